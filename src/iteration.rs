//! The iteration controller: a multiplexer/switch pair wrapped around a
//! sub-network, implementing the feedback loop of `iterate`.
//!
//! The multiplexer merges the outer stream with the feedback edge and
//! re-tags every incoming segment with a fresh pass tag, so that per-tag
//! state in the looped stages is isolated between passes. The switch applies
//! the termination policy: while the policy says continue, segments are
//! routed back through the feedback edge; on release they flow downstream
//! with their tags rewritten to the ambient tag of the loop.
//!
//! The `End` token circulates through the loop trailing the newest pass:
//! the switch sends it back as long as passes remain and forwards it
//! downstream after the release, closing the feedback edge so that the
//! cycle can unwind.

use std::collections::HashMap;
use std::sync::Arc;

use dyn_clone::DynClone;
use parking_lot::Mutex;

use crate::batch::{AnyBatch, Message, Sentinel, Tag};
use crate::fabric::TagHasherBuilder;
use crate::stage::{Outputs, StageLogic};

/// State shared between the multiplexer and the switch of one loop.
///
/// Both stages hold an `Arc` to it; the executor wiring owns neither
/// endpoint of the feedback edge.
#[derive(Debug, Default)]
pub struct IterationCtx {
    /// Tag of the stream entering the loop, restored on the way out.
    ambient: Mutex<Option<Tag>>,
}

impl IterationCtx {
    fn record_ambient(&self, tag: Tag) {
        let mut ambient = self.ambient.lock();
        if ambient.is_none() {
            *ambient = Some(tag);
        }
    }

    fn ambient(&self) -> Tag {
        let ambient = *self.ambient.lock();
        ambient.expect("iteration released before any segment entered the loop")
    }
}

/// A termination policy for `iterate`, producing the loop-closing switch
/// stage. Conditions are cloned when compiled into nested scopes.
pub trait TerminationCondition: DynClone + Send {
    fn iteration_switch(&self, ctx: Arc<IterationCtx>) -> Box<dyn StageLogic>;
}

dyn_clone::clone_trait_object!(TerminationCondition);

/// Run the loop body a fixed number of times.
#[derive(Debug, Clone, Copy)]
pub struct FixedIterations {
    iterations: u32,
}

impl FixedIterations {
    pub fn new(iterations: u32) -> Self {
        assert!(iterations > 0, "iteration count must be greater than zero!");
        Self { iterations }
    }
}

impl TerminationCondition for FixedIterations {
    fn iteration_switch(&self, ctx: Arc<IterationCtx>) -> Box<dyn StageLogic> {
        Box::new(FixedLengthSwitch {
            iterations: self.iterations,
            rounds_done: 0,
            releasing: false,
            released: false,
            ctx,
        })
    }
}

/// Entry stage of the loop: two inputs (outer stream, feedback edge), one
/// output into the sub-network.
pub(crate) struct Multiplexer {
    ctx: Arc<IterationCtx>,
    /// Segment tags currently being rewritten to their pass tag.
    retag: HashMap<Tag, Tag, TagHasherBuilder>,
}

impl Multiplexer {
    pub(crate) fn new(ctx: Arc<IterationCtx>) -> Self {
        Self {
            ctx,
            retag: HashMap::default(),
        }
    }
}

impl StageLogic for Multiplexer {
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        let pass = self.retag.get(&tag).copied().unwrap_or(tag);
        out.data(pass, batch);
    }

    fn handle_cstream_begin(&mut self, tag: Tag, out: &mut Outputs) {
        self.ctx.record_ambient(tag);
        let pass = Tag::fresh();
        self.retag.insert(tag, pass);
        out.sync(pass, Sentinel::CstreamBegin);
    }

    fn handle_cstream_end(&mut self, tag: Tag, out: &mut Outputs) {
        let pass = self.retag.remove(&tag).unwrap_or(tag);
        out.sync(pass, Sentinel::CstreamEnd);
    }
}

/// Loop-closing stage counting `CstreamEnd` tokens: the first n-1 passes are
/// routed back into the loop, the n-th is released downstream under the
/// ambient tag.
struct FixedLengthSwitch {
    iterations: u32,
    rounds_done: u32,
    /// The segment currently flowing through belongs to the final pass.
    releasing: bool,
    /// The final pass has been fully released.
    released: bool,
    ctx: Arc<IterationCtx>,
}

impl StageLogic for FixedLengthSwitch {
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        if self.releasing {
            out.data(self.ctx.ambient(), batch);
        } else {
            out.feedback(Message::batch(tag, batch));
        }
    }

    fn handle_cstream_begin(&mut self, tag: Tag, out: &mut Outputs) {
        if self.rounds_done + 1 >= self.iterations {
            self.releasing = true;
            out.sync(self.ctx.ambient(), Sentinel::CstreamBegin);
        } else {
            out.feedback(Message::sync(tag, Sentinel::CstreamBegin));
        }
    }

    fn handle_cstream_end(&mut self, tag: Tag, out: &mut Outputs) {
        if self.releasing {
            self.releasing = false;
            self.released = true;
            out.sync(self.ctx.ambient(), Sentinel::CstreamEnd);
        } else {
            self.rounds_done += 1;
            out.feedback(Message::sync(tag, Sentinel::CstreamEnd));
        }
    }

    fn handle_end(&mut self, tag: Tag, out: &mut Outputs) {
        if self.released {
            out.sync(tag, Sentinel::End);
            out.close_feedback();
        } else {
            // not done yet: send the end back, trailing the newest pass
            out.feedback(Message::sync(tag, Sentinel::End));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{open, seal, Microbatch};
    use crate::channel::{bounded, Receiver};
    use crate::stage::{dispatch, OutputPort};

    fn loop_port() -> (Outputs, Receiver<Message>, Receiver<Message>) {
        let (fb_tx, fb_rx) = bounded(64);
        let (out_tx, out_rx) = bounded(64);
        (
            Outputs::new(OutputPort::Loop {
                feedback: Some(fb_tx),
                out: out_tx,
            }),
            fb_rx,
            out_rx,
        )
    }

    fn segment(tag: Tag, value: u32) -> Vec<Message> {
        vec![
            Message::sync(tag, Sentinel::CstreamBegin),
            Message::batch(tag, seal(Microbatch::from(value))),
            Message::sync(tag, Sentinel::CstreamEnd),
        ]
    }

    #[test]
    fn multiplexer_retags_each_segment() {
        let ctx = Arc::new(IterationCtx::default());
        let (tx, rx) = bounded(64);
        let mut out = Outputs::new(OutputPort::Single(tx));
        let mut mplex = Multiplexer::new(ctx.clone());

        let outer = Tag::fresh();
        for message in segment(outer, 1) {
            dispatch(&mut mplex, message, &mut out);
        }
        let seen: Vec<_> = rx.try_iter().collect();
        let pass = match seen[0] {
            Message::Sync { tag, .. } => tag,
            _ => panic!("expected sync"),
        };
        assert_ne!(pass, outer);
        assert!(seen.iter().all(|m| match m {
            Message::Sync { tag, .. } | Message::Batch { tag, .. } => *tag == pass,
        }));
        assert_eq!(ctx.ambient(), outer);
    }

    #[test]
    fn switch_releases_last_round_under_ambient_tag() {
        let ctx = Arc::new(IterationCtx::default());
        let ambient = Tag::fresh();
        ctx.record_ambient(ambient);
        let (mut out, fb_rx, out_rx) = loop_port();
        let mut switch = FixedIterations::new(2).iteration_switch(ctx);

        // pass 1: everything routed back
        let pass1 = Tag::fresh();
        for message in segment(pass1, 1) {
            dispatch(switch.as_mut(), message, &mut out);
        }
        dispatch(switch.as_mut(), Message::sync(Tag::NIL, Sentinel::End), &mut out);
        assert_eq!(fb_rx.try_iter().count(), 4);
        assert_eq!(out_rx.try_iter().count(), 0);

        // pass 2: released downstream with the ambient tag
        let pass2 = Tag::fresh();
        for message in segment(pass2, 2) {
            dispatch(switch.as_mut(), message, &mut out);
        }
        dispatch(switch.as_mut(), Message::sync(Tag::NIL, Sentinel::End), &mut out);
        assert_eq!(fb_rx.try_iter().count(), 0);
        let released: Vec<_> = out_rx.try_iter().collect();
        assert_eq!(released.len(), 4);
        match &released[1] {
            Message::Batch { tag, .. } => assert_eq!(*tag, ambient),
            _ => panic!("expected data"),
        }
        match released[3] {
            Message::Sync { token, .. } => assert_eq!(token, Sentinel::End),
            _ => panic!("expected end"),
        }
    }

    #[test]
    fn single_iteration_releases_immediately() {
        let ctx = Arc::new(IterationCtx::default());
        let ambient = Tag::fresh();
        ctx.record_ambient(ambient);
        let (mut out, fb_rx, out_rx) = loop_port();
        let mut switch = FixedIterations::new(1).iteration_switch(ctx);

        for message in segment(Tag::fresh(), 9) {
            dispatch(switch.as_mut(), message, &mut out);
        }
        assert_eq!(fb_rx.try_iter().count(), 0);
        let released: Vec<_> = out_rx.try_iter().collect();
        assert_eq!(released.len(), 3);
        match released.last().unwrap() {
            Message::Sync { tag, token } => {
                assert_eq!(*tag, ambient);
                assert_eq!(*token, Sentinel::CstreamEnd);
            }
            _ => panic!("expected c-end"),
        }
        // released data keeps its committed items
        match released.into_iter().nth(1).unwrap() {
            Message::Batch { batch, .. } => {
                assert_eq!(open::<u32>(batch).iter().copied().sum::<u32>(), 9);
            }
            _ => panic!("expected data"),
        }
    }

    #[test]
    #[should_panic(expected = "greater than zero")]
    fn zero_iterations_rejected() {
        FixedIterations::new(0);
    }
}
