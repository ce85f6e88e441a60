//! The pair farm: the two-worker fabric running the sub-pipelines of a
//! binary operator, with origin tracking on the merged output.
//!
//! The emitter routes data and c-stream tokens only to the side that
//! accepts input; input-less sides produce their own stream boundaries and
//! only receive the top-level `Begin`/`End`. The collector decorates every
//! c-stream opening with a `FromLeft`/`FromRight` marker so that the
//! downstream binary operator can classify the data that follows.

use crate::batch::{AnyBatch, Message, Sentinel, Side, Tag};
use crate::stage::{Outputs, StageLogic};

const LEFT: usize = 0;
const RIGHT: usize = 1;

/// Emitter of a pair farm.
///
/// `to` is the side that accepts input, `None` when both sides are sources.
/// Data and c-stream tokens are never sent to an input-less side;
/// `Begin`/`End` are broadcast to both.
pub(crate) struct PairEmitter {
    to: Option<Side>,
}

impl PairEmitter {
    pub(crate) fn new(to: Option<Side>) -> Self {
        Self { to }
    }

    fn target(&self) -> usize {
        match self.to {
            Some(Side::Left) => LEFT,
            Some(Side::Right) => RIGHT,
            None => panic!("pair farm with two input-less sides received input"),
        }
    }
}

impl StageLogic for PairEmitter {
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        let target = self.target();
        out.send_to_worker(target, Message::batch(tag, batch));
    }

    fn handle_cstream_begin(&mut self, tag: Tag, out: &mut Outputs) {
        let target = self.target();
        out.send_to_worker(target, Message::sync(tag, Sentinel::CstreamBegin));
    }

    fn handle_cstream_end(&mut self, tag: Tag, out: &mut Outputs) {
        let target = self.target();
        out.send_to_worker(target, Message::sync(tag, Sentinel::CstreamEnd));
    }
}

/// Collector of a pair farm.
///
/// Coalesces `Begin`/`End` across the two sides and forwards every
/// `CstreamBegin` followed by the origin marker of the side that produced
/// it. Each tag originates from exactly one side, so c-stream tokens need
/// no coalescing.
pub(crate) struct PairCollector {
    pending_begin: usize,
    pending_end: usize,
    from: usize,
}

impl PairCollector {
    pub(crate) fn new() -> Self {
        Self {
            pending_begin: 2,
            pending_end: 2,
            from: 0,
        }
    }
}

impl StageLogic for PairCollector {
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        out.data(tag, batch);
    }

    fn set_origin(&mut self, from: usize) {
        self.from = from;
    }

    fn handle_begin(&mut self, tag: Tag, out: &mut Outputs) {
        debug_assert!(self.pending_begin > 0, "spurious begin token");
        self.pending_begin -= 1;
        if self.pending_begin == 0 {
            self.pending_begin = 2;
            out.sync(tag, Sentinel::Begin);
        }
    }

    fn handle_end(&mut self, tag: Tag, out: &mut Outputs) {
        debug_assert!(self.pending_end > 0, "spurious end token");
        self.pending_end -= 1;
        if self.pending_end == 0 {
            self.pending_end = 2;
            out.sync(tag, Sentinel::End);
        }
    }

    fn handle_cstream_begin(&mut self, tag: Tag, out: &mut Outputs) {
        out.sync(tag, Sentinel::CstreamBegin);
        let side = if self.from == LEFT {
            Side::Left
        } else {
            Side::Right
        };
        out.sync(tag, side.sentinel());
    }

    fn handle_cstream_end(&mut self, tag: Tag, out: &mut Outputs) {
        out.sync(tag, Sentinel::CstreamEnd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{seal, Microbatch};
    use crate::channel::{bounded, Receiver};
    use crate::stage::{dispatch, OutputPort};

    fn collector_out() -> (Outputs, Receiver<Message>) {
        let (tx, rx) = bounded(64);
        (Outputs::new(OutputPort::Single(tx)), rx)
    }

    #[test]
    fn origin_marker_follows_cstream_begin() {
        let (mut out, rx) = collector_out();
        let mut collector = PairCollector::new();
        let (left_tag, right_tag) = (Tag::fresh(), Tag::fresh());

        collector.set_origin(RIGHT);
        dispatch(
            &mut collector,
            Message::sync(right_tag, Sentinel::CstreamBegin),
            &mut out,
        );
        collector.set_origin(LEFT);
        dispatch(
            &mut collector,
            Message::sync(left_tag, Sentinel::CstreamBegin),
            &mut out,
        );

        let seen: Vec<_> = rx
            .try_iter()
            .map(|m| match m {
                Message::Sync { tag, token } => (tag, token),
                Message::Batch { .. } => panic!("unexpected data"),
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                (right_tag, Sentinel::CstreamBegin),
                (right_tag, Sentinel::FromRight),
                (left_tag, Sentinel::CstreamBegin),
                (left_tag, Sentinel::FromLeft),
            ]
        );
    }

    #[test]
    fn begin_coalesced_across_sides() {
        let (mut out, rx) = collector_out();
        let mut collector = PairCollector::new();
        collector.set_origin(LEFT);
        collector.handle_begin(Tag::NIL, &mut out);
        assert!(rx.try_recv().is_err());
        collector.set_origin(RIGHT);
        collector.handle_begin(Tag::NIL, &mut out);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Message::Sync {
                token: Sentinel::Begin,
                ..
            }
        ));
    }

    #[test]
    fn emitter_routes_only_to_input_side() {
        let (left_tx, left_rx) = bounded(16);
        let (right_tx, right_rx) = bounded(16);
        let mut out = Outputs::new(OutputPort::Indexed(vec![left_tx, right_tx]));
        let mut emitter = PairEmitter::new(Some(Side::Left));
        let tag = Tag::fresh();

        dispatch(&mut emitter, Message::sync(Tag::NIL, Sentinel::Begin), &mut out);
        dispatch(&mut emitter, Message::sync(tag, Sentinel::CstreamBegin), &mut out);
        dispatch(
            &mut emitter,
            Message::batch(tag, seal(Microbatch::from(1u8))),
            &mut out,
        );
        dispatch(&mut emitter, Message::sync(tag, Sentinel::CstreamEnd), &mut out);
        dispatch(&mut emitter, Message::sync(Tag::NIL, Sentinel::End), &mut out);

        // begin, c-begin, data, c-end, end on the input side
        assert_eq!(left_rx.try_iter().count(), 5);
        // only begin and end on the input-less side
        let right: Vec<_> = right_rx
            .try_iter()
            .map(|m| match m {
                Message::Sync { token, .. } => token,
                Message::Batch { .. } => panic!("data on the input-less side"),
            })
            .collect();
        assert_eq!(right, vec![Sentinel::Begin, Sentinel::End]);
    }

    #[test]
    #[should_panic(expected = "two input-less sides")]
    fn to_none_rejects_data(){
        let (tx, _rx) = bounded(16);
        let (tx2, _rx2) = bounded(16);
        let mut out = Outputs::new(OutputPort::Indexed(vec![tx, tx2]));
        let mut emitter = PairEmitter::new(None);
        dispatch(
            &mut emitter,
            Message::batch(Tag::fresh(), seal(Microbatch::from(1u8))),
            &mut out,
        );
    }
}
