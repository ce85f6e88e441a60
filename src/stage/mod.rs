//! The stage runtime: the contract every worker of the execution network
//! implements and the ports connecting workers together.
//!
//! A stage is a loop over incoming [`Message`]s. Data microbatches are
//! handed to the stage [`kernel`](StageLogic::kernel), control tokens are
//! dispatched by sentinel variant to one of the sync hooks. The default
//! hooks implement the pass-through filter behaviour: forward the same
//! sentinel downstream once and invoke the matching callback.

use crate::batch::{AnyBatch, Message, Sentinel, Side, Tag};
use crate::channel::{Receiver, Selector, Sender, TrySendError};

pub(crate) mod worker;

/// The behaviour of a single worker of the stage network.
///
/// Implementors provide the data kernel and may override the sync hooks.
/// Most stages only need the callbacks, the `handle_*` family is overridden
/// by the fabric stages (coalescers, emitters, switches) that own the token
/// routing rules.
pub trait StageLogic: Send {
    /// Process a data microbatch. The kernel is free to produce zero or more
    /// output microbatches through `out`.
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs);

    /// Invoked by the runtime before dispatching each message with the index
    /// of the input edge it arrived from.
    fn set_origin(&mut self, _from: usize) {}

    /// Whether `CstreamBegin`/`CstreamEnd` are forwarded downstream.
    ///
    /// Stages that emit their own stream boundaries (reducers, binary
    /// operators, sinks) return false here.
    fn propagate_cstream_sync(&self) -> bool {
        true
    }

    fn begin_callback(&mut self, _out: &mut Outputs) {}

    fn end_callback(&mut self, _out: &mut Outputs) {}

    fn cstream_begin_callback(&mut self, _tag: Tag, _out: &mut Outputs) {}

    fn cstream_end_callback(&mut self, _tag: Tag, _out: &mut Outputs) {}

    fn handle_begin(&mut self, tag: Tag, out: &mut Outputs) {
        debug_assert!(tag.is_nil(), "begin token with tag {tag}");
        out.sync(tag, Sentinel::Begin);
        self.begin_callback(out);
    }

    fn handle_end(&mut self, tag: Tag, out: &mut Outputs) {
        debug_assert!(tag.is_nil(), "end token with tag {tag}");
        self.end_callback(out);
        out.sync(tag, Sentinel::End);
    }

    fn handle_cstream_begin(&mut self, tag: Tag, out: &mut Outputs) {
        if self.propagate_cstream_sync() {
            out.sync(tag, Sentinel::CstreamBegin);
        }
        self.cstream_begin_callback(tag, out);
    }

    fn handle_cstream_end(&mut self, tag: Tag, out: &mut Outputs) {
        self.cstream_end_callback(tag, out);
        if self.propagate_cstream_sync() {
            out.sync(tag, Sentinel::CstreamEnd);
        }
    }

    /// Origin markers decorate the stream for the downstream binary
    /// operator, plain filters let them through.
    fn handle_origin(&mut self, tag: Tag, side: Side, out: &mut Outputs) {
        out.sync(tag, side.sentinel());
    }
}

/// Dispatch one message to the matching hook of a stage.
pub(crate) fn dispatch(logic: &mut dyn StageLogic, message: Message, out: &mut Outputs) {
    match message {
        Message::Batch { tag, batch } => logic.kernel(tag, batch, out),
        Message::Sync { tag, token } => match token {
            Sentinel::Begin => logic.handle_begin(tag, out),
            Sentinel::End => logic.handle_end(tag, out),
            Sentinel::CstreamBegin => logic.handle_cstream_begin(tag, out),
            Sentinel::CstreamEnd => logic.handle_cstream_end(tag, out),
            Sentinel::FromLeft => logic.handle_origin(tag, Side::Left, out),
            Sentinel::FromRight => logic.handle_origin(tag, Side::Right, out),
        },
    }
}

/// The input side of a stage: one or more edges merged according to the
/// stage role.
pub(crate) enum InputPort {
    /// A single upstream edge.
    Single(Receiver<Message>),
    /// Many upstream edges merged in arrival order (unordered collectors,
    /// the iteration multiplexer).
    Merge(MergeInput),
    /// Many upstream edges drained in strict round-robin, advancing on
    /// every message (ordered collectors).
    RoundRobin(RoundRobinInput),
}

impl InputPort {
    pub(crate) fn single(rx: Receiver<Message>) -> Self {
        InputPort::Single(rx)
    }

    pub(crate) fn merge(rxs: Vec<Receiver<Message>>) -> Self {
        InputPort::Merge(MergeInput::new(rxs))
    }

    pub(crate) fn round_robin(rxs: Vec<Receiver<Message>>) -> Self {
        InputPort::RoundRobin(RoundRobinInput::new(rxs))
    }

    /// Receive the next message together with the index of the edge it came
    /// from. `None` once every upstream edge has disconnected.
    pub(crate) fn recv(&mut self) -> Option<(usize, Message)> {
        match self {
            InputPort::Single(rx) => rx.recv().ok().map(|m| (0, m)),
            InputPort::Merge(merge) => merge.recv(),
            InputPort::RoundRobin(rr) => rr.recv(),
        }
    }
}

/// Arrival-order merge over a set of input edges.
pub(crate) struct MergeInput {
    /// Still-connected receivers with their original edge index.
    rxs: Vec<(usize, Receiver<Message>)>,
}

impl MergeInput {
    fn new(rxs: Vec<Receiver<Message>>) -> Self {
        Self {
            rxs: rxs.into_iter().enumerate().collect(),
        }
    }

    fn recv(&mut self) -> Option<(usize, Message)> {
        loop {
            match self.rxs.len() {
                0 => return None,
                1 => {
                    let (index, rx) = &self.rxs[0];
                    match rx.recv() {
                        Ok(message) => return Some((*index, message)),
                        Err(_) => {
                            self.rxs.clear();
                            return None;
                        }
                    }
                }
                _ => {
                    let (slot, message) = {
                        let selector = self.rxs.iter().enumerate().fold(
                            Selector::new(),
                            |selector, (slot, (_, rx))| {
                                selector.recv(rx, move |res| (slot, res.ok()))
                            },
                        );
                        selector.wait()
                    };
                    match message {
                        Some(message) => return Some((self.rxs[slot].0, message)),
                        None => {
                            // edge disconnected, drop it and select again
                            self.rxs.remove(slot);
                        }
                    }
                }
            }
        }
    }
}

/// Strict round-robin drain over a set of input edges.
///
/// The position advances after every received message: since the matching
/// emitter puts one copy of each sync token in every worker queue at the
/// same round position, per-worker FIFO composes to a global FIFO.
pub(crate) struct RoundRobinInput {
    rxs: Vec<Receiver<Message>>,
    open: Vec<bool>,
    current: usize,
}

impl RoundRobinInput {
    fn new(rxs: Vec<Receiver<Message>>) -> Self {
        let open = vec![true; rxs.len()];
        Self {
            rxs,
            open,
            current: 0,
        }
    }

    fn recv(&mut self) -> Option<(usize, Message)> {
        let n = self.rxs.len();
        while self.open.iter().any(|o| *o) {
            let i = self.current;
            if !self.open[i] {
                self.current = (i + 1) % n;
                continue;
            }
            match self.rxs[i].recv() {
                Ok(message) => {
                    self.current = (i + 1) % n;
                    return Some((i, message));
                }
                Err(_) => {
                    self.open[i] = false;
                    self.current = (i + 1) % n;
                }
            }
        }
        None
    }
}

/// The output side of a stage: the downstream edges and the routing policy
/// for data microbatches.
pub(crate) enum OutputPort {
    /// A single downstream edge.
    Single(Sender<Message>),
    /// One edge per worker, data dispatched in strict round-robin.
    RoundRobin { txs: Vec<Sender<Message>>, next: usize },
    /// One edge per worker, data sent to the first worker with queue space.
    LoadBalance { txs: Vec<Sender<Message>>, next: usize },
    /// One edge per worker, data routed explicitly by the stage (key
    /// partitioners, pair emitters).
    Indexed(Vec<Sender<Message>>),
    /// The two outputs of an iteration switch.
    Loop {
        feedback: Option<Sender<Message>>,
        out: Sender<Message>,
    },
}

/// Handle through which a stage emits messages downstream.
pub struct Outputs {
    port: OutputPort,
}

impl Outputs {
    pub(crate) fn new(port: OutputPort) -> Self {
        Self { port }
    }

    /// Send a data microbatch downstream, routed by the port policy.
    pub fn data(&mut self, tag: Tag, batch: AnyBatch) {
        match &mut self.port {
            OutputPort::Single(tx) => send(tx, Message::batch(tag, batch)),
            OutputPort::RoundRobin { txs, next } => {
                let i = *next;
                *next = (i + 1) % txs.len();
                send(&txs[i], Message::batch(tag, batch));
            }
            OutputPort::LoadBalance { txs, next } => {
                let mut message = Message::batch(tag, batch);
                for probe in 0..txs.len() {
                    let i = (*next + probe) % txs.len();
                    match txs[i].try_send(message) {
                        Ok(()) => {
                            *next = (i + 1) % txs.len();
                            return;
                        }
                        Err(TrySendError::Full(back)) => message = back,
                        Err(TrySendError::Disconnected(_)) => {
                            panic!("downstream worker disconnected")
                        }
                    }
                }
                // every queue is full, block on the next one in line
                let i = *next;
                *next = (i + 1) % txs.len();
                send(&txs[i], message);
            }
            OutputPort::Indexed(_) => {
                panic!("partitioned stage must route data explicitly")
            }
            OutputPort::Loop { out, .. } => send(out, Message::batch(tag, batch)),
        }
    }

    /// Send a sync token downstream. On multi-worker ports every worker
    /// receives its own copy, duplicating without amplifying.
    pub fn sync(&mut self, tag: Tag, token: Sentinel) {
        match &mut self.port {
            OutputPort::Single(tx) => send(tx, Message::sync(tag, token)),
            OutputPort::RoundRobin { txs, .. }
            | OutputPort::LoadBalance { txs, .. }
            | OutputPort::Indexed(txs) => {
                for tx in txs.iter() {
                    send(tx, Message::sync(tag, token));
                }
            }
            OutputPort::Loop { out, .. } => send(out, Message::sync(tag, token)),
        }
    }

    /// Send a message to a specific worker of an indexed port.
    pub fn send_to_worker(&mut self, worker: usize, message: Message) {
        match &mut self.port {
            OutputPort::Indexed(txs) => send(&txs[worker], message),
            _ => panic!("send_to_worker on a non-indexed port"),
        }
    }

    /// Number of workers reachable from this port.
    pub fn workers(&self) -> usize {
        match &self.port {
            OutputPort::Single(_) | OutputPort::Loop { .. } => 1,
            OutputPort::RoundRobin { txs, .. }
            | OutputPort::LoadBalance { txs, .. }
            | OutputPort::Indexed(txs) => txs.len(),
        }
    }

    /// Send a message on the feedback edge of a loop port.
    pub(crate) fn feedback(&mut self, message: Message) {
        match &mut self.port {
            OutputPort::Loop {
                feedback: Some(tx), ..
            } => send(tx, message),
            OutputPort::Loop { feedback: None, .. } => {
                panic!("feedback edge already closed")
            }
            _ => panic!("feedback on a non-loop port"),
        }
    }

    /// Close the feedback edge of a loop port, letting the cycle unwind.
    pub(crate) fn close_feedback(&mut self) {
        match &mut self.port {
            OutputPort::Loop { feedback, .. } => *feedback = None,
            _ => panic!("close_feedback on a non-loop port"),
        }
    }
}

fn send(tx: &Sender<Message>, message: Message) {
    // a disconnected downstream means its worker died: fatal
    if tx.send(message).is_err() {
        panic!("downstream stage disconnected");
    }
}

/// Identity stage: forwards everything untouched.
#[derive(Debug, Default, Clone)]
pub struct Forward;

impl StageLogic for Forward {
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        out.data(tag, batch);
    }
}
