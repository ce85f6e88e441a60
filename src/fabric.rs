//! The fan-out / fan-in fabric: templates replicating a logical stage across
//! a set of workers while duplicating and coalescing control tokens.
//!
//! A parallel stage is emitter -> workers[1..p] -> collector. The emitter
//! routes data microbatches (round-robin for ordered farms, load-balanced
//! for unordered ones, by key hash for partitioned ones) and broadcasts one
//! copy of every sync token to each worker. The collector merges the worker
//! outputs and coalesces the duplicated tokens back into a single one.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::batch::{AnyBatch, Message, Sentinel, Tag};
use crate::channel::{bounded, unbounded, Receiver, Sender};
use crate::compiler::CompileError;
use crate::config::Config;
use crate::iteration::{IterationCtx, TerminationCondition};
use crate::stage::worker::StageNode;
use crate::stage::{InputPort, OutputPort, Outputs, StageLogic};

/// Hashing function for key partitioning and group by operations.
pub fn group_by_hash<T: Hash>(item: &T) -> u64 {
    let mut hasher = wyhash::WyHash::with_seed(0x0123456789abcdef);
    item.hash(&mut hasher);
    hasher.finish()
}

/// Hasher used for internal hashmaps that have tags as keys
/// (optimized for small keys)
pub(crate) type TagHasherBuilder = fxhash::FxBuildHasher;

/// Hasher used for grouping keys
/// (for all around good performance)
pub type GroupHasherBuilder = core::hash::BuildHasherDefault<wyhash::WyHash>;

/// A compiled stage network: the spawnable workers plus the entry and exit
/// edges of the pipeline.
pub(crate) struct Network {
    pub(crate) stages: Vec<StageNode>,
    pub(crate) input: Sender<Message>,
    pub(crate) output: Receiver<Message>,
}

/// Incrementally wires stages into a network, keeping track of the dangling
/// tail edge that the next stage will consume.
pub struct NetworkBuilder {
    config: Config,
    stages: Vec<StageNode>,
    tail: Receiver<Message>,
}

impl NetworkBuilder {
    pub(crate) fn new(config: Config) -> (Sender<Message>, NetworkBuilder) {
        let (tx, rx) = bounded(config.channel_capacity);
        (
            tx,
            NetworkBuilder {
                config,
                stages: Vec::new(),
                tail: rx,
            },
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn edge(&self) -> (Sender<Message>, Receiver<Message>) {
        bounded(self.config.channel_capacity)
    }

    /// Append a sequential stage consuming the current tail.
    pub fn add_filter(&mut self, name: &str, logic: Box<dyn StageLogic>) {
        let (tx, rx) = self.edge();
        let input = InputPort::single(std::mem::replace(&mut self.tail, rx));
        self.stages.push(StageNode {
            name: name.into(),
            logic,
            input,
            outputs: Outputs::new(OutputPort::Single(tx)),
        });
    }

    /// Append a parallel farm of `par` copies of a worker stage.
    ///
    /// Ordered farms dispatch and drain in strict round-robin so that
    /// per-worker FIFO composes to a global FIFO; unordered farms
    /// load-balance data and merge in arrival order.
    pub fn add_farm(
        &mut self,
        name: &str,
        par: usize,
        ordered: bool,
        make_worker: &mut dyn FnMut(usize) -> Box<dyn StageLogic>,
    ) {
        assert!(par > 0, "farm parallelism must be positive");
        if par == 1 {
            // no fan-out needed, the lone worker acts as the whole farm
            self.add_filter(name, make_worker(0));
            return;
        }

        let emitter_input = {
            let (tx, rx) = self.edge();
            InputPort::single(std::mem::replace(&mut self.tail, rx))
        };
        // the placeholder tail is replaced below by the collector output

        let mut emit_txs = Vec::with_capacity(par);
        let mut worker_out = Vec::with_capacity(par);
        for w in 0..par {
            let (in_tx, in_rx) = self.edge();
            let (out_tx, out_rx) = self.edge();
            emit_txs.push(in_tx);
            worker_out.push(out_rx);
            self.stages.push(StageNode {
                name: format!("{name}[{w}]"),
                logic: make_worker(w),
                input: InputPort::single(in_rx),
                outputs: Outputs::new(OutputPort::Single(out_tx)),
            });
        }

        let emitter_port = if ordered {
            OutputPort::RoundRobin {
                txs: emit_txs,
                next: 0,
            }
        } else {
            OutputPort::LoadBalance {
                txs: emit_txs,
                next: 0,
            }
        };
        self.stages.push(StageNode {
            name: format!("{name}-emitter"),
            logic: Box::new(crate::stage::Forward),
            input: emitter_input,
            outputs: Outputs::new(emitter_port),
        });

        let (coll_tx, coll_rx) = self.edge();
        let collector_input = if ordered {
            InputPort::round_robin(worker_out)
        } else {
            InputPort::merge(worker_out)
        };
        self.stages.push(StageNode {
            name: format!("{name}-collector"),
            logic: Box::new(SyncCoalesce::new(par)),
            input: collector_input,
            outputs: Outputs::new(OutputPort::Single(coll_tx)),
        });
        self.tail = coll_rx;
    }

    /// Append a farm whose emitter routes data explicitly (key partitioned
    /// stages). Sync tokens are still broadcast to every worker.
    pub fn add_partitioned_farm(
        &mut self,
        name: &str,
        par: usize,
        emitter: Box<dyn StageLogic>,
        make_worker: &mut dyn FnMut(usize) -> Box<dyn StageLogic>,
    ) {
        assert!(par > 0, "farm parallelism must be positive");
        if par == 1 {
            self.add_filter(name, make_worker(0));
            return;
        }

        let emitter_input = {
            let (tx, rx) = self.edge();
            InputPort::single(std::mem::replace(&mut self.tail, rx))
        };

        let mut emit_txs = Vec::with_capacity(par);
        let mut worker_out = Vec::with_capacity(par);
        for w in 0..par {
            let (in_tx, in_rx) = self.edge();
            let (out_tx, out_rx) = self.edge();
            emit_txs.push(in_tx);
            worker_out.push(out_rx);
            self.stages.push(StageNode {
                name: format!("{name}[{w}]"),
                logic: make_worker(w),
                input: InputPort::single(in_rx),
                outputs: Outputs::new(OutputPort::Single(out_tx)),
            });
        }

        self.stages.push(StageNode {
            name: format!("{name}-emitter"),
            logic: emitter,
            input: emitter_input,
            outputs: Outputs::new(OutputPort::Indexed(emit_txs)),
        });

        let (coll_tx, coll_rx) = self.edge();
        self.stages.push(StageNode {
            name: format!("{name}-collector"),
            logic: Box::new(SyncCoalesce::new(par)),
            input: InputPort::merge(worker_out),
            outputs: Outputs::new(OutputPort::Single(coll_tx)),
        });
        self.tail = coll_rx;
    }

    /// Append a two-worker farm running the left and right sub-networks,
    /// with origin tracking on the collector side.
    pub(crate) fn add_pair(
        &mut self,
        emitter: Box<dyn StageLogic>,
        collector: Box<dyn StageLogic>,
        build_left: impl FnOnce(&mut NetworkBuilder) -> Result<(), CompileError>,
        build_right: impl FnOnce(&mut NetworkBuilder) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let emitter_input = {
            let (tx, rx) = self.edge();
            InputPort::single(std::mem::replace(&mut self.tail, rx))
        };

        let (left_tx, left_rx) = self.edge();
        let (right_tx, right_rx) = self.edge();
        self.stages.push(StageNode {
            name: "pair-emitter".into(),
            logic: emitter,
            input: emitter_input,
            outputs: Outputs::new(OutputPort::Indexed(vec![left_tx, right_tx])),
        });

        self.tail = left_rx;
        build_left(self)?;
        let left_out = std::mem::replace(&mut self.tail, right_rx);
        build_right(self)?;

        let (coll_tx, coll_rx) = self.edge();
        let right_out = std::mem::replace(&mut self.tail, coll_rx);
        self.stages.push(StageNode {
            name: "pair-collector".into(),
            logic: collector,
            input: InputPort::merge(vec![left_out, right_out]),
            outputs: Outputs::new(OutputPort::Single(coll_tx)),
        });
        Ok(())
    }

    /// Wrap a sub-network in a feedback loop: multiplexer -> sub -> switch,
    /// with the switch routing back to the multiplexer until the termination
    /// condition releases.
    pub(crate) fn add_iteration(
        &mut self,
        cond: &dyn TerminationCondition,
        build_sub: impl FnOnce(&mut NetworkBuilder) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let ctx = Arc::new(IterationCtx::default());

        // the feedback edge is the only unbounded one: a bounded cycle would
        // deadlock once a pass overflows the queue capacities
        let (feedback_tx, feedback_rx) = unbounded();
        let (sub_tx, sub_rx) = self.edge();

        let outer = std::mem::replace(&mut self.tail, sub_rx);
        self.stages.push(StageNode {
            name: "iter-multiplexer".into(),
            logic: Box::new(crate::iteration::Multiplexer::new(ctx.clone())),
            input: InputPort::merge(vec![outer, feedback_rx]),
            outputs: Outputs::new(OutputPort::Single(sub_tx)),
        });

        build_sub(self)?;

        let (out_tx, out_rx) = self.edge();
        let sub_out = std::mem::replace(&mut self.tail, out_rx);
        self.stages.push(StageNode {
            name: "iter-switch".into(),
            logic: cond.iteration_switch(ctx),
            input: InputPort::single(sub_out),
            outputs: Outputs::new(OutputPort::Loop {
                feedback: Some(feedback_tx),
                out: out_tx,
            }),
        });
        Ok(())
    }

    pub(crate) fn finish(self, input: Sender<Message>) -> Network {
        Network {
            stages: self.stages,
            input,
            output: self.tail,
        }
    }
}

/// Collector-side coalescer for duplicated sync tokens.
///
/// `Begin`/`End` are forwarded once all `workers` copies arrived; the
/// counters reset after firing so tokens circulating through iteration
/// cycles coalesce correctly on every round. `CstreamBegin(t)` is forwarded
/// on first sight (anticipated, the downstream segment opens as soon as any
/// worker has data for it), `CstreamEnd(t)` on last sight (delayed, the
/// segment closes only when every worker is done). Tags are tracked
/// independently: one tag closing does not block another one opening.
pub(crate) struct SyncCoalesce {
    workers: usize,
    pending_begin: usize,
    pending_end: usize,
    pending_cstream_begin: HashMap<Tag, usize, TagHasherBuilder>,
    pending_cstream_end: HashMap<Tag, usize, TagHasherBuilder>,
}

impl SyncCoalesce {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            workers,
            pending_begin: workers,
            pending_end: workers,
            pending_cstream_begin: HashMap::default(),
            pending_cstream_end: HashMap::default(),
        }
    }
}

impl StageLogic for SyncCoalesce {
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        out.data(tag, batch);
    }

    fn handle_begin(&mut self, tag: Tag, out: &mut Outputs) {
        debug_assert!(self.pending_begin > 0, "spurious begin token");
        self.pending_begin -= 1;
        if self.pending_begin == 0 {
            self.pending_begin = self.workers;
            out.sync(tag, Sentinel::Begin);
        }
    }

    fn handle_end(&mut self, tag: Tag, out: &mut Outputs) {
        debug_assert!(self.pending_end > 0, "spurious end token");
        self.pending_end -= 1;
        if self.pending_end == 0 {
            self.pending_end = self.workers;
            out.sync(tag, Sentinel::End);
        }
    }

    fn handle_cstream_begin(&mut self, tag: Tag, out: &mut Outputs) {
        let pending = self
            .pending_cstream_begin
            .entry(tag)
            .or_insert_with(|| {
                out.sync(tag, Sentinel::CstreamBegin);
                self.workers
            });
        *pending -= 1;
    }

    fn handle_cstream_end(&mut self, tag: Tag, out: &mut Outputs) {
        let pending = self
            .pending_cstream_end
            .entry(tag)
            .or_insert(self.workers);
        *pending -= 1;
        if *pending == 0 {
            self.pending_cstream_begin.remove(&tag);
            self.pending_cstream_end.remove(&tag);
            out.sync(tag, Sentinel::CstreamEnd);
        }
    }
}
