use std::marker::PhantomData;

use indexmap::IndexMap;

use log::debug;

use crate::batch::{
    open, seal, try_open, AnyBatch, Message, Microbatch, Sentinel, Side, Tag, TokenMeta,
};
use crate::compiler::CompileError;
use crate::fabric::{group_by_hash, GroupHasherBuilder, NetworkBuilder};
use crate::operator::{
    BinaryOperatorNode, Collector, Data, DataKey, OperatorClass, StructureType,
};
use crate::stage::{Outputs, StageLogic};

/// Per-key join of the two sides of a pair farm, with a flat-map kernel
/// over each matching value pair.
///
/// The stage consumes the origin-decorated stream produced by the pair
/// collector: each c-stream segment is preceded by a `FromLeft`/`FromRight`
/// marker classifying the data that follows, until the next marker. Both
/// partitions are buffered; once a segment from each side has closed, the
/// kernel runs over the matching keys and the result is emitted as a fresh
/// segment under the tag of the last closed input segment.
///
/// A new segment from one side replaces that side's previous partition, so
/// an iterated pair with a static side joins every pass against it.
pub struct JoinFlatMap<K, V1, V2, Out, F> {
    f: F,
    pardeg: Option<usize>,
    _t: PhantomData<fn(K, V1, V2) -> Out>,
}

impl<K, V1, V2, Out, F: Clone> Clone for JoinFlatMap<K, V1, V2, Out, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            pardeg: self.pardeg,
            _t: PhantomData,
        }
    }
}

impl<K, V1, V2, Out, F> JoinFlatMap<K, V1, V2, Out, F>
where
    K: DataKey,
    V1: Data,
    V2: Data,
    Out: Data,
    F: Fn(&K, &V1, &V2, &mut Collector<Out>) + Clone + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            pardeg: None,
            _t: PhantomData,
        }
    }

    /// Request a specific parallelism for this operator instance.
    pub fn with_parallelism(mut self, par: usize) -> Self {
        self.pardeg = Some(par);
        self
    }
}

impl<K, V1, V2, Out, F> BinaryOperatorNode for JoinFlatMap<K, V1, V2, Out, F>
where
    K: DataKey,
    V1: Data,
    V2: Data,
    Out: Data,
    F: Fn(&K, &V1, &V2, &mut Collector<Out>) + Clone + Send + 'static,
{
    fn name(&self) -> &'static str {
        "join-flat-map"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::JoinFlatMap
    }

    fn pardeg(&self) -> Option<usize> {
        self.pardeg
    }

    fn make_stage(
        &self,
        par: usize,
        left_input: bool,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        debug!(
            "join-flat-map: flowing input reaches the {} side",
            if left_input { "left" } else { "right" }
        );
        let capacity = builder.config().microbatch_size;
        let f = self.f.clone();
        builder.add_partitioned_farm(
            self.name(),
            par,
            Box::new(JoinPartition::<K, V1, V2>::new(par, capacity)),
            &mut |_| {
                Box::new(JoinWorker {
                    f: f.clone(),
                    capacity,
                    left: JoinSide::default(),
                    right: JoinSide::default(),
                    current: None,
                    _t: PhantomData,
                })
            },
        );
        Ok(())
    }
}

/// Emitter of a parallel join: routes the pairs of either side to the
/// worker owning their key hash. Origin markers are sync tokens and reach
/// every worker, so each worker sees its key subspace of both sides with
/// the full marker sequence.
struct JoinPartition<K, V1, V2> {
    workers: usize,
    capacity: usize,
    _t: PhantomData<fn(K, V1, V2)>,
}

impl<K, V1, V2> JoinPartition<K, V1, V2> {
    fn new(workers: usize, capacity: usize) -> Self {
        Self {
            workers,
            capacity,
            _t: PhantomData,
        }
    }
}

impl<K, V1, V2> JoinPartition<K, V1, V2>
where
    K: DataKey,
{
    fn route<V: Data>(&self, tag: Tag, input: Microbatch<(K, V)>, out: &mut Outputs) {
        let mut parts: Vec<Option<Microbatch<(K, V)>>> = (0..self.workers).map(|_| None).collect();
        for (meta, (key, value)) in input.drain() {
            let hash = meta.key_hint.unwrap_or_else(|| group_by_hash(&key));
            let worker = (hash % self.workers as u64) as usize;
            if parts[worker].as_ref().is_some_and(|p| p.is_full()) {
                let full = parts[worker].take().expect("partition checked full");
                out.send_to_worker(worker, Message::batch(tag, seal(full)));
            }
            let part = parts[worker].get_or_insert_with(|| Microbatch::new(self.capacity));
            part.push_with(TokenMeta { key_hint: Some(hash) }, (key, value));
        }
        for (worker, part) in parts.into_iter().enumerate() {
            if let Some(part) = part {
                if !part.is_empty() {
                    out.send_to_worker(worker, Message::batch(tag, seal(part)));
                }
            }
        }
    }
}

impl<K, V1, V2> StageLogic for JoinPartition<K, V1, V2>
where
    K: DataKey,
    V1: Data,
    V2: Data,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        match try_open::<(K, V1)>(batch) {
            Ok(left) => self.route(tag, left, out),
            Err(batch) => {
                let right = open::<(K, V2)>(batch);
                self.route(tag, right, out);
            }
        }
    }
}

/// One side of the join state: the buffered partition and the bookkeeping
/// of its current segment.
struct JoinSide<K, V> {
    partition: IndexMap<K, Vec<V>, GroupHasherBuilder>,
    tag: Option<Tag>,
    done: bool,
}

impl<K, V> Default for JoinSide<K, V> {
    fn default() -> Self {
        Self {
            partition: IndexMap::default(),
            tag: None,
            done: false,
        }
    }
}

impl<K: DataKey, V> JoinSide<K, V> {
    /// A new segment replaces the previous one from the same side.
    fn open_segment(&mut self, tag: Tag) {
        if self.tag != Some(tag) {
            self.partition.clear();
            self.tag = Some(tag);
            self.done = false;
        }
    }

    fn buffer(&mut self, key: K, value: V) {
        self.partition.entry(key).or_default().push(value);
    }
}

struct JoinWorker<K, V1, V2, Out, F> {
    f: F,
    capacity: usize,
    left: JoinSide<K, V1>,
    right: JoinSide<K, V2>,
    current: Option<Side>,
    _t: PhantomData<fn() -> Out>,
}

impl<K, V1, V2, Out, F> JoinWorker<K, V1, V2, Out, F>
where
    K: DataKey,
    V1: Data,
    V2: Data,
    Out: Data,
    F: Fn(&K, &V1, &V2, &mut Collector<Out>) + Send,
{
    fn emit_join(&mut self, tag: Tag, out: &mut Outputs) {
        out.sync(tag, Sentinel::CstreamBegin);
        let mut collector = Collector::new(self.capacity);
        for (key, left_values) in &self.left.partition {
            if let Some(right_values) = self.right.partition.get(key) {
                for v1 in left_values {
                    for v2 in right_values {
                        (self.f)(key, v1, v2, &mut collector);
                    }
                }
            }
        }
        for batch in collector.into_batches() {
            if !batch.is_empty() {
                out.data(tag, seal(batch));
            }
        }
        out.sync(tag, Sentinel::CstreamEnd);
    }
}

impl<K, V1, V2, Out, F> StageLogic for JoinWorker<K, V1, V2, Out, F>
where
    K: DataKey,
    V1: Data,
    V2: Data,
    Out: Data,
    F: Fn(&K, &V1, &V2, &mut Collector<Out>) + Send,
{
    fn propagate_cstream_sync(&self) -> bool {
        false
    }

    fn handle_origin(&mut self, tag: Tag, side: Side, _out: &mut Outputs) {
        // the marker is consumed here, downstream sees only our segments
        self.current = Some(side);
        match side {
            Side::Left => self.left.open_segment(tag),
            Side::Right => self.right.open_segment(tag),
        }
    }

    fn kernel(&mut self, _tag: Tag, batch: AnyBatch, _out: &mut Outputs) {
        match self.current {
            Some(Side::Left) => {
                let input = open::<(K, V1)>(batch);
                for (_meta, (key, value)) in input.drain() {
                    self.left.buffer(key, value);
                }
            }
            Some(Side::Right) => {
                let input = open::<(K, V2)>(batch);
                for (_meta, (key, value)) in input.drain() {
                    self.right.buffer(key, value);
                }
            }
            None => panic!("binary stage received data before an origin marker"),
        }
    }

    fn cstream_end_callback(&mut self, tag: Tag, out: &mut Outputs) {
        match self.current {
            Some(Side::Left) => self.left.done = true,
            Some(Side::Right) => self.right.done = true,
            None => return,
        }
        if self.left.done && self.right.done {
            self.emit_join(tag, out);
        }
    }
}
