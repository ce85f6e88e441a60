use std::collections::HashMap;
use std::marker::PhantomData;

use indexmap::IndexMap;

use crate::batch::{open, seal, AnyBatch, Message, Microbatch, Tag, TokenMeta};
use crate::compiler::CompileError;
use crate::fabric::{group_by_hash, GroupHasherBuilder, NetworkBuilder, TagHasherBuilder};
use crate::operator::{
    Data, DataKey, ErasedKernel, OperatorClass, OperatorNode, StructureType,
};
use crate::stage::{Outputs, StageLogic};

/// Folds the values of each key with an associative commutative kernel,
/// emitting one `(key, value)` pair per key when the stream segment closes.
///
/// Compiles to a key-partitioned farm: the emitter routes each pair to the
/// worker owning its key hash, every worker keeps its own partition and
/// flushes it on segment close. When preceded by a map-like operator the
/// compiler fuses the two into a single farm whose workers apply the map
/// kernel and fold locally, followed by a sequential keyed combiner.
pub struct PReduce<K, V, F> {
    f: F,
    pardeg: Option<usize>,
    _t: PhantomData<fn((K, V))>,
}

impl<K, V, F: Clone> Clone for PReduce<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            pardeg: self.pardeg,
            _t: PhantomData,
        }
    }
}

impl<K, V, F> PReduce<K, V, F>
where
    K: DataKey,
    V: Data,
    F: Fn(V, V) -> V + Clone + Send + 'static,
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

impl<K, V, F> OperatorNode for PReduce<K, V, F>
where
    K: DataKey,
    V: Data,
    F: Fn(V, V) -> V + Clone + Send + 'static,
{
    fn name(&self) -> &'static str {
        "p-reduce"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::PReduce
    }

    fn pardeg(&self) -> Option<usize> {
        self.pardeg
    }

    fn make_stage(
        &self,
        par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        let capacity = builder.config().microbatch_size;
        let f = self.f.clone();
        builder.add_partitioned_farm(
            self.name(),
            par,
            Box::new(KeyPartition::<K, V>::new(par, capacity)),
            &mut |_| Box::new(KeyedReduce::<K, V, F>::new(f.clone(), capacity)),
        );
        Ok(())
    }

    fn make_fused_stage(
        &self,
        prev: &dyn OperatorNode,
        par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        let capacity = builder.config().microbatch_size;
        if prev.erased_kernel(capacity).is_none() {
            return Err(CompileError::FusionUnsupported);
        }
        let f = self.f.clone();
        builder.add_farm("map-p-reduce", par, false, &mut |_| {
            let map = prev
                .erased_kernel(capacity)
                .expect("map-like operator without a batch kernel");
            Box::new(FusedKeyedReduce {
                map,
                inner: KeyedReduce::<K, V, F>::new(f.clone(), capacity),
            })
        });
        if par > 1 {
            // merge the per-worker partitions into the final one
            builder.add_filter(
                "p-reduce-combine",
                Box::new(KeyedReduce::<K, V, F>::new(self.f.clone(), capacity)),
            );
        }
        Ok(())
    }
}

/// Emitter of a key-partitioned farm: routes each pair to the worker owning
/// its key hash and stores the hash in the slot descriptor.
struct KeyPartition<K, V> {
    workers: usize,
    capacity: usize,
    _t: PhantomData<fn((K, V))>,
}

impl<K, V> KeyPartition<K, V> {
    fn new(workers: usize, capacity: usize) -> Self {
        Self {
            workers,
            capacity,
            _t: PhantomData,
        }
    }
}

impl<K, V> StageLogic for KeyPartition<K, V>
where
    K: DataKey,
    V: Data,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        let input = open::<(K, V)>(batch);
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

/// Folds `(key, value)` pairs per key and per stream segment, flushing the
/// partition in first-seen key order when the segment closes.
pub(crate) struct KeyedReduce<K, V, F> {
    f: F,
    capacity: usize,
    groups: HashMap<Tag, IndexMap<K, V, GroupHasherBuilder>, TagHasherBuilder>,
}

impl<K, V, F> KeyedReduce<K, V, F>
where
    K: DataKey,
    V: Data,
    F: Fn(V, V) -> V + Send,
{
    pub(crate) fn new(f: F, capacity: usize) -> Self {
        Self {
            f,
            capacity,
            groups: HashMap::default(),
        }
    }

    fn fold_batch(&mut self, tag: Tag, batch: AnyBatch) {
        let input = open::<(K, V)>(batch);
        let group = self.groups.entry(tag).or_default();
        for (_meta, (key, value)) in input.drain() {
            let folded = match group.get(&key) {
                Some(acc) => (self.f)(acc.clone(), value),
                None => value,
            };
            group.insert(key, folded);
        }
    }

    fn flush(&mut self, tag: Tag, out: &mut Outputs) {
        if let Some(group) = self.groups.remove(&tag) {
            let mut batch = Microbatch::new(self.capacity);
            for (key, value) in group {
                if batch.is_full() {
                    out.data(
                        tag,
                        seal(std::mem::replace(&mut batch, Microbatch::new(self.capacity))),
                    );
                }
                batch.push((key, value));
            }
            if !batch.is_empty() {
                out.data(tag, seal(batch));
            }
        }
    }
}

impl<K, V, F> StageLogic for KeyedReduce<K, V, F>
where
    K: DataKey,
    V: Data,
    F: Fn(V, V) -> V + Send,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, _out: &mut Outputs) {
        self.fold_batch(tag, batch);
    }

    fn cstream_end_callback(&mut self, tag: Tag, out: &mut Outputs) {
        self.flush(tag, out);
    }
}

/// Worker of a fused map + per-key reduce farm: applies the map batch
/// kernel and folds its output into the local partition right away.
struct FusedKeyedReduce<K, V, F> {
    map: ErasedKernel,
    inner: KeyedReduce<K, V, F>,
}

impl<K, V, F> StageLogic for FusedKeyedReduce<K, V, F>
where
    K: DataKey,
    V: Data,
    F: Fn(V, V) -> V + Send,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, _out: &mut Outputs) {
        let mut staged = Vec::new();
        (self.map)(batch, &mut |mapped| staged.push(mapped));
        for mapped in staged {
            self.inner.fold_batch(tag, mapped);
        }
    }

    fn cstream_end_callback(&mut self, tag: Tag, out: &mut Outputs) {
        self.inner.flush(tag, out);
    }
}
