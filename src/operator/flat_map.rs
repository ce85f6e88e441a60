use std::marker::PhantomData;

use crate::batch::{open, seal, AnyBatch, Tag};
use crate::compiler::CompileError;
use crate::fabric::NetworkBuilder;
use crate::operator::{
    Collector, Data, ErasedKernel, OperatorClass, OperatorNode, StructureType,
};
use crate::stage::{Outputs, StageLogic};

/// Applies a kernel producing zero or more output items per input item,
/// emitted through the [`Collector`] handed to it.
///
/// Flat maps always run as unordered farms: a one-to-many kernel does not
/// fit the round-robin slotting of the ordered farm.
pub struct FlatMap<In, Out, F> {
    f: F,
    pardeg: Option<usize>,
    _t: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F: Clone> Clone for FlatMap<In, Out, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            pardeg: self.pardeg,
            _t: PhantomData,
        }
    }
}

impl<In, Out, F> FlatMap<In, Out, F>
where
    In: Data,
    Out: Data,
    F: Fn(In, &mut Collector<Out>) + Clone + Send + 'static,
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

impl<In, Out, F> OperatorNode for FlatMap<In, Out, F>
where
    In: Data,
    Out: Data,
    F: Fn(In, &mut Collector<Out>) + Clone + Send + 'static,
{
    fn name(&self) -> &'static str {
        "flat-map"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::FlatMap
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
        builder.add_farm(self.name(), par, false, &mut |_| {
            Box::new(FlatMapStage {
                f: f.clone(),
                capacity,
                _t: PhantomData,
            })
        });
        Ok(())
    }

    fn erased_kernel(&self, capacity: usize) -> Option<ErasedKernel> {
        let f = self.f.clone();
        Some(Box::new(move |batch, emit| {
            let input = open::<In>(batch);
            let mut collector = Collector::new(capacity.max(1));
            for (_meta, item) in input.drain() {
                (f)(item, &mut collector);
            }
            for out_batch in collector.into_batches() {
                if !out_batch.is_empty() {
                    emit(seal(out_batch));
                }
            }
        }))
    }
}

struct FlatMapStage<In, Out, F> {
    f: F,
    capacity: usize,
    _t: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F> StageLogic for FlatMapStage<In, Out, F>
where
    In: Data,
    Out: Data,
    F: Fn(In, &mut Collector<Out>) + Send,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        let input = open::<In>(batch);
        let mut collector = Collector::new(self.capacity);
        for (_meta, item) in input.drain() {
            (self.f)(item, &mut collector);
        }
        for out_batch in collector.into_batches() {
            if !out_batch.is_empty() {
                out.data(tag, seal(out_batch));
            }
        }
    }
}
