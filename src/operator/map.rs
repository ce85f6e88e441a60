use std::marker::PhantomData;

use crate::batch::{open, seal, AnyBatch, Microbatch, Tag};
use crate::compiler::CompileError;
use crate::fabric::NetworkBuilder;
use crate::operator::{Data, ErasedKernel, OperatorClass, OperatorNode, StructureType};
use crate::stage::{Outputs, StageLogic};

/// Applies a kernel to every item of the stream, producing exactly one
/// output item per input item.
///
/// On ordered flows the farm dispatches and drains in round-robin, so the
/// one-to-one kernel preserves the global order.
pub struct Map<In, Out, F> {
    f: F,
    pardeg: Option<usize>,
    _t: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F: Clone> Clone for Map<In, Out, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            pardeg: self.pardeg,
            _t: PhantomData,
        }
    }
}

impl<In, Out, F> Map<In, Out, F>
where
    In: Data,
    Out: Data,
    F: Fn(In) -> Out + Clone + Send + 'static,
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

impl<In, Out, F> OperatorNode for Map<In, Out, F>
where
    In: Data,
    Out: Data,
    F: Fn(In) -> Out + Clone + Send + 'static,
{
    fn name(&self) -> &'static str {
        "map"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::UMap
    }

    fn pardeg(&self) -> Option<usize> {
        self.pardeg
    }

    fn make_stage(
        &self,
        par: usize,
        structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        let capacity = builder.config().microbatch_size;
        let ordered = structure == StructureType::Stream;
        let f = self.f.clone();
        builder.add_farm(self.name(), par, ordered, &mut |_| {
            Box::new(MapStage {
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
            let mut mapped = Microbatch::new(capacity.max(1));
            for (meta, item) in input.drain() {
                if mapped.is_full() {
                    emit(seal(std::mem::replace(
                        &mut mapped,
                        Microbatch::new(capacity.max(1)),
                    )));
                }
                mapped.push_with(meta, (f)(item));
            }
            if !mapped.is_empty() {
                emit(seal(mapped));
            }
        }))
    }
}

struct MapStage<In, Out, F> {
    f: F,
    capacity: usize,
    _t: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F> StageLogic for MapStage<In, Out, F>
where
    In: Data,
    Out: Data,
    F: Fn(In) -> Out + Send,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, out: &mut Outputs) {
        let input = open::<In>(batch);
        let mut mapped = Microbatch::new(self.capacity);
        for (meta, item) in input.drain() {
            if mapped.is_full() {
                out.data(
                    tag,
                    seal(std::mem::replace(
                        &mut mapped,
                        Microbatch::new(self.capacity),
                    )),
                );
            }
            mapped.push_with(meta, (self.f)(item));
        }
        if !mapped.is_empty() {
            out.data(tag, seal(mapped));
        }
    }
}
