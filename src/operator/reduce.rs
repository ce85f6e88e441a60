use std::collections::HashMap;
use std::marker::PhantomData;

use crate::batch::{open, seal, AnyBatch, Microbatch, Tag};
use crate::compiler::CompileError;
use crate::fabric::{NetworkBuilder, TagHasherBuilder};
use crate::operator::{Data, OperatorClass, OperatorNode, StructureType};
use crate::stage::{Outputs, StageLogic};

/// Folds the whole stream into a single value with an associative
/// commutative kernel.
///
/// Compiles to a farm of partial folders followed by a sequential combiner:
/// each worker folds its share per stream segment and emits the partial when
/// the segment closes, the combiner folds the partials into the final value.
pub struct Reduce<T, F> {
    f: F,
    pardeg: Option<usize>,
    _t: PhantomData<fn(T)>,
}

impl<T, F: Clone> Clone for Reduce<T, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            pardeg: self.pardeg,
            _t: PhantomData,
        }
    }
}

impl<T, F> Reduce<T, F>
where
    T: Data,
    F: Fn(T, T) -> T + Clone + Send + 'static,
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

impl<T, F> OperatorNode for Reduce<T, F>
where
    T: Data,
    F: Fn(T, T) -> T + Clone + Send + 'static,
{
    fn name(&self) -> &'static str {
        "reduce"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::Reduce
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
        let f = self.f.clone();
        builder.add_farm(self.name(), par, false, &mut |_| {
            Box::new(FoldStage::new(f.clone()))
        });
        if par > 1 {
            // fold the at most `par` partials into the final value
            builder.add_filter("reduce-combine", Box::new(FoldStage::new(self.f.clone())));
        }
        Ok(())
    }
}

/// Folds the items of each stream segment, emitting one value per segment
/// when it closes. Used both as the partial folder and as the combiner.
struct FoldStage<T, F> {
    f: F,
    partial: HashMap<Tag, T, TagHasherBuilder>,
}

impl<T, F> FoldStage<T, F> {
    fn new(f: F) -> Self {
        Self {
            f,
            partial: HashMap::default(),
        }
    }
}

impl<T, F> StageLogic for FoldStage<T, F>
where
    T: Data,
    F: Fn(T, T) -> T + Send,
{
    fn kernel(&mut self, tag: Tag, batch: AnyBatch, _out: &mut Outputs) {
        let input = open::<T>(batch);
        for (_meta, item) in input.drain() {
            let folded = match self.partial.remove(&tag) {
                Some(acc) => (self.f)(acc, item),
                None => item,
            };
            self.partial.insert(tag, folded);
        }
    }

    fn cstream_end_callback(&mut self, tag: Tag, out: &mut Outputs) {
        // an empty segment folds to nothing
        if let Some(acc) = self.partial.remove(&tag) {
            out.data(tag, seal(Microbatch::from(acc)));
        }
    }
}
