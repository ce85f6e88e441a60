//! Operators that can be composed into a [`Pipe`](crate::Pipe).
//!
//! An operator is a compiled description of a stage: it carries the user
//! kernel, the requested parallelism and the class used by the compiler for
//! fusion matching. `make_stage` produces the worker instances wired into
//! the network being built.

use std::hash::Hash;

use dyn_clone::DynClone;

use crate::batch::{AnyBatch, Microbatch};
use crate::compiler::CompileError;
use crate::fabric::NetworkBuilder;

mod flat_map;
mod join;
mod map;
mod preduce;
mod reduce;
pub mod sink;
pub mod source;

pub use flat_map::FlatMap;
pub use join::JoinFlatMap;
pub use map::Map;
pub use preduce::PReduce;
pub use reduce::Reduce;

/// Marker trait that all the types inside a stream should implement.
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}

/// Marker trait that all the grouping keys should implement.
pub trait DataKey: Clone + Send + Hash + Eq + 'static {}
impl<T: Clone + Send + Hash + Eq + 'static> DataKey for T {}

/// The class of an operator, used by the compiler for fusion matching and
/// farm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorClass {
    Input,
    Output,
    UMap,
    FlatMap,
    Reduce,
    PReduce,
    JoinFlatMap,
    Combine,
}

impl OperatorClass {
    /// Classes whose kernel can be fused in front of a per-key reduce.
    pub fn is_map_like(&self) -> bool {
        matches!(self, OperatorClass::UMap | OperatorClass::FlatMap)
    }
}

/// Structure of the collection flowing through a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureType {
    /// Unbounded ordered flow: micro-batched ordered farms.
    Stream,
    /// Bounded unordered flow: unordered farms.
    Bag,
}

/// A type-erased batch kernel, used to splice a map-like operator into a
/// fused stage. The closure maps one input batch into zero or more output
/// batches through the `emit` callback.
pub type ErasedKernel = Box<dyn FnMut(AnyBatch, &mut dyn FnMut(AnyBatch)) + Send>;

/// A compiled unary operator, ready to be instantiated into stages.
pub trait OperatorNode: DynClone + Send {
    /// Short name of the operator, used for stage and thread names.
    fn name(&self) -> &'static str;

    fn operator_class(&self) -> OperatorClass;

    /// Parallelism requested by this operator instance, `None` to use the
    /// configured default.
    fn pardeg(&self) -> Option<usize> {
        None
    }

    /// The structure produced by this operator, declared by sources only.
    fn structure(&self) -> Option<StructureType> {
        None
    }

    /// Whether the operator can consume a flow of the given structure.
    fn accepts(&self, _structure: StructureType) -> bool {
        true
    }

    /// Wire the stage (or compound stage) implementing the operator at the
    /// given parallelism into the network being built.
    fn make_stage(
        &self,
        par: usize,
        structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError>;

    /// The batch kernel of map-like operators, handed to the next operator
    /// when a fusion applies. `capacity` is the microbatch capacity output
    /// batches are built with.
    fn erased_kernel(&self, _capacity: usize) -> Option<ErasedKernel> {
        None
    }

    /// Wire a stage fusing `prev` (a map-like operator) with this one.
    ///
    /// Only operators that support being the tail of a fusion implement
    /// this; the default declines and the compiler falls back to two plain
    /// stages.
    fn make_fused_stage(
        &self,
        _prev: &dyn OperatorNode,
        _par: usize,
        _structure: StructureType,
        _builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        Err(CompileError::FusionUnsupported)
    }
}

dyn_clone::clone_trait_object!(OperatorNode);

/// A compiled binary operator, appended by the compiler after the pair farm
/// that runs its two input sub-pipelines.
pub trait BinaryOperatorNode: DynClone + Send {
    fn name(&self) -> &'static str;

    fn operator_class(&self) -> OperatorClass;

    fn pardeg(&self) -> Option<usize> {
        None
    }

    /// Wire the stage implementing the operator. `left_input` tells whether
    /// the flowing input of the enclosing pair reaches the left sub-pipe.
    fn make_stage(
        &self,
        par: usize,
        left_input: bool,
        structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError>;
}

dyn_clone::clone_trait_object!(BinaryOperatorNode);

/// Accumulator handed to flat-map and join kernels to emit any number of
/// output items. Items are packed into microbatches of the configured
/// capacity.
pub struct Collector<Out> {
    capacity: usize,
    batches: Vec<Microbatch<Out>>,
}

impl<Out> Collector<Out> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            batches: Vec::new(),
        }
    }

    /// Add one item to the output of the kernel.
    pub fn add(&mut self, item: Out) {
        match self.batches.last_mut() {
            Some(batch) if !batch.is_full() => batch.push(item),
            _ => {
                let mut batch = Microbatch::new(self.capacity);
                batch.push(item);
                self.batches.push(batch);
            }
        }
    }

    pub(crate) fn into_batches(self) -> Vec<Microbatch<Out>> {
        self.batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_packs_batches() {
        let mut collector = Collector::new(2);
        for i in 0..5 {
            collector.add(i);
        }
        let batches = collector.into_batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches
                .iter()
                .flat_map(|b| b.iter().copied())
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
    }
}
