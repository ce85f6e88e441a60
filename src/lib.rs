//! Microbatch dataflow execution engine.
//!
//! The crate compiles a user-declared pipeline of algebraic operators (map,
//! flat-map, reduce, per-key reduce, binary join, iteration) into a network
//! of worker threads exchanging microbatches and control tokens over
//! bounded channels. Each operator is parallelised across a configurable
//! number of workers by the fan-out / fan-in fabric, which duplicates and
//! coalesces the stream-boundary tokens so that every sink sees exactly one
//! `Begin`/`End` bracket and one `CstreamBegin`/`CstreamEnd` pair per
//! stream segment.
//!
//! The building blocks:
//! - [`Microbatch`]: the fixed-capacity slab of decorated items, the unit
//!   of data transfer;
//! - [`Pipe`]: the recursive pipeline term built with `add`, `to`,
//!   `pair_with` and `iterate`;
//! - [`operator`]: the operator factories consumed by the compiler;
//! - [`Executor`]: compiles the term and drives one execution of it.
//!
//! ## Example
//!
//! ```no_run
//! use ruscello::prelude::*;
//!
//! let (sink, output) = CollectSink::new();
//! let pipe = Pipe::new()
//!     .add(IteratorSource::new(["a b a", "c a b"].into_iter().map(str::to_owned)))
//!     .add(FlatMap::new(|line: String, coll: &mut Collector<String>| {
//!         for token in line.split_whitespace() {
//!             coll.add(token.to_owned());
//!         }
//!     }))
//!     .add(Map::new(|word: String| (word, 1u64)))
//!     .add(PReduce::<String, u64, _>::new(|a, b| a + b))
//!     .add(sink);
//!
//! Executor::new(&pipe).unwrap().run().unwrap();
//! let counts: Vec<(String, u64)> = output.get().unwrap();
//! # let _ = counts;
//! ```

mod batch;
mod channel;
mod compiler;
mod config;
mod executor;
mod fabric;
mod iteration;
pub mod operator;
mod pair;
mod pipe;
mod stage;
pub mod test;

pub use batch::{open, seal, try_open, AnyBatch, Message, Microbatch, Sentinel, Side, Tag, TokenMeta};
pub use compiler::CompileError;
pub use config::{Config, ConfigError, MBSIZE_ENV_VAR, PARDEG_ENV_VAR};
pub use executor::{Executor, RunError};
pub use fabric::{group_by_hash, GroupHasherBuilder, NetworkBuilder};
pub use iteration::{FixedIterations, IterationCtx, TerminationCondition};
pub use pipe::Pipe;
pub use stage::{Forward, Outputs, StageLogic};

/// The most commonly used types, in one import.
pub mod prelude {
    pub use crate::operator::sink::{CollectSink, FileSink, StreamOutput};
    pub use crate::operator::source::{FileSource, IteratorSource, StdinSource};
    pub use crate::operator::{
        Collector, FlatMap, JoinFlatMap, Map, OperatorClass, PReduce, Reduce, StructureType,
    };
    pub use crate::{Config, Executor, FixedIterations, Pipe};
}
