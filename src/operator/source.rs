//! Source operators: the entry points of a pipeline.
//!
//! A source has no upstream data: it emits its whole collection as a single
//! fresh c-stream right after forwarding the top-level `Begin`. Sources run
//! at parallelism 1.

use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::PathBuf;

use crate::batch::{seal, AnyBatch, Microbatch, Sentinel, Tag};
use crate::compiler::CompileError;
use crate::fabric::NetworkBuilder;
use crate::operator::{Data, OperatorClass, OperatorNode, StructureType};
use crate::stage::{Outputs, StageLogic};

/// Emit the microbatched items of an iterator, bracketed by a fresh
/// c-stream.
fn emit_collection<T: Data>(
    items: impl Iterator<Item = T>,
    capacity: usize,
    out: &mut Outputs,
) {
    let tag = Tag::fresh();
    out.sync(tag, Sentinel::CstreamBegin);
    let mut batch = Microbatch::new(capacity);
    for item in items {
        if batch.is_full() {
            out.data(tag, seal(std::mem::replace(&mut batch, Microbatch::new(capacity))));
        }
        batch.push(item);
    }
    if !batch.is_empty() {
        out.data(tag, seal(batch));
    }
    out.sync(tag, Sentinel::CstreamEnd);
}

/// Source reading from an in-memory iterator.
///
/// By default the collection is an unordered bag; [`ordered`] yields a
/// stream flow, selecting order-preserving farms downstream.
///
/// [`ordered`]: IteratorSource::ordered
#[derive(Clone)]
pub struct IteratorSource<It> {
    iter: It,
    structure: StructureType,
}

impl<It, T> IteratorSource<It>
where
    It: Iterator<Item = T> + Clone + Send + 'static,
    T: Data,
{
    pub fn new(iter: It) -> Self {
        Self {
            iter,
            structure: StructureType::Bag,
        }
    }

    /// An ordered variant: downstream farms preserve the iteration order.
    pub fn ordered(iter: It) -> Self {
        Self {
            iter,
            structure: StructureType::Stream,
        }
    }
}

impl<It, T> OperatorNode for IteratorSource<It>
where
    It: Iterator<Item = T> + Clone + Send + 'static,
    T: Data,
{
    fn name(&self) -> &'static str {
        "iterator-source"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::Input
    }

    fn structure(&self) -> Option<StructureType> {
        Some(self.structure)
    }

    fn accepts(&self, structure: StructureType) -> bool {
        structure == self.structure
    }

    fn make_stage(
        &self,
        _par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        let capacity = builder.config().microbatch_size;
        builder.add_filter(
            self.name(),
            Box::new(IteratorSourceStage {
                iter: Some(self.iter.clone()),
                capacity,
                _t: PhantomData,
            }),
        );
        Ok(())
    }
}

struct IteratorSourceStage<It, T> {
    iter: Option<It>,
    capacity: usize,
    _t: PhantomData<fn() -> T>,
}

impl<It, T> StageLogic for IteratorSourceStage<It, T>
where
    It: Iterator<Item = T> + Send,
    T: Data,
{
    fn kernel(&mut self, _tag: Tag, _batch: AnyBatch, _out: &mut Outputs) {
        panic!("source stage received data");
    }

    fn begin_callback(&mut self, out: &mut Outputs) {
        if let Some(iter) = self.iter.take() {
            emit_collection(iter, self.capacity, out);
        }
    }
}

/// Source reading a text file line by line, yielding an unordered bag of
/// `String` lines.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl OperatorNode for FileSource {
    fn name(&self) -> &'static str {
        "file-source"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::Input
    }

    fn structure(&self) -> Option<StructureType> {
        Some(StructureType::Bag)
    }

    fn accepts(&self, structure: StructureType) -> bool {
        structure == StructureType::Bag
    }

    fn make_stage(
        &self,
        _par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        let capacity = builder.config().microbatch_size;
        builder.add_filter(
            self.name(),
            Box::new(FileSourceStage {
                path: self.path.clone(),
                capacity,
                emitted: false,
            }),
        );
        Ok(())
    }
}

struct FileSourceStage {
    path: PathBuf,
    capacity: usize,
    emitted: bool,
}

impl StageLogic for FileSourceStage {
    fn kernel(&mut self, _tag: Tag, _batch: AnyBatch, _out: &mut Outputs) {
        panic!("source stage received data");
    }

    fn begin_callback(&mut self, out: &mut Outputs) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        let file = std::fs::File::open(&self.path)
            .unwrap_or_else(|e| panic!("cannot open {}: {e}", self.path.display()));
        let lines = BufReader::new(file).lines().map(|line| {
            line.unwrap_or_else(|e| panic!("error reading {}: {e}", self.path.display()))
        });
        emit_collection(lines, self.capacity, out);
    }
}

/// Source reading lines from standard input, yielding an ordered stream.
#[derive(Debug, Clone, Default)]
pub struct StdinSource;

impl StdinSource {
    pub fn new() -> Self {
        Self
    }
}

impl OperatorNode for StdinSource {
    fn name(&self) -> &'static str {
        "stdin-source"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::Input
    }

    fn structure(&self) -> Option<StructureType> {
        Some(StructureType::Stream)
    }

    fn accepts(&self, structure: StructureType) -> bool {
        structure == StructureType::Stream
    }

    fn make_stage(
        &self,
        _par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        let capacity = builder.config().microbatch_size;
        builder.add_filter(
            self.name(),
            Box::new(StdinSourceStage {
                capacity,
                emitted: false,
            }),
        );
        Ok(())
    }
}

struct StdinSourceStage {
    capacity: usize,
    emitted: bool,
}

impl StageLogic for StdinSourceStage {
    fn kernel(&mut self, _tag: Tag, _batch: AnyBatch, _out: &mut Outputs) {
        panic!("source stage received data");
    }

    fn begin_callback(&mut self, out: &mut Outputs) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        let stdin = std::io::stdin();
        let lines = stdin
            .lock()
            .lines()
            .map(|line| line.unwrap_or_else(|e| panic!("error reading stdin: {e}")));
        emit_collection(lines, self.capacity, out);
    }
}
