//! Sink operators: the exit points of a pipeline.
//!
//! Sinks consume data and suppress c-stream propagation, so that the output
//! side of the network only carries the `Begin`/`End` echoes the executor
//! waits for. Sinks run at parallelism 1.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::batch::{open, AnyBatch, Side, Tag};
use crate::compiler::CompileError;
use crate::fabric::NetworkBuilder;
use crate::operator::{Data, OperatorClass, OperatorNode, StructureType};
use crate::stage::{Outputs, StageLogic};

/// Handle to the items gathered by a [`CollectSink`], filled when the
/// pipeline completes.
pub struct StreamOutput<T> {
    inner: Arc<Mutex<Option<Vec<T>>>>,
}

impl<T> Clone for StreamOutput<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> StreamOutput<T> {
    /// Take the collected items, `None` if the pipeline has not completed.
    pub fn get(&self) -> Option<Vec<T>> {
        self.inner.lock().take()
    }
}

/// Sink gathering every item into a vector published on completion.
pub struct CollectSink<T> {
    output: Arc<Mutex<Option<Vec<T>>>>,
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            output: self.output.clone(),
        }
    }
}

impl<T: Data> CollectSink<T> {
    pub fn new() -> (Self, StreamOutput<T>) {
        let inner: Arc<Mutex<Option<Vec<T>>>> = Arc::new(Mutex::new(None));
        (
            Self {
                output: inner.clone(),
            },
            StreamOutput { inner },
        )
    }
}

impl<T: Data> OperatorNode for CollectSink<T> {
    fn name(&self) -> &'static str {
        "collect-sink"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::Output
    }

    fn make_stage(
        &self,
        _par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        builder.add_filter(
            self.name(),
            Box::new(CollectStage {
                items: Vec::new(),
                output: self.output.clone(),
            }),
        );
        Ok(())
    }
}

struct CollectStage<T> {
    items: Vec<T>,
    output: Arc<Mutex<Option<Vec<T>>>>,
}

impl<T: Data> StageLogic for CollectStage<T> {
    fn propagate_cstream_sync(&self) -> bool {
        false
    }

    fn kernel(&mut self, _tag: Tag, batch: AnyBatch, _out: &mut Outputs) {
        let input = open::<T>(batch);
        self.items.extend(input.drain().map(|(_meta, item)| item));
    }

    fn handle_origin(&mut self, _tag: Tag, _side: Side, _out: &mut Outputs) {}

    fn end_callback(&mut self, _out: &mut Outputs) {
        *self.output.lock() = Some(std::mem::take(&mut self.items));
    }
}

/// Sink writing one formatted line per item to a file.
pub struct FileSink<T, F> {
    path: PathBuf,
    fmt: F,
    _t: PhantomData<fn(T)>,
}

impl<T, F: Clone> Clone for FileSink<T, F> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            fmt: self.fmt.clone(),
            _t: PhantomData,
        }
    }
}

impl<T, F> FileSink<T, F>
where
    T: Data,
    F: Fn(&T) -> String + Clone + Send + 'static,
{
    pub fn new(path: impl Into<PathBuf>, fmt: F) -> Self {
        Self {
            path: path.into(),
            fmt,
            _t: PhantomData,
        }
    }
}

impl<T, F> OperatorNode for FileSink<T, F>
where
    T: Data,
    F: Fn(&T) -> String + Clone + Send + 'static,
{
    fn name(&self) -> &'static str {
        "file-sink"
    }

    fn operator_class(&self) -> OperatorClass {
        OperatorClass::Output
    }

    fn make_stage(
        &self,
        _par: usize,
        _structure: StructureType,
        builder: &mut NetworkBuilder,
    ) -> Result<(), CompileError> {
        builder.add_filter(
            self.name(),
            Box::new(FileSinkStage {
                path: self.path.clone(),
                fmt: self.fmt.clone(),
                writer: None,
                _t: PhantomData,
            }),
        );
        Ok(())
    }
}

struct FileSinkStage<T, F> {
    path: PathBuf,
    fmt: F,
    writer: Option<BufWriter<File>>,
    _t: PhantomData<fn(T)>,
}

impl<T, F> StageLogic for FileSinkStage<T, F>
where
    T: Data,
    F: Fn(&T) -> String + Send,
{
    fn propagate_cstream_sync(&self) -> bool {
        false
    }

    fn begin_callback(&mut self, _out: &mut Outputs) {
        let file = File::create(&self.path)
            .unwrap_or_else(|e| panic!("cannot create {}: {e}", self.path.display()));
        self.writer = Some(BufWriter::new(file));
    }

    fn kernel(&mut self, _tag: Tag, batch: AnyBatch, _out: &mut Outputs) {
        let writer = self.writer.as_mut().expect("data before begin token");
        let input = open::<T>(batch);
        for (_meta, item) in input.drain() {
            writeln!(writer, "{}", (self.fmt)(&item))
                .unwrap_or_else(|e| panic!("error writing {}: {e}", self.path.display()));
        }
    }

    fn handle_origin(&mut self, _tag: Tag, _side: Side, _out: &mut Outputs) {}

    fn end_callback(&mut self, _out: &mut Outputs) {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .unwrap_or_else(|e| panic!("error flushing {}: {e}", self.path.display()));
        }
    }
}
