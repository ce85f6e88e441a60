//! The executor: owns the compiled stage network, runs the sync protocol
//! and joins the workers.

use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::batch::{Message, Sentinel, Tag};
use crate::compiler::{compile, CompileError};
use crate::config::Config;
use crate::fabric::Network;
use crate::pipe::Pipe;
use crate::stage::worker::spawn_stage;

/// Errors raised while running a compiled pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("stage {stage} panicked")]
    WorkerPanic { stage: String },

    #[error("sync protocol violation: {0}")]
    Protocol(String),

    #[error("the pipeline was already run")]
    AlreadyRun,
}

/// Compiles a [`Pipe`] at construction and drives one execution of it.
///
/// `run` starts every stage, offloads the `Begin` and `End` tokens into the
/// input side of the network, closes the input edge and waits for the two
/// sync echoes on the output side before joining all the stages.
///
/// ## Example
///
/// ```no_run
/// # use ruscello::prelude::*;
/// let (sink, output) = CollectSink::new();
/// let pipe = Pipe::new()
///     .add(IteratorSource::new(0..10u32))
///     .add(Map::new(|x: u32| x * 2))
///     .add(sink);
/// Executor::new(&pipe).unwrap().run().unwrap();
/// let doubled: Vec<u32> = output.get().unwrap();
/// # let _ = doubled;
/// ```
pub struct Executor {
    network: Option<Network>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Executor {
    /// Compile the pipeline with the process-wide configuration.
    pub fn new(pipe: &Pipe) -> Result<Executor, CompileError> {
        Self::with_config(pipe, Config::global().clone())
    }

    /// Compile the pipeline with an explicit configuration.
    pub fn with_config(pipe: &Pipe, config: Config) -> Result<Executor, CompileError> {
        config.install();
        let network = compile(pipe, &config)?;
        debug!(
            "pipeline compiled into {} stages, microbatch size {}",
            network.stages.len(),
            config.microbatch_size
        );
        Ok(Executor {
            network: Some(network),
            handles: Vec::new(),
        })
    }

    /// Run the pipeline to completion.
    pub fn run(&mut self) -> Result<(), RunError> {
        let Network {
            stages,
            input,
            output,
        } = self.network.take().ok_or(RunError::AlreadyRun)?;

        info!("starting {} stages", stages.len());
        for (index, node) in stages.into_iter().enumerate() {
            let name = node.name.clone();
            self.handles.push((name, spawn_stage(index, node)));
        }

        // offload the execution brackets, then close the input edge
        for token in [Sentinel::Begin, Sentinel::End] {
            input
                .send(Message::sync(Tag::NIL, token))
                .map_err(|_| RunError::Protocol("input side of the network is closed".into()))?;
        }
        drop(input);

        // await the begin echo, then drain until the end echo
        match output.recv() {
            Ok(Message::Sync {
                token: Sentinel::Begin,
                tag,
            }) if tag.is_nil() => {}
            Ok(message) => {
                return Err(RunError::Protocol(format!(
                    "expected the begin echo, got {message:?}"
                )))
            }
            Err(_) => {
                return Err(RunError::Protocol(
                    "output side of the network closed before the begin echo".into(),
                ))
            }
        }
        loop {
            match output.recv() {
                Ok(Message::Sync {
                    token: Sentinel::End,
                    tag,
                }) if tag.is_nil() => break,
                Ok(message) => {
                    // a pipeline not ending in a sink leaks its flow here
                    warn!("stray message on the output side: {message:?}");
                }
                Err(_) => {
                    return Err(RunError::Protocol(
                        "output side of the network closed before the end echo".into(),
                    ))
                }
            }
        }
        drop(output);

        self.join_stages()
    }

    fn join_stages(&mut self) -> Result<(), RunError> {
        let mut failed = None;
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() && failed.is_none() {
                failed = Some(name);
            }
        }
        match failed {
            Some(stage) => Err(RunError::WorkerPanic { stage }),
            None => {
                info!("pipeline completed");
                Ok(())
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // release every stage the executor still owns
        if let Some(network) = self.network.take() {
            drop(network);
        }
        if !self.handles.is_empty() {
            let _ = self.join_stages();
        }
    }
}
