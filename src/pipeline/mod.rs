//! Media pipelines and the thread that owns them.
//!
//! Render graphs hold thread-affine native resources, so every pipeline lives
//! on one dedicated thread ([`PipelineHost`]). Relays never touch a pipeline
//! directly: creation, chunk pushes and teardown are queued as commands.
//! The queue is bounded, so a stalled host slows the relays down instead of
//! buffering media without limit.
//!
//! Backends:
//! - `gst`: one `gst-launch-1.0` render graph per track, fed over loopback UDP
//! - `dump`: length-prefixed chunk files, for headless hosts

pub mod dump;
pub mod gst;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::thread;

use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::shutdown::ShutdownSignal;

pub use dump::DumpPipelineFactory;
pub use gst::GstPipelineFactory;

/// Errors that can occur while creating or feeding a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Failed to start pipeline: {0}")]
    Spawn(String),

    #[error("Pipeline I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Pipeline exited: {0}")]
    Exited(String),

    #[error("Pipeline host is not running")]
    HostUnavailable,
}

/// Commands the host queue holds before senders wait
pub const PIPELINE_QUEUE_CAPACITY: usize = 256;

/// What a pipeline is created for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub payload_type: u8,
    /// Lower-cased codec name, e.g. `vp8` or `opus`
    pub codec: String,
}

impl PipelineKey {
    pub fn new(payload_type: u8, codec: &str) -> Self {
        Self {
            payload_type,
            codec: codec.to_lowercase(),
        }
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.codec, self.payload_type)
    }
}

/// A started sink for one track's chunks. Only ever called from the host thread.
pub trait MediaPipeline: Send {
    fn start(&mut self) -> Result<(), PipelineError>;

    fn push(&mut self, chunk: &[u8]) -> Result<(), PipelineError>;

    fn stop(&mut self);
}

/// Builds pipelines on the host thread
pub trait PipelineFactory: Send {
    fn create(&mut self, key: &PipelineKey) -> Result<Box<dyn MediaPipeline>, PipelineError>;
}

type PipelineId = u64;

enum PipelineCommand {
    Create {
        key: PipelineKey,
        failed: ShutdownSignal,
        reply: oneshot::Sender<Result<PipelineId, PipelineError>>,
    },
    Push {
        id: PipelineId,
        chunk: Bytes,
    },
    Destroy {
        id: PipelineId,
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

struct HostedPipeline {
    key: PipelineKey,
    pipeline: Box<dyn MediaPipeline>,
    failed: ShutdownSignal,
}

/// Owns every pipeline and runs them on the thread that calls [`PipelineHost::run`]
pub struct PipelineHost {
    factory: Box<dyn PipelineFactory>,
    rx: mpsc::Receiver<PipelineCommand>,
    pipelines: HashMap<PipelineId, HostedPipeline>,
    next_id: PipelineId,
}

impl PipelineHost {
    pub fn new(factory: Box<dyn PipelineFactory>) -> (Self, PipelineHandle) {
        Self::with_capacity(factory, PIPELINE_QUEUE_CAPACITY)
    }

    /// Host whose queue holds at most `capacity` commands
    pub fn with_capacity(factory: Box<dyn PipelineFactory>, capacity: usize) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let host = Self {
            factory,
            rx,
            pipelines: HashMap::new(),
            next_id: 1,
        };
        (host, PipelineHandle { tx })
    }

    /// Run on a dedicated, named thread.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("media-pipeline".to_string())
            .spawn(move || self.run())
    }

    /// Process commands until shut down or every handle is dropped.
    /// Blocks the calling thread; must not be called from async context.
    pub fn run(mut self) {
        info!("Pipeline host running on thread {:?}", thread::current().name());

        while let Some(command) = self.rx.blocking_recv() {
            match command {
                PipelineCommand::Create { key, failed, reply } => {
                    let result = self.create(key, failed);
                    let _ = reply.send(result);
                }
                PipelineCommand::Push { id, chunk } => self.push(id, &chunk),
                PipelineCommand::Destroy { id, done } => {
                    self.destroy(id);
                    let _ = done.send(());
                }
                PipelineCommand::Shutdown => break,
            }
        }

        for (_, mut hosted) in self.pipelines.drain() {
            hosted.pipeline.stop();
            hosted.failed.trigger();
        }
        info!("Pipeline host stopped");
    }

    fn create(&mut self, key: PipelineKey, failed: ShutdownSignal) -> Result<PipelineId, PipelineError> {
        let mut pipeline = self.factory.create(&key)?;
        pipeline.start()?;

        let id = self.next_id;
        self.next_id += 1;
        info!("Pipeline {} started for {}", id, key);
        self.pipelines.insert(id, HostedPipeline { key, pipeline, failed });
        Ok(id)
    }

    fn push(&mut self, id: PipelineId, chunk: &[u8]) {
        // Unknown ids belong to pipelines that already failed; drop the chunk.
        let Some(hosted) = self.pipelines.get_mut(&id) else {
            return;
        };

        if let Err(e) = hosted.pipeline.push(chunk) {
            warn!("Pipeline {} ({}) failed: {}", id, hosted.key, e);
            if let Some(mut hosted) = self.pipelines.remove(&id) {
                hosted.pipeline.stop();
                hosted.failed.trigger();
            }
        }
    }

    fn destroy(&mut self, id: PipelineId) {
        if let Some(mut hosted) = self.pipelines.remove(&id) {
            hosted.pipeline.stop();
            debug!("Pipeline {} ({}) destroyed", id, hosted.key);
        }
    }
}

/// Cloneable sender side of the host's queue
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
}

impl PipelineHandle {
    /// Create and start a pipeline on the host thread.
    ///
    /// `failed` is triggered if the pipeline later fails or the host shuts down.
    pub async fn create(&self, key: PipelineKey, failed: ShutdownSignal) -> Result<PipelineSink, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Create { key, failed, reply })
            .await
            .map_err(|_| PipelineError::HostUnavailable)?;

        let id = rx.await.map_err(|_| PipelineError::HostUnavailable)??;
        Ok(PipelineSink {
            id,
            tx: self.tx.clone(),
        })
    }

    /// Stop every pipeline and end [`PipelineHost::run`].
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PipelineCommand::Shutdown).await;
    }
}

/// Push side of one hosted pipeline
pub struct PipelineSink {
    id: PipelineId,
    tx: mpsc::Sender<PipelineCommand>,
}

impl PipelineSink {
    /// Queue one chunk, waiting while the host queue is full. Chunks from one
    /// sink reach the pipeline in push order.
    pub async fn push(&self, chunk: Bytes) -> Result<(), PipelineError> {
        self.tx
            .send(PipelineCommand::Push { id: self.id, chunk })
            .await
            .map_err(|_| PipelineError::HostUnavailable)
    }

    /// Tear the pipeline down once every queued chunk has been delivered.
    pub async fn close(self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(PipelineCommand::Destroy { id: self.id, done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
