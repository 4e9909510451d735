//! Writes relayed chunks to disk instead of rendering them.
//!
//! One file per track, named `<codec>-pt<payload type>-<n>.chunks`. Each chunk
//! is stored as a big-endian u16 length followed by the chunk bytes.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use log::{info, warn};

use super::{MediaPipeline, PipelineError, PipelineFactory, PipelineKey};

pub struct DumpPipelineFactory {
    dir: PathBuf,
    created: u64,
}

impl DumpPipelineFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            created: 0,
        }
    }
}

impl PipelineFactory for DumpPipelineFactory {
    fn create(&mut self, key: &PipelineKey) -> Result<Box<dyn MediaPipeline>, PipelineError> {
        self.created += 1;
        let path = self
            .dir
            .join(format!("{}-pt{}-{}.chunks", key.codec, key.payload_type, self.created));
        Ok(Box::new(DumpPipeline { path, writer: None }))
    }
}

struct DumpPipeline {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl MediaPipeline for DumpPipeline {
    fn start(&mut self) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.writer = Some(BufWriter::new(File::create(&self.path)?));
        info!("Dumping chunks to {}", self.path.display());
        Ok(())
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipelineError::Exited("dump file closed".to_string()))?;
        let len = u16::try_from(chunk.len())
            .map_err(|_| PipelineError::Exited(format!("chunk of {} bytes too large", chunk.len())))?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(chunk)?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush {}: {}", self.path.display(), e);
            }
        }
    }
}
