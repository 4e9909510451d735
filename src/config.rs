//! Relay configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::IceServerConfig;
use crate::peer::negotiator::DEFAULT_GATHER_TIMEOUT;
use crate::pipeline::{DumpPipelineFactory, GstPipelineFactory, PipelineFactory};

/// Where received media ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Decode and render locally through GStreamer
    Gstreamer,
    /// Write raw chunks to files
    Dump,
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP listen address (default 0.0.0.0:8888)
    pub listen: SocketAddr,
    /// Directory holding index.html and the demo assets
    pub static_dir: PathBuf,
    /// ICE servers, each `url` or `url|username|credential`. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    /// Upper bound on ICE gathering per call
    pub gather_timeout: Duration,
    pub sink: SinkKind,
    /// `gst-launch-1.0` executable used by the GStreamer sink
    pub gst_launch: PathBuf,
    /// Output directory of the dump sink
    pub dump_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8888)),
            static_dir: PathBuf::from("static"),
            ice_servers: Vec::new(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            sink: SinkKind::Gstreamer,
            gst_launch: PathBuf::from("gst-launch-1.0"),
            dump_dir: PathBuf::from("dump"),
        }
    }
}

impl RelayConfig {
    pub fn ice_server_configs(&self) -> Vec<IceServerConfig> {
        self.ice_servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(IceServerConfig::parse)
            .collect()
    }

    /// Factory for the configured sink, to be moved onto the pipeline host
    pub fn pipeline_factory(&self) -> Box<dyn PipelineFactory> {
        match self.sink {
            SinkKind::Gstreamer => Box::new(GstPipelineFactory::new(self.gst_launch.clone())),
            SinkKind::Dump => Box::new(DumpPipelineFactory::new(self.dump_dir.clone())),
        }
    }
}
