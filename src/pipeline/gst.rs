//! GStreamer render graphs driven through `gst-launch-1.0`.
//!
//! Each track gets its own child process listening on a loopback UDP port.
//! Every pushed chunk is one RTP packet and is sent as one datagram, so chunk
//! boundaries survive the hop into the graph.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use log::{debug, info, warn};

use super::{MediaPipeline, PipelineError, PipelineFactory, PipelineKey};

/// RTP caps and decode chain for one codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderGraph {
    pub media: &'static str,
    pub encoding_name: &'static str,
    pub clock_rate: u32,
    pub depayloader: &'static str,
    pub sink_chain: &'static [&'static str],
}

const VIDEO_SINK: &[&str] = &["decodebin", "!", "videoconvert", "!", "autovideosink"];
const AUDIO_SINK: &[&str] = &["decodebin", "!", "audioconvert", "!", "audioresample", "!", "autoaudiosink"];

impl RenderGraph {
    /// Decode chain for a lower-cased codec name
    pub fn for_codec(codec: &str) -> Result<Self, PipelineError> {
        let graph = match codec {
            "vp8" => Self::video("VP8", "rtpvp8depay"),
            "vp9" => Self::video("VP9", "rtpvp9depay"),
            "h264" => Self::video("H264", "rtph264depay"),
            "opus" => Self::audio("OPUS", 48000, "rtpopusdepay"),
            "g722" => Self::audio("G722", 8000, "rtpg722depay"),
            "pcmu" => Self::audio("PCMU", 8000, "rtppcmudepay"),
            "pcma" => Self::audio("PCMA", 8000, "rtppcmadepay"),
            other => return Err(PipelineError::UnsupportedCodec(other.to_string())),
        };
        Ok(graph)
    }

    fn video(encoding_name: &'static str, depayloader: &'static str) -> Self {
        Self {
            media: "video",
            encoding_name,
            clock_rate: 90000,
            depayloader,
            sink_chain: VIDEO_SINK,
        }
    }

    fn audio(encoding_name: &'static str, clock_rate: u32, depayloader: &'static str) -> Self {
        Self {
            media: "audio",
            encoding_name,
            clock_rate,
            depayloader,
            sink_chain: AUDIO_SINK,
        }
    }

    /// `gst-launch-1.0` arguments for a graph reading RTP from `port`
    pub fn launch_args(&self, payload_type: u8, port: u16) -> Vec<String> {
        let caps = format!(
            "caps=application/x-rtp,media={},payload={},encoding-name={},clock-rate={}",
            self.media, payload_type, self.encoding_name, self.clock_rate
        );
        let mut args = vec![
            "-q".to_string(),
            "udpsrc".to_string(),
            "address=127.0.0.1".to_string(),
            format!("port={}", port),
            caps,
            "!".to_string(),
            "rtpjitterbuffer".to_string(),
            "!".to_string(),
            self.depayloader.to_string(),
            "!".to_string(),
        ];
        args.extend(self.sink_chain.iter().map(|s| s.to_string()));
        args
    }
}

/// Builds one `gst-launch-1.0` process per track
pub struct GstPipelineFactory {
    program: PathBuf,
}

impl GstPipelineFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PipelineFactory for GstPipelineFactory {
    fn create(&mut self, key: &PipelineKey) -> Result<Box<dyn MediaPipeline>, PipelineError> {
        let graph = RenderGraph::for_codec(&key.codec)?;
        Ok(Box::new(GstPipeline {
            program: self.program.clone(),
            graph,
            payload_type: key.payload_type,
            child: None,
            socket: None,
            target: None,
        }))
    }
}

struct GstPipeline {
    program: PathBuf,
    graph: RenderGraph,
    payload_type: u8,
    child: Option<Child>,
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
}

/// Pick a free loopback port for the graph's udpsrc
fn reserve_port() -> Result<u16, PipelineError> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(socket.local_addr()?.port())
}

impl MediaPipeline for GstPipeline {
    fn start(&mut self) -> Result<(), PipelineError> {
        let port = reserve_port()?;
        let args = self.graph.launch_args(self.payload_type, port);
        debug!("Launching {} {}", self.program.display(), args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| PipelineError::Spawn(format!("{}: {}", self.program.display(), e)))?;

        info!(
            "Started {} render graph (pid {}) on udp port {}",
            self.graph.encoding_name,
            child.id(),
            port
        );

        self.socket = Some(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?);
        self.target = Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        self.child = Some(child);
        Ok(())
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        let (Some(child), Some(socket), Some(target)) = (self.child.as_mut(), &self.socket, self.target) else {
            return Err(PipelineError::Exited("pipeline not started".to_string()));
        };

        if let Some(status) = child.try_wait()? {
            return Err(PipelineError::Exited(status.to_string()));
        }

        socket.send_to(chunk, target)?;
        Ok(())
    }

    fn stop(&mut self) {
        self.socket = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                warn!("Failed to stop render graph (pid {}): {}", child.id(), e);
            }
            let _ = child.wait();
        }
    }
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
