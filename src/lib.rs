//! webrtc-call-relay - browser call in, local playback out
//!
//! A browser posts a WebRTC offer to `/call`; the relay answers it with a
//! single, fully gathered answer and renders every received track locally.
//!
//! Features:
//! - Signaling codec: base64 of the session description JSON
//! - One peer connection per call, ICE gathered before answering (no trickle)
//! - Per-track relay into a render pipeline keyed by payload type and codec
//! - Keyframe requests (PLI) every 3 seconds per track
//! - Pipelines owned by a single host thread (GStreamer or raw chunk dump)

pub mod config;
pub mod engine;
pub mod peer;
pub mod pipeline;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod signal;

pub use config::{RelayConfig, SinkKind};
pub use engine::{ConnectionState, EngineError, IceServerConfig, PeerConnection, PeerEngine, RemoteTrack, RtcEngine};
pub use peer::{NegotiationError, NegotiationStep, Session, SessionId, SessionNegotiator, SessionRegistry};
pub use pipeline::{
    DumpPipelineFactory, GstPipelineFactory, MediaPipeline, PipelineError, PipelineFactory, PipelineHandle,
    PipelineHost, PipelineKey,
};
pub use relay::{MediaRelay, TrackRelay, TrackRelayState, TrackStats, PLI_INTERVAL, READ_BUFFER_SIZE};
pub use server::{CallServer, ServerError};
pub use shutdown::ShutdownSignal;
pub use signal::{MalformedSignalError, SdpType, SessionDescription};
