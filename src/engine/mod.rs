//! WebRTC engine seam.
//!
//! The negotiator and the relay only talk to these traits. `webrtc_rs` is the
//! production backend; tests plug in their own implementations.

pub mod webrtc_rs;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signal::SessionDescription;

pub use webrtc_rs::{IceServerConfig, RtcEngine};

/// Errors surfaced by an engine backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The connection is gone; nothing sent through it will ever succeed again
    #[error("Peer connection closed")]
    ConnectionClosed,

    #[error("{0}")]
    Api(String),
}

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// True once the connection can no longer carry media
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Called once per inbound track
pub type TrackHandler = Box<dyn Fn(Arc<dyn RemoteTrack>) + Send + Sync>;

/// Called on every connection state transition
pub type StateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Creates peer connections
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn new_connection(&self) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

/// One negotiated connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn on_track(&self, handler: TrackHandler);

    fn on_state_change(&self, handler: StateHandler);

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Resolves (yields or closes) once candidate gathering completes. Must be
    /// taken before `set_local_description`, which starts gathering.
    async fn gathering_complete(&self) -> mpsc::Receiver<()>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    /// Ask the sender of `media_ssrc` for a keyframe.
    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Inbound media stream
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn ssrc(&self) -> u32;

    fn payload_type(&self) -> u8;

    /// Negotiated codec, e.g. `video/VP8`
    fn mime_type(&self) -> String;

    /// Read the next chunk into `buf`, returning the number of bytes written.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError>;
}
