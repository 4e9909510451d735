//! Media relay: inbound track -> render pipeline.
//!
//! For every inbound track:
//! 1. Derive the codec name from the track's mime type
//! 2. Start a pipeline keyed by (payload type, codec)
//! 3. Copy chunks from the track into the pipeline until the first read error
//! 4. Meanwhile send a PLI to the track's SSRC every 3 seconds so the sender
//!    keeps producing keyframes
//!
//! Nothing here escapes the track's own tasks: a failing pipeline or track
//! only stops that track.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::{EngineError, PeerConnection, RemoteTrack};
use crate::pipeline::{PipelineHandle, PipelineKey};
use crate::shutdown::ShutdownSignal;

/// Capacity of the per-read chunk buffer; stays under a typical path MTU
pub const READ_BUFFER_SIZE: usize = 1400;

/// Keyframe request cadence
pub const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Lifecycle of one track's relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRelayState {
    AwaitingTrack,
    PipelineStarting,
    Relaying,
    Stopped,
}

/// Per-track statistics (atomic, lock-free)
#[derive(Default)]
pub struct TrackStats {
    pub chunks_relayed: AtomicU64,
    pub bytes_relayed: AtomicU64,
    pub feedback_sent: AtomicU64,
    pub feedback_failed: AtomicU64,
}

/// `video/VP8` -> `vp8`
pub fn codec_name(mime_type: &str) -> String {
    let name = match mime_type.split_once('/') {
        Some((_, codec)) => codec,
        None => mime_type,
    };
    name.to_lowercase()
}

/// Handle on one running track relay
pub struct TrackRelay {
    ssrc: u32,
    codec: String,
    state: watch::Receiver<TrackRelayState>,
    stats: Arc<TrackStats>,
    task: JoinHandle<()>,
}

impl TrackRelay {
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn state(&self) -> TrackRelayState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &Arc<TrackStats> {
        &self.stats
    }

    /// Wait for the relay to reach `Stopped`.
    pub async fn stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == TrackRelayState::Stopped)
            .await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts a relay for every track of one session
#[derive(Clone)]
pub struct MediaRelay {
    pipelines: PipelineHandle,
    session: ShutdownSignal,
    tracks: Arc<Mutex<Vec<TrackRelay>>>,
}

impl MediaRelay {
    pub fn new(pipelines: PipelineHandle, session: ShutdownSignal) -> Self {
        Self {
            pipelines,
            session,
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Track callback. Spawns the relay and returns immediately.
    pub fn on_track(&self, connection: Weak<dyn PeerConnection>, track: Arc<dyn RemoteTrack>) {
        let relay = self.start(connection, track);
        self.tracks.lock().push(relay);
    }

    /// Spawn the relay for one track on the current tokio runtime.
    pub fn start(&self, connection: Weak<dyn PeerConnection>, track: Arc<dyn RemoteTrack>) -> TrackRelay {
        let ssrc = track.ssrc();
        let codec = codec_name(&track.mime_type());
        let key = PipelineKey::new(track.payload_type(), &codec);
        info!("Track has started, of type {}: {} (SSRC {})", key.payload_type, codec, ssrc);

        let (state_tx, state_rx) = watch::channel(TrackRelayState::AwaitingTrack);
        let stats = Arc::new(TrackStats::default());

        let task = tokio::spawn(relay_track(
            connection,
            track,
            key,
            self.pipelines.clone(),
            self.session.clone(),
            state_tx,
            stats.clone(),
        ));

        TrackRelay {
            ssrc,
            codec,
            state: state_rx,
            stats,
            task,
        }
    }

    /// Snapshot of (ssrc, codec, state) for every track seen so far
    pub fn track_states(&self) -> Vec<(u32, String, TrackRelayState)> {
        self.tracks
            .lock()
            .iter()
            .map(|t| (t.ssrc(), t.codec().to_string(), t.state()))
            .collect()
    }
}

async fn relay_track(
    connection: Weak<dyn PeerConnection>,
    track: Arc<dyn RemoteTrack>,
    key: PipelineKey,
    pipelines: PipelineHandle,
    session: ShutdownSignal,
    state: watch::Sender<TrackRelayState>,
    stats: Arc<TrackStats>,
) {
    let ssrc = track.ssrc();
    state.send_replace(TrackRelayState::PipelineStarting);

    // Triggered by the host if the pipeline dies, and by us when the relay ends.
    let track_done = ShutdownSignal::new();

    let sink = match pipelines.create(key.clone(), track_done.clone()).await {
        Ok(sink) => sink,
        Err(e) => {
            warn!("Failed to create pipeline {} for SSRC {}: {}", key, ssrc, e);
            state.send_replace(TrackRelayState::Stopped);
            return;
        }
    };

    state.send_replace(TrackRelayState::Relaying);
    tokio::spawn(send_feedback(
        connection,
        ssrc,
        session.clone(),
        track_done.clone(),
        stats.clone(),
    ));

    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            read = track.read(&mut buf) => read,
            _ = session.triggered() => break,
            _ = track_done.triggered() => break,
        };

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                info!("Track {} ended: {}", ssrc, e);
                break;
            }
        };

        // Waits while the pipeline host is backed up.
        let pushed = tokio::select! {
            pushed = sink.push(Bytes::copy_from_slice(&buf[..n])) => pushed.is_ok(),
            _ = session.triggered() => false,
            _ = track_done.triggered() => false,
        };
        if !pushed {
            break;
        }
        stats.chunks_relayed.fetch_add(1, Ordering::Relaxed);
        stats.bytes_relayed.fetch_add(n as u64, Ordering::Relaxed);
    }

    track_done.trigger();
    sink.close().await;
    state.send_replace(TrackRelayState::Stopped);

    info!(
        "Relay for SSRC {} stopped: {} chunks, {} bytes, {} PLIs sent, {} PLIs failed",
        ssrc,
        stats.chunks_relayed.load(Ordering::Relaxed),
        stats.bytes_relayed.load(Ordering::Relaxed),
        stats.feedback_sent.load(Ordering::Relaxed),
        stats.feedback_failed.load(Ordering::Relaxed),
    );
}

/// Send a PLI for `ssrc` every [`PLI_INTERVAL`], first one immediately.
///
/// Failed sends are logged and retried on the next tick. Stops once the
/// connection is gone or closed, or either signal fires.
pub async fn send_feedback(
    connection: Weak<dyn PeerConnection>,
    ssrc: u32,
    session: ShutdownSignal,
    track_done: ShutdownSignal,
    stats: Arc<TrackStats>,
) {
    let mut ticker = tokio::time::interval(PLI_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session.triggered() => break,
            _ = track_done.triggered() => break,
        }

        let Some(connection) = connection.upgrade() else {
            break;
        };

        match connection.send_picture_loss_indication(ssrc).await {
            Ok(()) => {
                stats.feedback_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(EngineError::ConnectionClosed) => {
                debug!("Connection closed, stopping PLI for SSRC {}", ssrc);
                break;
            }
            Err(e) => {
                stats.feedback_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send PLI for SSRC {}: {}", ssrc, e);
            }
        }
    }
}
