//! In-memory engine used by the negotiator, relay and server tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    ConnectionState, EngineError, PeerConnection, PeerEngine, RemoteTrack, StateHandler, TrackHandler,
};
use crate::signal::SessionDescription;

pub const ANSWER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

/// Engine step a mock connection should fail at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStep {
    RemoteDescription,
    CreateAnswer,
    LocalDescription,
}

/// How candidate gathering behaves once the local description is set
#[derive(Debug, Clone)]
pub enum Gathering {
    /// Append these candidates after `delay`, then close the completion channel
    Complete { delay: Duration, candidates: Vec<String> },
    /// Never signal completion
    Never,
}

impl Default for Gathering {
    fn default() -> Self {
        Gathering::Complete {
            delay: Duration::from_millis(20),
            candidates: vec!["candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBehaviour {
    pub fail_step: Option<FailStep>,
    pub gathering: Gathering,
}

#[derive(Default)]
pub struct MockEngine {
    pub behaviour: MockBehaviour,
    pub fail_create: bool,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockEngine {
    pub fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            ..Default::default()
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn new_connection(&self) -> Result<Arc<dyn PeerConnection>, EngineError> {
        if self.fail_create {
            return Err(EngineError::Api("mock create failure".to_string()));
        }
        let connection = Arc::new(MockConnection::with_behaviour(self.behaviour.clone()));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
pub struct MockConnection {
    behaviour: MockBehaviour,
    track_handler: Mutex<Option<TrackHandler>>,
    state_handler: Mutex<Option<StateHandler>>,
    remote: Mutex<Option<SessionDescription>>,
    local: Arc<Mutex<Option<SessionDescription>>>,
    gather_tx: Mutex<Option<mpsc::Sender<()>>>,
    closed: AtomicBool,
    failing_plis: AtomicUsize,
    plis: Mutex<Vec<(u32, Instant)>>,
}

impl MockConnection {
    pub fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            ..Default::default()
        }
    }

    /// Fail the next `n` PLI sends with a transient error
    pub fn fail_pli_sends(&self, n: usize) {
        self.failing_plis.store(n, Ordering::SeqCst);
    }

    /// Successful PLI sends as (media SSRC, time sent)
    pub fn plis(&self) -> Vec<(u32, Instant)> {
        self.plis.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn has_track_handler(&self) -> bool {
        self.track_handler.lock().is_some()
    }

    pub fn emit_track(&self, track: Arc<dyn RemoteTrack>) {
        if let Some(handler) = self.track_handler.lock().as_ref() {
            handler(track);
        }
    }

    pub fn emit_state(&self, state: ConnectionState) {
        if let Some(handler) = self.state_handler.lock().as_ref() {
            handler(state);
        }
    }

    fn check_step(&self, step: FailStep) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        if self.behaviour.fail_step == Some(step) {
            return Err(EngineError::Api(format!("mock failure at {:?}", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(handler);
    }

    fn on_state_change(&self, handler: StateHandler) {
        *self.state_handler.lock() = Some(handler);
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.check_step(FailStep::RemoteDescription)?;
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.check_step(FailStep::CreateAnswer)?;
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        *self.gather_tx.lock() = Some(tx);
        rx
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.check_step(FailStep::LocalDescription)?;
        *self.local.lock() = Some(description);

        match self.behaviour.gathering.clone() {
            Gathering::Complete { delay, candidates } => {
                let tx = self.gather_tx.lock().take();
                let local = self.local.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(desc) = local.lock().as_mut() {
                        for candidate in &candidates {
                            desc.sdp.push_str(&format!("a={}\r\n", candidate));
                        }
                    }
                    drop(tx);
                });
            }
            Gathering::Never => {}
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        let failing = self.failing_plis.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_plis.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::Api("mock PLI failure".to_string()));
        }
        self.plis.lock().push((media_ssrc, Instant::now()));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit_state(ConnectionState::Closed);
        }
        Ok(())
    }
}

enum TrackMode {
    Finite,
    Endless,
    Pending,
}

/// Track that plays back fixed chunks, then fails every read
pub struct MockTrack {
    ssrc: u32,
    payload_type: u8,
    mime_type: String,
    chunks: Mutex<VecDeque<Vec<u8>>>,
    mode: TrackMode,
    reads: AtomicUsize,
}

impl MockTrack {
    pub fn new(ssrc: u32, payload_type: u8, mime_type: &str, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            ssrc,
            payload_type,
            mime_type: mime_type.to_string(),
            chunks: Mutex::new(chunks.into()),
            mode: TrackMode::Finite,
            reads: AtomicUsize::new(0),
        }
    }

    /// Produces a 100-byte chunk on every read
    pub fn endless(ssrc: u32, payload_type: u8, mime_type: &str) -> Self {
        Self {
            mode: TrackMode::Endless,
            ..Self::new(ssrc, payload_type, mime_type, Vec::new())
        }
    }

    /// Reads never complete
    pub fn pending(ssrc: u32, payload_type: u8, mime_type: &str) -> Self {
        Self {
            mode: TrackMode::Pending,
            ..Self::new(ssrc, payload_type, mime_type, Vec::new())
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTrack for MockTrack {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            TrackMode::Pending => std::future::pending().await,
            TrackMode::Endless => {
                tokio::task::yield_now().await;
                buf[..100].fill(0xAB);
                Ok(100)
            }
            TrackMode::Finite => {
                let chunk = self.chunks.lock().pop_front();
                match chunk {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                    None => Err(EngineError::Api("EOF".to_string())),
                }
            }
        }
    }
}
