//! Negotiated sessions, one per `/call`, keyed by a generated id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use parking_lot::Mutex;

use crate::engine::PeerConnection;
use crate::relay::MediaRelay;
use crate::shutdown::ShutdownSignal;

/// Unique session identifier
pub type SessionId = u64;

/// One peer connection and the relay activities it spawned
pub struct Session {
    id: SessionId,
    connection: Arc<dyn PeerConnection>,
    relay: MediaRelay,
    shutdown: ShutdownSignal,
    created: Instant,
}

impl Session {
    pub fn new(
        id: SessionId,
        connection: Arc<dyn PeerConnection>,
        relay: MediaRelay,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            id,
            connection,
            relay,
            shutdown,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn relay(&self) -> &MediaRelay {
        &self.relay
    }

    /// True once the connection failed or was closed
    pub fn is_ended(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Stop every relay activity and close the peer connection.
    pub async fn close(&self) {
        self.shutdown.trigger();
        if let Err(e) = self.connection.close().await {
            warn!("Session {}: failed to close peer connection: {}", self.id, e);
        }

        let tracks = self.relay.track_states();
        info!(
            "Session {} closed after {:.1}s ({} track(s))",
            self.id,
            self.created.elapsed().as_secs_f64(),
            tracks.len()
        );
        for (ssrc, codec, state) in tracks {
            info!("Session {}: track {} ({}) ended in state {:?}", self.id, ssrc, codec, state);
        }
    }
}

/// Live sessions
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a session about to be negotiated
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a negotiated session, closing any that have ended since the last call.
    /// A session that already ended is closed instead of registered.
    pub async fn insert(&self, session: Session) -> Arc<Session> {
        self.reap().await;
        let session = Arc::new(session);
        if session.is_ended() {
            session.close().await;
            return session;
        }
        self.sessions.lock().insert(session.id(), session.clone());
        session
    }

    /// Close and forget one session. Returns false if it was not registered.
    pub async fn end(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().remove(&id);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every session whose connection has ended.
    pub async fn reap(&self) -> usize {
        let ended: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<SessionId> = sessions
                .values()
                .filter(|s| s.is_ended())
                .map(|s| s.id())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &ended {
            session.close().await;
        }
        ended.len()
    }

    /// Close every session (process shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
