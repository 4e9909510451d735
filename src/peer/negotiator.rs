//! Offer in, answer out.
//!
//! Flow for one call:
//! 1. Decode the remote offer (before touching the engine)
//! 2. Create a peer connection and register the track/state handlers
//! 3. Set the remote description and create an answer
//! 4. Set the local description and wait for ICE gathering to complete
//! 5. Encode the final local description, candidates included
//!
//! Only one signaling message travels each way (no trickle ICE), so the answer
//! is useless to the browser until it carries every gathered candidate.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use super::session::{Session, SessionId, SessionRegistry};
use crate::engine::{EngineError, PeerConnection, PeerEngine};
use crate::pipeline::PipelineHandle;
use crate::relay::MediaRelay;
use crate::shutdown::ShutdownSignal;
use crate::signal::{self, MalformedSignalError, SessionDescription};

/// Default upper bound on ICE gathering
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine call that failed during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateConnection,
    SetRemoteDescription,
    CreateAnswer,
    SetLocalDescription,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationStep::CreateConnection => "create peer connection",
            NegotiationStep::SetRemoteDescription => "set remote description",
            NegotiationStep::CreateAnswer => "create answer",
            NegotiationStep::SetLocalDescription => "set local description",
        };
        f.write_str(s)
    }
}

/// Errors that end one negotiation. Never fatal to the process.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Malformed offer: {0}")]
    MalformedSignal(#[from] MalformedSignalError),

    #[error("Failed to {step}: {source}")]
    Engine {
        step: NegotiationStep,
        #[source]
        source: EngineError,
    },

    #[error("ICE gathering did not complete within {0:?}")]
    GatheringTimeout(Duration),

    #[error("No local description available")]
    MissingLocalDescription,
}

fn at(step: NegotiationStep) -> impl FnOnce(EngineError) -> NegotiationError {
    move |source| NegotiationError::Engine { step, source }
}

/// Turns remote offers into answers, one fresh peer connection per call
pub struct SessionNegotiator {
    engine: Arc<dyn PeerEngine>,
    pipelines: PipelineHandle,
    sessions: Arc<SessionRegistry>,
    gather_timeout: Duration,
}

impl SessionNegotiator {
    pub fn new(engine: Arc<dyn PeerEngine>, pipelines: PipelineHandle) -> Self {
        Self {
            engine,
            pipelines,
            sessions: Arc::new(SessionRegistry::new()),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }

    pub fn with_gather_timeout(mut self, gather_timeout: Duration) -> Self {
        self.gather_timeout = gather_timeout;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Answer `remote_offer` (an encoded offer). Returns the encoded answer
    /// only after candidate gathering has completed.
    pub async fn negotiate(&self, remote_offer: &str) -> Result<String, NegotiationError> {
        let offer = signal::decode(remote_offer)?;

        let id = self.sessions.next_id();
        let connection = self
            .engine
            .new_connection()
            .await
            .map_err(at(NegotiationStep::CreateConnection))?;

        let shutdown = ShutdownSignal::new();
        let relay = MediaRelay::new(self.pipelines.clone(), shutdown.clone());
        register_handlers(id, &connection, &relay, &shutdown, Arc::downgrade(&self.sessions));

        match self.answer(&connection, offer).await {
            Ok(answer) => {
                info!(
                    "Session {} negotiated ({} local candidate(s))",
                    id,
                    answer.candidate_count()
                );
                self.sessions
                    .insert(Session::new(id, connection, relay, shutdown))
                    .await;
                Ok(signal::encode(&answer))
            }
            Err(e) => {
                warn!("Session {} negotiation failed: {}", id, e);
                shutdown.trigger();
                if let Err(close_err) = connection.close().await {
                    warn!("Session {}: failed to close peer connection: {}", id, close_err);
                }
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        connection: &Arc<dyn PeerConnection>,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        connection
            .set_remote_description(offer)
            .await
            .map_err(at(NegotiationStep::SetRemoteDescription))?;

        let answer = connection
            .create_answer()
            .await
            .map_err(at(NegotiationStep::CreateAnswer))?;

        // Subscribe before setting the local description, which starts gathering.
        let mut gather_complete = connection.gathering_complete().await;

        connection
            .set_local_description(answer)
            .await
            .map_err(at(NegotiationStep::SetLocalDescription))?;

        // Completion is either a message or the channel closing.
        if tokio::time::timeout(self.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            return Err(NegotiationError::GatheringTimeout(self.gather_timeout));
        }

        connection
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)
    }
}

fn register_handlers(
    id: SessionId,
    connection: &Arc<dyn PeerConnection>,
    relay: &MediaRelay,
    shutdown: &ShutdownSignal,
    sessions: Weak<SessionRegistry>,
) {
    let track_relay = relay.clone();
    let weak_connection = Arc::downgrade(connection);
    connection.on_track(Box::new(move |track| {
        track_relay.on_track(weak_connection.clone(), track);
    }));

    let session_shutdown = shutdown.clone();
    connection.on_state_change(Box::new(move |state| {
        info!("Session {} connection state has changed: {}", id, state);
        if state.is_terminal() && session_shutdown.trigger() {
            info!("Session {} ended, stopping its relays", id);
            // A session still negotiating is not registered yet; insert() refuses it later.
            let runtime = tokio::runtime::Handle::try_current();
            if let (Some(sessions), Ok(runtime)) = (sessions.upgrade(), runtime) {
                runtime.spawn(async move {
                    sessions.end(id).await;
                });
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FailStep, Gathering, MockBehaviour, MockEngine, MockTrack};
    use crate::engine::ConnectionState;
    use crate::pipeline::testing::{spawn_host, Recorder, RecordingFactory};
    use crate::relay::TrackRelayState;

    const OFFER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn negotiator(engine: Arc<MockEngine>, recorder: Recorder) -> SessionNegotiator {
        SessionNegotiator::new(engine, spawn_host(RecordingFactory::new(recorder)))
    }

    fn offer() -> String {
        signal::encode(&SessionDescription::offer(OFFER_SDP))
    }

    #[tokio::test]
    async fn test_negotiate_waits_for_gathering() {
        let engine = Arc::new(MockEngine::with_behaviour(MockBehaviour {
            gathering: Gathering::Complete {
                delay: Duration::from_millis(100),
                candidates: vec![
                    "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
                    "candidate:2 1 udp 2130706431 10.0.0.3 50001 typ host".to_string(),
                ],
            },
            ..Default::default()
        }));
        let negotiator = negotiator(engine.clone(), Recorder::default());

        let answer = signal::decode(&negotiator.negotiate(&offer()).await.unwrap()).unwrap();
        assert_eq!(answer.sdp_type, signal::SdpType::Answer);
        assert_eq!(answer.candidate_count(), 2);

        let connection = engine.last_connection().unwrap();
        assert_eq!(connection.remote(), Some(SessionDescription::offer(OFFER_SDP)));
        assert!(connection.has_track_handler());
        assert!(!connection.is_closed());
        assert_eq!(negotiator.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_offer_has_no_side_effects() {
        let engine = Arc::new(MockEngine::default());
        let negotiator = negotiator(engine.clone(), Recorder::default());

        for bad in ["", "%%%", "aGVsbG8="] {
            let err = negotiator.negotiate(bad).await.unwrap_err();
            assert!(matches!(err, NegotiationError::MalformedSignal(_)), "{}", err);
        }
        assert_eq!(engine.connection_count(), 0);
        assert!(negotiator.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_closes_connection() {
        for (fail_step, expected) in [
            (FailStep::RemoteDescription, NegotiationStep::SetRemoteDescription),
            (FailStep::CreateAnswer, NegotiationStep::CreateAnswer),
            (FailStep::LocalDescription, NegotiationStep::SetLocalDescription),
        ] {
            let engine = Arc::new(MockEngine::with_behaviour(MockBehaviour {
                fail_step: Some(fail_step),
                ..Default::default()
            }));
            let negotiator = negotiator(engine.clone(), Recorder::default());

            match negotiator.negotiate(&offer()).await {
                Err(NegotiationError::Engine { step, .. }) => assert_eq!(step, expected),
                other => panic!("unexpected result: {:?}", other),
            }
            assert!(engine.last_connection().unwrap().is_closed());
            assert!(negotiator.sessions().is_empty());
        }
    }

    #[tokio::test]
    async fn test_create_connection_failure() {
        let engine = Arc::new(MockEngine {
            fail_create: true,
            ..Default::default()
        });
        let negotiator = negotiator(engine, Recorder::default());

        let err = negotiator.negotiate(&offer()).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Engine {
                step: NegotiationStep::CreateConnection,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_timeout() {
        let engine = Arc::new(MockEngine::with_behaviour(MockBehaviour {
            gathering: Gathering::Never,
            ..Default::default()
        }));
        let negotiator = negotiator(engine.clone(), Recorder::default())
            .with_gather_timeout(Duration::from_secs(5));

        let err = negotiator.negotiate(&offer()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::GatheringTimeout(d) if d == Duration::from_secs(5)));
        assert!(engine.last_connection().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_tracks_relay_after_negotiation() {
        let engine = Arc::new(MockEngine::default());
        let recorder = Recorder::default();
        let negotiator = negotiator(engine.clone(), recorder.clone());
        negotiator.negotiate(&offer()).await.unwrap();

        let connection = engine.last_connection().unwrap();
        connection.emit_track(Arc::new(MockTrack::new(
            5,
            96,
            "video/VP8",
            vec![b"k1".to_vec(), b"k2".to_vec()],
        )));

        let session = negotiator.sessions().get(1).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.relay().track_states() != vec![(5, "vp8".to_string(), TrackRelayState::Stopped)] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(recorder.pushed_for("vp8"), vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[tokio::test]
    async fn test_terminal_state_ends_session() {
        let engine = Arc::new(MockEngine::default());
        let negotiator = negotiator(engine.clone(), Recorder::default());
        negotiator.negotiate(&offer()).await.unwrap();
        negotiator.negotiate(&offer()).await.unwrap();
        assert_eq!(negotiator.sessions().len(), 2);

        let first = engine.connections.lock()[0].clone();
        let second = engine.connections.lock()[1].clone();
        first.emit_state(ConnectionState::Connected);
        assert!(!negotiator.sessions().get(1).unwrap().is_ended());
        first.emit_state(ConnectionState::Failed);

        // Removal and close happen on their own, without another call arriving.
        tokio::time::timeout(Duration::from_secs(5), async {
            while negotiator.sessions().len() != 1 || !first.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(negotiator.sessions().get(1).is_none());
        assert!(negotiator.sessions().get(2).is_some());
        assert!(!second.is_closed());
    }
}
