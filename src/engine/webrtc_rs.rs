//! webrtc-rs backend for the engine traits.
//!
//! Wraps RTCPeerConnection and TrackRemote from the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::Marshal;

use super::{
    ConnectionState, EngineError, PeerConnection, PeerEngine, RemoteTrack, StateHandler, TrackHandler,
};
use crate::signal::{SdpType, SessionDescription};

/// ICE server configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Parse `url` or `url|username|credential`
    pub fn parse(spec: &str) -> Self {
        let mut parts = spec.splitn(3, '|');
        let url = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (Some(username), Some(credential)) => Self::turn(url, username, credential),
            _ => Self::stun(url),
        }
    }

    fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn map_error(e: webrtc::Error) -> EngineError {
    match e {
        webrtc::Error::ErrConnectionClosed
        | webrtc::Error::ErrClosedPipe
        | webrtc::Error::Util(webrtc::util::Error::ErrBufferClosed) => EngineError::ConnectionClosed,
        other => EngineError::Api(other.to_string()),
    }
}

/// Serialize a received packet back into `buf`. Padding-only packets yield `None`.
fn repack(mut packet: RtpPacket, buf: &mut [u8]) -> Result<Option<usize>, EngineError> {
    if packet.payload.is_empty() {
        return Ok(None);
    }
    // Padding was stripped from the payload on read.
    packet.header.padding = false;
    packet
        .marshal_to(buf)
        .map(Some)
        .map_err(|e| EngineError::Api(format!("Failed to serialize RTP packet: {}", e)))
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(EngineError::Api("Rollback descriptions are not supported".to_string()))
        }
    };
    result.map_err(|e| EngineError::Api(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(EngineError::Api("Session description has no type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

/// Engine backed by a webrtc-rs API instance with default codecs and interceptors
pub struct RtcEngine {
    api: API,
    ice_servers: Vec<IceServerConfig>,
}

impl RtcEngine {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Result<Self, EngineError> {
        Self::with_setting_engine(ice_servers, SettingEngine::default())
    }

    /// Engine with custom transport settings, e.g. loopback candidates
    pub fn with_setting_engine(
        ice_servers: Vec<IceServerConfig>,
        setting_engine: SettingEngine,
    ) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Api(format!("Failed to register codecs: {}", e)))?;

        // NACK, RTCP reports and TWCC
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::Api(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self { api, ice_servers })
    }

    fn build_rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(|s| s.to_rtc_ice_server()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn new_connection(&self) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let peer_connection = self
            .api
            .new_peer_connection(self.build_rtc_config())
            .await
            .map_err(|e| EngineError::Api(format!("Failed to create peer connection: {}", e)))?;

        peer_connection.on_ice_connection_state_change(Box::new(|state: RTCIceConnectionState| {
            info!("ICE connection state has changed: {}", state);
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection {
            inner: Arc::new(peer_connection),
        }))
    }
}

/// RTCPeerConnection behind the engine trait
pub struct RtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn on_track(&self, handler: TrackHandler) {
        self.inner.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                handler(Arc::new(RtcRemoteTrack { track }));
                Box::pin(async {})
            },
        ));
    }

    fn on_state_change(&self, handler: StateHandler) {
        self.inner
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => ConnectionState::New,
                };
                handler(state);
                Box::pin(async {})
            }));
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.inner
            .set_remote_description(description)
            .await
            .map_err(map_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.inner.create_answer(None).await.map_err(map_error)?;
        from_rtc_description(answer)
    }

    async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        self.inner.gathering_complete_promise().await
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.inner
            .set_local_description(description)
            .await
            .map_err(map_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.inner.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<(), EngineError> {
        let packets: [Box<dyn RtcpPacket + Send + Sync>; 1] = [Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })];
        self.inner.write_rtcp(&packets).await.map_err(map_error)?;
        debug!("Sent PLI for SSRC {}", media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.close().await.map_err(map_error)
    }
}

/// TrackRemote behind the engine trait.
///
/// Chunks are whole RTP packets so the render graph can depayload them.
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for RtcRemoteTrack {
    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn payload_type(&self) -> u8 {
        self.track.payload_type()
    }

    fn mime_type(&self) -> String {
        self.track.codec().capability.mime_type
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        loop {
            let (packet, _attributes) = self.track.read(buf).await.map_err(map_error)?;
            if let Some(n) = repack(packet, buf)? {
                return Ok(n);
            }
        }
    }
}
