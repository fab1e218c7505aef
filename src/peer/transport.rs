//! Transport-Abstraktion über `RTCPeerConnection`
//!
//! Der Manager spricht nur mit `PeerTransport`; die echte Implementierung
//! basiert auf webrtc-rs, Tests benutzen einen Fake.

use super::PeerError;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// TYPES
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description (Offer oder Answer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-Format (`candidate`, `sdpMid`, `sdpMLineIndex`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for CandidateInit {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateInit> for RTCIceCandidateInit {
    fn from(init: CandidateInit) -> Self {
        RTCIceCandidateInit {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Verbindungsstatus des Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Events, die ein Transport nach oben meldet
pub struct TransportEvents {
    pub on_local_candidate: Box<dyn Fn(CandidateInit) + Send + Sync>,
    pub on_remote_track: Box<dyn Fn(RemoteTrack) + Send + Sync>,
    pub on_state_change: Box<dyn Fn(ConnectionState) + Send + Sync>,
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError>;
    async fn stop_senders(&self);

    /// Entfernt alle Event-Handler (vor `close`)
    fn detach_handlers(&self);

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: Arc<TransportEvents>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

fn webrtc_err(e: webrtc::Error) -> PeerError {
    PeerError::Transport(e.to_string())
}

fn negotiation_err(e: webrtc::Error) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let kind = if desc.sdp_type == RTCSdpType::Answer {
        SdpKind::Answer
    } else {
        SdpKind::Offer
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

/// Erzeugt `RTCPeerConnection`s mit Default-Codecs und -Interceptors
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: Arc<TransportEvents>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        let transport = WebRtcTransport { pc };
        transport.register_handlers(events);

        Ok(Arc::new(transport))
    }
}

/// `PeerTransport` auf Basis von webrtc-rs
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    fn register_handlers(&self, events: Arc<TransportEvents>) {
        let candidate_events = Arc::clone(&events);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` markiert das Ende des Gatherings
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => (candidate_events.on_local_candidate)(init.into()),
                        Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let track_events = Arc::clone(&events);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            tracing::info!("Received remote {:?} track {}", kind, track.id());
            (track_events.on_remote_track)(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                source: Some(Arc::clone(&track)),
            });
            Box::pin(async {})
        }));

        let state_events = events;
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                (state_events.on_state_change)(s.into());
                Box::pin(async {})
            }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let sender = self.pc.add_track(track.rtp_track()).await.map_err(webrtc_err)?;

        // RTCP lesen, damit die Interceptors (NACK, Reports) arbeiten
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    async fn stop_senders(&self) {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                tracing::debug!("Failed to stop sender: {}", e);
            }
        }
    }

    fn detach_handlers(&self) {
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(webrtc_err)
    }
}
