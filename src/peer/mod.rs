//! Peer Module - eine Punkt-zu-Punkt Verbindung
//!
//! - `PeerConnectionManager`: Lebenszyklus einer Verbindung (Offer/Answer,
//!   ICE-Puffer, Remote-Medien, Teardown)
//! - `PeerTransport`: dünne Schicht über `RTCPeerConnection`

mod manager;
mod transport;

use thiserror::Error;

pub use manager::{NegotiationPhase, PeerCallbacks, PeerConnectionManager};
pub use transport::{
    CandidateInit, ConnectionState, IceServer, PeerTransport, SdpKind, SessionDescription,
    TransportEvents, TransportFactory, WebRtcTransport, WebRtcTransportFactory,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    Transport(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Peer connection closed")]
    Closed,
}
