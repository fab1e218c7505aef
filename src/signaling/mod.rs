//! Signaling Module - WebSocket Client für den Signaling-Server
//!
//! - Anruf-Nachrichten (`call_invite`, `call_answer`, `connectivity_candidate`,
//!   `call_end`) als typisierte Enum
//! - WebSocket-Verbindung aufbauen und halten
//! - Eingehende Nachrichten nach Adressat filtern und weiterleiten

mod client;
mod messages;

use thiserror::Error;

pub use client::{websocket_url, SignalingClient, SignalingEvent};
pub use messages::*;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
}
