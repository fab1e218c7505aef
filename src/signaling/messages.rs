//! Message Types für das Signaling-Protokoll
//!
//! Alle Nachrichten sind JSON-Objekte mit einem `type`-Feld. Die vier
//! Anruf-Nachrichten sind symmetrisch: beide Seiten senden und empfangen sie.

use super::SignalingError;
use crate::peer::CandidateInit;
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn wants_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(format!("unknown call type '{}'", other)),
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallType::Audio => write!(f, "audio"),
            CallType::Video => write!(f, "video"),
        }
    }
}

/// Anruf-Nachrichten zwischen zwei Teilnehmern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Anruf mit SDP Offer
    CallInvite {
        #[serde(alias = "from_user_id", deserialize_with = "participant_id::required")]
        from: String,
        #[serde(alias = "to_user_id", deserialize_with = "participant_id::required")]
        to: String,
        call_type: CallType,
        sdp: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "participant_id::optional"
        )]
        conversation_id: Option<String>,
    },

    /// SDP Answer des Angerufenen
    CallAnswer {
        #[serde(alias = "from_user_id", deserialize_with = "participant_id::required")]
        from: String,
        #[serde(alias = "to_user_id", deserialize_with = "participant_id::required")]
        to: String,
        sdp: String,
    },

    /// Einzelner ICE Candidate
    ConnectivityCandidate {
        #[serde(alias = "from_user_id", deserialize_with = "participant_id::required")]
        from: String,
        #[serde(alias = "to_user_id", deserialize_with = "participant_id::required")]
        to: String,
        candidate: CandidateInit,
    },

    /// Auflegen, Ablehnen oder Abbruch
    CallEnd {
        #[serde(alias = "from_user_id", deserialize_with = "participant_id::required")]
        from: String,
        #[serde(alias = "to_user_id", deserialize_with = "participant_id::required")]
        to: String,
    },
}

impl SignalMessage {
    pub fn from(&self) -> &str {
        match self {
            SignalMessage::CallInvite { from, .. }
            | SignalMessage::CallAnswer { from, .. }
            | SignalMessage::ConnectivityCandidate { from, .. }
            | SignalMessage::CallEnd { from, .. } => from,
        }
    }

    pub fn to(&self) -> &str {
        match self {
            SignalMessage::CallInvite { to, .. }
            | SignalMessage::CallAnswer { to, .. }
            | SignalMessage::ConnectivityCandidate { to, .. }
            | SignalMessage::CallEnd { to, .. } => to,
        }
    }

    /// Name wie auf dem Draht (für Logs)
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::CallInvite { .. } => "call_invite",
            SignalMessage::CallAnswer { .. } => "call_answer",
            SignalMessage::ConnectivityCandidate { .. } => "connectivity_candidate",
            SignalMessage::CallEnd { .. } => "call_end",
        }
    }

    pub fn is_addressed_to(&self, participant_id: &str) -> bool {
        self.to() == participant_id
    }
}

/// Ids kommen als String oder als numerische Datenbank-Id
mod participant_id {
    use serde::de::{Error, Unexpected};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(id) => Ok(id),
            Value::Number(id) => Ok(id.to_string()),
            other => Err(D::Error::invalid_type(unexpected(&other), &"a string or numeric id")),
        }
    }

    pub fn optional<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::String(id) => Ok(Some(id)),
            Value::Number(id) => Ok(Some(id.to_string())),
            other => Err(D::Error::invalid_type(unexpected(&other), &"a string or numeric id")),
        }
    }

    fn unexpected(value: &Value) -> Unexpected<'_> {
        match value {
            Value::Bool(b) => Unexpected::Bool(*b),
            Value::Array(_) => Unexpected::Seq,
            Value::Object(_) => Unexpected::Map,
            _ => Unexpected::Other("value"),
        }
    }
}

// ============================================================================
// CONTROL MESSAGES
// ============================================================================

/// Verbindungs-Nachrichten an den Server (nicht an den Gegenüber)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Meldet den lokalen Teilnehmer am Server an
    Join { user_id: String },

    Heartbeat { user_id: String },
}

// ============================================================================
// CHANNEL
// ============================================================================

/// Ausgehende Seite des Signaling-Kanals. Senden blockiert nie.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;
}
