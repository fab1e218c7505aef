//! Call Session und erlaubte Zustandsübergänge

use crate::peer::ConnectionState;
use crate::signaling::CallType;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    /// Kein Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf, wartet auf Answer
    Outgoing,
    /// Eingehender Anruf, wartet auf Annahme
    Incoming,
    /// Verhandlung abgeschlossen
    Active,
}

impl CallState {
    /// Idle → Outgoing/Incoming, Outgoing/Incoming → Active, alles außer Idle → Idle
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Outgoing)
                | (Idle, Incoming)
                | (Outgoing, Active)
                | (Incoming, Active)
                | (Outgoing, Idle)
                | (Incoming, Idle)
                | (Active, Idle)
        )
    }

    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::Incoming => "incoming",
            CallState::Active => "active",
        };
        f.write_str(name)
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_type: CallType,
    pub local_participant_id: String,
    pub peer_participant_id: String,
    /// Fest ab Erstellung; der Initiator sendet das Offer
    pub is_initiator: bool,
    /// Nur für die Weiterleitung nach dem Anruf
    pub associated_conversation_id: Option<String>,
}

impl CallSession {
    pub fn outgoing(
        local: &str,
        peer: &str,
        call_type: CallType,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            call_type,
            local_participant_id: local.to_string(),
            peer_participant_id: peer.to_string(),
            is_initiator: true,
            associated_conversation_id: conversation_id,
        }
    }

    pub fn incoming(
        local: &str,
        peer: &str,
        call_type: CallType,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            is_initiator: false,
            ..Self::outgoing(local, peer, call_type, conversation_id)
        }
    }

    pub fn is_peer(&self, participant_id: &str) -> bool {
        self.peer_participant_id == participant_id
    }
}

/// Lesesicht für die UI. Nur die Engine schreibt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub session: Option<CallSession>,
    pub accepting: bool,
    pub has_local_media: bool,
    pub has_remote_media: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub connection: Option<ConnectionState>,
}
