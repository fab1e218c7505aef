//! UI-Adapter: Anzeige-Modell der Anrufsteuerung und Konsolen-Befehle
//!
//! Die UI liest nur `CallSnapshot` und schickt Absichten an die Engine.

use super::session::{CallSnapshot, CallState};
use crate::peer::ConnectionState;
use crate::signaling::CallType;
use std::str::FromStr;

// ============================================================================
// CONTROLS VIEW
// ============================================================================

/// Welche Schaltflächen gerade sichtbar bzw. aktiv sind
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallControls {
    pub headline: String,
    pub can_accept: bool,
    pub can_reject: bool,
    pub can_hang_up: bool,
    pub show_mic_toggle: bool,
    pub show_camera_toggle: bool,
    pub mic_on: bool,
    pub camera_on: bool,
    /// Platzhalter statt Remote-Video
    pub waiting_for_connection: bool,
}

impl CallControls {
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Self {
        let Some(session) = &snapshot.session else {
            return Self {
                headline: "No call".to_string(),
                ..Default::default()
            };
        };

        let peer = &session.peer_participant_id;
        let kind = match session.call_type {
            CallType::Audio => "voice",
            CallType::Video => "video",
        };
        let is_video = session.call_type.wants_video();
        let has_media = snapshot.has_local_media;

        match snapshot.state {
            CallState::Incoming if !snapshot.accepting => Self {
                headline: format!("{} is calling you ({} call)", peer, kind),
                can_accept: true,
                can_reject: true,
                ..Default::default()
            },
            CallState::Idle => Self {
                headline: "No call".to_string(),
                ..Default::default()
            },
            state => {
                let connected = snapshot.connection == Some(ConnectionState::Connected);
                let headline = match state {
                    CallState::Outgoing => format!("Calling {} ({} call)", peer, kind),
                    CallState::Incoming => format!("Connecting to {}", peer),
                    _ => format!("In {} call with {}", kind, peer),
                };
                Self {
                    headline,
                    can_hang_up: true,
                    show_mic_toggle: has_media,
                    show_camera_toggle: has_media && is_video,
                    mic_on: snapshot.mic_enabled,
                    camera_on: snapshot.camera_enabled,
                    waiting_for_connection: !(snapshot.has_remote_media && connected),
                    ..Default::default()
                }
            }
        }
    }

    /// Einzeilige Darstellung für die Konsole
    pub fn render(&self) -> String {
        let mut line = self.headline.clone();
        let mut actions = Vec::new();
        if self.can_accept {
            actions.push("accept".to_string());
        }
        if self.can_reject {
            actions.push("reject".to_string());
        }
        if self.show_mic_toggle {
            actions.push(format!("mic [{}]", on_off(self.mic_on)));
        }
        if self.show_camera_toggle {
            actions.push(format!("cam [{}]", on_off(self.camera_on)));
        }
        if self.can_hang_up {
            actions.push("hangup".to_string());
        }
        if self.waiting_for_connection {
            line.push_str(" - waiting for connection");
        }
        if !actions.is_empty() {
            line.push_str(" | ");
            line.push_str(&actions.join(", "));
        }
        line
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

// ============================================================================
// CONSOLE COMMANDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Call { peer: String, call_type: CallType },
    Accept,
    Reject,
    HangUp,
    Mic,
    Cam,
    Record,
    Stop,
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Err("empty command".to_string());
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "call" => {
                let peer = parts
                    .next()
                    .ok_or_else(|| "usage: call <user-id> [audio|video]".to_string())?;
                let call_type = match parts.next() {
                    Some(kind) => kind.parse()?,
                    None => CallType::Audio,
                };
                ConsoleCommand::Call {
                    peer: peer.to_string(),
                    call_type,
                }
            }
            "accept" => ConsoleCommand::Accept,
            "reject" => ConsoleCommand::Reject,
            "hangup" | "end" => ConsoleCommand::HangUp,
            "mic" => ConsoleCommand::Mic,
            "cam" => ConsoleCommand::Cam,
            "record" => ConsoleCommand::Record,
            "stop" => ConsoleCommand::Stop,
            "status" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command '{}'", other)),
        };

        if parts.next().is_some() {
            return Err(format!("too many arguments for '{}'", verb));
        }
        Ok(command)
    }
}

pub const HELP: &str = "commands: call <id> [audio|video], accept, reject, hangup, mic, cam, record, stop, status, quit";
