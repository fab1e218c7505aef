//! Call Engine Module - Anruf-Zustandsmaschine
//!
//! Dieses Modul verwaltet:
//! - Call Session (Idle / Outgoing / Incoming / Active)
//! - Koordination von Geräten, Peer Connection und Signaling
//! - Anzeige-Modell und Befehle für die UI

mod controls;
mod engine;
mod session;

pub use controls::{CallControls, ConsoleCommand, HELP};
pub use engine::{CallEngine, CallEngineError, CallEvent, CallFailure, EndReason, EngineDeps};
pub use session::{CallSession, CallSnapshot, CallState};
