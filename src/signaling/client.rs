//! WebSocket Client für den Signaling-Server
//!
//! - Verbindung aufbauen, `join` senden
//! - Heartbeat halten
//! - Eingehende Anruf-Nachrichten nach Adressat filtern und als Events verteilen

use super::messages::{ControlMessage, SignalMessage, SignalingChannel};
use super::SignalingError;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

const OUTBOUND_CAPACITY: usize = 100;
const EVENT_CAPACITY: usize = 100;

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,

    /// Verbindung getrennt; laufende Anrufe sind damit verloren
    Disconnected,

    /// Anruf-Nachricht an den lokalen Teilnehmer
    Message(SignalMessage),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    /// Erhöht sich pro Verbindung; alte Heartbeat-Tasks beenden sich daran
    connection: u64,
}

/// Wandelt die Server-Basis-URL in die WebSocket-URL um (`http` → `ws`, `/ws` anhängen)
pub fn websocket_url(base: &str) -> Result<String, SignalingError> {
    let mut url = Url::parse(base).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(base.to_string()))?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/ws") {
        url.set_path(&format!("{}/ws", path));
    }

    Ok(url.to_string())
}

/// Parst eine Text-Nachricht vom Server. Fremde oder unbekannte Nachrichten -> `None`.
pub(crate) fn parse_inbound(text: &str, local_id: &str) -> Option<SignalMessage> {
    let message = match serde_json::from_str::<SignalMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Ignoring non-call message: {}", e);
            return None;
        }
    };

    if !message.is_addressed_to(local_id) {
        tracing::debug!("Ignoring {} addressed to {}", message.kind(), message.to());
        return None;
    }

    Some(message)
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: String,
    user_id: String,
    heartbeat: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    pub fn new(server_url: String, user_id: String, heartbeat: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            server_url,
            user_id,
            heartbeat,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Server und meldet den lokalen Teilnehmer an
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let ws_url = websocket_url(&self.server_url)?;
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        *self.tx.write() = Some(tx);

        let connection = {
            let mut state = self.state.write();
            state.is_connected = true;
            state.connection += 1;
            state.connection
        };

        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let local_id = self.user_id.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Some(message) = parse_inbound(&text, &local_id) {
                            tracing::debug!("Received {} from {}", message.kind(), message.from());
                            let _ = event_tx.send(SignalingEvent::Message(message));
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut s = state.write();
                if s.connection == connection {
                    s.is_connected = false;
                }
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send_control(&ControlMessage::Join {
            user_id: self.user_id.clone(),
        })?;
        self.start_heartbeat(connection);

        Ok(())
    }

    /// Trennt die Verbindung (Write-Task endet, Server schließt den Socket)
    pub fn disconnect(&self) {
        self.tx.write().take();
        self.state.write().is_connected = false;
    }

    fn start_heartbeat(&self, connection: u64) {
        let Some(tx) = self.tx.read().clone() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let period = self.heartbeat;
        let payload = ControlMessage::Heartbeat {
            user_id: self.user_id.clone(),
        };

        tokio::spawn(async move {
            let Ok(text) = serde_json::to_string(&payload) else {
                return;
            };
            let mut interval = tokio::time::interval(period);
            // Erster Tick feuert sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                {
                    let s = state.read();
                    if !s.is_connected || s.connection != connection {
                        break;
                    }
                }
                if let Err(e) = tx.try_send(text.clone()) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    fn send_control(&self, message: &ControlMessage) -> Result<(), SignalingError> {
        let text =
            serde_json::to_string(message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.send_text(text)
    }

    /// try_send ist non-blocking
    fn send_text(&self, text: String) -> Result<(), SignalingError> {
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl SignalingChannel for SignalingClient {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending {} to {}", message.kind(), message.to());
        let text =
            serde_json::to_string(&message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.send_text(text)
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("user_id", &self.user_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_rewrites_scheme_and_appends_path() {
        assert_eq!(websocket_url("http://localhost:8000").unwrap(), "ws://localhost:8000/ws");
        assert_eq!(
            websocket_url("https://signal.example.com/api/").unwrap(),
            "wss://signal.example.com/api/ws"
        );
        assert_eq!(websocket_url("ws://host/ws").unwrap(), "ws://host/ws");
    }

    #[test]
    fn websocket_url_rejects_garbage() {
        assert!(matches!(websocket_url("not a url"), Err(SignalingError::InvalidUrl(_))));
        assert!(matches!(websocket_url("ftp://host"), Err(SignalingError::InvalidUrl(_))));
    }

    #[test]
    fn inbound_messages_are_filtered_by_addressee() {
        let mine = r#"{"type":"call_answer","from":"bob","to":"alice","sdp":"v=0"}"#;
        let theirs = r#"{"type":"call_answer","from":"bob","to":"carol","sdp":"v=0"}"#;
        let chat = r#"{"type":"receive_message","text":"hi"}"#;

        assert!(parse_inbound(mine, "alice").is_some());
        assert!(parse_inbound(theirs, "alice").is_none());
        assert!(parse_inbound(chat, "alice").is_none());
    }

    #[test]
    fn sending_without_connection_fails() {
        let client = SignalingClient::new("http://localhost:1".into(), "me".into(), Duration::from_secs(25));
        let err = client
            .send(SignalMessage::CallEnd {
                from: "me".into(),
                to: "you".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
        assert!(!client.is_connected());
    }
}
