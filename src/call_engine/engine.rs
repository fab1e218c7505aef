//! Call Engine
//!
//! Zustandsmaschine für genau einen Anruf. Alle Eingaben (UI-Befehle,
//! Signaling-Nachrichten, Abschluss asynchroner Schritte) laufen über eine
//! Inbox und werden synchron nacheinander verarbeitet. Asynchrone Arbeit
//! (Geräte, Verhandlung) wird gestartet und meldet ihr Ergebnis mit der
//! Generation des Versuchs zurück; veraltete Ergebnisse werden verworfen und
//! ihre Ressourcen freigegeben.

use super::session::{CallSession, CallSnapshot, CallState};
use crate::media::{LocalMediaHandle, MediaDevices, MediaError, MediaKind, PeerMediaHandle};
use crate::peer::{
    CandidateInit, ConnectionState, IceServer, PeerCallbacks, PeerConnectionManager, PeerError,
    TransportFactory,
};
use crate::signaling::{CallType, SignalMessage, SignalingChannel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Call is already being accepted")]
    AlreadyAccepting,

    #[error("No active call")]
    NoActiveCall,

    #[error("No local media")]
    NoLocalMedia,

    #[error("Not a video call")]
    NotVideoCall,

    #[error("Invalid peer: '{0}'")]
    InvalidPeer(String),

    #[error("Call engine stopped")]
    Stopped,
}

/// Für den Nutzer sichtbare Fehler
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    #[error("could not access camera/microphone")]
    MediaAccess,

    #[error("call could not be connected")]
    ConnectionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Failed,
    SignalingLost,
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall { from: String, call_type: CallType },
    LocalMediaReady(LocalMediaHandle),
    RemoteMediaAvailable(PeerMediaHandle),
    ConnectionChanged(ConnectionState),
    Failed(CallFailure),
    CallEnded {
        reason: EndReason,
        conversation_id: Option<String>,
    },
}

/// Abhängigkeiten der Engine
pub struct EngineDeps {
    pub local_id: String,
    pub ice_servers: Vec<IceServer>,
    pub media: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
}

// ============================================================================
// INBOX
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, CallEngineError>>;

enum Command {
    StartCall {
        peer: String,
        call_type: CallType,
        conversation_id: Option<String>,
        reply: Reply<()>,
    },
    Accept(Reply<()>),
    Reject(Reply<()>),
    HangUp(Reply<()>),
    ToggleMic(Reply<bool>),
    ToggleCamera(Reply<bool>),
    Snapshot(oneshot::Sender<CallSnapshot>),
}

enum Input {
    Command(Command),
    Signal(SignalMessage),
    SignalingDisconnected,
    MediaAcquired {
        generation: u64,
        result: Result<LocalMediaHandle, MediaError>,
    },
    PeerCreated {
        generation: u64,
        result: Result<Arc<PeerConnectionManager>, PeerError>,
    },
    OfferCreated {
        generation: u64,
        result: Result<String, PeerError>,
    },
    AnswerCreated {
        generation: u64,
        result: Result<String, PeerError>,
    },
    AnswerApplied {
        generation: u64,
        result: Result<(), PeerError>,
    },
    LocalCandidate {
        generation: u64,
        candidate: CandidateInit,
    },
    RemoteMedia {
        generation: u64,
        media: PeerMediaHandle,
    },
    Connection {
        generation: u64,
        state: ConnectionState,
    },
    Shutdown,
}

impl Input {
    /// Gibt Ressourcen frei, die niemand mehr übernimmt
    fn discard(self) {
        match self {
            Input::MediaAcquired {
                result: Ok(media), ..
            } => {
                tracing::debug!("Releasing media from abandoned call attempt");
                media.release();
            }
            Input::PeerCreated { result: Ok(pcm), .. } => {
                tracing::debug!("Closing peer connection from abandoned call attempt");
                pcm.close();
            }
            _ => {}
        }
    }
}

fn post(inbox: &mpsc::UnboundedSender<Input>, input: Input) {
    if let Err(mpsc::error::SendError(input)) = inbox.send(input) {
        input.discard();
    }
}

/// Ein Anrufversuch. Teardown setzt `cancelled` und startet eine neue Generation.
struct Attempt {
    generation: u64,
    cancelled: Arc<AtomicBool>,
}

impl Attempt {
    fn first() -> Self {
        Self {
            generation: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn next(&self) -> Self {
        self.cancelled.store(true, Ordering::SeqCst);
        Self {
            generation: self.generation + 1,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Alles, was ein Anruf besitzt. Wird beim Teardown als Ganzes entnommen.
#[derive(Default)]
struct CallResources {
    offer_sdp: Option<String>,
    local_media: Option<LocalMediaHandle>,
    remote_media: Option<PeerMediaHandle>,
    peer: Option<Arc<PeerConnectionManager>>,
    /// Remote Candidates, solange noch kein Manager existiert
    early_candidates: Vec<CandidateInit>,
    /// Lokale Candidates, bis Offer bzw. Answer gesendet ist
    held_candidates: Vec<CandidateInit>,
    description_sent: bool,
    accepting: bool,
    answer_received: bool,
    mic_enabled: bool,
    camera_enabled: bool,
    connection: Option<ConnectionState>,
}

// ============================================================================
// CALL ENGINE (HANDLE)
// ============================================================================

struct Lifetime {
    inbox: mpsc::UnboundedSender<Input>,
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        let _ = self.inbox.send(Input::Shutdown);
    }
}

/// Handle auf die Call Engine. Klone teilen dieselbe Engine; mit dem letzten
/// Handle wird ein laufender Anruf beendet.
#[derive(Clone)]
pub struct CallEngine {
    inbox: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    _lifetime: Arc<Lifetime>,
}

impl CallEngine {
    /// Startet die Engine auf der aktuellen Tokio-Runtime
    pub fn new(deps: EngineDeps) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::default());
        let (events, _) = broadcast::channel(100);

        let core = Core {
            deps,
            inbox: inbox.clone(),
            snapshot: snapshot_tx,
            events: events.clone(),
            state: CallState::Idle,
            session: None,
            attempt: Attempt::first(),
            call: CallResources::default(),
            tearing_down: false,
        };
        tokio::spawn(core.run(inbox_rx));

        Self {
            inbox: inbox.clone(),
            snapshot,
            events,
            _lifetime: Arc::new(Lifetime { inbox }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Beobachtet den Zustand
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Zuletzt veröffentlichter Zustand (ohne auf die Inbox zu warten)
    pub fn current(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Zustand nachdem alle bisher eingegangenen Eingaben verarbeitet sind
    pub async fn snapshot(&self) -> CallSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.inbox.send(Input::Command(Command::Snapshot(reply))).is_err() {
            return self.current();
        }
        rx.await.unwrap_or_else(|_| self.current())
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        &self,
        peer: impl Into<String>,
        call_type: CallType,
        conversation_id: Option<String>,
    ) -> Result<(), CallEngineError> {
        let peer = peer.into();
        self.request(|reply| Command::StartCall {
            peer,
            call_type,
            conversation_id,
            reply,
        })
        .await
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn accept(&self) -> Result<(), CallEngineError> {
        self.request(Command::Accept).await
    }

    /// Lehnt den eingehenden Anruf ab (sendet `call_end`)
    pub async fn reject(&self) -> Result<(), CallEngineError> {
        self.request(Command::Reject).await
    }

    /// Legt auf
    pub async fn hang_up(&self) -> Result<(), CallEngineError> {
        self.request(Command::HangUp).await
    }

    /// Schaltet das Mikrofon um. Gibt den neuen Zustand zurück.
    pub async fn toggle_mic(&self) -> Result<bool, CallEngineError> {
        self.request(Command::ToggleMic).await
    }

    /// Schaltet die Kamera um (nur Video-Anrufe)
    pub async fn toggle_camera(&self) -> Result<bool, CallEngineError> {
        self.request(Command::ToggleCamera).await
    }

    /// Eingehende Signaling-Nachricht übergeben
    pub fn handle_signal(&self, message: SignalMessage) {
        let _ = self.inbox.send(Input::Signal(message));
    }

    /// Der Signaling-Kanal ist weg; ein laufender Anruf endet lokal
    pub fn signaling_disconnected(&self) {
        let _ = self.inbox.send(Input::SignalingDisconnected);
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallEngineError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Command(build(reply)))
            .map_err(|_| CallEngineError::Stopped)?;
        rx.await.map_err(|_| CallEngineError::Stopped)?
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.snapshot.borrow().state)
            .finish()
    }
}

// ============================================================================
// CORE
// ============================================================================

struct Core {
    deps: EngineDeps,
    inbox: mpsc::UnboundedSender<Input>,
    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    state: CallState,
    session: Option<CallSession>,
    attempt: Attempt,
    call: CallResources,
    tearing_down: bool,
}

impl Core {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inbox.recv().await {
            if matches!(input, Input::Shutdown) {
                break;
            }
            self.handle(input);
        }

        if !self.state.is_idle() {
            self.send_end();
            self.teardown(EndReason::LocalHangup);
        }
        tracing::debug!("Call engine stopped");
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.on_command(command),
            Input::Signal(message) => self.on_signal(message),
            Input::SignalingDisconnected => {
                if !self.state.is_idle() {
                    tracing::warn!("Signaling lost during call, ending locally");
                    self.teardown(EndReason::SignalingLost);
                }
            }
            Input::Shutdown => {}
            completion => self.on_completion(completion),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                peer,
                call_type,
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.start_call(peer, call_type, conversation_id));
            }
            Command::Accept(reply) => {
                let _ = reply.send(self.accept());
            }
            Command::Reject(reply) => {
                let _ = reply.send(self.reject());
            }
            Command::HangUp(reply) => {
                let _ = reply.send(self.hang_up());
            }
            Command::ToggleMic(reply) => {
                let _ = reply.send(self.toggle(MediaKind::Audio));
            }
            Command::ToggleCamera(reply) => {
                let _ = reply.send(self.toggle(MediaKind::Video));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.build_snapshot());
            }
        }
    }

    fn start_call(
        &mut self,
        peer: String,
        call_type: CallType,
        conversation_id: Option<String>,
    ) -> Result<(), CallEngineError> {
        if !self.state.is_idle() {
            return Err(CallEngineError::AlreadyInCall);
        }
        if peer.is_empty() || peer == self.deps.local_id {
            return Err(CallEngineError::InvalidPeer(peer));
        }

        tracing::info!("Calling {} ({})", peer, call_type);
        self.session = Some(CallSession::outgoing(
            &self.deps.local_id,
            &peer,
            call_type,
            conversation_id,
        ));
        self.transition(CallState::Outgoing);
        self.spawn_acquire(call_type.wants_video());
        Ok(())
    }

    fn accept(&mut self) -> Result<(), CallEngineError> {
        if self.state != CallState::Incoming {
            return Err(CallEngineError::NoIncomingCall);
        }
        if self.call.accepting {
            return Err(CallEngineError::AlreadyAccepting);
        }
        let Some(session) = &self.session else {
            return Err(CallEngineError::NoIncomingCall);
        };

        tracing::info!("Accepting call from {}", session.peer_participant_id);
        let video = session.call_type.wants_video();
        self.call.accepting = true;
        self.publish();
        self.spawn_acquire(video);
        Ok(())
    }

    fn reject(&mut self) -> Result<(), CallEngineError> {
        if self.state != CallState::Incoming {
            return Err(CallEngineError::NoIncomingCall);
        }
        tracing::info!("Rejecting incoming call");
        self.send_end();
        self.teardown(EndReason::Rejected);
        Ok(())
    }

    fn hang_up(&mut self) -> Result<(), CallEngineError> {
        if self.state.is_idle() {
            return Err(CallEngineError::NoActiveCall);
        }
        tracing::info!("Hanging up");
        self.send_end();
        self.teardown(EndReason::LocalHangup);
        Ok(())
    }

    fn toggle(&mut self, kind: MediaKind) -> Result<bool, CallEngineError> {
        if kind == MediaKind::Video {
            let video_call = self
                .session
                .as_ref()
                .is_some_and(|s| s.call_type.wants_video());
            if !video_call {
                return Err(CallEngineError::NotVideoCall);
            }
        }
        let media = self
            .call
            .local_media
            .as_ref()
            .ok_or(CallEngineError::NoLocalMedia)?;

        let flag = match kind {
            MediaKind::Audio => &mut self.call.mic_enabled,
            MediaKind::Video => &mut self.call.camera_enabled,
        };
        *flag = !*flag;
        let enabled = *flag;
        media.set_enabled(kind, enabled);

        tracing::debug!("{:?} {}", kind, if enabled { "enabled" } else { "disabled" });
        self.publish();
        Ok(enabled)
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    fn is_from_peer(&self, from: &str) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_peer(from))
    }

    fn on_signal(&mut self, message: SignalMessage) {
        if !message.is_addressed_to(&self.deps.local_id) {
            tracing::debug!("Ignoring {} for {}", message.kind(), message.to());
            return;
        }

        match message {
            SignalMessage::CallInvite {
                from,
                call_type,
                sdp,
                conversation_id,
                ..
            } => {
                if !self.state.is_idle() {
                    tracing::info!("Ignoring invite from {} while {}", from, self.state);
                    return;
                }
                if from == self.deps.local_id {
                    return;
                }

                tracing::info!("Incoming {} call from {}", call_type, from);
                self.session = Some(CallSession::incoming(
                    &self.deps.local_id,
                    &from,
                    call_type,
                    conversation_id,
                ));
                self.call.offer_sdp = Some(sdp);
                self.transition(CallState::Incoming);
                self.emit(CallEvent::IncomingCall { from, call_type });
            }

            SignalMessage::CallAnswer { from, sdp, .. } => {
                if self.state != CallState::Outgoing
                    || !self.is_from_peer(&from)
                    || self.call.answer_received
                {
                    tracing::debug!("Ignoring answer from {} while {}", from, self.state);
                    return;
                }
                let Some(peer) = self.call.peer.clone() else {
                    tracing::debug!("Ignoring answer without peer connection");
                    return;
                };

                self.call.answer_received = true;
                let generation = self.attempt.generation;
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    let result = peer.apply_answer(sdp).await;
                    post(&inbox, Input::AnswerApplied { generation, result });
                });
            }

            SignalMessage::ConnectivityCandidate {
                from, candidate, ..
            } => {
                if self.state.is_idle() || !self.is_from_peer(&from) {
                    tracing::debug!("Ignoring candidate from {}", from);
                    return;
                }
                match &self.call.peer {
                    Some(peer) => peer.add_remote_candidate(candidate),
                    None => self.call.early_candidates.push(candidate),
                }
            }

            SignalMessage::CallEnd { from, .. } => {
                if self.state.is_idle() || !self.is_from_peer(&from) {
                    tracing::debug!("Ignoring call_end from {}", from);
                    return;
                }
                tracing::info!("Call ended by {}", from);
                self.teardown(EndReason::RemoteHangup);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Async completions
    // ------------------------------------------------------------------------

    fn on_completion(&mut self, input: Input) {
        let generation = match &input {
            Input::MediaAcquired { generation, .. }
            | Input::PeerCreated { generation, .. }
            | Input::OfferCreated { generation, .. }
            | Input::AnswerCreated { generation, .. }
            | Input::AnswerApplied { generation, .. }
            | Input::LocalCandidate { generation, .. }
            | Input::RemoteMedia { generation, .. }
            | Input::Connection { generation, .. } => *generation,
            _ => return,
        };

        if generation != self.attempt.generation || self.state.is_idle() {
            input.discard();
            return;
        }

        match input {
            Input::MediaAcquired { result, .. } => match result {
                Ok(media) => self.on_media(media),
                Err(e) => {
                    tracing::error!("Media acquisition failed: {}", e);
                    self.fail(CallFailure::MediaAccess);
                }
            },

            Input::PeerCreated { result, .. } => match result {
                Ok(peer) => self.on_peer(peer),
                Err(e) => {
                    tracing::error!("Failed to create peer connection: {}", e);
                    self.fail(CallFailure::ConnectionFailed);
                }
            },

            Input::OfferCreated { result, .. } => match result {
                Ok(sdp) => {
                    let Some(session) = &self.session else { return };
                    let invite = SignalMessage::CallInvite {
                        from: session.local_participant_id.clone(),
                        to: session.peer_participant_id.clone(),
                        call_type: session.call_type,
                        sdp,
                        conversation_id: session.associated_conversation_id.clone(),
                    };
                    if self.send_description(invite) {
                        tracing::info!("Invite sent");
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to create offer: {}", e);
                    self.fail(CallFailure::ConnectionFailed);
                }
            },

            Input::AnswerCreated { result, .. } => match result {
                Ok(sdp) => {
                    let Some(session) = &self.session else { return };
                    let answer = SignalMessage::CallAnswer {
                        from: session.local_participant_id.clone(),
                        to: session.peer_participant_id.clone(),
                        sdp,
                    };
                    if self.send_description(answer) {
                        self.transition(CallState::Active);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to answer offer: {}", e);
                    self.fail(CallFailure::ConnectionFailed);
                }
            },

            Input::AnswerApplied { result, .. } => match result {
                Ok(()) => self.transition(CallState::Active),
                Err(e) => {
                    tracing::error!("Failed to apply answer: {}", e);
                    self.fail(CallFailure::ConnectionFailed);
                }
            },

            Input::LocalCandidate { candidate, .. } => {
                if self.call.description_sent {
                    self.send_candidate(candidate);
                } else {
                    self.call.held_candidates.push(candidate);
                }
            }

            Input::RemoteMedia { media, .. } => {
                tracing::info!("Remote media available ({})", media.stream_id());
                self.call.remote_media = Some(media.clone());
                self.publish();
                self.emit(CallEvent::RemoteMediaAvailable(media));
            }

            Input::Connection { state, .. } => {
                self.call.connection = Some(state);
                self.publish();
                self.emit(CallEvent::ConnectionChanged(state));
                if state == ConnectionState::Failed {
                    tracing::error!("Peer connection failed");
                    self.fail(CallFailure::ConnectionFailed);
                }
            }

            _ => {}
        }
    }

    fn on_media(&mut self, media: LocalMediaHandle) {
        self.call.mic_enabled = true;
        self.call.camera_enabled = media.has_video();
        self.call.local_media = Some(media.clone());
        self.publish();
        self.emit(CallEvent::LocalMediaReady(media.clone()));
        self.spawn_peer(media);
    }

    fn on_peer(&mut self, peer: Arc<PeerConnectionManager>) {
        for candidate in self.call.early_candidates.drain(..) {
            peer.add_remote_candidate(candidate);
        }
        self.call.peer = Some(Arc::clone(&peer));

        let is_initiator = self.session.as_ref().is_some_and(|s| s.is_initiator);
        let generation = self.attempt.generation;
        let inbox = self.inbox.clone();

        if is_initiator {
            let Some(media) = self.call.local_media.clone() else {
                self.fail(CallFailure::MediaAccess);
                return;
            };
            tokio::spawn(async move {
                let result = async {
                    peer.attach_local_tracks(&media).await?;
                    peer.create_offer().await
                }
                .await;
                post(&inbox, Input::OfferCreated { generation, result });
            });
        } else {
            let Some(offer) = self.call.offer_sdp.take() else {
                tracing::error!("No stored offer to answer");
                self.fail(CallFailure::ConnectionFailed);
                return;
            };
            tokio::spawn(async move {
                let result = peer.apply_offer_and_create_answer(offer).await;
                post(&inbox, Input::AnswerCreated { generation, result });
            });
        }
    }

    // ------------------------------------------------------------------------
    // Async work
    // ------------------------------------------------------------------------

    fn spawn_acquire(&self, video: bool) {
        let media = Arc::clone(&self.deps.media);
        let generation = self.attempt.generation;
        let cancelled = Arc::clone(&self.attempt.cancelled);
        let inbox = self.inbox.clone();

        tokio::spawn(async move {
            let result = media.acquire(video).await;
            let input = Input::MediaAcquired { generation, result };
            if cancelled.load(Ordering::SeqCst) {
                input.discard();
                return;
            }
            post(&inbox, input);
        });
    }

    fn spawn_peer(&self, media: LocalMediaHandle) {
        let factory = Arc::clone(&self.deps.transports);
        let ice_servers = self.deps.ice_servers.clone();
        let generation = self.attempt.generation;
        let cancelled = Arc::clone(&self.attempt.cancelled);
        let inbox = self.inbox.clone();

        tokio::spawn(async move {
            let callbacks = peer_callbacks(&inbox, generation, media);
            let result = PeerConnectionManager::create(factory.as_ref(), &ice_servers, callbacks)
                .await
                .map(Arc::new);
            let input = Input::PeerCreated { generation, result };
            if cancelled.load(Ordering::SeqCst) {
                input.discard();
                return;
            }
            post(&inbox, input);
        });
    }

    // ------------------------------------------------------------------------
    // Outbound signaling
    // ------------------------------------------------------------------------

    /// Sendet Offer bzw. Answer und danach die zurückgehaltenen Candidates
    fn send_description(&mut self, message: SignalMessage) -> bool {
        if let Err(e) = self.deps.signaling.send(message) {
            tracing::error!("Failed to send session description: {}", e);
            self.fail(CallFailure::ConnectionFailed);
            return false;
        }
        self.call.description_sent = true;

        let held = std::mem::take(&mut self.call.held_candidates);
        if !held.is_empty() {
            tracing::debug!("Forwarding {} held local candidate(s)", held.len());
        }
        for candidate in held {
            self.send_candidate(candidate);
        }
        true
    }

    fn send_candidate(&self, candidate: CandidateInit) {
        let Some(session) = &self.session else { return };
        let message = SignalMessage::ConnectivityCandidate {
            from: session.local_participant_id.clone(),
            to: session.peer_participant_id.clone(),
            candidate,
        };
        if let Err(e) = self.deps.signaling.send(message) {
            tracing::warn!("Failed to send local candidate: {}", e);
        }
    }

    fn send_end(&self) {
        let Some(session) = &self.session else { return };
        let message = SignalMessage::CallEnd {
            from: session.local_participant_id.clone(),
            to: session.peer_participant_id.clone(),
        };
        if let Err(e) = self.deps.signaling.send(message) {
            tracing::warn!("Failed to send call_end: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn transition(&mut self, next: CallState) {
        if !self.state.can_transition_to(next) {
            tracing::error!("Refusing transition {} -> {}", self.state, next);
            return;
        }
        tracing::info!("Call state: {} -> {}", self.state, next);
        self.state = next;
        self.publish();
        self.emit(CallEvent::StateChanged(next));
    }

    /// Fataler Fehler im Anrufversuch
    fn fail(&mut self, failure: CallFailure) {
        if self.state.is_idle() {
            return;
        }
        // Der Gegenüber weiß vom Anruf, sobald er unser Offer hat oder uns angerufen hat
        let peer_knows = self.call.description_sent
            || self.session.as_ref().is_some_and(|s| !s.is_initiator);
        if peer_knows {
            self.send_end();
        }
        self.emit(CallEvent::Failed(failure));
        self.teardown(EndReason::Failed);
    }

    /// Gibt alle Ressourcen frei und kehrt zu Idle zurück. Idempotent.
    fn teardown(&mut self, reason: EndReason) {
        if self.tearing_down || self.state.is_idle() {
            return;
        }
        self.tearing_down = true;

        self.attempt = self.attempt.next();
        let call = std::mem::take(&mut self.call);

        if let Some(peer) = call.peer {
            peer.close();
        }
        if let Some(media) = call.local_media {
            self.deps.media.release(&media);
        }
        if let Some(remote) = call.remote_media {
            remote.release();
        }

        let conversation_id = self
            .session
            .take()
            .and_then(|s| s.associated_conversation_id);

        self.transition(CallState::Idle);
        self.emit(CallEvent::CallEnded {
            reason,
            conversation_id,
        });
        tracing::info!("Call torn down ({:?})", reason);

        self.tearing_down = false;
    }

    fn build_snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            session: self.session.clone(),
            accepting: self.call.accepting,
            has_local_media: self.call.local_media.is_some(),
            has_remote_media: self.call.remote_media.is_some(),
            mic_enabled: self.call.mic_enabled,
            camera_enabled: self.call.camera_enabled,
            connection: self.call.connection,
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.build_snapshot());
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

/// Callbacks des Peer Connection Managers: alles läuft zurück in die Inbox
fn peer_callbacks(
    inbox: &mpsc::UnboundedSender<Input>,
    generation: u64,
    media: LocalMediaHandle,
) -> PeerCallbacks {
    let candidates = inbox.clone();
    let remote = inbox.clone();
    let states = inbox.clone();

    PeerCallbacks {
        on_local_candidate: Box::new(move |candidate| {
            post(
                &candidates,
                Input::LocalCandidate {
                    generation,
                    candidate,
                },
            )
        }),
        on_remote_media: Box::new(move |media| post(&remote, Input::RemoteMedia { generation, media })),
        on_state_change: Box::new(move |state| post(&states, Input::Connection { generation, state })),
        local_media: Box::new(move || Some(media.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        eventually, wait_for_state, FakeBehavior, FakeMediaDevices, FakeTransportFactory,
        LoopbackSignaling,
    };

    struct Party {
        engine: CallEngine,
        signaling: Arc<LoopbackSignaling>,
        transports: Arc<FakeTransportFactory>,
        media: Arc<FakeMediaDevices>,
    }

    fn party_with(id: &str, behavior: FakeBehavior, media: FakeMediaDevices) -> Party {
        let signaling = Arc::new(LoopbackSignaling::default());
        let transports = Arc::new(FakeTransportFactory::new(behavior));
        let media = Arc::new(media);
        let engine = CallEngine::new(EngineDeps {
            local_id: id.to_string(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            media: media.clone(),
            transports: transports.clone(),
            signaling: signaling.clone(),
        });
        Party {
            engine,
            signaling,
            transports,
            media,
        }
    }

    fn party(id: &str) -> Party {
        party_with(id, FakeBehavior::default(), FakeMediaDevices::default())
    }

    fn invite(from: &str, to: &str) -> SignalMessage {
        SignalMessage::CallInvite {
            from: from.into(),
            to: to.into(),
            call_type: CallType::Audio,
            sdp: "remote-offer".into(),
            conversation_id: Some("conv-1".into()),
        }
    }

    fn candidate(from: &str, to: &str, body: &str) -> SignalMessage {
        SignalMessage::ConnectivityCandidate {
            from: from.into(),
            to: to.into(),
            candidate: CandidateInit::new(body),
        }
    }

    fn answer(from: &str, to: &str) -> SignalMessage {
        SignalMessage::CallAnswer {
            from: from.into(),
            to: to.into(),
            sdp: "remote-answer".into(),
        }
    }

    fn drain_states(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CallEvent::StateChanged(s) = event {
                states.push(s);
            }
        }
        states
    }

    #[tokio::test]
    async fn invite_accept_answer_reaches_active_on_both_sides() {
        let behavior = FakeBehavior {
            local_candidates: 2,
            ..Default::default()
        };
        let x = party_with("x", behavior.clone(), FakeMediaDevices::default());
        let y = party_with("y", behavior, FakeMediaDevices::default());
        x.signaling.link(y.engine.clone());
        y.signaling.link(x.engine.clone());
        let mut x_events = x.engine.subscribe();
        let mut y_events = y.engine.subscribe();

        x.engine.start_call("y", CallType::Audio, None).await.unwrap();
        wait_for_state(&y.engine, CallState::Incoming).await;

        // Nicht automatisch annehmen
        let y_snapshot = y.engine.snapshot().await;
        assert!(!y_snapshot.has_local_media);
        assert_eq!(y.transports.count(), 0);

        y.engine.accept().await.unwrap();
        wait_for_state(&y.engine, CallState::Active).await;
        wait_for_state(&x.engine, CallState::Active).await;

        assert_eq!(
            x.signaling.sent_kinds(),
            vec!["call_invite", "connectivity_candidate", "connectivity_candidate"]
        );
        assert_eq!(
            y.signaling.sent_kinds(),
            vec!["call_answer", "connectivity_candidate", "connectivity_candidate"]
        );

        let y_transport = y.transports.last();
        eventually(|| y_transport.applied_candidates().len() == 2).await;
        let x_transport = x.transports.last();
        eventually(|| x_transport.applied_candidates().len() == 2).await;

        assert_eq!(drain_states(&mut x_events), vec![CallState::Outgoing, CallState::Active]);
        assert_eq!(drain_states(&mut y_events), vec![CallState::Incoming, CallState::Active]);
    }

    #[tokio::test]
    async fn answer_outside_outgoing_is_ignored() {
        let y = party("y");
        y.engine.handle_signal(answer("x", "y"));
        assert_eq!(y.engine.snapshot().await.state, CallState::Idle);

        y.engine.handle_signal(invite("x", "y"));
        wait_for_state(&y.engine, CallState::Incoming).await;
        y.engine.handle_signal(answer("x", "y"));
        let snapshot = y.engine.snapshot().await;
        assert_eq!(snapshot.state, CallState::Incoming);
        assert!(!snapshot.has_local_media);
        assert_eq!(y.transports.count(), 0);
    }

    #[tokio::test]
    async fn duplicate_answer_is_applied_once() {
        let x = party("x");
        let mut events = x.engine.subscribe();
        x.engine.start_call("y", CallType::Audio, None).await.unwrap();
        eventually(|| x.signaling.sent_kinds() == vec!["call_invite"]).await;

        x.engine.handle_signal(answer("y", "x"));
        x.engine.handle_signal(answer("y", "x"));
        wait_for_state(&x.engine, CallState::Active).await;
        // Nachzügler im Active-Zustand
        x.engine.handle_signal(answer("y", "x"));
        x.engine.snapshot().await;

        let transport = x.transports.last();
        let remote_descriptions = transport
            .calls()
            .into_iter()
            .filter(|call| *call == "set_remote_description")
            .count();
        assert_eq!(remote_descriptions, 1);
        assert_eq!(x.transports.count(), 1);
        assert_eq!(drain_states(&mut events), vec![CallState::Outgoing, CallState::Active]);
        assert_eq!(x.engine.current().state, CallState::Active);
    }

    #[tokio::test]
    async fn receiver_applies_candidates_after_accept_without_buffering() {
        let y = party("y");
        y.engine.handle_signal(invite("x", "y"));
        wait_for_state(&y.engine, CallState::Incoming).await;
        y.engine.accept().await.unwrap();
        wait_for_state(&y.engine, CallState::Active).await;

        for body in ["c1", "c2", "c3"] {
            y.engine.handle_signal(candidate("x", "y", body));
        }
        y.engine.snapshot().await;

        let transport = y.transports.last();
        eventually(|| transport.applied_candidates().len() == 3).await;
        assert_eq!(transport.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(transport.rejected_count(), 0);
    }

    #[tokio::test]
    async fn candidates_before_accept_are_kept_in_order() {
        let y = party("y");
        y.engine.handle_signal(invite("x", "y"));
        y.engine.handle_signal(candidate("x", "y", "early-1"));
        y.engine.handle_signal(candidate("x", "y", "early-2"));
        y.engine.handle_signal(candidate("mallory", "y", "foreign"));
        wait_for_state(&y.engine, CallState::Incoming).await;

        y.engine.accept().await.unwrap();
        wait_for_state(&y.engine, CallState::Active).await;

        let transport = y.transports.last();
        eventually(|| transport.applied_candidates().len() == 2).await;
        assert_eq!(transport.applied_candidates(), vec!["early-1", "early-2"]);
    }

    #[tokio::test]
    async fn call_end_during_pending_negotiation_leaves_nothing_behind() {
        let behavior = FakeBehavior::stalled();
        let gate = behavior.gate.clone();
        let x = party_with("x", behavior, FakeMediaDevices::default());

        x.engine.start_call("y", CallType::Video, None).await.unwrap();
        eventually(|| x.transports.count() == 1).await;
        let transport = x.transports.last();
        eventually(|| transport.calls().contains(&"create_offer")).await;

        x.engine.handle_signal(SignalMessage::CallEnd {
            from: "y".into(),
            to: "x".into(),
        });
        wait_for_state(&x.engine, CallState::Idle).await;
        if let Some(gate) = gate {
            gate.notify_one();
        }

        let snapshot = x.engine.snapshot().await;
        assert!(!snapshot.has_local_media);
        assert!(snapshot.session.is_none());
        eventually(|| transport.close_count() == 1).await;
        assert_eq!(x.media.stops(), 2);
        assert!(x.media.acquired().iter().all(|m| m.is_released()));
        assert!(x.signaling.sent_kinds().is_empty());
    }

    #[tokio::test]
    async fn hang_up_while_acquiring_releases_late_media() {
        let (devices, gate) = FakeMediaDevices::stalled();
        let x = party_with("x", FakeBehavior::default(), devices);

        x.engine.start_call("y", CallType::Audio, None).await.unwrap();
        x.engine.hang_up().await.unwrap();
        assert_eq!(x.engine.snapshot().await.state, CallState::Idle);

        gate.notify_one();
        eventually(|| x.media.stops() == 1).await;
        assert_eq!(x.transports.count(), 0);
        assert_eq!(x.signaling.sent_kinds(), vec!["call_end"]);
    }

    #[tokio::test]
    async fn denied_permission_fails_the_attempt() {
        let x = party_with(
            "x",
            FakeBehavior::default(),
            FakeMediaDevices::denying(MediaKind::Video),
        );
        let mut events = x.engine.subscribe();

        x.engine.start_call("y", CallType::Video, None).await.unwrap();
        wait_for_state(&x.engine, CallState::Idle).await;

        let mut failure = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Failed(f) = event {
                failure = Some(f);
            }
        }
        assert_eq!(failure, Some(CallFailure::MediaAccess));
        assert!(x.signaling.sent_kinds().is_empty());
        assert_eq!(x.transports.count(), 0);
    }

    #[tokio::test]
    async fn negotiation_failure_tears_down_and_notifies_peer() {
        let behavior = FakeBehavior {
            fail_remote_description: true,
            ..Default::default()
        };
        let y = party_with("y", behavior, FakeMediaDevices::default());
        y.engine.handle_signal(invite("x", "y"));
        wait_for_state(&y.engine, CallState::Incoming).await;

        y.engine.accept().await.unwrap();
        wait_for_state(&y.engine, CallState::Idle).await;

        assert_eq!(y.signaling.sent_kinds(), vec!["call_end"]);
        assert_eq!(y.media.stops(), 1);
        eventually(|| y.transports.last().close_count() == 1).await;
    }

    #[tokio::test]
    async fn second_invite_is_ignored_while_busy() {
        let (devices, _gate) = FakeMediaDevices::stalled();
        let x = party_with("x", FakeBehavior::default(), devices);

        x.engine.start_call("y", CallType::Audio, None).await.unwrap();
        x.engine.handle_signal(invite("y", "x"));
        let snapshot = x.engine.snapshot().await;

        assert_eq!(snapshot.state, CallState::Outgoing);
        assert!(snapshot.session.unwrap().is_initiator);
        assert!(x.signaling.sent_kinds().is_empty());
    }

    #[tokio::test]
    async fn reject_sends_call_end_and_keeps_conversation_id() {
        let y = party("y");
        let mut events = y.engine.subscribe();
        y.engine.handle_signal(invite("x", "y"));
        wait_for_state(&y.engine, CallState::Incoming).await;

        y.engine.reject().await.unwrap();

        assert_eq!(y.engine.snapshot().await.state, CallState::Idle);
        assert_eq!(y.signaling.sent_kinds(), vec!["call_end"]);
        let mut ended = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::CallEnded {
                reason,
                conversation_id,
            } = event
            {
                ended = Some((reason, conversation_id));
            }
        }
        assert_eq!(ended, Some((EndReason::Rejected, Some("conv-1".to_string()))));
        assert_eq!(y.engine.accept().await, Err(CallEngineError::NoIncomingCall));
    }

    #[tokio::test]
    async fn call_end_from_a_stranger_is_ignored() {
        let y = party("y");
        y.engine.handle_signal(invite("x", "y"));
        y.engine.handle_signal(SignalMessage::CallEnd {
            from: "mallory".into(),
            to: "y".into(),
        });

        assert_eq!(y.engine.snapshot().await.state, CallState::Incoming);
    }

    #[tokio::test]
    async fn signaling_loss_ends_the_call_locally() {
        let y = party("y");
        y.engine.handle_signal(invite("x", "y"));
        y.engine.signaling_disconnected();

        assert_eq!(y.engine.snapshot().await.state, CallState::Idle);
        assert!(y.signaling.sent_kinds().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_ends_an_active_call() {
        let y = party("y");
        y.engine.handle_signal(invite("x", "y"));
        wait_for_state(&y.engine, CallState::Incoming).await;
        y.engine.accept().await.unwrap();
        wait_for_state(&y.engine, CallState::Active).await;

        y.transports.last().emit_state(ConnectionState::Failed);
        wait_for_state(&y.engine, CallState::Idle).await;

        assert_eq!(y.signaling.sent_kinds().last(), Some(&"call_end"));
        assert_eq!(y.media.stops(), 1);
    }

    #[tokio::test]
    async fn toggles_follow_the_call_type() {
        let y = party("y");
        assert_eq!(y.engine.toggle_mic().await, Err(CallEngineError::NoLocalMedia));

        y.engine.handle_signal(invite("x", "y"));
        wait_for_state(&y.engine, CallState::Incoming).await;
        y.engine.accept().await.unwrap();
        wait_for_state(&y.engine, CallState::Active).await;

        assert_eq!(y.engine.toggle_mic().await, Ok(false));
        assert_eq!(y.engine.toggle_mic().await, Ok(true));
        assert_eq!(y.engine.toggle_camera().await, Err(CallEngineError::NotVideoCall));

        y.engine.hang_up().await.unwrap();
        let snapshot = y.engine.snapshot().await;
        assert!(!snapshot.mic_enabled);
        assert_eq!(y.engine.hang_up().await, Err(CallEngineError::NoActiveCall));
    }

    #[tokio::test]
    async fn calling_yourself_is_refused() {
        let x = party("x");
        assert_eq!(
            x.engine.start_call("x", CallType::Audio, None).await,
            Err(CallEngineError::InvalidPeer("x".into()))
        );
        assert_eq!(x.engine.current().state, CallState::Idle);
    }
}
