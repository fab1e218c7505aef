//! Test-Doubles für Transport, Geräte und Signaling

use crate::call_engine::{CallEngine, CallState};
use crate::media::{DeviceLease, LocalMediaHandle, LocalTrack, MediaDevices, MediaError, MediaKind, RemoteTrack};
use crate::peer::{
    CandidateInit, ConnectionState, IceServer, PeerError, PeerTransport, SessionDescription,
    TransportEvents, TransportFactory,
};
use crate::signaling::{SignalMessage, SignalingChannel, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT_LIMIT: Duration = Duration::from_secs(2);

/// Pollt, bis die Bedingung erfüllt ist
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            WAIT_LIMIT
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(engine: &CallEngine, state: CallState) {
    let mut rx = engine.watch();
    tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("engine did not reach {:?}", state))
        .expect("engine stopped");
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    pub fail_create_offer: bool,
    pub fail_remote_description: bool,
    pub reject_candidates: Vec<String>,
    /// Offer/Answer warten auf dieses Signal
    pub gate: Option<Arc<Notify>>,
    /// Anzahl lokaler Candidates nach `set_local_description`
    pub local_candidates: usize,
}

impl FakeBehavior {
    pub fn stalled() -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<&'static str>,
    remote: Option<SessionDescription>,
    local: Option<SessionDescription>,
    applied: Vec<String>,
    rejected: usize,
    tracks: Vec<String>,
    closes: usize,
    detached: bool,
}

pub struct FakeTransport {
    behavior: FakeBehavior,
    events: Arc<TransportEvents>,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    fn record(&self, call: &'static str) {
        self.state.lock().calls.push(call);
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.behavior.gate {
            gate.notified().await;
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn rejected_count(&self) -> usize {
        self.state.lock().rejected
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.state.lock().tracks.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn emit_local_candidate(&self, candidate: CandidateInit) {
        if !self.is_detached() {
            (self.events.on_local_candidate)(candidate);
        }
    }

    pub fn emit_remote_track(&self, track: RemoteTrack) {
        if !self.is_detached() {
            (self.events.on_remote_track)(track);
        }
    }

    pub fn emit_state(&self, state: ConnectionState) {
        if !self.is_detached() {
            (self.events.on_state_change)(state);
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_offer");
        self.wait_gate().await;
        if self.behavior.fail_create_offer {
            return Err(PeerError::Negotiation("offer failed".into()));
        }
        Ok(SessionDescription::offer("fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer");
        self.wait_gate().await;
        Ok(SessionDescription::answer("fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record("set_local_description");
        self.state.lock().local = Some(desc);
        for i in 0..self.behavior.local_candidates {
            self.emit_local_candidate(CandidateInit::new(format!("local-candidate-{}", i)));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record("set_remote_description");
        if self.behavior.fail_remote_description {
            return Err(PeerError::Negotiation("remote description rejected".into()));
        }
        self.state.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            state.rejected += 1;
            return Err(PeerError::Candidate("no remote description".into()));
        }
        if self.behavior.reject_candidates.contains(&candidate.candidate) {
            state.rejected += 1;
            return Err(PeerError::Candidate(format!("malformed: {}", candidate.candidate)));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.calls.push("add_track");
        state.tracks.push(track.id().to_string());
        Ok(())
    }

    async fn stop_senders(&self) {
        self.record("stop_senders");
    }

    fn detach_handlers(&self) {
        self.state.lock().detached = true;
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    behavior: FakeBehavior,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: Arc<TransportEvents>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let transport = Arc::new(FakeTransport {
            behavior: self.behavior.clone(),
            events,
            state: Mutex::new(FakeState::default()),
        });
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// MEDIA
// ============================================================================

struct CountingLease {
    stops: Arc<AtomicUsize>,
}

impl DeviceLease for CountingLease {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Geräte ohne Hardware; zählt, wie oft ein Gerät gestoppt wurde
#[derive(Default)]
pub struct FakeMediaDevices {
    stops: Arc<AtomicUsize>,
    acquired: Mutex<Vec<LocalMediaHandle>>,
    deny: Option<MediaKind>,
    gate: Option<Arc<Notify>>,
}

impl FakeMediaDevices {
    pub fn denying(kind: MediaKind) -> Self {
        Self {
            deny: Some(kind),
            ..Default::default()
        }
    }

    /// `acquire` wartet, bis das zurückgegebene Notify ausgelöst wird
    pub fn stalled() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let devices = Self {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        (devices, gate)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> Vec<LocalMediaHandle> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(&self, video_requested: bool) -> Result<LocalMediaHandle, MediaError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match self.deny {
            Some(MediaKind::Audio) => return Err(MediaError::PermissionDenied(MediaKind::Audio)),
            Some(MediaKind::Video) if video_requested => {
                return Err(MediaError::PermissionDenied(MediaKind::Video))
            }
            _ => {}
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut kinds = vec![MediaKind::Audio];
        if video_requested {
            kinds.push(MediaKind::Video);
        }
        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let lease = CountingLease {
                    stops: Arc::clone(&self.stops),
                };
                LocalTrack::new(kind, &stream_id, Some(Box::new(lease)))
            })
            .collect();

        let handle = LocalMediaHandle::new(stream_id, tracks);
        self.acquired.lock().push(handle.clone());
        Ok(handle)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Zeichnet gesendete Nachrichten auf und stellt sie optional einer zweiten Engine zu
#[derive(Default)]
pub struct LoopbackSignaling {
    sent: Mutex<Vec<SignalMessage>>,
    peer: Mutex<Option<CallEngine>>,
}

impl LoopbackSignaling {
    pub fn link(&self, engine: CallEngine) {
        *self.peer.lock() = Some(engine);
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.kind()).collect()
    }
}

impl SignalingChannel for LoopbackSignaling {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(message.clone());
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.handle_signal(message);
        }
        Ok(())
    }
}
