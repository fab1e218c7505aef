//! Peer Connection Manager
//!
//! Besitzt genau einen Transport. Alle Transport-Operationen (Negotiation und
//! Remote-Candidates) laufen nacheinander in einem Worker-Task, dadurch bleibt
//! die Reihenfolge der Candidates erhalten:
//!
//! - vor gesetzter Remote Description: FIFO-Puffer
//! - danach: sofort anwenden
//! - direkt nach dem Setzen der Remote Description: Puffer in Reihenfolge leeren

use super::transport::{
    CandidateInit, ConnectionState, IceServer, PeerTransport, SessionDescription,
    TransportEvents, TransportFactory,
};
use super::PeerError;
use crate::media::{LocalMediaHandle, LocalTrack, PeerMediaHandle, RemoteTrack};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// TYPES
// ============================================================================

/// Benannte Phasen der Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    New,
    OfferCreated,
    AnswerCreated,
    AnswerApplied,
    Connected,
    Closed,
}

/// Callbacks des Besitzers. Werden bei `close()` entfernt.
pub struct PeerCallbacks {
    /// Synchron pro gefundenem lokalen Candidate, sofort weiterleiten
    pub on_local_candidate: Box<dyn Fn(CandidateInit) + Send + Sync>,
    pub on_remote_media: Box<dyn Fn(PeerMediaHandle) + Send + Sync>,
    pub on_state_change: Box<dyn Fn(ConnectionState) + Send + Sync>,
    pub local_media: Box<dyn Fn() -> Option<LocalMediaHandle> + Send + Sync>,
}

type Reply<T> = oneshot::Sender<Result<T, PeerError>>;

enum PeerOp {
    CreateOffer(Reply<String>),
    ApplyOffer {
        sdp: String,
        local: Option<LocalMediaHandle>,
        reply: Reply<String>,
    },
    ApplyAnswer {
        sdp: String,
        reply: Reply<()>,
    },
    AttachTracks {
        media: LocalMediaHandle,
        reply: Reply<usize>,
    },
    AddCandidate(CandidateInit),
}

struct Shared {
    phase: Mutex<NegotiationPhase>,
    callbacks: RwLock<Option<PeerCallbacks>>,
    /// Zuletzt gemeldeter Remote-Stream (pro Verbindung, nicht global)
    remote_media: Mutex<Option<PeerMediaHandle>>,
    buffered: AtomicUsize,
    closed: AtomicBool,
}

impl Shared {
    fn set_phase(&self, phase: NegotiationPhase) {
        let mut current = self.phase.lock();
        if *current != NegotiationPhase::Closed {
            *current = phase;
        }
    }

    fn local_media(&self) -> Option<LocalMediaHandle> {
        self.callbacks
            .read()
            .as_ref()
            .and_then(|cb| (cb.local_media)())
    }

    fn local_candidate(&self, candidate: CandidateInit) {
        if let Some(cb) = self.callbacks.read().as_ref() {
            (cb.on_local_candidate)(candidate);
        }
    }

    fn state_change(&self, state: ConnectionState) {
        if state == ConnectionState::Connected {
            self.set_phase(NegotiationPhase::Connected);
        }
        if let Some(cb) = self.callbacks.read().as_ref() {
            (cb.on_state_change)(state);
        }
    }

    /// Neuer Remote-Track: eigener Stream wird ignoriert, bekannte Tracks
    /// ebenfalls. Ein neuer Track im selben Stream ersetzt das Handle komplett.
    fn remote_track(&self, track: RemoteTrack) {
        let callbacks = self.callbacks.read();
        let Some(cb) = callbacks.as_ref() else {
            return;
        };

        if let Some(local) = (cb.local_media)() {
            if local.stream_id() == track.stream_id {
                tracing::debug!("Ignoring own stream {} on remote track", track.stream_id);
                return;
            }
        }

        let handle = {
            let mut current = self.remote_media.lock();
            let next = match current.as_ref() {
                Some(existing) if existing.stream_id() == track.stream_id => {
                    if existing.contains_track(&track.id) {
                        tracing::debug!("Remote track {} already bound", track.id);
                        return;
                    }
                    let mut tracks = existing.tracks().to_vec();
                    tracks.push(track);
                    PeerMediaHandle::new(existing.stream_id().to_string(), tracks)
                }
                _ => PeerMediaHandle::new(track.stream_id.clone(), vec![track]),
            };
            *current = Some(next.clone());
            next
        };

        (cb.on_remote_media)(handle);
    }
}

// ============================================================================
// PEER CONNECTION MANAGER
// ============================================================================

/// Lebenszyklus einer Punkt-zu-Punkt Verbindung
pub struct PeerConnectionManager {
    ops: mpsc::UnboundedSender<PeerOp>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnectionManager {
    /// Erstellt den Transport und registriert die Callbacks
    pub async fn create(
        factory: &dyn TransportFactory,
        ice_servers: &[IceServer],
        callbacks: PeerCallbacks,
    ) -> Result<Self, PeerError> {
        let shared = Arc::new(Shared {
            phase: Mutex::new(NegotiationPhase::New),
            callbacks: RwLock::new(Some(callbacks)),
            remote_media: Mutex::new(None),
            buffered: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let events = {
            let candidates = Arc::clone(&shared);
            let tracks = Arc::clone(&shared);
            let states = Arc::clone(&shared);
            Arc::new(TransportEvents {
                on_local_candidate: Box::new(move |c| candidates.local_candidate(c)),
                on_remote_track: Box::new(move |t| tracks.remote_track(t)),
                on_state_change: Box::new(move |s| states.state_change(s)),
            })
        };

        let transport = factory.create(ice_servers, events).await?;

        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            transport,
            shared: Arc::clone(&shared),
            remote_description_set: false,
            pending: VecDeque::new(),
            attached: Vec::new(),
        };
        let handle = tokio::spawn(worker.run(ops_rx, shutdown_rx));

        tracing::debug!("Peer connection created ({} ICE server(s))", ice_servers.len());

        Ok(Self {
            ops,
            shared,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.shared.phase.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Anzahl der Candidates, die auf die Remote Description warten
    pub fn buffered_candidates(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    pub fn remote_media(&self) -> Option<PeerMediaHandle> {
        self.shared.remote_media.lock().clone()
    }

    /// Initiator: Offer erzeugen und als Local Description setzen
    pub async fn create_offer(&self) -> Result<String, PeerError> {
        self.request(PeerOp::CreateOffer).await
    }

    /// Empfänger: Remote Offer setzen, lokale Tracks anhängen, Answer erzeugen
    /// und als Local Description setzen. Schlägt ein Schritt fehl, ist der
    /// Anrufversuch verloren.
    pub async fn apply_offer_and_create_answer(&self, offer_sdp: String) -> Result<String, PeerError> {
        let local = self.shared.local_media();
        self.request(|reply| PeerOp::ApplyOffer {
            sdp: offer_sdp,
            local,
            reply,
        })
        .await
    }

    /// Initiator: Answer des Gegenübers setzen, danach gepufferte Candidates anwenden
    pub async fn apply_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        self.request(|reply| PeerOp::ApplyAnswer {
            sdp: answer_sdp,
            reply,
        })
        .await
    }

    /// Hängt lokale Tracks an; bereits angehängte werden übersprungen.
    /// Gibt die Anzahl neu hinzugefügter Tracks zurück.
    pub async fn attach_local_tracks(&self, media: &LocalMediaHandle) -> Result<usize, PeerError> {
        let media = media.clone();
        self.request(|reply| PeerOp::AttachTracks { media, reply }).await
    }

    /// Remote Candidate übergeben (puffert bis zur Remote Description)
    pub fn add_remote_candidate(&self, candidate: CandidateInit) {
        if self.is_closed() {
            tracing::debug!("Dropping candidate for closed peer connection");
            return;
        }
        if self.ops.send(PeerOp::AddCandidate(candidate)).is_err() {
            tracing::debug!("Peer worker gone, candidate dropped");
        }
    }

    /// Entfernt zuerst die Handler, schließt dann den Transport. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Späte Transport-Events laufen ab hier ins Leere
        self.shared.callbacks.write().take();
        if let Some(remote) = self.shared.remote_media.lock().take() {
            remote.release();
        }
        self.shared.set_phase(NegotiationPhase::Closed);
        self.shutdown.send_replace(true);

        tracing::info!("Peer connection closing");
    }

    /// Wartet, bis der Transport tatsächlich geschlossen ist
    pub async fn closed(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> PeerOp) -> Result<T, PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.ops.send(build(reply)).map_err(|_| PeerError::Closed)?;
        // Abbruch durch close() verwirft den Sender
        rx.await.map_err(|_| PeerError::Closed)?
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("phase", &self.phase())
            .field("buffered_candidates", &self.buffered_candidates())
            .finish()
    }
}

// ============================================================================
// WORKER
// ============================================================================

struct Worker {
    transport: Arc<dyn PeerTransport>,
    shared: Arc<Shared>,
    remote_description_set: bool,
    pending: VecDeque<CandidateInit>,
    attached: Vec<Arc<LocalTrack>>,
}

impl Worker {
    async fn run(
        mut self,
        mut ops: mpsc::UnboundedReceiver<PeerOp>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let op = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                op = ops.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };

            // Eine laufende Operation wird bei close() abgebrochen
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.execute(op) => {}
            }
        }

        self.shutdown().await;
    }

    async fn execute(&mut self, op: PeerOp) {
        match op {
            PeerOp::CreateOffer(reply) => {
                let result = self.create_offer().await;
                let _ = reply.send(result);
            }
            PeerOp::ApplyOffer { sdp, local, reply } => {
                let result = self.apply_offer(sdp, local).await;
                let _ = reply.send(result);
            }
            PeerOp::ApplyAnswer { sdp, reply } => {
                let result = self.apply_answer(sdp).await;
                let _ = reply.send(result);
            }
            PeerOp::AttachTracks { media, reply } => {
                let result = self.attach(&media).await;
                let _ = reply.send(result);
            }
            PeerOp::AddCandidate(candidate) => self.add_candidate(candidate).await,
        }
    }

    async fn create_offer(&mut self) -> Result<String, PeerError> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.shared.set_phase(NegotiationPhase::OfferCreated);
        tracing::debug!("Offer created");
        Ok(offer.sdp)
    }

    async fn apply_offer(
        &mut self,
        sdp: String,
        local: Option<LocalMediaHandle>,
    ) -> Result<String, PeerError> {
        self.transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.remote_description_set = true;
        self.flush_pending().await;

        if let Some(local) = local {
            self.attach(&local).await?;
        }

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.shared.set_phase(NegotiationPhase::AnswerCreated);
        tracing::debug!("Offer applied, answer created");
        Ok(answer.sdp)
    }

    async fn apply_answer(&mut self, sdp: String) -> Result<(), PeerError> {
        self.transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.remote_description_set = true;
        self.shared.set_phase(NegotiationPhase::AnswerApplied);
        tracing::debug!("Answer applied");
        self.flush_pending().await;
        Ok(())
    }

    async fn attach(&mut self, media: &LocalMediaHandle) -> Result<usize, PeerError> {
        let mut added = 0;
        for track in media.tracks() {
            if self.attached.iter().any(|t| Arc::ptr_eq(t, track)) {
                continue;
            }
            self.transport.add_track(Arc::clone(track)).await?;
            self.attached.push(Arc::clone(track));
            added += 1;
        }
        Ok(added)
    }

    async fn add_candidate(&mut self, candidate: CandidateInit) {
        if self.remote_description_set {
            self.apply_candidate(candidate).await;
        } else {
            self.pending.push_back(candidate);
            self.shared.buffered.store(self.pending.len(), Ordering::SeqCst);
            tracing::debug!("Buffered remote candidate ({} pending)", self.pending.len());
        }
    }

    async fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Flushing {} buffered candidate(s)", self.pending.len());
        }
        while let Some(candidate) = self.pending.pop_front() {
            self.shared.buffered.store(self.pending.len(), Ordering::SeqCst);
            self.apply_candidate(candidate).await;
        }
    }

    /// Ein einzelner schlechter Candidate bricht die Verbindung nicht ab
    async fn apply_candidate(&self, candidate: CandidateInit) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            tracing::warn!("Ignoring remote candidate: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        self.transport.detach_handlers();
        self.transport.stop_senders().await;
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
        self.pending.clear();
        self.shared.buffered.store(0, Ordering::SeqCst);
        self.shared.set_phase(NegotiationPhase::Closed);
        tracing::info!("Peer connection closed");
    }
}
