//! Media Module - lokale Geräte und Remote-Tracks
//!
//! Verwaltet:
//! - Zugriff auf Mikrofon/Kamera (mit Nutzer-Erlaubnis)
//! - `LocalMediaHandle`: besitzt die Geräte bis `release()`
//! - `PeerMediaHandle`: Track-Bündel des Gegenübers
//! - Binden von Medien an Render-Sinks

mod devices;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub use devices::{AllowAll, CameraSource, CpalMediaDevices, PermissionGate};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied for {0:?}")]
    PermissionDenied(MediaKind),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture failed: {0}")]
    Capture(String),
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

/// Ein geöffnetes Gerät hinter einem lokalen Track
pub trait DeviceLease: Send {
    fn set_enabled(&mut self, _enabled: bool) {}

    /// Gibt das Gerät frei (Hardware-Indikator geht aus)
    fn stop(&mut self);
}

impl DeviceLease for crate::audio::AudioCapture {
    fn set_enabled(&mut self, enabled: bool) {
        self.set_muted(!enabled);
    }

    fn stop(&mut self) {
        crate::audio::AudioCapture::stop(self);
    }
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

/// Lokaler Track: RTP-Senke für den Transport plus das Gerät dahinter
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    stream_id: String,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    device: Mutex<Option<Box<dyn DeviceLease>>>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str, device: Option<Box<dyn DeviceLease>>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let rtp = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            id,
            kind,
            stream_id: stream_id.to_string(),
            rtp,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            device: Mutex::new(device),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Track für `RTCPeerConnection::add_track`
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.is_stopped() {
            return;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        if let Some(device) = self.device.lock().as_mut() {
            device.set_enabled(enabled);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stoppt den Track. Gibt `true` zurück, wenn dieser Aufruf ihn gestoppt hat.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(mut device) = self.device.lock().take() {
            device.stop();
        }
        tracing::debug!("Stopped local {:?} track {}", self.kind, self.id);
        true
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// LOCAL MEDIA HANDLE
// ============================================================================

struct LocalMediaInner {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
    released: AtomicBool,
}

/// Besitz-Wrapper um die erworbenen lokalen Tracks.
///
/// Klone teilen sich denselben Zustand; `release()` stoppt alle Tracks genau
/// einmal, weitere Aufrufe sind No-ops.
#[derive(Clone)]
pub struct LocalMediaHandle {
    inner: Arc<LocalMediaInner>,
}

impl LocalMediaHandle {
    pub fn new(stream_id: String, tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                stream_id,
                tracks: tracks.into_iter().map(Arc::new).collect(),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.inner.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.inner.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(MediaKind::Video).next().is_some()
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Stoppt alle Tracks. Idempotent.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let stopped = self.inner.tracks.iter().filter(|t| t.stop()).count();
        tracing::info!(
            "Released local media {} ({} track(s) stopped)",
            self.inner.stream_id,
            stopped
        );
    }

    pub fn ptr_eq(&self, other: &LocalMediaHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.inner.tracks)
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// REMOTE MEDIA
// ============================================================================

/// Ein vom Gegenüber empfangener Track
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// RTP-Quelle (fehlt bei Transports ohne echte Medien)
    pub source: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct PeerMediaInner {
    stream_id: String,
    tracks: Vec<RemoteTrack>,
    released: AtomicBool,
}

/// Track-Bündel des Gegenübers. Wird nie verändert, höchstens komplett ersetzt.
#[derive(Clone)]
pub struct PeerMediaHandle {
    inner: Arc<PeerMediaInner>,
}

impl PeerMediaHandle {
    pub fn new(stream_id: String, tracks: Vec<RemoteTrack>) -> Self {
        Self {
            inner: Arc::new(PeerMediaInner {
                stream_id,
                tracks,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.inner.tracks
    }

    pub fn contains_track(&self, track_id: &str) -> bool {
        self.inner.tracks.iter().any(|t| t.id == track_id)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            tracing::debug!("Released remote media {}", self.inner.stream_id);
        }
    }

    pub fn ptr_eq(&self, other: &PeerMediaHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for PeerMediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerMediaHandle")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.inner.tracks)
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// DEVICES / SINKS
// ============================================================================

/// Zugriff auf lokale Capture-Geräte
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fordert immer Audio an, Video nur auf Wunsch
    async fn acquire(&self, video_requested: bool) -> Result<LocalMediaHandle, MediaError>;

    fn release(&self, handle: &LocalMediaHandle) {
        handle.release();
    }
}

/// Was an eine Render-Senke gebunden wird
#[derive(Debug, Clone, Copy)]
pub enum MediaBinding<'a> {
    Local(&'a LocalMediaHandle),
    Remote(&'a PeerMediaHandle),
}

impl MediaBinding<'_> {
    pub fn stream_id(&self) -> &str {
        match self {
            MediaBinding::Local(handle) => handle.stream_id(),
            MediaBinding::Remote(handle) => handle.stream_id(),
        }
    }
}

/// Render-Ziel (Video-Element, Lautsprecher, Log, ...). Übernimmt nie den Besitz.
pub trait MediaSink: Send + Sync {
    fn attach(&self, media: MediaBinding<'_>);

    fn detach(&self) {}
}

/// Bindet Medien an eine Senke. Freigegebene Handles werden nicht gebunden.
pub fn bind(sink: &dyn MediaSink, media: MediaBinding<'_>) -> bool {
    let released = match media {
        MediaBinding::Local(handle) => handle.is_released(),
        MediaBinding::Remote(handle) => handle.is_released(),
    };
    if released {
        tracing::debug!("Not binding released stream {}", media.stream_id());
        return false;
    }
    sink.attach(media);
    true
}
