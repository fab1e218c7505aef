//! Native Geräte-Erfassung über cpal

use super::{DeviceLease, LocalMediaHandle, LocalTrack, MediaDevices, MediaError, MediaKind};
use crate::audio::{producer_sink, AudioCapture, AudioError, AudioFrame, FrameConfig, FrameProducer};
use async_trait::async_trait;
use std::sync::Arc;

/// Fragt den Nutzer (bzw. die Host-UI) nach Gerätezugriff
pub trait PermissionGate: Send + Sync {
    fn request(&self, kind: MediaKind) -> bool;
}

/// Erlaubt alles (Headless-Betrieb)
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn request(&self, _kind: MediaKind) -> bool {
        true
    }
}

/// Kamera-Backend. Ohne registrierte Kamera sind Video-Anrufe nicht möglich.
pub trait CameraSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn DeviceLease>, MediaError>;
}

type SharedFrameSink = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Mikrofon über cpal, Kamera über ein optionales Backend
pub struct CpalMediaDevices {
    permissions: Arc<dyn PermissionGate>,
    camera: Option<Arc<dyn CameraSource>>,
    frames: Option<(FrameConfig, SharedFrameSink)>,
}

impl CpalMediaDevices {
    pub fn new(permissions: Arc<dyn PermissionGate>) -> Self {
        Self {
            permissions,
            camera: None,
            frames: None,
        }
    }

    pub fn with_camera(mut self, camera: Arc<dyn CameraSource>) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Jedes geöffnete Mikrofon speist zusätzlich einen PCM Frame Producer
    pub fn with_frame_sink(mut self, config: FrameConfig, sink: SharedFrameSink) -> Self {
        self.frames = Some((config, sink));
        self
    }

    fn open_microphone(&self) -> Result<AudioCapture, MediaError> {
        let mut sinks = Vec::new();
        if let Some((config, sink)) = &self.frames {
            let sink = Arc::clone(sink);
            let producer = FrameProducer::new(*config, Box::new(move |frame| sink(frame)));
            sinks.push(producer_sink(producer));
        }

        AudioCapture::open_default(sinks).map_err(|e| match e {
            AudioError::NoInputDevice => MediaError::DeviceUnavailable("microphone".to_string()),
            other => MediaError::Capture(other.to_string()),
        })
    }
}

impl std::fmt::Debug for CpalMediaDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalMediaDevices")
            .field("camera", &self.camera.is_some())
            .field("frames", &self.frames.as_ref().map(|(config, _)| *config))
            .finish()
    }
}

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn acquire(&self, video_requested: bool) -> Result<LocalMediaHandle, MediaError> {
        if !self.permissions.request(MediaKind::Audio) {
            return Err(MediaError::PermissionDenied(MediaKind::Audio));
        }
        if video_requested && !self.permissions.request(MediaKind::Video) {
            return Err(MediaError::PermissionDenied(MediaKind::Video));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();

        // Mikrofon zuerst; schlägt die Kamera fehl, stoppt Drop die Aufnahme wieder
        let microphone = self.open_microphone()?;
        let mut tracks = vec![LocalTrack::new(
            MediaKind::Audio,
            &stream_id,
            Some(Box::new(microphone)),
        )];

        if video_requested {
            let camera = self
                .camera
                .as_ref()
                .ok_or_else(|| MediaError::DeviceUnavailable("camera".to_string()))?;
            tracks.push(LocalTrack::new(MediaKind::Video, &stream_id, Some(camera.open()?)));
        }

        tracing::info!(
            "Acquired local media {} (video: {})",
            stream_id,
            video_requested
        );
        Ok(LocalMediaHandle::new(stream_id, tracks))
    }
}
