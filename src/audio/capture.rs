//! Audio Capture - Mikrofon via cpal
//!
//! Der cpal-Callback läuft auf dem Echtzeit-Thread und schreibt nur in
//! einen Ring-Buffer. Ein Pump-Task holt die Samples dort ab und reicht sie
//! als `AudioBlock` an die registrierten Sinks weiter (Frame Producer,
//! Recorder, ...).

use super::frames::AudioBlock;
use super::AudioError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte native Rate (wird vom Frame Producer 1:3 dezimiert)
pub const PREFERRED_SAMPLE_RATE: u32 = 48000;

/// Ring-Buffer Kapazität in Sekunden Audio
const RING_BUFFER_SECONDS: usize = 2;

/// Wie oft der Pump-Task den Ring-Buffer leert
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Empfänger für Capture-Blöcke
pub type BlockSink = Box<dyn FnMut(&AudioBlock) + Send>;

/// Format des laufenden Capture-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Laufende Mikrofon-Aufnahme
pub struct AudioCapture {
    device_name: String,
    format: CaptureFormat,
    stream: Option<Stream>,
    pump: Option<JoinHandle<()>>,
    ring: Arc<Mutex<HeapRb<f32>>>,
    muted: Arc<AtomicBool>,
    input_level: Arc<Mutex<f32>>,
}

// cpal::Stream ist nicht Send. Der Stream wird nach dem Start nur noch
// gedroppt, nie von einem anderen Thread aus benutzt.
unsafe impl Send for AudioCapture {}

impl AudioCapture {
    /// Öffnet das Standard-Eingabegerät und startet die Aufnahme
    pub fn open_default(sinks: Vec<BlockSink>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;
        Self::open(device, sinks)
    }

    /// Startet die Aufnahme auf einem bestimmten Gerät
    pub fn open(device: Device, sinks: Vec<BlockSink>) -> Result<Self, AudioError> {
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let config = find_best_input_config(&device)?;
        let format = CaptureFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };

        tracing::info!(
            "Starting audio capture on '{}': {} Hz, {} channel(s)",
            device_name,
            format.sample_rate,
            format.channels
        );

        let capacity = format.sample_rate as usize * format.channels as usize * RING_BUFFER_SECONDS;
        let ring = Arc::new(Mutex::new(HeapRb::<f32>::new(capacity)));
        let muted = Arc::new(AtomicBool::new(false));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let stream = {
            let ring = Arc::clone(&ring);
            let muted = Arc::clone(&muted);
            let input_level = Arc::clone(&input_level);

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if data.is_empty() {
                            return;
                        }

                        let rms: f32 =
                            (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                        *input_level.lock() = rms.min(1.0);

                        // Stumm = Stille, damit die Frame-Kadenz erhalten bleibt
                        let silent = muted.load(Ordering::Relaxed);
                        let mut buffer = ring.lock();
                        let mut dropped = 0usize;
                        for &sample in data {
                            let value = if silent { 0.0 } else { sample };
                            if buffer.try_push(value).is_err() {
                                dropped += 1;
                            }
                        }
                        if dropped > 0 {
                            tracing::warn!("Capture ring buffer full, dropped {} samples", dropped);
                        }
                    },
                    |err| {
                        tracing::error!("Audio capture error: {}", err);
                    },
                    None,
                )
                .map_err(map_build_error)?
        };

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        let pump = spawn_pump(Arc::clone(&ring), format, sinks);

        Ok(Self {
            device_name,
            format,
            stream: Some(stream),
            pump: Some(pump),
            ring,
            muted,
            input_level,
        })
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Capture muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// RMS-Pegel des letzten Callbacks (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Stoppt Stream und Pump-Task. Mehrfacher Aufruf ist harmlos.
    pub fn stop(&mut self) {
        if self.stream.take().is_none() {
            return;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.ring.lock().clear();
        tracing::info!("Audio capture on '{}' stopped", self.device_name);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("device", &self.device_name)
            .field("format", &self.format)
            .field("running", &self.is_running())
            .field("muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// PUMP
// ============================================================================

/// Leert den Ring-Buffer periodisch und verteilt die Blöcke
fn spawn_pump(
    ring: Arc<Mutex<HeapRb<f32>>>,
    format: CaptureFormat,
    mut sinks: Vec<BlockSink>,
) -> JoinHandle<()> {
    let channels = format.channels.max(1) as usize;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PUMP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let samples = {
                let mut buffer = ring.lock();
                // Nur ganze Sample-Frames entnehmen, sonst verrutschen die Kanäle
                let available = buffer.occupied_len() - buffer.occupied_len() % channels;
                let mut samples = Vec::with_capacity(available);
                for _ in 0..available {
                    match buffer.try_pop() {
                        Some(s) => samples.push(s),
                        None => break,
                    }
                }
                samples
            };

            if samples.is_empty() {
                continue;
            }

            let block = AudioBlock {
                samples,
                channels: format.channels,
                sample_rate: format.sample_rate,
            };
            for sink in sinks.iter_mut() {
                sink(&block);
            }
        }
    })
}

// ============================================================================
// DEVICE CONFIG
// ============================================================================

fn map_build_error(err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::NoInputDevice,
        other => AudioError::StreamBuildError(other.to_string()),
    }
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Priorität: 48kHz F32 > F32 mit anderer Rate. Der Callback erwartet f32,
/// andere Sample-Formate werden daher nicht genommen.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(PREFERRED_SAMPLE_RATE);

    let float_configs: Vec<&SupportedStreamConfigRange> = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(config) = float_configs
        .iter()
        .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok((*config).clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = float_configs.first() {
        tracing::warn!(
            "Input device does not support {} Hz, falling back to {} Hz",
            PREFERRED_SAMPLE_RATE,
            config.max_sample_rate().0
        );
        return Ok((*config).clone().with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 input configuration found".to_string(),
    ))
}
