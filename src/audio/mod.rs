//! Audio Module - Capture und PCM-Framing
//!
//! - Mikrofon-Capture über cpal (`capture`)
//! - Echtzeit-Framing in 16-Bit PCM für Transkription (`frames`)

mod capture;
mod frames;

use thiserror::Error;

pub use capture::{AudioCapture, BlockSink, CaptureFormat, PREFERRED_SAMPLE_RATE};
pub use frames::{
    sample_to_pcm16, AudioBlock, AudioFrame, FrameCallback, FrameConfig, FrameProducer,
    DEFAULT_FRAME_MS, DEFAULT_TARGET_SAMPLE_RATE,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Invalid frame configuration: {target_sample_rate} Hz / {frame_ms} ms")]
    InvalidFrameConfig { target_sample_rate: u32, frame_ms: u32 },
}

/// Hängt einen Frame Producer als Sink an eine Capture-Pipeline
pub fn producer_sink(mut producer: FrameProducer) -> BlockSink {
    Box::new(move |block: &AudioBlock| producer.process(block))
}
