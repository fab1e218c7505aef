//! PCM Frame Producer
//!
//! Wandelt Capture-Blöcke (native Sample-Rate, f32, ggf. mehrkanalig) in
//! Frames fester Länge aus 16-Bit signed little-endian PCM um.
//!
//! Resampling ist absichtlich simpel: bei 48kHz wird jedes dritte Sample
//! genommen (ohne Anti-Alias-Filter), jede andere Rate wird unverändert
//! durchgereicht. Für Sprach-Transkription reicht das.

use super::AudioError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Ziel-Sample-Rate für Transkription
pub const DEFAULT_TARGET_SAMPLE_RATE: u32 = 16000;

/// Frame-Dauer in Millisekunden
pub const DEFAULT_FRAME_MS: u32 = 20;

/// Einzige native Rate, die dezimiert wird
const DECIMATION_SOURCE_RATE: u32 = 48000;

/// 48kHz -> 16kHz
const DECIMATION_FACTOR: usize = 3;

const POSITIVE_SCALE: f32 = 32767.0;
const NEGATIVE_SCALE: f32 = 32768.0;

// ============================================================================
// CONFIG
// ============================================================================

/// Konfiguration des Frame Producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    pub target_sample_rate: u32,
    pub frame_ms: u32,
}

impl FrameConfig {
    pub fn new(target_sample_rate: u32, frame_ms: u32) -> Result<Self, AudioError> {
        let config = Self {
            target_sample_rate,
            frame_ms,
        };
        if config.frame_sample_count() == 0 {
            return Err(AudioError::InvalidFrameConfig {
                target_sample_rate,
                frame_ms,
            });
        }
        Ok(config)
    }

    /// `round(targetSampleRate * frameMs / 1000)`
    pub fn frame_sample_count(&self) -> usize {
        (self.target_sample_rate as f64 * self.frame_ms as f64 / 1000.0).round() as usize
    }

    /// Größe eines Frames in Bytes (2 Bytes pro Sample)
    pub fn frame_byte_len(&self) -> usize {
        self.frame_sample_count() * 2
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: DEFAULT_TARGET_SAMPLE_RATE,
            frame_ms: DEFAULT_FRAME_MS,
        }
    }
}

// ============================================================================
// AUDIO BLOCK / FRAME
// ============================================================================

/// Ein Block Roh-Samples, so wie ihn die Capture-Pipeline liefert
/// (interleaved, native Rate).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() || self.channels == 0
    }

    /// Anzahl Samples pro Kanal
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Fertiger PCM-Frame (Int16LE). Nach der Übergabe unveränderlich.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Bytes);

impl AudioFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dekodiert die Samples wieder (für Konsumenten und Tests)
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Callback, der jeden fertigen Frame übernimmt
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send>;

// ============================================================================
// RESAMPLING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resampling {
    Decimate(usize),
    Passthrough,
}

impl Resampling {
    fn for_native_rate(native_rate: u32) -> Self {
        if native_rate == DECIMATION_SOURCE_RATE {
            Resampling::Decimate(DECIMATION_FACTOR)
        } else {
            Resampling::Passthrough
        }
    }

    fn output_rate(&self, native_rate: u32) -> u32 {
        match self {
            Resampling::Decimate(factor) => native_rate / *factor as u32,
            Resampling::Passthrough => native_rate,
        }
    }
}

/// Float-Sample auf Int16 abbilden (getrennte Skalierung für +/-)
pub fn sample_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEGATIVE_SCALE) as i16
    } else {
        (s * POSITIVE_SCALE) as i16
    }
}

// ============================================================================
// FRAME PRODUCER
// ============================================================================

/// Zerlegt einen kontinuierlichen Capture-Stream in PCM-Frames fester Größe.
pub struct FrameProducer {
    config: FrameConfig,
    frame_samples: usize,
    native_rate: Option<u32>,
    resampling: Resampling,
    /// Position im Dezimations-Raster, über Blockgrenzen hinweg
    decimation_phase: usize,
    /// Noch nicht gerahmte (bereits resampelte) Samples
    carry: Vec<f32>,
    rate_mismatch: bool,
    on_frame: FrameCallback,
}

impl FrameProducer {
    pub fn new(config: FrameConfig, on_frame: FrameCallback) -> Self {
        let frame_samples = config.frame_sample_count();
        Self {
            config,
            frame_samples,
            native_rate: None,
            resampling: Resampling::Passthrough,
            decimation_phase: 0,
            carry: Vec::with_capacity(frame_samples * 2),
            rate_mismatch: false,
            on_frame,
        }
    }

    pub fn config(&self) -> FrameConfig {
        self.config
    }

    /// Noch gepufferte Samples (kleiner als ein Frame nach jedem `process`)
    pub fn pending_samples(&self) -> usize {
        self.carry.len()
    }

    /// `true`, wenn die native Rate mit der einfachen Dezimation nicht auf
    /// die Ziel-Rate abgebildet werden kann. Die Frames haben dann die falsche Rate.
    pub fn rate_mismatch(&self) -> bool {
        self.rate_mismatch
    }

    /// Verarbeitet einen Capture-Block. Leere Blöcke sind ein No-op.
    pub fn process(&mut self, block: &AudioBlock) {
        if block.is_empty() {
            return;
        }

        self.update_native_rate(block.sample_rate);
        self.append_resampled(block);
        self.emit_ready_frames();
    }

    fn update_native_rate(&mut self, native_rate: u32) {
        if self.native_rate == Some(native_rate) {
            return;
        }

        self.native_rate = Some(native_rate);
        self.resampling = Resampling::for_native_rate(native_rate);
        self.decimation_phase = 0;

        let output_rate = self.resampling.output_rate(native_rate);
        self.rate_mismatch = output_rate != self.config.target_sample_rate;
        if self.rate_mismatch {
            tracing::warn!(
                "Native rate {} Hz yields {} Hz frames, target is {} Hz (no resampling available)",
                native_rate,
                output_rate,
                self.config.target_sample_rate
            );
        } else {
            tracing::debug!(
                "Frame producer: {} Hz -> {} Hz, {} samples/frame",
                native_rate,
                output_rate,
                self.frame_samples
            );
        }
    }

    fn append_resampled(&mut self, block: &AudioBlock) {
        let channels = block.channels as usize;
        let mono = block.samples.chunks_exact(channels).map(|frame| {
            if channels == 1 {
                frame[0]
            } else {
                frame.iter().sum::<f32>() / channels as f32
            }
        });

        match self.resampling {
            Resampling::Passthrough => self.carry.extend(mono),
            Resampling::Decimate(factor) => {
                for sample in mono {
                    if self.decimation_phase == 0 {
                        self.carry.push(sample);
                    }
                    self.decimation_phase = (self.decimation_phase + 1) % factor;
                }
            }
        }
    }

    fn emit_ready_frames(&mut self) {
        let n = self.frame_samples;
        let mut offset = 0;

        while self.carry.len() - offset >= n {
            // Frische Allokation pro Frame, der Konsument besitzt den Buffer
            let mut pcm = Vec::with_capacity(n * 2);
            for &sample in &self.carry[offset..offset + n] {
                pcm.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
            }
            offset += n;
            (self.on_frame)(AudioFrame(Bytes::from(pcm)));
        }

        if offset > 0 {
            self.carry.drain(..offset);
        }
    }
}

impl std::fmt::Debug for FrameProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProducer")
            .field("config", &self.config)
            .field("native_rate", &self.native_rate)
            .field("pending", &self.carry.len())
            .field("rate_mismatch", &self.rate_mismatch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn collecting_producer(config: FrameConfig) -> (FrameProducer, Arc<Mutex<Vec<AudioFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let producer = FrameProducer::new(config, Box::new(move |f| sink.lock().push(f)));
        (producer, frames)
    }

    #[test]
    fn frame_sample_count_rounds() {
        assert_eq!(FrameConfig::default().frame_sample_count(), 320);
        assert_eq!(FrameConfig::new(16000, 10).unwrap().frame_sample_count(), 160);
        assert_eq!(FrameConfig::new(22050, 20).unwrap().frame_sample_count(), 441);
        assert_eq!(FrameConfig::new(8000, 30).unwrap().frame_byte_len(), 480);
        assert!(FrameConfig::new(16000, 0).is_err());
    }

    #[test]
    fn full_scale_block_at_48k_yields_one_max_frame() {
        let (mut producer, frames) = collecting_producer(FrameConfig::default());

        producer.process(&AudioBlock::mono(vec![1.0; 960], 48000));

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 640);
        assert!(frames[0].samples().all(|s| s == 32767));
        assert_eq!(&frames[0].as_bytes()[..2], &[0xFF, 0x7F]);
        assert_eq!(producer.pending_samples(), 0);
        assert!(!producer.rate_mismatch());
    }

    #[test]
    fn conversion_clamps_and_scales_asymmetrically() {
        assert_eq!(sample_to_pcm16(-1.0), -32768);
        assert_eq!(sample_to_pcm16(-4.0), -32768);
        assert_eq!(sample_to_pcm16(2.5), 32767);
        assert_eq!(sample_to_pcm16(0.0), 0);
        assert_eq!(sample_to_pcm16(0.5), 16383);
        assert_eq!(sample_to_pcm16(-0.5), -16384);
    }

    #[test]
    fn empty_block_is_a_noop() {
        let (mut producer, frames) = collecting_producer(FrameConfig::default());
        producer.process(&AudioBlock::mono(Vec::new(), 48000));
        producer.process(&AudioBlock {
            samples: vec![0.3; 12],
            channels: 0,
            sample_rate: 48000,
        });
        assert!(frames.lock().is_empty());
        assert_eq!(producer.pending_samples(), 0);

        // läuft danach normal weiter
        producer.process(&AudioBlock::mono(vec![0.0; 960], 48000));
        assert_eq!(frames.lock().len(), 1);
    }

    #[test]
    fn leftover_samples_carry_into_next_block() {
        let (mut producer, frames) = collecting_producer(FrameConfig::default());

        producer.process(&AudioBlock::mono(vec![0.25; 600], 48000));
        assert!(frames.lock().is_empty());
        assert_eq!(producer.pending_samples(), 200);

        producer.process(&AudioBlock::mono(vec![0.25; 600], 48000));
        assert_eq!(frames.lock().len(), 1);
        assert_eq!(producer.pending_samples(), 80);
    }

    #[test]
    fn decimation_phase_survives_odd_block_sizes() {
        let (mut producer, frames) = collecting_producer(FrameConfig::new(16000, 1).unwrap());
        let ramp: Vec<f32> = (0..48).map(|i| i as f32 / 100.0).collect();

        producer.process(&AudioBlock::mono(ramp[..5].to_vec(), 48000));
        producer.process(&AudioBlock::mono(ramp[5..].to_vec(), 48000));

        let got: Vec<i16> = frames.lock().iter().flat_map(|f| f.samples().collect::<Vec<_>>()).collect();
        let expected: Vec<i16> = ramp.iter().step_by(3).map(|&s| sample_to_pcm16(s)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn stereo_is_downmixed_before_framing() {
        let (mut producer, frames) = collecting_producer(FrameConfig::new(16000, 1).unwrap());
        let mut interleaved = Vec::new();
        for _ in 0..16 {
            interleaved.push(1.0);
            interleaved.push(0.0);
        }

        producer.process(&AudioBlock {
            samples: interleaved,
            channels: 2,
            sample_rate: 16000,
        });

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].samples().all(|s| s == sample_to_pcm16(0.5)));
    }

    #[test]
    fn unsupported_native_rate_is_flagged_and_passed_through() {
        let (mut producer, frames) = collecting_producer(FrameConfig::default());
        producer.process(&AudioBlock::mono(vec![0.1; 441], 44100));
        assert!(producer.rate_mismatch());
        assert_eq!(frames.lock().len(), 1);
        assert_eq!(producer.pending_samples(), 121);

        let (mut producer, _) = collecting_producer(FrameConfig::default());
        producer.process(&AudioBlock::mono(vec![0.1; 320], 16000));
        assert!(!producer.rate_mismatch());
    }

    #[test]
    fn every_frame_gets_its_own_buffer() {
        let (mut producer, frames) = collecting_producer(FrameConfig::default());
        let mut block = vec![0.5; 960];
        block.extend(vec![-0.5; 960]);
        producer.process(&AudioBlock::mono(block, 48000));

        let frames = frames.lock();
        assert_eq!(frames.len(), 2);
        assert_ne!(frames[0].as_bytes().as_ptr(), frames[1].as_bytes().as_ptr());
        assert!(frames[0].samples().all(|s| s == 16383));
        assert!(frames[1].samples().all(|s| s == -16384));
    }

    proptest! {
        #[test]
        fn frames_always_have_the_configured_size(
            rate in prop::sample::select(vec![8000u32, 16000, 22050, 24000]),
            frame_ms in 5u32..60,
            blocks in prop::collection::vec(prop::collection::vec(-1.5f32..1.5, 0..700), 1..12),
            native in prop::sample::select(vec![16000u32, 44100, 48000]),
        ) {
            let config = FrameConfig::new(rate, frame_ms).unwrap();
            let (mut producer, frames) = collecting_producer(config);
            for samples in blocks {
                producer.process(&AudioBlock::mono(samples, native));
            }
            for frame in frames.lock().iter() {
                prop_assert_eq!(frame.len(), config.frame_sample_count() * 2);
            }
            prop_assert!(producer.pending_samples() < config.frame_sample_count());
        }

        #[test]
        fn concatenated_frames_reconstruct_the_decimated_input(
            frame_count in 1usize..6,
            cuts in prop::collection::vec(0usize..2000, 0..6),
            seed in prop::collection::vec(-1.0f32..1.0, 64),
        ) {
            let config = FrameConfig::default();
            let total = frame_count * config.frame_sample_count() * 3;
            let input: Vec<f32> = (0..total).map(|i| seed[i % seed.len()]).collect();

            let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c % (total + 1)).collect();
            bounds.push(0);
            bounds.push(total);
            bounds.sort_unstable();

            let (mut producer, frames) = collecting_producer(config);
            for pair in bounds.windows(2) {
                producer.process(&AudioBlock::mono(input[pair[0]..pair[1]].to_vec(), 48000));
            }

            let frames = frames.lock();
            prop_assert_eq!(frames.len(), frame_count);
            let got: Vec<i16> = frames.iter().flat_map(|f| f.samples().collect::<Vec<_>>()).collect();
            let expected: Vec<i16> = input.iter().step_by(3).map(|&s| sample_to_pcm16(s)).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
