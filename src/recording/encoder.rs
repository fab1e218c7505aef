//! Chunk-Encoder für den Recorder

use super::RecordingError;
use crate::audio::{sample_to_pcm16, AudioBlock};
use bytes::Bytes;
use std::io::Cursor;

/// Kodiert Audio-Blöcke in Chunks und baut daraus die fertige Datei
pub trait ChunkEncoder: Send {
    fn encode(&mut self, block: &AudioBlock) -> Result<(), RecordingError>;

    /// Bisher kodierte Daten als Chunk (periodisch aufgerufen)
    fn flush(&mut self) -> Option<Bytes>;

    /// Setzt die Chunks zum Container zusammen
    fn finalize(&mut self, chunks: &[Bytes]) -> Result<Vec<u8>, RecordingError>;
}

/// Welche Formate nativ kodiert werden können
pub trait EncoderFactory: Send + Sync {
    fn is_supported(&self, mime_type: &str) -> bool;

    fn create(&self, mime_type: &str) -> Result<Box<dyn ChunkEncoder>, RecordingError>;
}

/// Native Encoder (WAV über hound)
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEncoders;

impl EncoderFactory for NativeEncoders {
    fn is_supported(&self, mime_type: &str) -> bool {
        mime_type == "audio/wav"
    }

    fn create(&self, mime_type: &str) -> Result<Box<dyn ChunkEncoder>, RecordingError> {
        if self.is_supported(mime_type) {
            Ok(Box::new(WavEncoder::default()))
        } else {
            Err(RecordingError::NoSupportedEncoding)
        }
    }
}

/// 16-bit PCM WAV. Chunks enthalten rohe Samples, der Header entsteht beim Finalisieren.
#[derive(Debug, Default)]
pub struct WavEncoder {
    format: Option<(u32, u16)>,
    pending: Vec<u8>,
}

impl ChunkEncoder for WavEncoder {
    fn encode(&mut self, block: &AudioBlock) -> Result<(), RecordingError> {
        if block.is_empty() {
            return Ok(());
        }
        let format = (block.sample_rate, block.channels);
        match self.format {
            None => self.format = Some(format),
            Some(existing) if existing != format => {
                return Err(RecordingError::Finalization(format!(
                    "format changed from {:?} to {:?}",
                    existing, format
                )))
            }
            Some(_) => {}
        }

        self.pending.reserve(block.samples.len() * 2);
        for &sample in &block.samples {
            self.pending
                .extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
        }
        Ok(())
    }

    fn flush(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut self.pending)))
    }

    fn finalize(&mut self, chunks: &[Bytes]) -> Result<Vec<u8>, RecordingError> {
        let (sample_rate, channels) = self.format.ok_or(RecordingError::NoData)?;
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let finalization = |e: hound::Error| RecordingError::Finalization(e.to_string());
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(finalization)?;
            for chunk in chunks {
                for pair in chunk.chunks_exact(2) {
                    writer
                        .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                        .map_err(finalization)?;
                }
            }
            writer.finalize().map_err(finalization)?;
        }

        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_chunks_become_a_readable_file() {
        let mut encoder = WavEncoder::default();
        let block = AudioBlock {
            samples: vec![0.5; 1600],
            channels: 1,
            sample_rate: 16000,
        };

        let mut chunks = Vec::new();
        for _ in 0..3 {
            encoder.encode(&block).unwrap();
            chunks.extend(encoder.flush());
        }
        assert!(encoder.flush().is_none());

        let bytes = encoder.finalize(&chunks).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 4800);
    }

    #[test]
    fn wav_rejects_format_change() {
        let mut encoder = WavEncoder::default();
        let mono = AudioBlock {
            samples: vec![0.0; 10],
            channels: 1,
            sample_rate: 48000,
        };
        let stereo = AudioBlock {
            samples: vec![0.0; 10],
            channels: 2,
            sample_rate: 48000,
        };
        encoder.encode(&mono).unwrap();
        assert!(encoder.encode(&stereo).is_err());
    }

    #[test]
    fn finalize_without_audio_is_no_data() {
        let mut encoder = WavEncoder::default();
        assert!(matches!(encoder.finalize(&[]), Err(RecordingError::NoData)));
    }

    #[test]
    fn native_factory_only_knows_wav() {
        assert!(NativeEncoders.is_supported("audio/wav"));
        assert!(!NativeEncoders.is_supported("audio/webm;codecs=opus"));
        assert!(NativeEncoders.create("audio/ogg").is_err());
    }
}
