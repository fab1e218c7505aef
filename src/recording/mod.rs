//! Recording Module - komplette Aufnahme in eine Datei
//!
//! Unabhängig vom PCM-Frame-Pfad: Blöcke werden kodiert, periodisch als Chunk
//! gesammelt und bei `stop()` zu einer einzigen Datei zusammengesetzt.
//! Die Geräte gehören dem Aufrufer; der Recorder stoppt sie nicht.

mod encoder;
mod mime;

use crate::audio::{AudioBlock, BlockSink};
use bytes::Bytes;
use chrono::Utc;
use futures::channel::mpsc as block_mpsc;
use futures::{FutureExt, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use encoder::{ChunkEncoder, EncoderFactory, NativeEncoders, WavEncoder};
pub use mime::{extension_for, select_mime_type, CANDIDATE_MIME_TYPES};

pub const DEFAULT_TIMESLICE: Duration = Duration::from_millis(250);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("recording failed: no supported encoding")]
    NoSupportedEncoding,

    #[error("recording failed: not recording")]
    NotRecording,

    #[error("recording failed: no audio captured")]
    NoData,

    #[error("recording failed: {0}")]
    Finalization(String),

    #[error("recording failed: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// RECORDED FILE
// ============================================================================

/// Fertige Aufnahme, bereit für den Upload
#[derive(Debug, Clone)]
pub struct RecordedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl RecordedFile {
    fn new(mime_type: &str, bytes: Vec<u8>) -> Self {
        let name = format!(
            "recording-{}.{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            extension_for(mime_type)
        );
        Self {
            name,
            mime_type: mime_type.to_string(),
            bytes: Bytes::from(bytes),
        }
    }

    pub fn extension(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Schreibt die Datei in `dir` (wird bei Bedarf angelegt)
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf, RecordingError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.name);
        tokio::fs::write(&path, &self.bytes).await?;
        tracing::info!("Saved recording to {}", path.display());
        Ok(path)
    }
}

/// Sink für eine Capture-Pipeline plus passender Block-Stream für `AudioRecorder::start`
pub fn block_channel() -> (BlockSink, block_mpsc::UnboundedReceiver<AudioBlock>) {
    let (tx, rx) = block_mpsc::unbounded();
    let sink: BlockSink = Box::new(move |block: &AudioBlock| {
        // Empfänger weg = Aufnahme beendet
        let _ = tx.unbounded_send(block.clone());
    });
    (sink, rx)
}

// ============================================================================
// AUDIO RECORDER
// ============================================================================

/// Laufende Aufnahme
pub struct AudioRecorder {
    mime_type: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<RecordedFile, RecordingError>>,
}

impl AudioRecorder {
    /// Wählt das beste unterstützte Format und beginnt mit der Aufnahme
    pub fn start<S>(
        blocks: S,
        encoders: &dyn EncoderFactory,
        timeslice: Duration,
    ) -> Result<Self, RecordingError>
    where
        S: Stream<Item = AudioBlock> + Send + Unpin + 'static,
    {
        let mime_type = select_mime_type(|m| encoders.is_supported(m))
            .ok_or(RecordingError::NoSupportedEncoding)?;
        let encoder = encoders.create(mime_type)?;
        let (stop_tx, stop_rx) = oneshot::channel();

        tracing::info!("Recording started ({})", mime_type);
        let task = tokio::spawn(record(blocks, encoder, mime_type, timeslice, stop_rx));

        Ok(Self {
            mime_type,
            stop_tx: Some(stop_tx),
            task,
        })
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    /// Beendet die Aufnahme und liefert die fertige Datei
    pub async fn stop(mut self) -> Result<RecordedFile, RecordingError> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        let result = match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(RecordingError::Finalization(e.to_string())),
        };

        match &result {
            Ok(file) => tracing::info!("Recording finished: {} ({} bytes)", file.name, file.len()),
            Err(e) => tracing::warn!("{}", e),
        }
        result
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.task.abort();
        }
    }
}

impl std::fmt::Debug for AudioRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRecorder")
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

async fn record<S>(
    mut blocks: S,
    mut encoder: Box<dyn ChunkEncoder>,
    mime_type: &'static str,
    timeslice: Duration,
    mut stop: oneshot::Receiver<()>,
) -> Result<RecordedFile, RecordingError>
where
    S: Stream<Item = AudioBlock> + Send + Unpin + 'static,
{
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut interval = tokio::time::interval(timeslice);
    let mut stream_open = true;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            block = blocks.next(), if stream_open => match block {
                Some(block) => encoder.encode(&block)?,
                None => stream_open = false,
            },
            _ = interval.tick() => {
                if let Some(chunk) = encoder.flush() {
                    chunks.push(chunk);
                }
            }
        }
    }

    // Bereits gelieferte Blöcke noch mitnehmen
    if stream_open {
        while let Some(Some(block)) = blocks.next().now_or_never() {
            encoder.encode(&block)?;
        }
    }
    chunks.extend(encoder.flush());

    if chunks.iter().all(|c| c.is_empty()) {
        return Err(RecordingError::NoData);
    }
    let bytes = encoder.finalize(&chunks)?;
    if bytes.is_empty() {
        return Err(RecordingError::NoData);
    }

    Ok(RecordedFile::new(mime_type, bytes))
}
