//! RTC Call - P2P Audio/Video-Anrufe
//!
//! Ein nativer Anruf-Client mit:
//! - WebSocket Signaling (Einladung, Antwort, Kandidaten, Auflegen)
//! - WebRTC Peer Connection pro Anruf
//! - PCM-Frames (16 kHz, 20 ms) aus dem Mikrofon
//! - Aufnahme in eine Datei

pub mod audio;
pub mod call_engine;
pub mod config;
pub mod media;
pub mod peer;
pub mod recording;
pub mod signaling;

#[cfg(test)]
mod testing;

use anyhow::Context;
use audio::{AudioCapture, AudioFrame};
use call_engine::{
    CallControls, CallEngine, CallEvent, CallState, ConsoleCommand, EndReason, EngineDeps, HELP,
};
use config::AppConfig;
use media::{bind, AllowAll, CpalMediaDevices, MediaBinding, MediaSink};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use peer::WebRtcTransportFactory;
use recording::{block_channel, AudioRecorder, NativeEncoders};
use signaling::{SignalingChannel, SignalingClient, SignalingError, SignalingEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const DEFAULT_LOG_FILTER: &str = "rtc_call=debug,webrtc=warn";

static LOGGING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos); `RUST_LOG` hat Vorrang
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

// ============================================================================
// CALL CLIENT
// ============================================================================

/// Verdrahtet Signaling, Geräte, Transport und die CallEngine
pub struct CallClient {
    config: AppConfig,
    signaling: Arc<SignalingClient>,
    engine: CallEngine,
    frames: Arc<AtomicU64>,
    forwarder: JoinHandle<()>,
}

impl CallClient {
    /// Baut alle Teile auf und verbindet mit dem Signaling-Server
    pub async fn connect(config: AppConfig) -> Result<Self, SignalingError> {
        tracing::info!("Starting call client as '{}'", config.user_id);

        let signaling = Arc::new(SignalingClient::new(
            config.signaling_url.clone(),
            config.user_id.clone(),
            config.heartbeat,
        ));

        let frames = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames);
        let devices = CpalMediaDevices::new(Arc::new(AllowAll)).with_frame_sink(
            config.frames,
            Arc::new(move |frame: AudioFrame| {
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("PCM frame ({} bytes)", frame.len());
            }),
        );

        let channel: Arc<dyn SignalingChannel> = signaling.clone();
        let engine = CallEngine::new(EngineDeps {
            local_id: config.user_id.clone(),
            ice_servers: config.ice_servers.clone(),
            media: Arc::new(devices),
            transports: Arc::new(WebRtcTransportFactory),
            signaling: channel,
        });

        // Vor dem Verbinden abonnieren, damit kein Event verloren geht
        let forwarder = tokio::spawn(forward_signaling(signaling.subscribe(), engine.clone()));

        if let Err(e) = signaling.connect().await {
            forwarder.abort();
            return Err(e);
        }

        Ok(Self {
            config,
            signaling,
            engine,
            frames,
            forwarder,
        })
    }

    pub fn engine(&self) -> &CallEngine {
        &self.engine
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Anzahl der bisher erzeugten PCM-Frames
    pub fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Legt einen laufenden Anruf auf und trennt die Verbindung
    pub async fn shutdown(self) {
        if !self.engine.current().state.is_idle() {
            if let Err(e) = self.engine.hang_up().await {
                tracing::warn!("Hang up on shutdown failed: {}", e);
            }
        }
        self.signaling.disconnect();
        self.forwarder.abort();
        tracing::info!("Call client stopped");
    }
}

/// Leitet Signaling-Events an die Engine weiter
async fn forward_signaling(mut events: broadcast::Receiver<SignalingEvent>, engine: CallEngine) {
    loop {
        match events.recv().await {
            Ok(SignalingEvent::Message(message)) => engine.handle_signal(message),
            Ok(SignalingEvent::Disconnected) => {
                tracing::warn!("Signaling connection lost");
                engine.signaling_disconnected();
            }
            Ok(SignalingEvent::Connected) => tracing::info!("Signaling connected"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Verlorene Antwort/Candidates lassen sich nicht nachholen
                tracing::warn!("Dropped {} signaling events", skipped);
                match engine.hang_up().await {
                    Ok(()) => tracing::error!("Ended call after lost signaling events"),
                    Err(e) => tracing::debug!("No call to end after lag: {}", e),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// CONSOLE
// ============================================================================

/// Konsolen-"Renderer": merkt sich den gebundenen Stream und zeigt ihn an
struct ConsoleView {
    label: &'static str,
    bound: Mutex<Option<String>>,
}

impl ConsoleView {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            bound: Mutex::new(None),
        }
    }

    fn bound_stream(&self) -> Option<String> {
        self.bound.lock().clone()
    }
}

impl MediaSink for ConsoleView {
    fn attach(&self, media: MediaBinding<'_>) {
        let tracks = match media {
            MediaBinding::Local(handle) => handle.tracks().len(),
            MediaBinding::Remote(handle) => handle.tracks().len(),
        };
        println!("{}: stream {} ({} tracks)", self.label, media.stream_id(), tracks);
        *self.bound.lock() = Some(media.stream_id().to_string());
    }

    fn detach(&self) {
        self.bound.lock().take();
    }
}

/// Lokale Vorschau und Gegenüber, gebunden aus den Engine-Events
struct MediaViews {
    local: ConsoleView,
    remote: ConsoleView,
}

impl MediaViews {
    fn new() -> Self {
        Self {
            local: ConsoleView::new("local preview"),
            remote: ConsoleView::new("remote"),
        }
    }

    fn on_event(&self, event: &CallEvent) {
        match event {
            CallEvent::LocalMediaReady(handle) => {
                bind(&self.local, MediaBinding::Local(handle));
            }
            CallEvent::RemoteMediaAvailable(handle) => {
                bind(&self.remote, MediaBinding::Remote(handle));
            }
            CallEvent::CallEnded { .. } => {
                self.local.detach();
                self.remote.detach();
            }
            _ => {}
        }
    }
}

struct ActiveRecording {
    capture: AudioCapture,
    recorder: AudioRecorder,
}

/// Konsolen-Oberfläche: liest Befehle von stdin, zeigt Engine-Events an
struct Console {
    client: CallClient,
    views: MediaViews,
    recording: Option<ActiveRecording>,
}

impl Console {
    fn new(client: CallClient) -> Self {
        Self {
            client,
            views: MediaViews::new(),
            recording: None,
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        let mut events = self.client.engine().subscribe();
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

        println!("{}", HELP);
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read stdin")? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<ConsoleCommand>() {
                        Ok(ConsoleCommand::Quit) => break,
                        Ok(command) => {
                            if let Err(e) = self.execute(command).await {
                                println!("error: {:#}", e);
                            }
                        }
                        Err(e) => println!("{} (type 'help')", e),
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.show_event(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        if let Some(active) = self.recording.take() {
            self.finish_recording(active).await?;
        }
        self.client.shutdown().await;
        Ok(())
    }

    async fn execute(&mut self, command: ConsoleCommand) -> anyhow::Result<()> {
        let engine = self.client.engine().clone();
        match command {
            ConsoleCommand::Call { peer, call_type } => {
                engine.start_call(peer, call_type, None).await?
            }
            ConsoleCommand::Accept => engine.accept().await?,
            ConsoleCommand::Reject => engine.reject().await?,
            ConsoleCommand::HangUp => engine.hang_up().await?,
            ConsoleCommand::Mic => {
                let on = engine.toggle_mic().await?;
                println!("microphone {}", if on { "on" } else { "off" });
            }
            ConsoleCommand::Cam => {
                let on = engine.toggle_camera().await?;
                println!("camera {}", if on { "on" } else { "off" });
            }
            ConsoleCommand::Record => self.start_recording()?,
            ConsoleCommand::Stop => {
                let active = self.recording.take().context("not recording")?;
                self.finish_recording(active).await?;
            }
            ConsoleCommand::Status => {
                let snapshot = engine.snapshot().await;
                println!("{}", CallControls::from_snapshot(&snapshot).render());
                println!(
                    "signaling: {}, pcm frames: {}",
                    if self.client.is_connected() { "connected" } else { "offline" },
                    self.client.frames_produced()
                );
                match &self.recording {
                    Some(active) => println!(
                        "recording ({}), input level {:.2}",
                        active.recorder.mime_type(),
                        active.capture.input_level()
                    ),
                    None => println!("not recording"),
                }
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    fn start_recording(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.recording.is_none(), "already recording");

        let (sink, blocks) = block_channel();
        let capture = AudioCapture::open_default(vec![sink]).context("recording failed")?;
        let recorder = AudioRecorder::start(
            blocks,
            &NativeEncoders,
            self.client.config().recording_timeslice,
        )?;
        println!("recording ({})", recorder.mime_type());

        self.recording = Some(ActiveRecording { capture, recorder });
        Ok(())
    }

    async fn finish_recording(&self, active: ActiveRecording) -> anyhow::Result<()> {
        let ActiveRecording {
            mut capture,
            recorder,
        } = active;
        capture.stop();

        let file = recorder.stop().await?;
        let path = file.save_to(&self.client.config().recordings_dir).await?;
        println!("saved {} ({} bytes)", path.display(), file.len());
        Ok(())
    }

    fn show_event(&self, event: CallEvent) {
        self.views.on_event(&event);
        match event {
            CallEvent::StateChanged(state) => {
                tracing::debug!("Call state: {}", state);
                if state != CallState::Idle {
                    println!("{}", CallControls::from_snapshot(&self.client.engine().current()).render());
                }
            }
            CallEvent::IncomingCall { from, call_type } => {
                println!("incoming {} call from {} (accept / reject)", call_type, from);
            }
            CallEvent::Failed(failure) => println!("{}", failure),
            CallEvent::CallEnded {
                reason,
                conversation_id,
            } => {
                let why = match reason {
                    EndReason::LocalHangup => "you hung up",
                    EndReason::RemoteHangup => "the other side hung up",
                    EndReason::Rejected => "call rejected",
                    EndReason::Failed => "call failed",
                    EndReason::SignalingLost => "connection to server lost",
                };
                println!("call ended: {}", why);
                if let Some(conversation) = conversation_id {
                    println!("back to conversation {}", conversation);
                }
            }
            CallEvent::ConnectionChanged(state) => tracing::debug!("Connection: {:?}", state),
            CallEvent::LocalMediaReady(_) | CallEvent::RemoteMediaAvailable(_) => {}
        }
    }
}

/// Einstiegspunkt der Konsolen-Anwendung
pub async fn run() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let client = CallClient::connect(config)
        .await
        .context("could not reach signaling server")?;

    Console::new(client).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMediaHandle, PeerMediaHandle};
    use crate::peer::{CandidateInit, IceServer};
    use crate::signaling::{CallType, SignalMessage};
    use crate::testing::{
        wait_for_state, FakeMediaDevices, FakeTransportFactory, LoopbackSignaling,
    };

    fn engine() -> (CallEngine, Arc<LoopbackSignaling>) {
        let signaling = Arc::new(LoopbackSignaling::default());
        let engine = CallEngine::new(EngineDeps {
            local_id: "me".to_string(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            media: Arc::new(FakeMediaDevices::default()),
            transports: Arc::new(FakeTransportFactory::default()),
            signaling: signaling.clone(),
        });
        (engine, signaling)
    }

    fn invite() -> SignalMessage {
        SignalMessage::CallInvite {
            from: "ayse".to_string(),
            to: "me".to_string(),
            call_type: CallType::Audio,
            sdp: "v=0".to_string(),
            conversation_id: None,
        }
    }

    #[tokio::test]
    async fn forwards_messages_and_disconnects_to_engine() {
        let (engine, _signaling) = engine();
        let (tx, rx) = broadcast::channel(8);
        let forwarder = tokio::spawn(forward_signaling(rx, engine.clone()));

        tx.send(SignalingEvent::Connected).unwrap();
        tx.send(SignalingEvent::Message(invite())).unwrap();
        wait_for_state(&engine, CallState::Incoming).await;

        tx.send(SignalingEvent::Disconnected).unwrap();
        wait_for_state(&engine, CallState::Idle).await;

        drop(tx);
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn lost_events_during_a_call_end_it() {
        let (engine, signaling) = engine();
        engine.handle_signal(invite());
        wait_for_state(&engine, CallState::Incoming).await;

        let (tx, rx) = broadcast::channel(2);
        for body in ["c1", "c2", "c3"] {
            tx.send(SignalingEvent::Message(SignalMessage::ConnectivityCandidate {
                from: "ayse".to_string(),
                to: "me".to_string(),
                candidate: CandidateInit::new(body),
            }))
            .unwrap();
        }
        let forwarder = tokio::spawn(forward_signaling(rx, engine.clone()));

        wait_for_state(&engine, CallState::Idle).await;
        assert_eq!(signaling.sent_kinds(), vec!["call_end"]);

        drop(tx);
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn lost_events_while_idle_change_nothing() {
        let (engine, signaling) = engine();
        let (tx, rx) = broadcast::channel(1);
        tx.send(SignalingEvent::Connected).unwrap();
        tx.send(SignalingEvent::Connected).unwrap();
        drop(tx);

        forward_signaling(rx, engine.clone()).await;
        assert_eq!(engine.snapshot().await.state, CallState::Idle);
        assert!(signaling.sent().is_empty());
    }

    #[test]
    fn media_views_follow_call_events() {
        let views = MediaViews::new();
        let local = LocalMediaHandle::new("local-stream".to_string(), Vec::new());
        let remote = PeerMediaHandle::new("remote-stream".to_string(), Vec::new());

        views.on_event(&CallEvent::LocalMediaReady(local.clone()));
        views.on_event(&CallEvent::RemoteMediaAvailable(remote.clone()));
        assert_eq!(views.local.bound_stream().as_deref(), Some("local-stream"));
        assert_eq!(views.remote.bound_stream().as_deref(), Some("remote-stream"));

        views.on_event(&CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            conversation_id: None,
        });
        assert_eq!(views.local.bound_stream(), None);
        assert_eq!(views.remote.bound_stream(), None);

        // Freigegebene Medien werden nicht mehr gebunden
        remote.release();
        views.on_event(&CallEvent::RemoteMediaAvailable(remote));
        assert_eq!(views.remote.bound_stream(), None);
    }

    #[test]
    fn logging_init_is_idempotent() {
        init_logging();
        init_logging();
        assert!(LOGGING.get().is_some());
    }
}
