//! Capture session
//!
//! One recording from acquisition to finalized artifact:
//!
//! ```text
//! Idle -> Arming -> Recording <-> Paused -> Finalizing -> Terminated
//!           |                                    ^
//!           +-> Idle (refused / cancelled)       +-- fatal encoder error
//! ```
//!
//! Every provider call during arming races the caller's cancellation token,
//! so a stop request observed mid-acquisition releases whatever was acquired
//! so far. Chunks flow from the encoder through a single pump task into the
//! `ChunkStore`, which keeps them in emission order.

use super::chunks::ChunkStore;
use super::encoder::{select_format, EncodeRequest, EncoderEvent, EncoderFactory, EncoderSink, FormatProbe, RecordingFormat};
use super::error::{RecordingError, RecordingResult};
use super::state::{ElapsedClock, RecordedArtifact, RecordingConfig, RecordingSegment, SessionState};
use crate::capture::media::{MediaSource, VideoTrack};
use crate::capture::platform::CaptureProviders;
use crate::capture::traits::{AcquireError, DisplayRequest, MicrophoneConstraints};
use crate::compositor::{CompositorHandle, FrameCompositor};
use crate::mixer::{AudioMixGraph, MixInput, SourceRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long finalize waits for the chunk pump to drain
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Encoder construction and format probing
#[derive(Clone)]
pub struct EncodingServices {
    pub encoders: Arc<dyn EncoderFactory>,
    pub formats: Arc<dyn FormatProbe>,
}

/// Why arming ended without a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The display prompt was refused
    DisplayRefused,
    /// The save-destination prompt was cancelled
    DestinationCancelled,
    /// The display stopped before encoding could start
    SourceInactive,
    /// Stop was requested while arming
    StopRequested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CancelReason::DisplayRefused => "display refused",
            CancelReason::DestinationCancelled => "save destination cancelled",
            CancelReason::SourceInactive => "display no longer active",
            CancelReason::StopRequested => "stop requested",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Cancelled(CancelReason),
}

/// Events emitted during recording
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    StateChanged(SessionState),
    Started,
    Paused,
    Resumed,
    Stopped { duration_ms: u64 },
    Cancelled { reason: CancelReason },
    ChunkPersisted { sequence: u64, bytes: usize, to_disk: bool },
    Error(String),
}

/// Asynchronous notifications a running session needs its owner to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The display's video track ended outside our control
    SourceEnded,
    /// The encoder cannot continue
    EncoderFatal(String),
}

pub type SignalSender = mpsc::UnboundedSender<(Uuid, SessionSignal)>;

pub struct CaptureSession {
    id: Uuid,
    config: RecordingConfig,
    providers: CaptureProviders,
    encoding: EncodingServices,
    events: broadcast::Sender<RecordingEvent>,
    signals: SignalSender,
    state: watch::Sender<SessionState>,
    clock: ElapsedClock,

    display: Option<MediaSource>,
    microphone: Option<MediaSource>,
    mixer: Option<AudioMixGraph>,
    mixed_inputs: Vec<MixInput>,
    compositor: Option<CompositorHandle>,
    video: Option<VideoTrack>,
    encoder: Option<Box<dyn EncoderSink>>,
    format: Option<RecordingFormat>,
    pump: Option<JoinHandle<ChunkStore>>,
    watcher: Option<JoinHandle<()>>,
    artifact: Option<RecordedArtifact>,
}

impl CaptureSession {
    pub fn new(
        config: RecordingConfig,
        providers: CaptureProviders,
        encoding: EncodingServices,
        events: broadcast::Sender<RecordingEvent>,
        signals: SignalSender,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4(),
            config,
            providers,
            encoding,
            events,
            signals,
            state,
            clock: ElapsedClock::new(),
            display: None,
            microphone: None,
            mixer: None,
            mixed_inputs: Vec::new(),
            compositor: None,
            video: None,
            encoder: None,
            format: None,
            pump: None,
            watcher: None,
            artifact: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state changes without holding the session
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// Recorded time so far, pauses excluded
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn segments(&self) -> &[RecordingSegment] {
        self.clock.segments()
    }

    /// Audio inputs connected to the mix
    pub fn mixed_inputs(&self) -> &[MixInput] {
        &self.mixed_inputs
    }

    /// The video track handed to the encoder
    pub fn video(&self) -> Option<&VideoTrack> {
        self.video.as_ref()
    }

    pub fn format(&self) -> Option<RecordingFormat> {
        self.format
    }

    /// Whether the display source is still held
    pub fn holds_display(&self) -> bool {
        self.display.is_some()
    }

    pub fn holds_microphone(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn is_compositing(&self) -> bool {
        self.compositor.is_some()
    }

    /// The finalized artifact, once stopped
    pub fn artifact(&self) -> Option<&RecordedArtifact> {
        self.artifact.as_ref()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Session {}: {} -> {}", self.id, previous, state);
            let _ = self.events.send(RecordingEvent::StateChanged(state));
        }
    }

    /// Arm and start recording.
    ///
    /// `overlay` is the camera track to composite; the camera itself stays
    /// owned by the caller. Cancelling `cancel` while arming releases every
    /// source acquired so far and returns `Cancelled(StopRequested)`.
    pub async fn start(
        &mut self,
        overlay: Option<VideoTrack>,
        cancel: CancellationToken,
    ) -> RecordingResult<StartOutcome> {
        match self.state() {
            SessionState::Idle => {}
            state if state.is_live() => return Err(RecordingError::AlreadyRecording),
            state => {
                return Err(RecordingError::InvalidState {
                    action: "start",
                    state: state.to_string(),
                })
            }
        }

        tracing::info!("Session {} arming", self.id);
        self.set_state(SessionState::Arming);

        // Base source
        let request = DisplayRequest {
            display_id: self.config.display_id.clone(),
            width: self.config.capture_width,
            height: self.config.capture_height,
            frame_rate: self.config.frame_rate,
            capture_audio: self.config.enable_system_audio,
        };
        let provider = self.providers.display.clone();
        let acquired = tokio::select! {
            _ = cancel.cancelled() => None,
            result = provider.acquire_display(&request) => Some(result),
        };
        match acquired {
            None => return Ok(self.abort_arming(CancelReason::StopRequested, None).await),
            Some(Ok(source)) => self.display = Some(source),
            Some(Err(AcquireError::UserCancelled)) => {
                tracing::info!("Display capture refused by user");
                return Ok(self.abort_arming(CancelReason::DisplayRefused, None).await);
            }
            Some(Err(e)) => {
                tracing::warn!("Display capture unavailable: {}", e);
                return Ok(self.abort_arming(CancelReason::DisplayRefused, None).await);
            }
        }

        // Write target
        let sink = if self.config.direct_to_disk {
            let destination = self.providers.destination.clone();
            let name = self.config.suggested_name.clone();
            let negotiated = tokio::select! {
                _ = cancel.cancelled() => None,
                result = destination.negotiate(&name) => Some(result),
            };
            match negotiated {
                None => return Ok(self.abort_arming(CancelReason::StopRequested, None).await),
                Some(Ok(Some(sink))) => Some(sink),
                Some(Ok(None)) => {
                    tracing::info!("No save destination available, buffering in memory");
                    None
                }
                Some(Err(AcquireError::UserCancelled)) => {
                    tracing::info!("Save destination cancelled by user");
                    return Ok(self
                        .abort_arming(CancelReason::DestinationCancelled, None)
                        .await);
                }
                Some(Err(e)) => {
                    tracing::warn!("Save destination failed, buffering in memory: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let store = ChunkStore::new(sink);

        // Microphone
        if self.config.enable_mic {
            let provider = self.providers.microphone.clone();
            let constraints = MicrophoneConstraints {
                device_id: self.config.microphone_device_id.clone(),
                ..MicrophoneConstraints::default()
            };
            let acquired = tokio::select! {
                _ = cancel.cancelled() => None,
                result = provider.acquire_microphone(&constraints) => Some(result),
            };
            match acquired {
                None => {
                    return Ok(self
                        .abort_arming(CancelReason::StopRequested, Some(store))
                        .await)
                }
                Some(Ok(source)) => self.microphone = Some(source),
                Some(Err(e)) => {
                    tracing::warn!("Microphone unavailable, recording without it: {}", e);
                }
            }
        }

        // Audio
        let mut mixer = AudioMixGraph::default();
        let mixed = {
            let mut sources = Vec::new();
            if let Some(display) = &self.display {
                sources.push((display, SourceRole::SystemAudio));
            }
            if let Some(mic) = &self.microphone {
                sources.push((mic, SourceRole::Microphone));
            }
            mixer.mix(&sources)
        };
        self.mixed_inputs = mixed.inputs().to_vec();
        let audio = mixed.has_audio().then(|| mixed.track().clone());
        self.mixer = Some(mixer);

        // Format
        let format = match select_format(&self.config.format_preferences, self.encoding.formats.as_ref()) {
            Ok(format) => format,
            Err(e) => return Err(self.fail_arming(e, store).await),
        };
        self.format = Some(format);

        // Video
        let Some(base) = self.display.as_ref().and_then(|d| d.video()).cloned() else {
            tracing::warn!("Display source carries no video");
            return Ok(self
                .abort_arming(CancelReason::SourceInactive, Some(store))
                .await);
        };
        let video = match overlay.filter(|_| self.config.show_camera) {
            Some(camera) => {
                let (track, handle) = FrameCompositor::new(
                    base.clone(),
                    self.providers.overlay_position.clone(),
                    self.providers.viewport.clone(),
                )
                .with_overlay(camera)
                .with_bubble_size(self.config.bubble_size)
                .spawn(self.config.frame_rate);
                self.compositor = Some(handle);
                track
            }
            None => base.clone(),
        };
        self.video = Some(video.clone());

        let active = self.display.as_ref().map(|d| d.is_active()).unwrap_or(false);
        if !active || cancel.is_cancelled() {
            let reason = if active {
                CancelReason::StopRequested
            } else {
                tracing::warn!("Display became inactive before encoding started");
                CancelReason::SourceInactive
            };
            return Ok(self.abort_arming(reason, Some(store)).await);
        }

        // Encoder
        let mut encoder = match self.encoding.encoders.create(format) {
            Ok(encoder) => encoder,
            Err(e) => return Err(self.fail_arming(e, store).await),
        };
        let request = EncodeRequest {
            format,
            frame_rate: self.config.frame_rate,
            chunk_interval: self.config.chunk_interval(),
        };
        let started = tokio::select! {
            _ = cancel.cancelled() => None,
            result = encoder.start(video, audio, &request) => Some(result),
        };
        let chunks = match started {
            None => {
                let _ = encoder.stop().await;
                return Ok(self
                    .abort_arming(CancelReason::StopRequested, Some(store))
                    .await);
            }
            Some(Ok(chunks)) => chunks,
            Some(Err(e)) => {
                let _ = encoder.stop().await;
                return Err(self.fail_arming(e, store).await);
            }
        };
        self.encoder = Some(encoder);

        self.pump = Some(tokio::spawn(pump_chunks(
            self.id,
            chunks,
            store,
            self.events.clone(),
            self.signals.clone(),
        )));
        self.watcher = Some(tokio::spawn(watch_source(
            self.id,
            base,
            self.signals.clone(),
        )));

        self.clock.start();
        self.set_state(SessionState::Recording);
        let _ = self.events.send(RecordingEvent::Started);
        tracing::info!(
            "Session {} recording ({}, {} audio input(s), overlay: {})",
            self.id,
            format,
            self.mixed_inputs.len(),
            self.compositor.is_some()
        );
        Ok(StartOutcome::Started)
    }

    pub fn pause(&mut self) -> RecordingResult<()> {
        self.require(SessionState::Recording, "pause")?;
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.pause();
        }
        self.clock.pause();
        self.set_state(SessionState::Paused);
        let _ = self.events.send(RecordingEvent::Paused);
        tracing::info!("Session {} paused at {:?}", self.id, self.clock.elapsed());
        Ok(())
    }

    pub fn resume(&mut self) -> RecordingResult<()> {
        self.require(SessionState::Paused, "resume")?;
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.resume();
        }
        self.clock.resume();
        self.set_state(SessionState::Recording);
        let _ = self.events.send(RecordingEvent::Resumed);
        tracing::info!("Session {} resumed", self.id);
        Ok(())
    }

    fn require(&self, expected: SessionState, action: &'static str) -> RecordingResult<()> {
        let state = self.state();
        if state == expected {
            return Ok(());
        }
        if state.is_live() {
            return Err(RecordingError::InvalidState {
                action,
                state: state.to_string(),
            });
        }
        Err(RecordingError::NotRecording)
    }

    /// Stop recording, finalize the artifact and release every source.
    ///
    /// Returns None when nothing was recorded.
    pub async fn stop(&mut self) -> RecordingResult<Option<RecordedArtifact>> {
        if !self.state().is_live() {
            return Err(RecordingError::NotRecording);
        }

        tracing::info!("Session {} stopping", self.id);
        let artifact = self.finalize().await;
        let duration_ms = self.clock.elapsed().as_millis() as u64;

        self.set_state(SessionState::Terminated);
        let _ = self.events.send(RecordingEvent::Stopped { duration_ms });
        tracing::info!("Session {} stopped after {}ms", self.id, duration_ms);
        Ok(artifact)
    }

    /// Terminate after a fatal encoder error.
    ///
    /// Whatever was persisted before the failure is still assembled and
    /// kept as the session's artifact. The returned error is the one to
    /// surface to the user.
    pub async fn fail(&mut self, message: String) -> RecordingError {
        tracing::error!("Session {} encoder failed: {}", self.id, message);
        if self.state().is_live() {
            if let Some(artifact) = self.finalize().await {
                tracing::warn!(
                    "Recovered {}ms of recording after encoder failure",
                    artifact.duration_ms()
                );
            }
        } else {
            self.cleanup();
        }
        self.set_state(SessionState::Terminated);
        let _ = self.events.send(RecordingEvent::Error(message.clone()));
        RecordingError::EncoderFatal(message)
    }

    /// Drain the encoder into the store and assemble the artifact
    async fn finalize(&mut self) -> Option<RecordedArtifact> {
        self.set_state(SessionState::Finalizing);
        self.clock.stop();

        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(mut encoder) = self.encoder.take() {
            if let Err(e) = encoder.stop().await {
                tracing::warn!("Encoder did not stop cleanly: {}", e);
            }
        }
        if let Some(mut compositor) = self.compositor.take() {
            compositor.shutdown().await;
        }

        let store = match self.pump.take() {
            Some(pump) => match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await {
                Ok(Ok(store)) => Some(store),
                Ok(Err(e)) => {
                    tracing::error!("Chunk pump failed: {}", e);
                    None
                }
                Err(_) => {
                    tracing::error!("Encoder output never closed, chunks in flight are lost");
                    None
                }
            },
            None => None,
        };

        let artifact = match (store, self.format) {
            (Some(store), Some(format)) => store.finalize(self.clock.elapsed(), format).await,
            _ => None,
        };

        self.cleanup();
        self.artifact = artifact.clone();
        artifact
    }

    async fn abort_arming(&mut self, reason: CancelReason, store: Option<ChunkStore>) -> StartOutcome {
        tracing::info!("Session {} not started: {}", self.id, reason);
        self.cleanup();
        if let Some(store) = store {
            store.discard().await;
        }
        self.set_state(SessionState::Idle);
        let _ = self.events.send(RecordingEvent::Cancelled { reason });
        StartOutcome::Cancelled(reason)
    }

    async fn fail_arming(&mut self, error: RecordingError, store: ChunkStore) -> RecordingError {
        tracing::error!("Session {} failed to start: {}", self.id, error);
        self.cleanup();
        store.discard().await;
        self.set_state(SessionState::Terminated);
        let _ = self.events.send(RecordingEvent::Error(error.to_string()));
        error
    }

    /// Release every source and cancel all scheduled work. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(compositor) = self.compositor.take() {
            compositor.terminate();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // dropping an encoder kills whatever process backs it
        self.encoder = None;
        if let Some(mut mixer) = self.mixer.take() {
            mixer.close();
        }
        if let Some(mic) = self.microphone.take() {
            mic.stop();
        }
        if let Some(display) = self.display.take() {
            display.stop();
        }
        self.video = None;
        self.clock.stop();
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Persist encoder output in emission order until the encoder closes
async fn pump_chunks(
    session: Uuid,
    mut chunks: mpsc::UnboundedReceiver<EncoderEvent>,
    mut store: ChunkStore,
    events: broadcast::Sender<RecordingEvent>,
    signals: SignalSender,
) -> ChunkStore {
    while let Some(event) = chunks.recv().await {
        match event {
            EncoderEvent::Chunk(bytes) => {
                let receipt = store.push(bytes).await;
                let _ = events.send(RecordingEvent::ChunkPersisted {
                    sequence: receipt.sequence,
                    bytes: receipt.bytes,
                    to_disk: receipt.to_disk,
                });
            }
            EncoderEvent::Fatal(message) => {
                tracing::error!("Encoder reported a fatal error: {}", message);
                let _ = signals.send((session, SessionSignal::EncoderFatal(message)));
            }
        }
    }
    tracing::debug!(
        "Chunk pump finished: {} chunk(s), mode {:?}",
        store.chunk_count(),
        store.mode()
    );
    store
}

/// Report when the base video ends outside our control
async fn watch_source(session: Uuid, base: VideoTrack, signals: SignalSender) {
    base.ended().await;
    tracing::info!("Display video ended, requesting stop");
    let _ = signals.send((session, SessionSignal::SourceEnded));
}
