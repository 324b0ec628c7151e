//! Recorder controller
//!
//! Owns the camera, keeps at most one capture session alive and reacts to
//! the signals a running session raises (display ended, encoder failure).

use super::error::{RecordingError, RecordingResult};
use super::session::{
    CaptureSession, EncodingServices, RecordingEvent, SessionSignal, StartOutcome,
};
use super::state::{RecordedArtifact, RecordingConfig, SessionState};
use crate::capture::media::{MediaSource, VideoTrack};
use crate::capture::platform::CaptureProviders;
use crate::capture::traits::CameraConstraints;
use crate::export::trim::TrimReencoder;
use crate::export::types::TrimError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
struct ActiveSession {
    id: Uuid,
    session: Arc<tokio::sync::Mutex<CaptureSession>>,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

struct Shared {
    active: Mutex<Option<ActiveSession>>,
    camera: Mutex<Option<MediaSource>>,
    last_artifact: Mutex<Option<RecordedArtifact>>,
    events: broadcast::Sender<RecordingEvent>,
}

impl Shared {
    /// Forget the active session if it is still `id`
    fn release(&self, id: Uuid) {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| a.id) == Some(id) {
            *active = None;
        }
    }

    fn keep_artifact(&self, artifact: Option<RecordedArtifact>) {
        if let Some(artifact) = artifact {
            *self.last_artifact.lock() = Some(artifact);
        }
    }
}

pub struct RecorderController {
    providers: CaptureProviders,
    encoding: EncodingServices,
    trimmer: TrimReencoder,
    shared: Arc<Shared>,
}

impl RecorderController {
    pub fn new(
        providers: CaptureProviders,
        encoding: EncodingServices,
        trimmer: TrimReencoder,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            providers,
            encoding,
            trimmer,
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                camera: Mutex::new(None),
                last_artifact: Mutex::new(None),
                events,
            }),
        }
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.shared.events.subscribe()
    }

    /// State of the active session, Idle when there is none
    pub fn state(&self) -> SessionState {
        self.shared
            .active
            .lock()
            .as_ref()
            .map(|a| *a.state.borrow())
            .unwrap_or_default()
    }

    /// Recorded time of the live session
    pub async fn elapsed(&self) -> Duration {
        let Some(active) = self.live_session() else {
            return Duration::ZERO;
        };
        let session = active.session.lock().await;
        session.elapsed()
    }

    /// The most recently finalized artifact
    pub fn last_artifact(&self) -> Option<RecordedArtifact> {
        self.shared.last_artifact.lock().clone()
    }

    pub fn camera_enabled(&self) -> bool {
        self.shared.camera.lock().is_some()
    }

    fn camera_track(&self) -> Option<VideoTrack> {
        self.shared
            .camera
            .lock()
            .as_ref()
            .and_then(|c| c.video().cloned())
    }

    /// Acquire or release the camera used for the overlay bubble
    pub async fn set_camera_enabled(
        &self,
        enabled: bool,
        constraints: &CameraConstraints,
    ) -> RecordingResult<()> {
        if !enabled {
            if let Some(camera) = self.shared.camera.lock().take() {
                camera.stop();
                tracing::info!("Camera released");
            }
            return Ok(());
        }

        if self.camera_enabled() {
            return Ok(());
        }

        let camera = self.providers.camera.acquire_camera(constraints).await?;
        let mut slot = self.shared.camera.lock();
        if slot.is_some() {
            camera.stop();
        } else {
            tracing::info!("Camera enabled");
            *slot = Some(camera);
        }
        Ok(())
    }

    async fn overlay_for(&self, config: &RecordingConfig) -> Option<VideoTrack> {
        if !config.show_camera {
            return None;
        }
        if let Some(track) = self.camera_track() {
            return Some(track);
        }
        let constraints = CameraConstraints {
            device_id: config.camera_device_id.clone(),
            ..CameraConstraints::default()
        };
        match self.set_camera_enabled(true, &constraints).await {
            Ok(()) => self.camera_track(),
            Err(e) => {
                tracing::warn!("Camera unavailable, recording without overlay: {}", e);
                None
            }
        }
    }

    /// Start a new recording
    pub async fn start(&self, config: RecordingConfig) -> RecordingResult<StartOutcome> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let session = CaptureSession::new(
            config.clone(),
            self.providers.clone(),
            self.encoding.clone(),
            self.shared.events.clone(),
            signals_tx,
        );
        let active = ActiveSession {
            id: session.id(),
            state: session.state_watch(),
            session: Arc::new(tokio::sync::Mutex::new(session)),
            cancel: CancellationToken::new(),
        };

        {
            let mut slot = self.shared.active.lock();
            if slot.is_some() {
                return Err(RecordingError::AlreadyRecording);
            }
            *slot = Some(active.clone());
        }

        let overlay = tokio::select! {
            _ = active.cancel.cancelled() => None,
            overlay = self.overlay_for(&config) => overlay,
        };

        let outcome = {
            let mut session = active.session.lock().await;
            session.start(overlay, active.cancel.clone()).await
        };

        match outcome {
            Ok(StartOutcome::Started) => {
                tokio::spawn(supervise(self.shared.clone(), active, signals_rx));
            }
            _ => self.shared.release(active.id),
        }
        outcome
    }

    fn active(&self) -> RecordingResult<ActiveSession> {
        self.shared
            .active
            .lock()
            .clone()
            .ok_or(RecordingError::NotRecording)
    }

    fn live_session(&self) -> Option<ActiveSession> {
        self.shared
            .active
            .lock()
            .clone()
            .filter(|a| a.state.borrow().is_live())
    }

    pub async fn pause(&self) -> RecordingResult<()> {
        let active = self.live_session().ok_or(RecordingError::NotRecording)?;
        let mut session = active.session.lock().await;
        session.pause()
    }

    pub async fn resume(&self) -> RecordingResult<()> {
        let active = self.live_session().ok_or(RecordingError::NotRecording)?;
        let mut session = active.session.lock().await;
        session.resume()
    }

    /// Stop the active session.
    ///
    /// While arming this cancels the start and returns `Ok(None)`.
    pub async fn stop(&self) -> RecordingResult<Option<RecordedArtifact>> {
        let active = self.active()?;
        active.cancel.cancel();

        let result = {
            let mut session = active.session.lock().await;
            if session.state().is_live() {
                session.stop().await
            } else {
                // cancelled while arming, or already stopped by the supervisor
                Ok(session.artifact().cloned())
            }
        };
        self.shared.release(active.id);

        let artifact = result?;
        self.shared.keep_artifact(artifact.clone());
        Ok(artifact)
    }

    /// Re-encode part of an artifact into a new one
    pub async fn trim(
        &self,
        artifact: &RecordedArtifact,
        start: Duration,
        end: Duration,
    ) -> Result<RecordedArtifact, TrimError> {
        self.trimmer.trim(artifact, start, end).await
    }

    /// Stop any recording and release the camera
    pub async fn shutdown(&self) {
        if self.active().is_ok() {
            if let Err(e) = self.stop().await {
                tracing::warn!("Stopping on shutdown failed: {}", e);
            }
        }
        if let Err(e) = self
            .set_camera_enabled(false, &CameraConstraints::default())
            .await
        {
            tracing::warn!("Releasing camera failed: {}", e);
        }
    }
}

/// React to signals of one running session until it terminates
async fn supervise(
    shared: Arc<Shared>,
    active: ActiveSession,
    mut signals: mpsc::UnboundedReceiver<(Uuid, SessionSignal)>,
) {
    let mut state = active.state.clone();

    loop {
        tokio::select! {
            signal = signals.recv() => {
                let Some((id, signal)) = signal else { break };
                if id != active.id {
                    continue;
                }

                let mut session = active.session.lock().await;
                if !session.state().is_live() {
                    break;
                }
                match signal {
                    SessionSignal::SourceEnded => {
                        tracing::info!("Display ended, stopping session {}", id);
                        match session.stop().await {
                            Ok(artifact) => shared.keep_artifact(artifact),
                            Err(e) => tracing::warn!("Stopping after display ended failed: {}", e),
                        }
                    }
                    SessionSignal::EncoderFatal(message) => {
                        let error = session.fail(message).await;
                        tracing::error!("Session {} terminated: {}", id, error);
                        shared.keep_artifact(session.artifact().cloned());
                    }
                }
                drop(session);
                shared.release(active.id);
                break;
            }
            changed = state.changed() => {
                let done = changed.is_err()
                    || matches!(*state.borrow(), SessionState::Terminated | SessionState::Idle);
                if done {
                    break;
                }
            }
        }
    }

    tracing::debug!("Supervisor for session {} finished", active.id);
}
