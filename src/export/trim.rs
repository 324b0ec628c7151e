//! Trim re-encoding
//!
//! A trim plays the source artifact from `start` and captures the rendered
//! output through a fresh encoder until playback reaches `end`. The source is
//! never modified; a new artifact is produced.

use super::player::{Playback, PlaybackEngine, PlaybackEvent};
use super::types::TrimError;
use crate::recorder::chunks::ChunkStore;
use crate::recorder::encoder::{EncodeRequest, EncoderEvent, EncoderFactory, RecordingFormat};
use crate::recorder::state::RecordedArtifact;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default wait for a seek to land
pub const DEFAULT_SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Marks an artifact as being trimmed until dropped
struct InFlightGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

pub struct TrimReencoder {
    engine: Arc<dyn PlaybackEngine>,
    encoders: Arc<dyn EncoderFactory>,
    seek_timeout: Duration,
    frame_rate: u32,
    chunk_interval: Duration,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl TrimReencoder {
    pub fn new(engine: Arc<dyn PlaybackEngine>, encoders: Arc<dyn EncoderFactory>) -> Self {
        Self {
            engine,
            encoders,
            seek_timeout: DEFAULT_SEEK_TIMEOUT,
            frame_rate: crate::compositor::TARGET_FRAME_RATE,
            chunk_interval: Duration::from_secs(1),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout = timeout;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Whether a trim of this artifact is running
    pub fn is_in_flight(&self, artifact: &RecordedArtifact) -> bool {
        self.active.lock().contains(&artifact.id())
    }

    fn begin(&self, id: Uuid) -> Result<InFlightGuard, TrimError> {
        let mut active = self.active.lock();
        if !active.insert(id) {
            return Err(TrimError::AlreadyInFlight);
        }
        Ok(InFlightGuard {
            active: self.active.clone(),
            id,
        })
    }

    /// Re-encode `[start, end)` of `artifact` into a new artifact
    pub async fn trim(
        &self,
        artifact: &RecordedArtifact,
        start: Duration,
        end: Duration,
    ) -> Result<RecordedArtifact, TrimError> {
        if start >= end || end > artifact.duration() {
            return Err(TrimError::InvalidRange {
                start,
                end,
                duration: artifact.duration(),
            });
        }

        let _guard = self.begin(artifact.id())?;
        tracing::info!(
            "Trimming artifact {} to {:?}..{:?}",
            artifact.id(),
            start,
            end
        );

        let mut playback = self.engine.open(artifact).await?;
        let result = self
            .capture(playback.as_mut(), artifact.format(), start, end)
            .await;
        playback.close().await;

        match &result {
            Ok(trimmed) => tracing::info!(
                "Trim finished: {} ({} ms)",
                trimmed.id(),
                trimmed.duration_ms()
            ),
            Err(e) => tracing::warn!("Trim of {} failed: {}", artifact.id(), e),
        }
        result
    }

    async fn capture(
        &self,
        playback: &mut dyn Playback,
        format: RecordingFormat,
        start: Duration,
        end: Duration,
    ) -> Result<RecordedArtifact, TrimError> {
        match tokio::time::timeout(self.seek_timeout, playback.seek(start)).await {
            Ok(result) => result?,
            Err(_) => return Err(TrimError::SeekFailed(start)),
        }

        let mut encoder = self
            .encoders
            .create(format)
            .map_err(|e| TrimError::Encoder(e.to_string()))?;
        let request = EncodeRequest {
            format,
            frame_rate: self.frame_rate,
            chunk_interval: self.chunk_interval,
        };
        let mut chunks = encoder
            .start(playback.video(), playback.audio(), &request)
            .await
            .map_err(|e| TrimError::Encoder(e.to_string()))?;

        let mut events = match playback.play() {
            Ok(events) => events,
            Err(e) => {
                let _ = encoder.stop().await;
                return Err(e);
            }
        };

        let mut store = ChunkStore::new(None);
        let mut failure: Option<String> = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(PlaybackEvent::Position(position)) if position >= end => {
                        tracing::debug!("Playback reached {:?}, stopping capture", position);
                        break;
                    }
                    Some(PlaybackEvent::Position(_)) => {}
                    Some(PlaybackEvent::Ended) | None => {
                        tracing::debug!("Playback ended before {:?}", end);
                        break;
                    }
                },
                chunk = chunks.recv() => match chunk {
                    Some(EncoderEvent::Chunk(bytes)) => {
                        store.push(bytes).await;
                    }
                    Some(EncoderEvent::Fatal(message)) => {
                        failure = Some(message);
                        break;
                    }
                    None => {
                        failure = Some("Encoder stopped unexpectedly".to_string());
                        break;
                    }
                }
            }
        }

        playback.pause();
        if let Err(e) = encoder.stop().await {
            failure.get_or_insert(e.to_string());
        }

        // stop closes the channel once the tail is flushed
        while let Some(event) = chunks.recv().await {
            match event {
                EncoderEvent::Chunk(bytes) => {
                    store.push(bytes).await;
                }
                EncoderEvent::Fatal(message) => {
                    failure.get_or_insert(message);
                }
            }
        }

        if let Some(message) = failure {
            store.discard().await;
            return Err(TrimError::Encoder(message));
        }

        store
            .finalize(end - start, format)
            .await
            .ok_or_else(|| TrimError::Encoder("Encoder produced no output".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEncoderFactory, FakePlaybackEngine};

    fn artifact(secs: u64) -> RecordedArtifact {
        RecordedArtifact::from_bytes(
            b"source".to_vec(),
            Duration::from_secs(secs),
            RecordingFormat::WebmVp8Opus,
        )
    }

    fn reencoder(engine: FakePlaybackEngine, encoders: FakeEncoderFactory) -> TrimReencoder {
        TrimReencoder::new(Arc::new(engine), Arc::new(encoders))
            .with_chunk_interval(Duration::from_millis(250))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_range_trim_keeps_duration() {
        let encoders = FakeEncoderFactory::auto_chunking(Duration::from_millis(250));
        let control = encoders.control();
        let trimmer = reencoder(FakePlaybackEngine::new(), encoders);
        let source = artifact(3);

        let trimmed = trimmer
            .trim(&source, Duration::ZERO, source.duration())
            .await
            .unwrap();

        assert_eq!(trimmed.duration(), source.duration());
        assert_ne!(trimmed.id(), source.id());
        assert_eq!(control.formats(), vec![RecordingFormat::WebmVp8Opus]);
        assert!(!trimmed.read_all().await.unwrap().is_empty());
        // source untouched
        assert_eq!(source.read_all().await.unwrap(), b"source");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trim_stops_at_end_position() {
        let encoders = FakeEncoderFactory::auto_chunking(Duration::from_millis(250));
        let engine = FakePlaybackEngine::new();
        let probe = engine.clone();
        let trimmer = reencoder(engine, encoders);

        let trimmed = trimmer
            .trim(&artifact(10), Duration::from_secs(2), Duration::from_secs(4))
            .await
            .unwrap();

        assert_eq!(trimmed.duration(), Duration::from_secs(2));
        assert_eq!(probe.seeks(), vec![Duration::from_secs(2)]);
        assert!(probe.last_position() >= Duration::from_secs(4));
        assert!(probe.last_position() < Duration::from_secs(5));
        assert!(probe.was_paused());
    }

    #[tokio::test]
    async fn test_invalid_ranges_are_rejected() {
        let trimmer = reencoder(FakePlaybackEngine::new(), FakeEncoderFactory::manual());
        let source = artifact(5);

        for (start, end) in [(3, 3), (4, 2), (0, 6)] {
            let result = trimmer
                .trim(&source, Duration::from_secs(start), Duration::from_secs(end))
                .await;
            assert!(matches!(result, Err(TrimError::InvalidRange { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trim_of_same_artifact_is_rejected() {
        let encoders = FakeEncoderFactory::auto_chunking(Duration::from_millis(250));
        let trimmer = Arc::new(reencoder(FakePlaybackEngine::new(), encoders));
        let source = artifact(4);

        let first = {
            let trimmer = trimmer.clone();
            let source = source.clone();
            tokio::spawn(async move {
                trimmer
                    .trim(&source, Duration::ZERO, Duration::from_secs(4))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(trimmer.is_in_flight(&source));

        let second = trimmer
            .trim(&source, Duration::ZERO, Duration::from_secs(1))
            .await;
        assert!(matches!(second, Err(TrimError::AlreadyInFlight)));

        assert!(first.await.unwrap().is_ok());
        assert!(!trimmer.is_in_flight(&source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_seek_fails_and_releases_guard() {
        let trimmer = reencoder(FakePlaybackEngine::hanging_seek(), FakeEncoderFactory::manual())
            .with_seek_timeout(Duration::from_millis(100));
        let source = artifact(4);

        let result = trimmer
            .trim(&source, Duration::from_secs(1), Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(TrimError::SeekFailed(_))));
        assert!(!trimmer.is_in_flight(&source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_encoder_construction_failure_aborts() {
        let trimmer = reencoder(FakePlaybackEngine::new(), FakeEncoderFactory::failing());
        let result = trimmer
            .trim(&artifact(4), Duration::ZERO, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TrimError::Encoder(_))));
    }
}
