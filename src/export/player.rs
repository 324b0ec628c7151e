//! Timed playback of recorded artifacts
//!
//! Playback renders an artifact back into a video track (and an audio track
//! when the recording has sound) in real time, so that it can be captured
//! again through an encoder sink.

use super::ffmpeg::{probe_media, FfmpegPaths};
use super::types::{MediaInfo, TrimError};
use crate::capture::media::{
    audio_track, video_track, AudioTrack, AudioTrackWriter, VideoFrame, VideoTrack,
    VideoTrackWriter,
};
use crate::recorder::state::RecordedArtifact;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Audio is decoded to this format
const PLAYBACK_SAMPLE_RATE: u32 = 48000;
const PLAYBACK_CHANNELS: u16 = 2;

/// Audio is pushed in blocks of this length
const AUDIO_BLOCK: Duration = Duration::from_millis(20);

/// Progress of a playing artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Media time of the frame just rendered
    Position(Duration),
    Ended,
}

#[async_trait]
pub trait Playback: Send {
    /// Rendered video; stays the same track across seeks
    fn video(&self) -> VideoTrack;

    /// Rendered audio, None for silent recordings
    fn audio(&self) -> Option<AudioTrack>;

    /// Seek and render the frame at `position`. Completes once it is shown.
    async fn seek(&mut self, position: Duration) -> Result<(), TrimError>;

    /// Play from the last seek position
    fn play(&mut self) -> Result<mpsc::UnboundedReceiver<PlaybackEvent>, TrimError>;

    fn pause(&mut self);

    fn position(&self) -> Duration;

    async fn close(&mut self);
}

#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    async fn open(&self, artifact: &RecordedArtifact) -> Result<Box<dyn Playback>, TrimError>;
}

/// Reads raw RGBA frames from an ffmpeg decoder
struct FrameDecoder {
    process: Child,
    stdout: ChildStdout,
    frame_len: usize,
}

impl FrameDecoder {
    fn spawn(
        ffmpeg: &Path,
        source: &Path,
        start: Duration,
        width: u32,
        height: u32,
    ) -> Result<Self, TrimError> {
        // -s keeps the output free of row padding
        let mut process = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-ss"])
            .arg(format!("{:.3}", start.as_secs_f64()))
            .arg("-i")
            .arg(source)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgba", "-s"])
            .arg(format!("{}x{}", width, height))
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrimError::Ffmpeg(format!("Failed to start FFmpeg decoder: {}", e)))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| TrimError::Ffmpeg("Failed to capture FFmpeg stdout".to_string()))?;

        Ok(Self {
            process,
            stdout,
            frame_len: VideoFrame::expected_len(width, height),
        })
    }

    /// Next frame, None at end of stream
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TrimError> {
        let mut buffer = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buffer).await {
            Ok(_) => Ok(Some(buffer)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(TrimError::Playback(format!("Failed to read frame: {}", e))),
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        let _ = self.process.start_kill();
    }
}

/// ffmpeg-backed playback engine
#[derive(Debug, Clone, Default)]
pub struct FfmpegPlaybackEngine {
    paths: FfmpegPaths,
}

impl FfmpegPlaybackEngine {
    pub fn new(paths: FfmpegPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl PlaybackEngine for FfmpegPlaybackEngine {
    async fn open(&self, artifact: &RecordedArtifact) -> Result<Box<dyn Playback>, TrimError> {
        // Multi-part or in-memory artifacts are spooled to one file first
        let (source, spool) = match artifact.single_file() {
            Some(path) => (path.to_path_buf(), None),
            None => {
                let spool = tempfile::Builder::new()
                    .prefix("open-screencast-")
                    .suffix(&format!(".{}", artifact.format().extension()))
                    .tempfile()?;
                tokio::fs::write(spool.path(), artifact.read_all().await?).await?;
                (spool.path().to_path_buf(), Some(spool))
            }
        };

        let info = probe_media(&self.paths.ffprobe, &source).await?;
        tracing::info!(
            "Opened {:?} for playback: {}x{} @ {:.2}fps, audio: {}",
            source,
            info.width,
            info.height,
            info.fps,
            info.has_audio
        );

        Ok(Box::new(FfmpegPlayback::new(
            self.paths.ffmpeg.clone(),
            source,
            spool,
            info,
        )))
    }
}

pub struct FfmpegPlayback {
    ffmpeg: PathBuf,
    source: PathBuf,
    _spool: Option<NamedTempFile>,
    info: MediaInfo,
    video_writer: Arc<VideoTrackWriter>,
    video: VideoTrack,
    audio_writer: Option<Arc<AudioTrackWriter>>,
    audio: Option<AudioTrack>,
    position: Arc<Mutex<Duration>>,
    decoder: Option<FrameDecoder>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl FfmpegPlayback {
    fn new(ffmpeg: PathBuf, source: PathBuf, spool: Option<NamedTempFile>, info: MediaInfo) -> Self {
        let (video_writer, video) = video_track("playback");
        let (audio_writer, audio) = if info.has_audio {
            let (w, a) = audio_track("playback-audio", PLAYBACK_SAMPLE_RATE, PLAYBACK_CHANNELS);
            (Some(Arc::new(w)), Some(a))
        } else {
            (None, None)
        };

        Self {
            ffmpeg,
            source,
            _spool: spool,
            info,
            video_writer: Arc::new(video_writer),
            video,
            audio_writer,
            audio,
            position: Arc::new(Mutex::new(Duration::ZERO)),
            decoder: None,
            cancel: None,
            tasks: Vec::new(),
        }
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.info.fps.max(1.0))
    }
}

#[async_trait]
impl Playback for FfmpegPlayback {
    fn video(&self) -> VideoTrack {
        self.video.clone()
    }

    fn audio(&self) -> Option<AudioTrack> {
        self.audio.clone()
    }

    async fn seek(&mut self, position: Duration) -> Result<(), TrimError> {
        self.pause();
        self.decoder = None;

        let mut decoder = FrameDecoder::spawn(
            &self.ffmpeg,
            &self.source,
            position,
            self.info.width,
            self.info.height,
        )?;

        let data = decoder
            .read_frame()
            .await?
            .ok_or(TrimError::SeekFailed(position))?;
        let mut frame = VideoFrame::from_rgba(self.info.width, self.info.height, data)
            .ok_or_else(|| TrimError::Playback("Decoded frame has the wrong size".to_string()))?;
        frame.timestamp_ms = position.as_secs_f64() * 1000.0;
        self.video_writer.publish(frame);

        *self.position.lock() = position;
        self.decoder = Some(decoder);
        tracing::debug!("Seeked playback to {:?}", position);
        Ok(())
    }

    fn play(&mut self) -> Result<mpsc::UnboundedReceiver<PlaybackEvent>, TrimError> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| TrimError::Playback("Seek before playing".to_string()))?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let start = *self.position.lock();

        self.tasks.push(tokio::spawn(play_video(
            decoder,
            self.video_writer.clone(),
            (self.info.width, self.info.height),
            self.frame_period(),
            self.position.clone(),
            tx,
            cancel.clone(),
        )));

        if let Some(writer) = &self.audio_writer {
            self.tasks.push(tokio::spawn(play_audio(
                self.ffmpeg.clone(),
                self.source.clone(),
                start,
                writer.clone(),
                cancel.clone(),
            )));
        }

        self.cancel = Some(cancel);
        Ok(rx)
    }

    fn pause(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }

    fn position(&self) -> Duration {
        *self.position.lock()
    }

    async fn close(&mut self) {
        self.pause();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.decoder = None;
        self.video_writer.clear();
        self.video_writer.end();
        if let Some(writer) = &self.audio_writer {
            writer.end();
        }
    }
}

impl Drop for FfmpegPlayback {
    fn drop(&mut self) {
        self.pause();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn play_video(
    mut decoder: FrameDecoder,
    writer: Arc<VideoTrackWriter>,
    size: (u32, u32),
    period: Duration,
    position: Arc<Mutex<Duration>>,
    tx: mpsc::UnboundedSender<PlaybackEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // the seek already showed the first frame
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match decoder.read_frame().await {
            Ok(Some(data)) => {
                let now = {
                    let mut pos = position.lock();
                    *pos += period;
                    *pos
                };
                if let Some(mut frame) = VideoFrame::from_rgba(size.0, size.1, data) {
                    frame.timestamp_ms = now.as_secs_f64() * 1000.0;
                    writer.publish(frame);
                }
                let _ = tx.send(PlaybackEvent::Position(now));
            }
            Ok(None) => {
                let _ = tx.send(PlaybackEvent::Ended);
                return;
            }
            Err(e) => {
                tracing::warn!("Playback stopped: {}", e);
                let _ = tx.send(PlaybackEvent::Ended);
                return;
            }
        }
    }
}

async fn play_audio(
    ffmpeg: PathBuf,
    source: PathBuf,
    start: Duration,
    writer: Arc<AudioTrackWriter>,
    cancel: CancellationToken,
) {
    let spawned = Command::new(&ffmpeg)
        .args(["-hide_banner", "-loglevel", "error", "-ss"])
        .arg(format!("{:.3}", start.as_secs_f64()))
        .arg("-i")
        .arg(&source)
        .args(["-vn", "-f", "f32le", "-ar"])
        .arg(PLAYBACK_SAMPLE_RATE.to_string())
        .arg("-ac")
        .arg(PLAYBACK_CHANNELS.to_string())
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let mut process = match spawned {
        Ok(process) => process,
        Err(e) => {
            tracing::warn!("Failed to start audio decoder, playing silent: {}", e);
            return;
        }
    };
    let Some(mut stdout) = process.stdout.take() else {
        return;
    };

    let block_samples = (PLAYBACK_SAMPLE_RATE as u128 * AUDIO_BLOCK.as_millis() / 1000) as usize
        * PLAYBACK_CHANNELS as usize;
    let mut bytes = vec![0u8; block_samples * 4];
    let mut ticker = tokio::time::interval(AUDIO_BLOCK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if stdout.read_exact(&mut bytes).await.is_err() {
            break;
        }
        let samples = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if !writer.push(samples) {
            break;
        }
    }

    let _ = process.start_kill();
}
