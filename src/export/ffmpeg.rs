//! FFmpeg encoder sink, format probe and ffprobe helpers
//!
//! Video reaches ffmpeg as raw RGBA frames on stdin, sampled from the track
//! at the requested frame rate. Mixed audio is streamed as f32le over a
//! loopback TCP socket that ffmpeg reads as its second input. The muxed WebM
//! comes back on stdout and is cut into chunks on a fixed timer.

use super::types::{MediaInfo, TrimError};
use crate::capture::media::{AudioChunk, AudioTrack, VideoFrame, VideoTrack};
use crate::recorder::encoder::{
    EncodeRequest, EncoderEvent, EncoderFactory, EncoderSink, FormatProbe, RecordingFormat,
};
use crate::recorder::error::{RecordingError, RecordingResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to wait for the first video frame before giving up
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long ffmpeg gets to flush after its inputs close
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lines of ffmpeg stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Locations of the ffmpeg binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for FfmpegPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Audio input handed to ffmpeg over loopback TCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AudioInput {
    sample_rate: u32,
    channels: u16,
    port: u16,
}

/// Build the ffmpeg argument list for a streaming WebM encode
fn build_encoder_args(
    format: RecordingFormat,
    width: u32,
    height: u32,
    fps: u32,
    audio: Option<AudioInput>,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", width, height));
    args.extend(["-r".to_string(), fps.to_string(), "-i".to_string(), "-".to_string()]);

    if let Some(audio) = audio {
        args.extend([
            "-f".to_string(),
            "f32le".to_string(),
            "-ar".to_string(),
            audio.sample_rate.to_string(),
            "-ac".to_string(),
            audio.channels.to_string(),
            "-i".to_string(),
            format!("tcp://127.0.0.1:{}", audio.port),
        ]);
    }

    args.extend(["-map".to_string(), "0:v".to_string()]);
    if audio.is_some() {
        args.extend(["-map".to_string(), "1:a".to_string()]);
    }

    // yuv420p needs even dimensions
    args.extend([
        "-vf".to_string(),
        "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:v".to_string(),
        format.video_encoder().to_string(),
        "-deadline".to_string(),
        "realtime".to_string(),
        "-cpu-used".to_string(),
        "8".to_string(),
    ]);

    match format {
        RecordingFormat::WebmVp9Opus => {
            args.extend([
                "-row-mt".to_string(),
                "1".to_string(),
                "-crf".to_string(),
                "32".to_string(),
                "-b:v".to_string(),
                "0".to_string(),
            ]);
        }
        RecordingFormat::WebmVp8Opus | RecordingFormat::Webm => {
            args.extend([
                "-crf".to_string(),
                "10".to_string(),
                "-b:v".to_string(),
                "4M".to_string(),
            ]);
        }
    }

    if audio.is_some() {
        args.extend(["-c:a".to_string(), format.audio_encoder().to_string()]);
        match format {
            RecordingFormat::Webm => args.extend(["-q:a".to_string(), "4".to_string()]),
            _ => args.extend(["-b:a".to_string(), "128k".to_string()]),
        }
    }

    args.extend(["-f".to_string(), "webm".to_string(), "-".to_string()]);
    args
}

/// Streaming WebM encoder backed by an ffmpeg child process
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    format: RecordingFormat,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    feed_cancel: CancellationToken,
    feeders: Vec<JoinHandle<()>>,
    output: Option<JoinHandle<()>>,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, format: RecordingFormat) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            format,
            paused: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            feed_cancel: CancellationToken::new(),
            feeders: Vec::new(),
            output: None,
        }
    }
}

async fn wait_for_first_frame(video: &VideoTrack) -> Option<Arc<VideoFrame>> {
    let wait = async {
        loop {
            if let Some(frame) = video.current_frame() {
                return Some(frame);
            }
            if video.is_ended() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(FIRST_FRAME_TIMEOUT, wait)
        .await
        .ok()
        .flatten()
}

#[async_trait]
impl EncoderSink for FfmpegEncoder {
    async fn start(
        &mut self,
        video: VideoTrack,
        audio: Option<AudioTrack>,
        request: &EncodeRequest,
    ) -> RecordingResult<mpsc::UnboundedReceiver<EncoderEvent>> {
        if self.output.is_some() {
            return Err(RecordingError::InvalidState {
                action: "start",
                state: "encoding".to_string(),
            });
        }

        let first = wait_for_first_frame(&video).await.ok_or_else(|| {
            RecordingError::EncoderFatal(format!("No video frames from '{}'", video.label()))
        })?;
        let (width, height) = (first.width, first.height);

        let mut audio_feed = None;
        if let Some(track) = audio.filter(|a| a.channels() > 0) {
            let rx = track
                .take_stream()
                .map_err(|e| RecordingError::EncoderFatal(e.to_string()))?;
            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            let port = listener.local_addr()?.port();
            audio_feed = Some((
                AudioInput {
                    sample_rate: track.sample_rate(),
                    channels: track.channels(),
                    port,
                },
                listener,
                rx,
            ));
        }

        let args = build_encoder_args(
            self.format,
            width,
            height,
            request.frame_rate,
            audio_feed.as_ref().map(|(input, _, _)| *input),
        );
        tracing::info!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RecordingError::EncoderFatal(format!("Failed to start FFmpeg encoder: {}", e))
            })?;

        let stdin = process.stdin.take().ok_or_else(|| {
            RecordingError::EncoderFatal("Failed to capture FFmpeg stdin".to_string())
        })?;
        let stdout = process.stdout.take().ok_or_else(|| {
            RecordingError::EncoderFatal("Failed to capture FFmpeg stdout".to_string())
        })?;
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = process.stderr.take() {
            tokio::spawn(collect_stderr(stderr, stderr_tail.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        self.feeders.push(tokio::spawn(feed_video(
            stdin,
            video,
            (width, height),
            request.frame_rate,
            self.paused.clone(),
            self.feed_cancel.clone(),
        )));
        if let Some((_, listener, audio_rx)) = audio_feed {
            self.feeders.push(tokio::spawn(feed_audio(
                listener,
                audio_rx,
                self.paused.clone(),
                self.feed_cancel.clone(),
            )));
        }

        self.output = Some(tokio::spawn(pump_output(
            process,
            stdout,
            tx,
            request.chunk_interval,
            self.stopping.clone(),
            stderr_tail,
        )));

        Ok(rx)
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.feed_cancel.cancel();

        for feeder in self.feeders.drain(..) {
            let _ = feeder.await;
        }

        if let Some(mut output) = self.output.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut output).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("FFmpeg did not finish within {:?}, killing it", STOP_TIMEOUT);
                    output.abort();
                }
            }
        }
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.feed_cancel.cancel();
        if let Some(output) = self.output.take() {
            output.abort();
        }
    }
}

async fn collect_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("ffmpeg: {}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

async fn feed_video(
    mut stdin: ChildStdin,
    video: VideoTrack,
    size: (u32, u32),
    frame_rate: u32,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64));
    let mut frames_written = 0u64;
    let mut size_warned = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if video.is_ended() {
            tracing::debug!("Video track '{}' ended, closing encoder input", video.label());
            break;
        }
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        let Some(frame) = video.current_frame() else {
            continue;
        };
        if (frame.width, frame.height) != size {
            if !size_warned {
                tracing::warn!(
                    "Dropping {}x{} frames, encoder was opened at {}x{}",
                    frame.width,
                    frame.height,
                    size.0,
                    size.1
                );
                size_warned = true;
            }
            continue;
        }

        if let Err(e) = stdin.write_all(&frame.data).await {
            tracing::warn!("Failed to write frame to FFmpeg: {}", e);
            break;
        }
        frames_written += 1;
    }

    let _ = stdin.shutdown().await;
    tracing::debug!("Video feed closed after {} frames", frames_written);
}

fn encode_samples(chunk: &AudioChunk) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(chunk.samples.len() * 4);
    for sample in &chunk.samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

async fn feed_audio(
    listener: TcpListener,
    mut rx: mpsc::UnboundedReceiver<AudioChunk>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!("FFmpeg never connected for audio: {}", e);
                return;
            }
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = stream.write_all(&encode_samples(&chunk)).await {
                        tracing::warn!("Failed to write audio to FFmpeg: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = stream.shutdown().await;
}

async fn pump_output(
    mut process: Child,
    mut stdout: ChildStdout,
    tx: mpsc::UnboundedSender<EncoderEvent>,
    chunk_interval: Duration,
    stopping: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut ticker = tokio::time::interval(chunk_interval);
    ticker.tick().await;

    let mut pending = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut chunks = 0u64;

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) => {
                    tracing::warn!("Failed to read FFmpeg output: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    chunks += 1;
                    let _ = tx.send(EncoderEvent::Chunk(std::mem::take(&mut pending)));
                }
            }
        }
    }

    if !pending.is_empty() {
        chunks += 1;
        let _ = tx.send(EncoderEvent::Chunk(pending));
    }

    match process.wait().await {
        Ok(status) if status.success() => {
            tracing::info!("FFmpeg encoder finished: {} chunks emitted", chunks);
        }
        Ok(status) => {
            let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
            let message = format!("FFmpeg exited with {}: {}", status, tail.join("\n"));
            if stopping.load(Ordering::SeqCst) {
                tracing::warn!("{}", message);
            } else {
                tracing::error!("{}", message);
                let _ = tx.send(EncoderEvent::Fatal(message));
            }
        }
        Err(e) => {
            let _ = tx.send(EncoderEvent::Fatal(format!("Failed to wait for FFmpeg: {}", e)));
        }
    }
}

/// Creates ffmpeg encoders
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    ffmpeg: PathBuf,
}

impl FfmpegEncoderFactory {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self, format: RecordingFormat) -> RecordingResult<Box<dyn EncoderSink>> {
        Ok(Box::new(FfmpegEncoder::new(self.ffmpeg.clone(), format)))
    }
}

/// Extract encoder names from `ffmpeg -encoders` output
fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            // capability columns look like "V....D" / "A....."
            let is_row = flags.len() == 6
                && matches!(flags.chars().next(), Some('V' | 'A' | 'S'))
                && name != "=";
            is_row.then(|| name.to_string())
        })
        .collect()
}

/// Probes `ffmpeg -encoders` once and caches the answer
pub struct FfmpegFormatProbe {
    ffmpeg: PathBuf,
    encoders: OnceLock<HashSet<String>>,
}

impl FfmpegFormatProbe {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            encoders: OnceLock::new(),
        }
    }

    fn encoders(&self) -> &HashSet<String> {
        self.encoders.get_or_init(|| {
            match std::process::Command::new(&self.ffmpeg)
                .args(["-hide_banner", "-encoders"])
                .output()
            {
                Ok(output) if output.status.success() => {
                    let list = parse_encoder_list(&String::from_utf8_lossy(&output.stdout));
                    tracing::debug!("FFmpeg reports {} encoders", list.len());
                    list
                }
                Ok(output) => {
                    tracing::warn!("ffmpeg -encoders failed with {}", output.status);
                    HashSet::new()
                }
                Err(e) => {
                    tracing::warn!("Failed to run {:?}: {}", self.ffmpeg, e);
                    HashSet::new()
                }
            }
        })
    }
}

impl FormatProbe for FfmpegFormatProbe {
    fn is_supported(&self, format: RecordingFormat) -> bool {
        let encoders = self.encoders();
        encoders.contains(format.video_encoder()) && encoders.contains(format.audio_encoder())
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse a frame rate as ffprobe prints it ("30/1", "30000/1001", "25")
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn parse_probe_output(json: &str) -> Result<MediaInfo, TrimError> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| TrimError::Ffmpeg(format!("Unexpected ffprobe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| TrimError::Ffmpeg("No video stream".to_string()))?;

    let width = video
        .width
        .ok_or_else(|| TrimError::Ffmpeg("Invalid width".to_string()))?;
    let height = video
        .height
        .ok_or_else(|| TrimError::Ffmpeg("Invalid height".to_string()))?;
    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(30.0);

    let duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(Duration::from_secs_f64);

    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(MediaInfo {
        width,
        height,
        fps,
        duration,
        has_audio,
    })
}

/// Probe a media file for its video geometry, duration and audio presence
pub async fn probe_media(ffprobe: &Path, path: &Path) -> Result<MediaInfo, TrimError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,width,height,r_frame_rate:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| TrimError::Ffmpeg(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TrimError::Ffmpeg(format!("ffprobe failed: {}", stderr)));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}
