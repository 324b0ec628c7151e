//! In-process fakes for the capture, encoding and playback seams

use crate::capture::destination::FileSink;
use crate::capture::media::{
    audio_track, video_track, AudioTrackWriter, MediaSource, SourceControl, SourceKind, VideoFrame,
    VideoTrack, VideoTrackWriter,
};
use crate::capture::platform::CaptureProviders;
use crate::capture::traits::{
    AcquireError, AcquireResult, CameraConstraints, CameraProvider, DisplayProvider,
    DisplayRequest, MicrophoneConstraints, MicrophoneProvider, SaveDestinationProvider,
    SharedOverlayPosition, SharedViewport, WritableSink,
};
use crate::export::player::{Playback, PlaybackEngine, PlaybackEvent};
use crate::export::types::TrimError;
use crate::recorder::encoder::{
    EncodeRequest, EncoderEvent, EncoderFactory, EncoderSink, FormatProbe, RecordingFormat,
};
use crate::recorder::error::{RecordingError, RecordingResult};
use crate::recorder::session::EncodingServices;
use crate::recorder::state::RecordedArtifact;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Write targets
// ---------------------------------------------------------------------------

/// A file sink that can be told to fail
pub struct FlakySink {
    inner: FileSink,
    writes: usize,
    fail_on_write: Option<usize>,
    fail_close: bool,
}

impl FlakySink {
    pub async fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: FileSink::create(path).await.unwrap(),
            writes: 0,
            fail_on_write: None,
            fail_close: false,
        }
    }

    /// Fail the n-th write (1-based) and every one after it
    pub fn fail_on_write(mut self, n: usize) -> Self {
        self.fail_on_write = Some(n);
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl WritableSink for FlakySink {
    fn location(&self) -> &Path {
        self.inner.location()
    }

    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writes += 1;
        if matches!(self.fail_on_write, Some(n) if self.writes >= n) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            ));
        }
        self.inner.write(chunk).await
    }

    async fn close(&mut self) -> std::io::Result<PathBuf> {
        if self.fail_close {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "close failed",
            ));
        }
        self.inner.close().await
    }
}

#[derive(Clone, Copy)]
enum DestinationMode {
    File,
    Unavailable,
    Cancel,
    Hang,
}

/// Save destination handing out `FlakySink`s in a directory
pub struct FakeDestination {
    mode: DestinationMode,
    dir: PathBuf,
    fail_on_write: Option<usize>,
    fail_close: bool,
    negotiated: Mutex<Vec<PathBuf>>,
}

impl FakeDestination {
    fn with_mode(mode: DestinationMode, dir: PathBuf) -> Self {
        Self {
            mode,
            dir,
            fail_on_write: None,
            fail_close: false,
            negotiated: Mutex::new(Vec::new()),
        }
    }

    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::with_mode(DestinationMode::File, dir.into())
    }

    /// No direct-to-disk target available
    pub fn unavailable() -> Self {
        Self::with_mode(DestinationMode::Unavailable, PathBuf::new())
    }

    pub fn cancelling() -> Self {
        Self::with_mode(DestinationMode::Cancel, PathBuf::new())
    }

    pub fn hanging() -> Self {
        Self::with_mode(DestinationMode::Hang, PathBuf::new())
    }

    pub fn fail_on_write(mut self, n: usize) -> Self {
        self.fail_on_write = Some(n);
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn negotiated(&self) -> Vec<PathBuf> {
        self.negotiated.lock().clone()
    }
}

#[async_trait]
impl SaveDestinationProvider for FakeDestination {
    async fn negotiate(
        &self,
        suggested_name: &str,
    ) -> AcquireResult<Option<Box<dyn WritableSink>>> {
        match self.mode {
            DestinationMode::Unavailable => Ok(None),
            DestinationMode::Cancel => Err(AcquireError::UserCancelled),
            DestinationMode::Hang => std::future::pending().await,
            DestinationMode::File => {
                let path = self.dir.join(format!("{}.webm", suggested_name));
                self.negotiated.lock().push(path.clone());
                let mut sink = FlakySink::create(path).await;
                sink.fail_on_write = self.fail_on_write;
                sink.fail_close = self.fail_close;
                Ok(Some(Box::new(sink)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Capture devices
// ---------------------------------------------------------------------------

/// Writers and counters behind every source a fake provider hands out
#[derive(Default)]
pub struct FakeDevice {
    acquisitions: AtomicUsize,
    stops: AtomicUsize,
    video: Mutex<Option<VideoTrackWriter>>,
    audio: Mutex<Option<AudioTrackWriter>>,
}

impl FakeDevice {
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// How many times a handed-out source was released
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Simulate the user ending the share from outside the app
    pub fn end_video(&self) {
        if let Some(writer) = self.video.lock().take() {
            writer.end();
        }
    }

    pub fn publish(&self, frame: VideoFrame) {
        if let Some(writer) = self.video.lock().as_ref() {
            writer.publish(frame);
        }
    }

    pub fn push_audio(&self, samples: Vec<f32>) -> bool {
        self.audio
            .lock()
            .as_ref()
            .map(|w| w.push(samples))
            .unwrap_or(false)
    }

    fn attach(&self, video: Option<VideoTrackWriter>, audio: Option<AudioTrackWriter>) {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        *self.video.lock() = video;
        *self.audio.lock() = audio;
    }
}

struct FakeControl(Arc<FakeDevice>);

impl SourceControl for FakeControl {
    fn stop(&self) {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(writer) = self.0.video.lock().take() {
            writer.end();
        }
        if let Some(writer) = self.0.audio.lock().take() {
            writer.end();
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Grant {
    Grant,
    Refuse,
    Deny,
    Hang,
}

async fn gate(grant: Grant) -> AcquireResult<()> {
    match grant {
        Grant::Grant => Ok(()),
        Grant::Refuse => Err(AcquireError::UserCancelled),
        Grant::Deny => Err(AcquireError::PermissionDenied("denied by test".to_string())),
        Grant::Hang => std::future::pending().await,
    }
}

pub struct FakeDisplayProvider {
    grant: Grant,
    width: u32,
    height: u32,
    system_audio_channels: u16,
    ended_on_grant: bool,
    device: Arc<FakeDevice>,
    requests: Mutex<Vec<DisplayRequest>>,
}

impl FakeDisplayProvider {
    fn with_grant(grant: Grant) -> Self {
        Self {
            grant,
            width: 1920,
            height: 1080,
            system_audio_channels: 2,
            ended_on_grant: false,
            device: Arc::new(FakeDevice::default()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn granting(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::with_grant(Grant::Grant)
        }
    }

    pub fn refusing() -> Self {
        Self::with_grant(Grant::Refuse)
    }

    pub fn hanging() -> Self {
        Self::with_grant(Grant::Hang)
    }

    /// Channels of the system audio track when it is requested, 0 for none
    pub fn with_system_audio_channels(mut self, channels: u16) -> Self {
        self.system_audio_channels = channels;
        self
    }

    /// Hand out a source whose tracks have already ended
    pub fn ended_on_grant(mut self) -> Self {
        self.ended_on_grant = true;
        self
    }

    pub fn device(&self) -> Arc<FakeDevice> {
        self.device.clone()
    }

    pub fn requests(&self) -> Vec<DisplayRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl DisplayProvider for FakeDisplayProvider {
    async fn acquire_display(&self, request: &DisplayRequest) -> AcquireResult<MediaSource> {
        self.requests.lock().push(request.clone());
        gate(self.grant).await?;

        let (video_writer, video) = video_track("screen");
        video_writer.publish(VideoFrame::solid(self.width, self.height, [10, 20, 30, 255]));
        let mut source = MediaSource::new(SourceKind::Display, "screen").with_video(video);

        let mut audio_writer = None;
        if request.capture_audio && self.system_audio_channels > 0 {
            let (writer, audio) = audio_track("system", 48000, self.system_audio_channels);
            source = source.with_audio(audio);
            audio_writer = Some(writer);
        }

        if self.ended_on_grant {
            video_writer.end();
            if let Some(writer) = &audio_writer {
                writer.end();
            }
        }

        self.device.attach(Some(video_writer), audio_writer);
        Ok(source.with_control(FakeControl(self.device.clone())))
    }
}

pub struct FakeCameraProvider {
    grant: Grant,
    device: Arc<FakeDevice>,
}

impl FakeCameraProvider {
    pub fn granting() -> Self {
        Self {
            grant: Grant::Grant,
            device: Arc::new(FakeDevice::default()),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: Grant::Deny,
            device: Arc::new(FakeDevice::default()),
        }
    }

    pub fn device(&self) -> Arc<FakeDevice> {
        self.device.clone()
    }
}

#[async_trait]
impl CameraProvider for FakeCameraProvider {
    async fn acquire_camera(&self, constraints: &CameraConstraints) -> AcquireResult<MediaSource> {
        gate(self.grant).await?;

        let (writer, video) = video_track("camera");
        writer.publish(VideoFrame::solid(
            constraints.width,
            constraints.height,
            [200, 0, 0, 255],
        ));
        self.device.attach(Some(writer), None);
        Ok(MediaSource::new(SourceKind::Camera, "camera")
            .with_video(video)
            .with_control(FakeControl(self.device.clone())))
    }
}

pub struct FakeMicrophoneProvider {
    grant: Grant,
    device: Arc<FakeDevice>,
}

impl FakeMicrophoneProvider {
    pub fn granting() -> Self {
        Self {
            grant: Grant::Grant,
            device: Arc::new(FakeDevice::default()),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: Grant::Deny,
            device: Arc::new(FakeDevice::default()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            grant: Grant::Hang,
            device: Arc::new(FakeDevice::default()),
        }
    }

    pub fn device(&self) -> Arc<FakeDevice> {
        self.device.clone()
    }
}

#[async_trait]
impl MicrophoneProvider for FakeMicrophoneProvider {
    async fn acquire_microphone(
        &self,
        constraints: &MicrophoneConstraints,
    ) -> AcquireResult<MediaSource> {
        gate(self.grant).await?;

        let (writer, audio) = audio_track("mic", constraints.sample_rate, constraints.channels);
        self.device.attach(None, Some(writer));
        Ok(MediaSource::new(SourceKind::Microphone, "mic")
            .with_audio(audio)
            .with_control(FakeControl(self.device.clone())))
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Reports a fixed set of supported formats
pub struct FakeFormatProbe(Vec<RecordingFormat>);

impl FakeFormatProbe {
    pub fn supporting(formats: &[RecordingFormat]) -> Self {
        Self(formats.to_vec())
    }

    pub fn all() -> Self {
        Self(RecordingFormat::preferences())
    }
}

impl FormatProbe for FakeFormatProbe {
    fn is_supported(&self, format: RecordingFormat) -> bool {
        self.0.contains(&format)
    }
}

/// Observes and drives every encoder a `FakeEncoderFactory` creates
#[derive(Default)]
pub struct EncoderControl {
    sender: Mutex<Option<mpsc::UnboundedSender<EncoderEvent>>>,
    emitted: Mutex<Vec<Vec<u8>>>,
    formats: Mutex<Vec<RecordingFormat>>,
    video: Mutex<Option<VideoTrack>>,
    audio_channels: Mutex<Option<u16>>,
    paused: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    sequence: AtomicUsize,
}

impl EncoderControl {
    /// Emit a chunk from the running encoder. False when none is running.
    pub fn emit(&self, bytes: impl Into<Vec<u8>>) -> bool {
        let bytes = bytes.into();
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) if tx.send(EncoderEvent::Chunk(bytes.clone())).is_ok() => {
                self.emitted.lock().push(bytes);
                true
            }
            _ => false,
        }
    }

    /// Emit a numbered chunk
    pub fn emit_next(&self) -> bool {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.emit(format!("chunk-{:04};", n))
    }

    pub fn fail(&self, message: &str) -> bool {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| tx.send(EncoderEvent::Fatal(message.to_string())).is_ok())
            .unwrap_or(false)
    }

    /// Every chunk emitted so far, in order
    pub fn emitted(&self) -> Vec<Vec<u8>> {
        self.emitted.lock().clone()
    }

    /// Formats of every started encoder
    pub fn formats(&self) -> Vec<RecordingFormat> {
        self.formats.lock().clone()
    }

    /// Video track the last encoder was started with
    pub fn video(&self) -> Option<VideoTrack> {
        self.video.lock().clone()
    }

    /// Channel count of the audio the last encoder got, None for silent
    pub fn audio_channels(&self) -> Option<u16> {
        *self.audio_channels.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum EncoderMode {
    Manual,
    Auto(Duration),
    FailCreate,
    FailStart,
}

pub struct FakeEncoderFactory {
    mode: EncoderMode,
    control: Arc<EncoderControl>,
}

impl FakeEncoderFactory {
    fn with_mode(mode: EncoderMode) -> Self {
        Self {
            mode,
            control: Arc::new(EncoderControl::default()),
        }
    }

    /// Chunks are only emitted through the control
    pub fn manual() -> Self {
        Self::with_mode(EncoderMode::Manual)
    }

    /// Emits a chunk every `interval` while not paused
    pub fn auto_chunking(interval: Duration) -> Self {
        Self::with_mode(EncoderMode::Auto(interval))
    }

    pub fn failing() -> Self {
        Self::with_mode(EncoderMode::FailCreate)
    }

    pub fn failing_start() -> Self {
        Self::with_mode(EncoderMode::FailStart)
    }

    pub fn control(&self) -> Arc<EncoderControl> {
        self.control.clone()
    }
}

impl EncoderFactory for FakeEncoderFactory {
    fn create(&self, _format: RecordingFormat) -> RecordingResult<Box<dyn EncoderSink>> {
        if let EncoderMode::FailCreate = self.mode {
            return Err(RecordingError::EncoderFatal(
                "encoder unavailable".to_string(),
            ));
        }
        Ok(Box::new(FakeEncoder {
            mode: self.mode,
            control: self.control.clone(),
            ticker: None,
            stopped: false,
        }))
    }
}

struct FakeEncoder {
    mode: EncoderMode,
    control: Arc<EncoderControl>,
    ticker: Option<JoinHandle<()>>,
    stopped: bool,
}

#[async_trait]
impl EncoderSink for FakeEncoder {
    async fn start(
        &mut self,
        video: VideoTrack,
        audio: Option<crate::capture::media::AudioTrack>,
        request: &EncodeRequest,
    ) -> RecordingResult<mpsc::UnboundedReceiver<EncoderEvent>> {
        if let EncoderMode::FailStart = self.mode {
            return Err(RecordingError::EncoderFatal("encoder refused to start".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let control = &self.control;
        control.starts.fetch_add(1, Ordering::SeqCst);
        control.formats.lock().push(request.format);
        *control.video.lock() = Some(video);
        *control.audio_channels.lock() = audio.map(|a| a.channels());
        control.paused.store(false, Ordering::SeqCst);
        *control.sender.lock() = Some(tx);

        if let EncoderMode::Auto(interval) = self.mode {
            let control = self.control.clone();
            self.ticker = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !control.is_paused() && !control.emit_next() {
                        break;
                    }
                }
            }));
        }

        Ok(rx)
    }

    fn pause(&mut self) {
        self.control.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.control.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        if std::mem::replace(&mut self.stopped, true) {
            return Ok(());
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.control.stops.fetch_add(1, Ordering::SeqCst);
        self.control.sender.lock().take();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlaybackState {
    seeks: Mutex<Vec<Duration>>,
    last_position: Mutex<Duration>,
    paused: AtomicBool,
}

/// Plays any artifact at real-time pace, reporting every 100 ms
#[derive(Clone, Default)]
pub struct FakePlaybackEngine {
    hang_seek: bool,
    state: Arc<PlaybackState>,
}

impl FakePlaybackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeks never complete
    pub fn hanging_seek() -> Self {
        Self {
            hang_seek: true,
            ..Self::default()
        }
    }

    pub fn seeks(&self) -> Vec<Duration> {
        self.state.seeks.lock().clone()
    }

    pub fn last_position(&self) -> Duration {
        *self.state.last_position.lock()
    }

    pub fn was_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackEngine for FakePlaybackEngine {
    async fn open(&self, artifact: &RecordedArtifact) -> Result<Box<dyn Playback>, TrimError> {
        let (writer, video) = video_track(format!("playback-{}", artifact.id()));
        Ok(Box::new(FakePlayback {
            hang_seek: self.hang_seek,
            state: self.state.clone(),
            duration: artifact.duration(),
            writer: Arc::new(writer),
            video,
            position: Duration::ZERO,
            playing: None,
        }))
    }
}

struct FakePlayback {
    hang_seek: bool,
    state: Arc<PlaybackState>,
    duration: Duration,
    writer: Arc<VideoTrackWriter>,
    video: VideoTrack,
    position: Duration,
    playing: Option<CancellationToken>,
}

#[async_trait]
impl Playback for FakePlayback {
    fn video(&self) -> VideoTrack {
        self.video.clone()
    }

    fn audio(&self) -> Option<crate::capture::media::AudioTrack> {
        None
    }

    async fn seek(&mut self, position: Duration) -> Result<(), TrimError> {
        if self.hang_seek {
            std::future::pending::<()>().await;
        }
        self.state.seeks.lock().push(position);
        self.position = position;
        *self.state.last_position.lock() = position;
        let mut frame = VideoFrame::solid(8, 8, [0, 0, 0, 255]);
        frame.timestamp_ms = position.as_secs_f64() * 1000.0;
        self.writer.publish(frame);
        Ok(())
    }

    fn play(&mut self) -> Result<mpsc::UnboundedReceiver<PlaybackEvent>, TrimError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        self.playing = Some(token.clone());

        let state = self.state.clone();
        let writer = self.writer.clone();
        let duration = self.duration;
        let mut position = self.position;

        tokio::spawn(async move {
            let step = Duration::from_millis(100);
            let mut ticker = tokio::time::interval(step);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if position >= duration {
                            let _ = tx.send(PlaybackEvent::Ended);
                            break;
                        }
                        position += step;
                        *state.last_position.lock() = position;
                        let mut frame = VideoFrame::solid(8, 8, [0, 0, 0, 255]);
                        frame.timestamp_ms = position.as_secs_f64() * 1000.0;
                        writer.publish(frame);
                        if tx.send(PlaybackEvent::Position(position)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn pause(&mut self) {
        if let Some(token) = self.playing.take() {
            token.cancel();
        }
        self.state.paused.store(true, Ordering::SeqCst);
    }

    fn position(&self) -> Duration {
        *self.state.last_position.lock()
    }

    async fn close(&mut self) {
        self.pause();
        self.writer.end();
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// One fake of everything a recorder needs
pub struct TestRig {
    pub display: Arc<FakeDisplayProvider>,
    pub camera: Arc<FakeCameraProvider>,
    pub microphone: Arc<FakeMicrophoneProvider>,
    pub destination: Arc<FakeDestination>,
    pub encoders: Arc<FakeEncoderFactory>,
    pub formats: Arc<FakeFormatProbe>,
    pub position: SharedOverlayPosition,
    pub viewport: SharedViewport,
}

impl TestRig {
    pub fn new() -> Self {
        Self {
            display: Arc::new(FakeDisplayProvider::granting(1920, 1080)),
            camera: Arc::new(FakeCameraProvider::granting()),
            microphone: Arc::new(FakeMicrophoneProvider::granting()),
            destination: Arc::new(FakeDestination::unavailable()),
            encoders: Arc::new(FakeEncoderFactory::manual()),
            formats: Arc::new(FakeFormatProbe::all()),
            position: SharedOverlayPosition::default(),
            viewport: SharedViewport::default(),
        }
    }

    pub fn with_display(mut self, display: FakeDisplayProvider) -> Self {
        self.display = Arc::new(display);
        self
    }

    pub fn with_camera(mut self, camera: FakeCameraProvider) -> Self {
        self.camera = Arc::new(camera);
        self
    }

    pub fn with_microphone(mut self, microphone: FakeMicrophoneProvider) -> Self {
        self.microphone = Arc::new(microphone);
        self
    }

    pub fn with_destination(mut self, destination: FakeDestination) -> Self {
        self.destination = Arc::new(destination);
        self
    }

    pub fn with_encoders(mut self, encoders: FakeEncoderFactory) -> Self {
        self.encoders = Arc::new(encoders);
        self
    }

    pub fn with_formats(mut self, formats: FakeFormatProbe) -> Self {
        self.formats = Arc::new(formats);
        self
    }

    pub fn encoder(&self) -> Arc<EncoderControl> {
        self.encoders.control()
    }

    pub fn providers(&self) -> CaptureProviders {
        CaptureProviders {
            display: self.display.clone(),
            camera: self.camera.clone(),
            microphone: self.microphone.clone(),
            destination: self.destination.clone(),
            overlay_position: Arc::new(self.position.clone()),
            viewport: Arc::new(self.viewport.clone()),
        }
    }

    pub fn encoding(&self) -> EncodingServices {
        EncodingServices {
            encoders: self.encoders.clone(),
            formats: self.formats.clone(),
        }
    }
}
