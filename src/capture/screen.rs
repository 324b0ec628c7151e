//! ffmpeg-backed screen and camera capture
//!
//! Each source runs an ffmpeg grabber (x11grab / avfoundation / gdigrab for
//! the display, v4l2 / dshow for cameras) that writes raw RGBA frames to
//! stdout. A capture thread reads fixed-size frames and publishes them into
//! the source's video track.

use super::media::{video_track, MediaSource, SourceControl, SourceKind, VideoFrame, VideoTrack};
use super::traits::{
    AcquireError, AcquireResult, CameraConstraints, CameraProvider, DisplayProvider,
    DisplayRequest, MicrophoneConstraints,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a grabber may take to deliver its first frame
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Kills a capture process when its source is released
pub(crate) struct ProcessControl {
    child: Mutex<Option<Child>>,
    running: Arc<AtomicBool>,
}

impl ProcessControl {
    pub(crate) fn new(child: Child, running: Arc<AtomicBool>) -> Self {
        Self {
            child: Mutex::new(Some(child)),
            running,
        }
    }
}

impl SourceControl for ProcessControl {
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessControl {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a spawn error onto the acquisition taxonomy
pub(crate) fn spawn_error(program: &Path, e: std::io::Error) -> AcquireError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AcquireError::DeviceNotFound(format!("{} not found", program.display()))
    } else {
        AcquireError::Capture(format!("Failed to start {}: {}", program.display(), e))
    }
}

/// Grabber input arguments for the current platform's screen device
fn display_input_args(request: &DisplayRequest) -> Vec<String> {
    let fps = request.frame_rate.max(1).to_string();

    #[cfg(target_os = "macos")]
    {
        let screen = request
            .display_id
            .clone()
            .unwrap_or_else(|| "Capture screen 0".to_string());
        vec![
            "-f".into(),
            "avfoundation".into(),
            "-capture_cursor".into(),
            "1".into(),
            "-framerate".into(),
            fps,
            "-i".into(),
            format!("{}:none", screen),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        let input = request
            .display_id
            .clone()
            .unwrap_or_else(|| "desktop".to_string());
        vec![
            "-f".into(),
            "gdigrab".into(),
            "-framerate".into(),
            fps,
            "-i".into(),
            input,
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let display = request
            .display_id
            .clone()
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0.0".to_string());
        vec![
            "-f".into(),
            "x11grab".into(),
            "-framerate".into(),
            fps,
            "-video_size".into(),
            format!("{}x{}", request.width, request.height),
            "-i".into(),
            display,
        ]
    }
}

/// Grabber input arguments for a camera
#[cfg(not(target_os = "macos"))]
fn camera_input_args(constraints: &CameraConstraints) -> Vec<String> {
    let fps = constraints.frame_rate.max(1).to_string();

    #[cfg(target_os = "windows")]
    {
        let name = constraints
            .device_id
            .clone()
            .unwrap_or_else(|| "Integrated Camera".to_string());
        vec![
            "-f".into(),
            "dshow".into(),
            "-framerate".into(),
            fps,
            "-i".into(),
            format!("video={}", name),
        ]
    }

    #[cfg(not(target_os = "windows"))]
    {
        let device = constraints
            .device_id
            .clone()
            .unwrap_or_else(|| "/dev/video0".to_string());
        vec![
            "-f".into(),
            "v4l2".into(),
            "-framerate".into(),
            fps,
            "-i".into(),
            device,
        ]
    }
}

/// Full ffmpeg argument list: grab, scale to the requested size, emit RGBA
pub(crate) fn raw_video_args(input: Vec<String>, width: u32, height: u32) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];
    args.extend(input);
    args.extend([
        "-vf".to_string(),
        format!("scale={}:{}", width, height),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-".to_string(),
    ]);
    args
}

/// Spawn a grabber and a thread that turns its stdout into a video track
pub(crate) fn spawn_raw_video(
    ffmpeg: &Path,
    args: &[String],
    width: u32,
    height: u32,
    label: &str,
) -> AcquireResult<(VideoTrack, ProcessControl)> {
    let mut child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| spawn_error(ffmpeg, e))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AcquireError::Capture("Grabber has no stdout".to_string()))?;

    let (writer, track) = video_track(label);
    let running = Arc::new(AtomicBool::new(true));
    let frame_size = VideoFrame::expected_len(width, height);
    let thread_running = running.clone();
    let thread_label = label.to_string();

    std::thread::spawn(move || {
        let start = std::time::Instant::now();
        let mut buffer = vec![0u8; frame_size];
        let mut frame_count: u64 = 0;

        while thread_running.load(Ordering::SeqCst) {
            if stdout.read_exact(&mut buffer).is_err() {
                break;
            }
            if let Some(mut frame) = VideoFrame::from_rgba(width, height, buffer.clone()) {
                frame.timestamp_ms = start.elapsed().as_secs_f64() * 1000.0;
                writer.publish(frame);
                frame_count += 1;
            }
        }

        tracing::info!(
            "Capture of '{}' stopped after {} frames ({:.1}s)",
            thread_label,
            frame_count,
            start.elapsed().as_secs_f64()
        );
        writer.end();
    });

    Ok((track, ProcessControl::new(child, running)))
}

/// Wait until a freshly spawned grabber proves it works
pub(crate) async fn wait_for_first_frame(track: &VideoTrack) -> AcquireResult<()> {
    let wait = async {
        loop {
            if track.current_frame().is_some() {
                return Ok(());
            }
            if track.is_ended() {
                return Err(AcquireError::PermissionDenied(format!(
                    "'{}' produced no frames",
                    track.label()
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::time::timeout(FIRST_FRAME_TIMEOUT, wait)
        .await
        .unwrap_or_else(|_| {
            Err(AcquireError::Capture(format!(
                "Timed out waiting for '{}'",
                track.label()
            )))
        })
}

/// Captures the screen through ffmpeg
pub struct FfmpegDisplayProvider {
    ffmpeg: PathBuf,
}

impl FfmpegDisplayProvider {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

#[async_trait]
impl DisplayProvider for FfmpegDisplayProvider {
    async fn acquire_display(&self, request: &DisplayRequest) -> AcquireResult<MediaSource> {
        let args = raw_video_args(display_input_args(request), request.width, request.height);
        tracing::debug!("Starting display grabber: {} {}", self.ffmpeg.display(), args.join(" "));

        let (video, control) =
            spawn_raw_video(&self.ffmpeg, &args, request.width, request.height, "screen")?;
        let mut source = MediaSource::new(SourceKind::Display, "screen")
            .with_video(video.clone())
            .with_control(control);

        if let Err(e) = wait_for_first_frame(&video).await {
            source.stop();
            return Err(e);
        }

        if request.capture_audio {
            match super::audio::system_audio_track(&self.ffmpeg, &MicrophoneConstraints::default())
                .await
            {
                Ok((audio, control)) => source = source.with_audio(audio).with_control(control),
                Err(e) => tracing::warn!("System audio unavailable, recording without it: {}", e),
            }
        }

        tracing::info!(
            "Display acquired: {}x{} @ {}fps",
            request.width,
            request.height,
            request.frame_rate
        );
        Ok(source)
    }
}

/// Captures a camera through ffmpeg
#[cfg(not(target_os = "macos"))]
pub struct FfmpegCameraProvider {
    ffmpeg: PathBuf,
}

#[cfg(not(target_os = "macos"))]
impl FfmpegCameraProvider {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

#[cfg(not(target_os = "macos"))]
#[async_trait]
impl CameraProvider for FfmpegCameraProvider {
    async fn acquire_camera(&self, constraints: &CameraConstraints) -> AcquireResult<MediaSource> {
        let args = raw_video_args(
            camera_input_args(constraints),
            constraints.width,
            constraints.height,
        );
        let (video, control) = spawn_raw_video(
            &self.ffmpeg,
            &args,
            constraints.width,
            constraints.height,
            "camera",
        )?;
        let source = MediaSource::new(SourceKind::Camera, "camera")
            .with_video(video.clone())
            .with_control(control);

        wait_for_first_frame(&video).await?;
        tracing::info!(
            "Camera acquired: {}x{} @ {}fps",
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_video_args_scale_and_pipe() {
        let args = raw_video_args(vec!["-i".into(), "in".into()], 640, 360);
        let joined = args.join(" ");
        assert!(joined.contains("-i in"));
        assert!(joined.contains("scale=640:360"));
        assert!(joined.ends_with("-pix_fmt rgba -f rawvideo -"));
    }

    #[test]
    fn test_display_args_carry_frame_rate() {
        let request = DisplayRequest {
            display_id: Some("screen-1".to_string()),
            width: 1280,
            height: 720,
            frame_rate: 24,
            capture_audio: false,
        };
        let args = display_input_args(&request);
        let rate = args.iter().position(|a| a == "-framerate").unwrap();
        assert_eq!(args[rate + 1], "24");
        assert!(args.iter().any(|a| a.contains("screen-1")));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_device_not_found() {
        let result = spawn_raw_video(
            Path::new("/nonexistent/ffmpeg-binary"),
            &[],
            4,
            4,
            "screen",
        );
        assert!(matches!(result, Err(AcquireError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_first_frame_wait_fails_on_ended_track() {
        let (writer, track) = video_track("screen");
        writer.end();
        let result = wait_for_first_frame(&track).await;
        assert!(matches!(result, Err(AcquireError::PermissionDenied(_))));
    }
}
