//! Microphone and system audio capture
//!
//! On Linux both come from PulseAudio through an ffmpeg child that writes
//! interleaved f32le samples to stdout. On macOS and Windows the microphone
//! is a cpal input stream; Windows system audio uses a WASAPI loopback
//! stream on the default output device.

use super::media::{audio_track, AudioTrack, MediaSource, SourceKind};
use super::traits::{AcquireResult, MicrophoneConstraints, MicrophoneProvider};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Samples are pushed in blocks of this many milliseconds
const BLOCK_MS: u32 = 20;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
mod pulse {
    use super::*;
    use crate::capture::screen::{spawn_error, ProcessControl};
    use crate::capture::traits::AcquireError;
    use std::io::Read;
    use std::process::{Command, Stdio};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub(crate) fn capture_args(device: &str, sample_rate: u32, channels: u16) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "pulse".into(),
            "-i".into(),
            device.into(),
            "-ac".into(),
            channels.to_string(),
            "-ar".into(),
            sample_rate.to_string(),
            "-f".into(),
            "f32le".into(),
            "-".into(),
        ]
    }

    /// Run an ffmpeg PulseAudio capture into a new audio track
    pub(crate) fn spawn_pulse(
        ffmpeg: &Path,
        device: &str,
        label: &str,
        sample_rate: u32,
        channels: u16,
    ) -> AcquireResult<(AudioTrack, ProcessControl)> {
        let mut child = Command::new(ffmpeg)
            .args(capture_args(device, sample_rate, channels))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(ffmpeg, e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AcquireError::Capture("Audio capture has no stdout".to_string()))?;

        let (writer, track) = audio_track(label, sample_rate, channels);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let block_bytes =
            (sample_rate * BLOCK_MS / 1000) as usize * channels.max(1) as usize * 4;
        let label = label.to_string();

        std::thread::spawn(move || {
            let mut buffer = vec![0u8; block_bytes];
            while thread_running.load(Ordering::SeqCst) {
                if stdout.read_exact(&mut buffer).is_err() {
                    break;
                }
                let samples: Vec<f32> = buffer
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                if !writer.push(samples) {
                    break;
                }
            }
            tracing::info!("Audio capture '{}' stopped", label);
            writer.end();
        });

        tracing::info!(
            "Capturing '{}' from pulse device {} ({}Hz, {}ch)",
            track.label(),
            device,
            sample_rate,
            channels
        );
        Ok((track, ProcessControl::new(child, running)))
    }
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
mod native {
    use super::*;
    use crate::capture::media::SourceControl;
    use crate::capture::traits::AcquireError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, StreamConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Ends the capture thread, which drops the stream with it
    pub(crate) struct StreamControl {
        running: Arc<AtomicBool>,
    }

    impl SourceControl for StreamControl {
        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) enum Endpoint {
        Input(Option<String>),
        #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
        Loopback,
    }

    fn find_device(endpoint: &Endpoint) -> AcquireResult<Device> {
        let host = cpal::default_host();
        let device = match endpoint {
            Endpoint::Input(Some(name)) => host
                .input_devices()
                .map_err(|e| AcquireError::Capture(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false)),
            Endpoint::Input(None) => host.default_input_device(),
            Endpoint::Loopback => host.default_output_device(),
        };
        device.ok_or_else(|| AcquireError::DeviceNotFound("No audio device".to_string()))
    }

    /// Open a cpal stream on a dedicated thread and expose it as a track
    pub(crate) async fn spawn_stream(
        endpoint: Endpoint,
        label: &str,
    ) -> AcquireResult<(AudioTrack, StreamControl)> {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let label = label.to_string();

        std::thread::spawn(move || {
            let device = match find_device(&endpoint) {
                Ok(d) => d,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let supported = match &endpoint {
                Endpoint::Loopback => device.default_output_config(),
                Endpoint::Input(_) => device.default_input_config(),
            };
            let supported = match supported {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(AcquireError::Capture(format!(
                        "Failed to get audio config: {}",
                        e
                    ))));
                    return;
                }
            };

            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels();
            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let (writer, track) = audio_track(label.as_str(), sample_rate, channels);
            let writer = Arc::new(writer);
            let on_error = |err: cpal::StreamError| tracing::error!("Audio stream error: {}", err);

            let stream = match supported.sample_format() {
                SampleFormat::I16 => {
                    let writer = writer.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            writer.push(data.iter().map(|&s| s as f32 / 32768.0).collect());
                        },
                        on_error,
                        None,
                    )
                }
                _ => {
                    let writer = writer.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            writer.push(data.to_vec());
                        },
                        on_error,
                        None,
                    )
                }
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(AcquireError::PermissionDenied(e.to_string())));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AcquireError::Capture(e.to_string())));
                return;
            }

            tracing::info!(
                "Audio stream '{}' started ({}Hz, {}ch)",
                label,
                sample_rate,
                channels
            );
            let _ = ready_tx.send(Ok(track));

            while thread_running.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(u64::from(BLOCK_MS) * 5));
            }

            drop(stream);
            writer.end();
            tracing::info!("Audio stream '{}' stopped", label);
        });

        let track = ready_rx
            .await
            .map_err(|_| AcquireError::Capture("Audio thread exited".to_string()))??;
        Ok((track, StreamControl { running }))
    }
}

/// System audio as a track that rides along with the display source
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub(crate) async fn system_audio_track(
    ffmpeg: &Path,
    _constraints: &MicrophoneConstraints,
) -> AcquireResult<(AudioTrack, crate::capture::screen::ProcessControl)> {
    pulse::spawn_pulse(ffmpeg, "@DEFAULT_MONITOR@", "system", 48000, 2)
}

#[cfg(target_os = "windows")]
pub(crate) async fn system_audio_track(
    _ffmpeg: &Path,
    _constraints: &MicrophoneConstraints,
) -> AcquireResult<(AudioTrack, native::StreamControl)> {
    native::spawn_stream(native::Endpoint::Loopback, "system").await
}

#[cfg(target_os = "macos")]
pub(crate) async fn system_audio_track(
    _ffmpeg: &Path,
    _constraints: &MicrophoneConstraints,
) -> AcquireResult<(AudioTrack, native::StreamControl)> {
    Err(super::traits::AcquireError::DeviceNotFound(
        "System audio capture is not available on macOS".to_string(),
    ))
}

/// Microphone provider for the current platform
pub struct PlatformMicrophoneProvider {
    #[cfg_attr(any(target_os = "macos", target_os = "windows"), allow(dead_code))]
    ffmpeg: PathBuf,
}

impl PlatformMicrophoneProvider {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

#[async_trait]
impl MicrophoneProvider for PlatformMicrophoneProvider {
    async fn acquire_microphone(
        &self,
        constraints: &MicrophoneConstraints,
    ) -> AcquireResult<MediaSource> {
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let (audio, control) = pulse::spawn_pulse(
            &self.ffmpeg,
            constraints.device_id.as_deref().unwrap_or("default"),
            "mic",
            constraints.sample_rate,
            constraints.channels,
        )?;

        #[cfg(any(target_os = "macos", target_os = "windows"))]
        let (audio, control) = native::spawn_stream(
            native::Endpoint::Input(constraints.device_id.clone()),
            "mic",
        )
        .await?;

        Ok(MediaSource::new(SourceKind::Microphone, "mic")
            .with_audio(audio)
            .with_control(control))
    }
}

#[cfg(all(test, not(any(target_os = "macos", target_os = "windows"))))]
mod tests {
    use super::*;
    use crate::capture::traits::AcquireError;

    #[test]
    fn test_pulse_args_request_interleaved_float() {
        let args = pulse::capture_args("default", 44100, 2).join(" ");
        assert!(args.contains("-f pulse -i default"));
        assert!(args.contains("-ac 2 -ar 44100"));
        assert!(args.ends_with("-f f32le -"));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_fails_acquisition() {
        let provider = PlatformMicrophoneProvider::new("/nonexistent/ffmpeg-binary");
        let result = provider
            .acquire_microphone(&MicrophoneConstraints::default())
            .await;
        assert!(matches!(result, Err(AcquireError::DeviceNotFound(_))));
    }
}
