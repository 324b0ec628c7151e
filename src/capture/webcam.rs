//! macOS camera capture using nokhwa
//!
//! The camera is opened on its own thread (nokhwa handles are not `Send`)
//! and each delivered frame is decoded to RGBA and published to the track.

use super::media::{video_track, MediaSource, SourceControl, SourceKind, VideoFrame};
use super::traits::{AcquireError, AcquireResult, CameraConstraints, CameraProvider};
use async_trait::async_trait;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct CameraControl {
    running: Arc<AtomicBool>,
}

impl SourceControl for CameraControl {
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn camera_index(device_id: Option<&str>) -> CameraIndex {
    match device_id {
        Some(id) => match id.parse::<u32>() {
            Ok(idx) => CameraIndex::Index(idx),
            Err(_) => CameraIndex::String(id.to_string()),
        },
        None => CameraIndex::Index(0),
    }
}

/// Camera provider backed by AVFoundation through nokhwa
#[derive(Default)]
pub struct NokhwaCameraProvider;

impl NokhwaCameraProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CameraProvider for NokhwaCameraProvider {
    async fn acquire_camera(&self, constraints: &CameraConstraints) -> AcquireResult<MediaSource> {
        let index = camera_index(constraints.device_id.as_deref());
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let (writer, video) = video_track("camera");

        std::thread::spawn(move || {
            let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
            let mut camera = match Camera::new(index.clone(), format) {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(AcquireError::PermissionDenied(format!(
                        "Failed to open camera {:?}: {:?}",
                        index, e
                    ))));
                    return;
                }
            };
            if let Err(e) = camera.open_stream() {
                let _ = ready_tx.send(Err(AcquireError::Capture(format!(
                    "Failed to open camera stream: {:?}",
                    e
                ))));
                return;
            }

            let camera_format = camera.camera_format();
            tracing::info!(
                "Camera opened: {}x{} @ {}fps, format={:?}",
                camera_format.resolution().width(),
                camera_format.resolution().height(),
                camera_format.frame_rate(),
                camera_format.format()
            );
            let _ = ready_tx.send(Ok(()));

            let start = std::time::Instant::now();
            let mut frame_count: u64 = 0;

            while thread_running.load(Ordering::SeqCst) {
                // blocks until the camera delivers
                let buffer = match camera.frame() {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::debug!("Failed to capture frame: {:?}", e);
                        continue;
                    }
                };
                match buffer.decode_image::<RgbAFormat>() {
                    Ok(image) => {
                        let (width, height) = image.dimensions();
                        if let Some(mut frame) =
                            VideoFrame::from_rgba(width, height, image.into_raw())
                        {
                            frame.timestamp_ms = start.elapsed().as_secs_f64() * 1000.0;
                            writer.publish(frame);
                            frame_count += 1;
                        }
                    }
                    Err(e) => tracing::debug!("Failed to decode camera frame: {:?}", e),
                }
            }

            if let Err(e) = camera.stop_stream() {
                tracing::warn!("Error stopping camera stream: {:?}", e);
            }
            writer.end();
            tracing::info!(
                "Camera captured {} frames in {:.2}s",
                frame_count,
                start.elapsed().as_secs_f64()
            );
        });

        ready_rx
            .await
            .map_err(|_| AcquireError::Capture("Camera thread exited".to_string()))??;

        Ok(MediaSource::new(SourceKind::Camera, "camera")
            .with_video(video)
            .with_control(CameraControl { running }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_index_parsing() {
        assert_eq!(camera_index(None), CameraIndex::Index(0));
        assert_eq!(camera_index(Some("2")), CameraIndex::Index(2));
        assert_eq!(
            camera_index(Some("FaceTime HD Camera")),
            CameraIndex::String("FaceTime HD Camera".to_string())
        );
    }
}
