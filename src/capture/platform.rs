//! The capability providers for the current platform

use super::audio::PlatformMicrophoneProvider;
use super::destination::FileDestination;
use super::screen::FfmpegDisplayProvider;
use super::traits::{
    CameraProvider, DisplayProvider, MicrophoneProvider, OverlayPositionProvider,
    SaveDestinationProvider, SharedOverlayPosition, SharedViewport, ViewportProvider,
};
use crate::config::RecorderSettings;
use std::sync::Arc;

/// Every external capability a recorder depends on
#[derive(Clone)]
pub struct CaptureProviders {
    pub display: Arc<dyn DisplayProvider>,
    pub camera: Arc<dyn CameraProvider>,
    pub microphone: Arc<dyn MicrophoneProvider>,
    pub destination: Arc<dyn SaveDestinationProvider>,
    pub overlay_position: Arc<dyn OverlayPositionProvider>,
    pub viewport: Arc<dyn ViewportProvider>,
}

#[cfg(target_os = "macos")]
fn camera_provider(_settings: &RecorderSettings) -> Arc<dyn CameraProvider> {
    Arc::new(super::webcam::NokhwaCameraProvider::new())
}

#[cfg(not(target_os = "macos"))]
fn camera_provider(settings: &RecorderSettings) -> Arc<dyn CameraProvider> {
    Arc::new(super::screen::FfmpegCameraProvider::new(&settings.ffmpeg_path))
}

/// Real providers configured from `settings`.
///
/// The overlay position and viewport handles are returned separately so
/// callers can move the bubble while recording.
pub fn default_providers(
    settings: &RecorderSettings,
) -> (CaptureProviders, SharedOverlayPosition, SharedViewport) {
    let position = SharedOverlayPosition::new(settings.overlay);
    let viewport = SharedViewport::new(settings.viewport);

    let providers = CaptureProviders {
        display: Arc::new(FfmpegDisplayProvider::new(&settings.ffmpeg_path)),
        camera: camera_provider(settings),
        microphone: Arc::new(PlatformMicrophoneProvider::new(&settings.ffmpeg_path)),
        destination: Arc::new(FileDestination::new(&settings.output_dir)),
        overlay_position: Arc::new(position.clone()),
        viewport: Arc::new(viewport.clone()),
    };

    tracing::debug!(
        "Capture providers ready (ffmpeg: {:?}, output: {:?})",
        settings.ffmpeg_path,
        settings.output_dir
    );
    (providers, position, viewport)
}
