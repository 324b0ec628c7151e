//! Fixed-rate frame compositor

use super::overlay::{
    draw_base, draw_circular_overlay, draw_ring, overlay_layout, OverlayLayout,
    DEFAULT_BUBBLE_SIZE, RING_COLOR, RING_WIDTH,
};
use crate::capture::media::{video_track, VideoFrame, VideoTrack, VideoTrackWriter};
use crate::capture::traits::{OverlayPositionProvider, Resolution, ViewportProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Output frame rate of composited video
pub const TARGET_FRAME_RATE: u32 = 30;

/// Renders the base frame plus a circular overlay into one canvas per tick
pub struct FrameCompositor {
    base: VideoTrack,
    overlay: Option<VideoTrack>,
    position: Arc<dyn OverlayPositionProvider>,
    viewport: Arc<dyn ViewportProvider>,
    bubble_size: f64,
    canvas: Option<Arc<VideoFrame>>,
    /// Canvas of the previous tick, drawn into again once no consumer holds it
    spare: Option<Arc<VideoFrame>>,
    frames_rendered: u64,
}

impl FrameCompositor {
    pub fn new(
        base: VideoTrack,
        position: Arc<dyn OverlayPositionProvider>,
        viewport: Arc<dyn ViewportProvider>,
    ) -> Self {
        Self {
            base,
            overlay: None,
            position,
            viewport,
            bubble_size: DEFAULT_BUBBLE_SIZE,
            canvas: None,
            spare: None,
            frames_rendered: 0,
        }
    }

    pub fn with_overlay(mut self, overlay: VideoTrack) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_bubble_size(mut self, bubble_size: f64) -> Self {
        self.bubble_size = bubble_size;
        self
    }

    pub fn has_overlay(&self) -> bool {
        self.overlay.is_some()
    }

    /// Current canvas size, None until the first base frame arrived
    pub fn canvas_resolution(&self) -> Option<Resolution> {
        self.canvas.as_ref().map(|c| c.resolution())
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Layout the bubble would use for the given base resolution right now
    pub fn current_layout(&self, base: Resolution) -> OverlayLayout {
        overlay_layout(
            base,
            self.viewport.viewport(),
            self.position.position(),
            self.bubble_size,
        )
    }

    /// Render one frame.
    ///
    /// Returns None while the base source has not produced a frame yet.
    /// Two canvases alternate, so a frame handed out stays untouched while
    /// it is still referenced.
    pub fn tick(&mut self) -> Option<Arc<VideoFrame>> {
        let base = self.base.current_frame()?;
        if !base.is_valid() {
            return None;
        }
        let resolution = base.resolution();

        if self.canvas.as_ref().map(|c| c.resolution()) != Some(resolution) {
            tracing::debug!(
                "Compositor canvas sized to {}x{}",
                resolution.width,
                resolution.height
            );
        }
        let mut canvas = match self.spare.take() {
            Some(spare) if spare.resolution() == resolution => spare,
            _ => Arc::new(VideoFrame::new(resolution.width, resolution.height)),
        };

        // Position and viewport are polled every frame, never cached
        let layout = self.overlay.as_ref().map(|_| self.current_layout(resolution));
        let overlay_frame = self.overlay.as_ref().and_then(|o| o.current_frame());

        let target = Arc::make_mut(&mut canvas);
        if !draw_base(target, &base) {
            return None;
        }

        if let Some(layout) = layout {
            if let Some(frame) = overlay_frame {
                draw_circular_overlay(target, &frame, &layout);
            }
            draw_ring(target, &layout, RING_WIDTH * layout.scale_x, RING_COLOR);
        }

        self.frames_rendered += 1;
        self.spare = self.canvas.replace(canvas.clone());
        Some(canvas)
    }

    /// Drop retained buffers and overlay handles
    pub fn release(&mut self) {
        self.canvas = None;
        self.spare = None;
        self.overlay = None;
    }

    /// Run the render loop on the current runtime and publish into a new track
    pub fn spawn(self, frame_rate: u32) -> (VideoTrack, CompositorHandle) {
        let (writer, track) = video_track("composited");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(render_loop(self, writer, frame_rate, cancel.clone()));
        (track, CompositorHandle { cancel, task: Some(task) })
    }
}

async fn render_loop(
    mut compositor: FrameCompositor,
    writer: VideoTrackWriter,
    frame_rate: u32,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        "Compositor started at {}fps (overlay: {})",
        frame_rate,
        compositor.has_overlay()
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if compositor.base.is_ended() {
            tracing::info!("Base video ended, compositor stopping");
            break;
        }

        if let Some(frame) = compositor.tick() {
            writer.publish_shared(frame);
        }
    }

    tracing::debug!(
        "Compositor stopped after {} frames",
        compositor.frames_rendered()
    );
    compositor.release();
    writer.clear();
    writer.end();
}

/// Controls a spawned compositor loop
pub struct CompositorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CompositorHandle {
    /// Stop scheduling further ticks. Idempotent.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Terminate and wait for the loop to release its buffers
    pub async fn shutdown(&mut self) {
        self.terminate();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Compositor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for CompositorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{OverlayPosition, SharedOverlayPosition, SharedViewport, ViewportSize};

    fn providers(
        x: f64,
        y: f64,
        viewport: Option<ViewportSize>,
    ) -> (SharedOverlayPosition, SharedViewport) {
        (
            SharedOverlayPosition::new(OverlayPosition { x, y }),
            SharedViewport::new(viewport),
        )
    }

    #[test]
    fn test_tick_skips_until_base_has_frame() {
        let (base_writer, base) = video_track("screen");
        let (pos, vp) = providers(0.0, 0.0, None);
        let mut compositor = FrameCompositor::new(base, Arc::new(pos), Arc::new(vp));

        assert!(compositor.tick().is_none());
        assert!(compositor.canvas_resolution().is_none());

        base_writer.publish(VideoFrame::solid(8, 4, [10, 20, 30, 255]));
        let frame = compositor.tick().unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.pixel(7, 3), Some([10, 20, 30, 255]));
    }

    #[test]
    fn test_canvas_follows_base_resolution() {
        let (base_writer, base) = video_track("screen");
        let (pos, vp) = providers(0.0, 0.0, None);
        let mut compositor = FrameCompositor::new(base, Arc::new(pos), Arc::new(vp));

        base_writer.publish(VideoFrame::solid(4, 4, [0, 0, 0, 255]));
        compositor.tick();
        base_writer.publish(VideoFrame::solid(16, 9, [0, 0, 0, 255]));
        compositor.tick();

        assert_eq!(
            compositor.canvas_resolution(),
            Some(Resolution { width: 16, height: 9 })
        );
    }

    #[test]
    fn test_full_hd_frame_with_camera_bubble() {
        let (base_writer, base) = video_track("screen");
        let (cam_writer, camera) = video_track("camera");
        let (pos, vp) = providers(
            960.0,
            540.0,
            Some(ViewportSize { width: 1920.0, height: 1080.0 }),
        );

        base_writer.publish(VideoFrame::solid(1920, 1080, [0, 0, 0, 255]));
        cam_writer.publish(VideoFrame::solid(320, 320, [0, 200, 0, 255]));

        let mut compositor =
            FrameCompositor::new(base, Arc::new(pos), Arc::new(vp)).with_overlay(camera);
        let frame = compositor.tick().unwrap();

        assert_eq!((frame.width, frame.height), (1920, 1080));
        assert_eq!(frame.pixel(960, 540), Some([0, 200, 0, 255]));
        // diameter 200, so 120px from center is outside
        assert_eq!(frame.pixel(1080, 540), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_position_is_polled_every_tick() {
        let (base_writer, base) = video_track("screen");
        let (_cam_writer, camera) = video_track("camera");
        let (pos, vp) = providers(10.0, 10.0, None);
        let handle = pos.clone();

        base_writer.publish(VideoFrame::solid(100, 100, [0, 0, 0, 255]));
        let compositor =
            FrameCompositor::new(base, Arc::new(pos), Arc::new(vp)).with_overlay(camera);

        let res = Resolution { width: 100, height: 100 };
        assert_eq!(compositor.current_layout(res).center_x, 10.0);
        handle.set(OverlayPosition { x: 70.0, y: 10.0 });
        assert_eq!(compositor.current_layout(res).center_x, 70.0);
    }

    #[test]
    fn test_overlay_without_frames_draws_only_ring() {
        let (base_writer, base) = video_track("screen");
        let (_cam_writer, camera) = video_track("camera");
        let (pos, vp) = providers(50.0, 50.0, None);

        base_writer.publish(VideoFrame::solid(100, 100, [0, 0, 0, 255]));
        let mut compositor = FrameCompositor::new(base, Arc::new(pos), Arc::new(vp))
            .with_overlay(camera)
            .with_bubble_size(40.0);

        let frame = compositor.tick().unwrap();
        assert_eq!(frame.pixel(50, 50), Some([0, 0, 0, 255]));
        assert_ne!(frame.pixel(69, 50), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_released_canvas_is_reused() {
        let (base_writer, base) = video_track("screen");
        let (pos, vp) = providers(0.0, 0.0, None);
        let mut compositor = FrameCompositor::new(base, Arc::new(pos), Arc::new(vp));
        base_writer.publish(VideoFrame::solid(64, 48, [5, 5, 5, 255]));

        let first = compositor.tick().unwrap();
        let first_ptr = Arc::as_ptr(&first);
        drop(first);
        let second = compositor.tick().unwrap();
        assert_ne!(Arc::as_ptr(&second), first_ptr);
        drop(second);

        let third = compositor.tick().unwrap();
        assert_eq!(Arc::as_ptr(&third), first_ptr);
    }

    #[test]
    fn test_held_frame_is_not_redrawn() {
        let (base_writer, base) = video_track("screen");
        let (pos, vp) = providers(0.0, 0.0, None);
        let mut compositor = FrameCompositor::new(base, Arc::new(pos), Arc::new(vp));

        base_writer.publish(VideoFrame::solid(4, 4, [1, 1, 1, 255]));
        let held = compositor.tick().unwrap();
        base_writer.publish(VideoFrame::solid(4, 4, [9, 9, 9, 255]));
        compositor.tick();
        let latest = compositor.tick().unwrap();

        assert_eq!(held.pixel(0, 0), Some([1, 1, 1, 255]));
        assert_eq!(latest.pixel(0, 0), Some([9, 9, 9, 255]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_publishes_and_terminates() {
        let (base_writer, base) = video_track("screen");
        let (pos, vp) = providers(0.0, 0.0, None);
        base_writer.publish(VideoFrame::solid(4, 4, [1, 2, 3, 255]));

        let compositor = FrameCompositor::new(base, Arc::new(pos), Arc::new(vp));
        let (output, mut handle) = compositor.spawn(TARGET_FRAME_RATE);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output.current_frame().unwrap().pixel(0, 0), Some([1, 2, 3, 255]));

        handle.shutdown().await;
        assert!(output.is_ended());
        assert!(output.current_frame().is_none());
    }
}
