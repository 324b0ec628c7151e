//! Video compositing
//!
//! Layers the camera bubble onto the screen capture at a fixed cadence.

pub mod overlay;
pub mod render;

pub use overlay::{overlay_layout, OverlayLayout, DEFAULT_BUBBLE_SIZE};
pub use render::{CompositorHandle, FrameCompositor, TARGET_FRAME_RATE};
