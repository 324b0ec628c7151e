//! Overlay geometry and pixel drawing
//!
//! Maps the UI-space bubble onto the base frame and draws it: a circular,
//! horizontally mirrored crop of the overlay frame plus a thin translucent
//! ring. Positions are never clamped; anything outside the canvas is clipped
//! per pixel, so the bubble may sit partially off-canvas.

use crate::capture::media::VideoFrame;
use crate::capture::traits::{OverlayPosition, Resolution, ViewportSize};
use serde::Serialize;

/// On-screen diameter of the bubble in UI pixels
pub const DEFAULT_BUBBLE_SIZE: f64 = 200.0;

/// Ring stroke width in UI pixels
pub const RING_WIDTH: f64 = 3.0;

/// White at roughly 40% opacity
pub const RING_COLOR: [u8; 4] = [255, 255, 255, 102];

/// Where the bubble lands on the base frame, in base pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayLayout {
    pub center_x: f64,
    pub center_y: f64,
    pub diameter: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl OverlayLayout {
    pub fn radius(&self) -> f64 {
        self.diameter / 2.0
    }
}

fn axis_scale(base: u32, viewport: Option<f64>) -> f64 {
    match viewport {
        Some(v) if v > 0.0 && v.is_finite() => base as f64 / v,
        _ => 1.0,
    }
}

/// Compute the bubble layout for one frame.
///
/// The diameter follows the horizontal scale only; the center is scaled per axis.
pub fn overlay_layout(
    base: Resolution,
    viewport: Option<ViewportSize>,
    position: OverlayPosition,
    bubble_size: f64,
) -> OverlayLayout {
    let scale_x = axis_scale(base.width, viewport.map(|v| v.width));
    let scale_y = axis_scale(base.height, viewport.map(|v| v.height));

    OverlayLayout {
        center_x: position.x * scale_x,
        center_y: position.y * scale_y,
        diameter: bubble_size * scale_x,
        scale_x,
        scale_y,
    }
}

/// Replace the canvas contents with the base frame.
/// Both frames must share the same resolution.
pub fn draw_base(canvas: &mut VideoFrame, base: &VideoFrame) -> bool {
    if canvas.width != base.width || canvas.height != base.height {
        return false;
    }
    if canvas.data.len() != base.data.len() {
        return false;
    }
    canvas.data.copy_from_slice(&base.data);
    canvas.timestamp_ms = base.timestamp_ms;
    true
}

/// Pixel bounds of the circle's bounding box, clipped to the canvas
fn clipped_bounds(canvas: &VideoFrame, layout: &OverlayLayout, pad: f64) -> Option<(u32, u32, u32, u32)> {
    let r = layout.radius() + pad;
    let x0 = (layout.center_x - r).floor().max(0.0);
    let y0 = (layout.center_y - r).floor().max(0.0);
    let x1 = (layout.center_x + r).ceil().min(canvas.width as f64);
    let y1 = (layout.center_y + r).ceil().min(canvas.height as f64);

    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
}

/// Draw the overlay frame inside the bubble circle, mirrored horizontally.
///
/// The overlay is center-cropped to a square before sampling so that a
/// non-square camera is never stretched.
pub fn draw_circular_overlay(canvas: &mut VideoFrame, overlay: &VideoFrame, layout: &OverlayLayout) {
    if !overlay.is_valid() || layout.diameter <= 0.0 {
        return;
    }
    let Some((x0, y0, x1, y1)) = clipped_bounds(canvas, layout, 0.0) else {
        return;
    };

    let side = overlay.width.min(overlay.height);
    let crop_x = (overlay.width - side) / 2;
    let crop_y = (overlay.height - side) / 2;

    let r = layout.radius();
    let r2 = r * r;
    let left = layout.center_x - r;
    let top = layout.center_y - r;

    for py in y0..y1 {
        let fy = py as f64 + 0.5;
        let dy = fy - layout.center_y;

        for px in x0..x1 {
            let fx = px as f64 + 0.5;
            let dx = fx - layout.center_x;
            if dx * dx + dy * dy > r2 {
                continue;
            }

            // Mirror: the left edge of the bubble samples the right edge of the source
            let u = 1.0 - (fx - left) / layout.diameter;
            let v = (fy - top) / layout.diameter;

            let sx = crop_x + ((u * side as f64) as u32).min(side - 1);
            let sy = crop_y + ((v * side as f64) as u32).min(side - 1);

            let src_idx = (sy as usize * overlay.width as usize + sx as usize) * 4;
            let dst_idx = (py as usize * canvas.width as usize + px as usize) * 4;

            if src_idx + 3 >= overlay.data.len() || dst_idx + 3 >= canvas.data.len() {
                continue;
            }

            canvas.data[dst_idx] = overlay.data[src_idx];
            canvas.data[dst_idx + 1] = overlay.data[src_idx + 1];
            canvas.data[dst_idx + 2] = overlay.data[src_idx + 2];
            canvas.data[dst_idx + 3] = 255;
        }
    }
}

/// Alpha-blend a ring of `width` pixels centered on the bubble's edge
pub fn draw_ring(canvas: &mut VideoFrame, layout: &OverlayLayout, width: f64, color: [u8; 4]) {
    if width <= 0.0 || layout.diameter <= 0.0 {
        return;
    }
    let half = width / 2.0;
    let Some((x0, y0, x1, y1)) = clipped_bounds(canvas, layout, half) else {
        return;
    };

    let r = layout.radius();
    let inner = (r - half).max(0.0);
    let outer = r + half;
    let alpha = color[3] as f32 / 255.0;

    for py in y0..y1 {
        let dy = py as f64 + 0.5 - layout.center_y;
        for px in x0..x1 {
            let dx = px as f64 + 0.5 - layout.center_x;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist < inner || dist > outer {
                continue;
            }

            let idx = (py as usize * canvas.width as usize + px as usize) * 4;
            if idx + 3 >= canvas.data.len() {
                continue;
            }

            for c in 0..3 {
                let dst = canvas.data[idx + c] as f32;
                let src = color[c] as f32;
                let out = src * alpha + dst * (1.0 - alpha);
                canvas.data[idx + c] = out.clamp(0.0, 255.0) as u8;
            }
            canvas.data[idx + 3] = 255;
        }
    }
}
