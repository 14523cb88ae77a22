//! Normalized (0-999) to pixel coordinate mapping.
//!
//! Planners speak a resolution-independent 0-999 grid. Everything handed to a
//! [`DisplayController`](crate::agent::DisplayController) is pixel-space, and
//! this module is the only place the two meet.

use serde::{Deserialize, Serialize};

/// Upper bound of the normalized grid (inclusive).
pub const NORMALIZED_MAX: u16 = 999;

/// A point on the normalized 0-999 grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormPoint {
    pub x: u16,
    pub y: u16,
}

impl NormPoint {
    /// Build a point from raw planner values, clamping each axis into the grid.
    pub fn clamped(x: i64, y: i64) -> Self {
        Self {
            x: clamp_normalized(x),
            y: clamp_normalized(y),
        }
    }
}

/// A point in screen pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: u32,
    pub y: u32,
}

pub fn clamp_normalized(v: i64) -> u16 {
    v.clamp(0, NORMALIZED_MAX as i64) as u16
}

/// Map one normalized axis value onto `extent` pixels.
///
/// 0 maps to pixel 0 and 999 maps to `extent - 1`; results round half away
/// from zero and never leave `[0, extent - 1]`.
pub fn denormalize(value: u16, extent: u32) -> u32 {
    if extent == 0 {
        return 0;
    }
    let value = value.min(NORMALIZED_MAX) as f64;
    let last = (extent - 1) as f64;
    let px = (value / NORMALIZED_MAX as f64 * last).round();
    (px as u32).min(extent - 1)
}

/// Map a normalized point against the dimensions of a specific capture.
pub fn to_pixels(point: NormPoint, width: u32, height: u32) -> PixelPoint {
    PixelPoint {
        x: denormalize(point.x, width),
        y: denormalize(point.y, height),
    }
}
