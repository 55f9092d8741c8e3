//! Shared types for the cycle counter

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Bytes per pixel for BGR24 frames
pub const BGR_CHANNELS: usize = 3;

/// One captured sensor image (BGR24, row-major, no padding)
///
/// Pixel data is reference counted so a frame can sit in the hand-off slot
/// and be read by the control loop without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Wall clock capture time (epoch seconds)
    pub timestamp: f64,
    /// Monotonic capture time, used for staleness checks
    pub captured_at: Instant,
    /// Sequence number within one acquisition worker's lifetime
    pub seq: u64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, timestamp: f64) -> Self {
        Self { data: data.into(), width, height, timestamp, captured_at: Instant::now(), seq: 0 }
    }

    /// Expected buffer length for the given dimensions
    #[inline]
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BGR_CHANNELS
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == Self::expected_len(self.width, self.height)
    }

    /// BGR triple at (x, y). Caller guarantees bounds.
    #[inline]
    pub fn bgr(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Per-tick signals reduced from a frame pair
///
/// Produced once per tick and consumed immediately by the cycle detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalSample {
    /// Flow-region mean horizontal motion; feeds the box indicator window
    pub velocity_x: f64,
    /// Flow-region mean vertical motion (diagnostic only)
    pub velocity_y: f64,
    /// Conveyor-region mean motion; drives the hysteresis state machine
    pub conveyor_velocity: f64,
    pub intensity_1: f64,
    pub intensity_2: f64,
    /// Capture time of the newer frame (epoch seconds)
    pub timestamp: f64,
}

impl SignalSample {
    /// Sample with only the conveyor velocity and timestamp set
    pub fn at(timestamp: f64, conveyor_velocity: f64) -> Self {
        Self {
            velocity_x: 0.0,
            velocity_y: 0.0,
            conveyor_velocity,
            intensity_1: 0.0,
            intensity_2: 0.0,
            timestamp,
        }
    }
}

/// Axis-aligned rectangle given as upper-left and lower-right corners (pixels)
///
/// The lower-right corner is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub upper_left: [u32; 2],
    pub lower_right: [u32; 2],
}

impl Rect {
    pub const fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { upper_left: [x0, y0], lower_right: [x1, y1] }
    }

    pub fn is_empty(&self) -> bool {
        self.lower_right[0] <= self.upper_left[0] || self.lower_right[1] <= self.upper_left[1]
    }

    /// Intersect with a `width` x `height` image. Returns None if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let clamped = Rect::new(
            self.upper_left[0].min(width),
            self.upper_left[1].min(height),
            self.lower_right[0].min(width),
            self.lower_right[1].min(height),
        );
        if clamped.is_empty() {
            None
        } else {
            Some(clamped)
        }
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.lower_right[0] - self.upper_left[0]) as u64
            * (self.lower_right[1] - self.upper_left[1]) as u64
    }
}

/// Inclusive HSV range (H 0-179, S 0-255, V 0-255)
///
/// A lower hue above the upper hue wraps through 179/0, which is how red
/// ranges are usually written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvBounds {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvBounds {
    pub const fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    #[inline]
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        let hue_ok = if self.lower[0] <= self.upper[0] {
            hsv[0] >= self.lower[0] && hsv[0] <= self.upper[0]
        } else {
            hsv[0] >= self.lower[0] || hsv[0] <= self.upper[0]
        };
        hue_ok && (1..3).all(|i| hsv[i] >= self.lower[i] && hsv[i] <= self.upper[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_clamp_and_area() {
        let rect = Rect::new(600, 340, 630, 360);
        assert_eq!(rect.area(), 600);
        assert_eq!(rect.clamp_to(620, 480), Some(Rect::new(600, 340, 620, 360)));
        assert_eq!(rect.clamp_to(500, 480), None);
        assert!(Rect::new(10, 10, 10, 20).is_empty());
    }

    #[test]
    fn test_hsv_bounds_inclusive() {
        let bounds = HsvBounds::new([13, 23, 244], [35, 255, 255]);
        assert!(bounds.contains([13, 23, 244]));
        assert!(bounds.contains([35, 255, 255]));
        assert!(!bounds.contains([12, 100, 250]));
        assert!(!bounds.contains([20, 100, 243]));
    }

    #[test]
    fn test_hsv_bounds_hue_wraps() {
        let red = HsvBounds::new([170, 50, 50], [10, 255, 255]);
        assert!(red.contains([175, 100, 100]));
        assert!(red.contains([5, 100, 100]));
        assert!(!red.contains([90, 100, 100]));
    }

    #[test]
    fn test_frame_well_formed() {
        let frame = Frame::new(vec![0u8; 4 * 2 * 3], 4, 2, 0.0);
        assert!(frame.is_well_formed());
        let short = Frame::new(vec![0u8; 5], 4, 2, 0.0);
        assert!(!short.is_well_formed());
    }
}
