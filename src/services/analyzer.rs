//! Frame analysis - reduce a frame pair to the per-tick signals
//!
//! `FrameAnalyzer` is the seam the control loop calls; `RegionAnalyzer` is the
//! production implementation. It works on BGR24 frames:
//! - motion: gradient-based least squares (Lucas-Kanade) solved per tile
//!   inside a region and averaged, giving the region-mean motion vector
//! - color: OpenCV-style 8-bit HSV ranges (H 0-179, S/V 0-255)
//! - brightness: binary threshold of the gray level

use crate::domain::{Frame, HsvBounds, Rect, SignalSample};
use crate::infra::Config;
use thiserror::Error;

/// Side of the square tiles the motion solve runs on (pixels)
const FLOW_TILE: u32 = 15;
/// Tiles whose structure tensor is this ill-conditioned carry no motion
const MIN_EIGENVALUE: f64 = 1.0;
/// Edge tiles smaller than this many pixels are skipped
const MIN_TILE_AREA: u64 = (FLOW_TILE * FLOW_TILE / 4) as u64;

#[derive(Debug, Error, PartialEq)]
pub enum AnalyzerError {
    #[error("frame buffer does not match {width}x{height} BGR24")]
    Malformed { width: u32, height: u32 },
    #[error("frame size changed from {previous:?} to {current:?}")]
    SizeMismatch { previous: (u32, u32), current: (u32, u32) },
    #[error("region {0} lies outside the frame")]
    RegionOutside(&'static str),
}

/// Region and threshold parameters for one tick
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerParams {
    pub flow_region: Rect,
    pub conveyor_region: Rect,
    pub color_region_1: Rect,
    pub color_region_2: Rect,
    pub bounds_1: HsvBounds,
    pub bounds_2: HsvBounds,
    pub brightness_threshold: u8,
}

impl AnalyzerParams {
    pub fn from_config(config: &Config) -> Self {
        let regions = config.regions();
        let color = config.color();
        Self {
            flow_region: regions.flow,
            conveyor_region: regions.conveyor,
            color_region_1: regions.color_1,
            color_region_2: regions.color_2,
            bounds_1: color.bounds_1,
            bounds_2: color.bounds_2,
            brightness_threshold: color.brightness_threshold,
        }
    }
}

/// Maps a frame pair plus parameters to one signal sample
pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, previous: &Frame, current: &Frame, params: &AnalyzerParams)
        -> Result<SignalSample, AnalyzerError>;
}

/// Single-channel 8-bit image
#[derive(Debug, Clone)]
struct GrayImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl GrayImage {
    fn from_frame(frame: &Frame) -> Self {
        let data = frame.data.chunks_exact(3).map(|bgr| gray_level(bgr[0], bgr[1], bgr[2])).collect();
        Self { width: frame.width, height: frame.height, data }
    }

    #[inline]
    fn at(&self, x: u32, y: u32) -> f64 {
        self.data[(y * self.width + x) as usize] as f64
    }
}

/// Identity of a frame for the gray cache
#[derive(Debug, Clone, Copy, PartialEq)]
struct FrameKey {
    seq: u64,
    timestamp_bits: u64,
}

impl FrameKey {
    fn of(frame: &Frame) -> Self {
        Self { seq: frame.seq, timestamp_bits: frame.timestamp.to_bits() }
    }
}

/// Region-mean analyzer over BGR24 frames
#[derive(Debug, Default)]
pub struct RegionAnalyzer {
    /// Gray image of the last `current` frame; becomes next tick's `previous`
    cached: Option<(FrameKey, GrayImage)>,
}

impl RegionAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn gray_for(&mut self, frame: &Frame) -> GrayImage {
        let key = FrameKey::of(frame);
        match &self.cached {
            Some((cached_key, gray)) if *cached_key == key => gray.clone(),
            _ => GrayImage::from_frame(frame),
        }
    }
}

impl FrameAnalyzer for RegionAnalyzer {
    fn analyze(
        &mut self,
        previous: &Frame,
        current: &Frame,
        params: &AnalyzerParams,
    ) -> Result<SignalSample, AnalyzerError> {
        for frame in [previous, current] {
            if !frame.is_well_formed() {
                return Err(AnalyzerError::Malformed { width: frame.width, height: frame.height });
            }
        }
        if (previous.width, previous.height) != (current.width, current.height) {
            return Err(AnalyzerError::SizeMismatch {
                previous: (previous.width, previous.height),
                current: (current.width, current.height),
            });
        }
        let (w, h) = (current.width, current.height);
        let clamp = |rect: &Rect, name: &'static str| rect.clamp_to(w, h).ok_or(AnalyzerError::RegionOutside(name));
        let flow_region = clamp(&params.flow_region, "flow")?;
        let conveyor_region = clamp(&params.conveyor_region, "conveyor")?;
        let color_region_1 = clamp(&params.color_region_1, "color_1")?;
        let color_region_2 = clamp(&params.color_region_2, "color_2")?;

        let prev_gray = self.gray_for(previous);
        let curr_gray = GrayImage::from_frame(current);

        let (velocity_x, velocity_y) = region_flow(&prev_gray, &curr_gray, &flow_region);
        let (conv_x, conv_y) = region_flow(&prev_gray, &curr_gray, &conveyor_region);
        let intensity_1 = bright_mask_mean(current, &color_region_1, &params.bounds_1, params.brightness_threshold);
        let intensity_2 = masked_gray_mean(current, &color_region_2, &params.bounds_2);

        self.cached = Some((FrameKey::of(current), curr_gray));

        Ok(SignalSample {
            velocity_x,
            velocity_y,
            conveyor_velocity: (conv_x + conv_y) / 2.0,
            intensity_1,
            intensity_2,
            timestamp: current.timestamp,
        })
    }
}

/// ITU-R 601 luma, rounded like OpenCV's 8-bit BGR2GRAY
#[inline]
pub fn gray_level(b: u8, g: u8, r: u8) -> u8 {
    (0.114 * b as f64 + 0.587 * g as f64 + 0.299 * r as f64).round().min(255.0) as u8
}

/// 8-bit HSV with H in 0-179 (half degrees), as OpenCV stores it
pub fn bgr_to_hsv(b: u8, g: u8, r: u8) -> [u8; 3] {
    let (bf, gf, rf) = (b as f64, g as f64, r as f64);
    let v = bf.max(gf).max(rf);
    let min = bf.min(gf).min(rf);
    let diff = v - min;
    let s = if v > 0.0 { 255.0 * diff / v } else { 0.0 };
    let mut hue = if diff == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / diff
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    let h = (hue / 2.0).round() as u32 % 180;
    [h as u8, s.round().min(255.0) as u8, v as u8]
}

/// Mean motion over `region`, averaged across well-conditioned tiles
fn region_flow(prev: &GrayImage, next: &GrayImage, region: &Rect) -> (f64, f64) {
    let [x0, y0] = region.upper_left;
    let [x1, y1] = region.lower_right;
    let (mut sum_u, mut sum_v, mut tiles) = (0.0, 0.0, 0u32);

    let mut ty = y0;
    while ty < y1 {
        let mut tx = x0;
        while tx < x1 {
            let tile = Rect::new(tx, ty, (tx + FLOW_TILE).min(x1), (ty + FLOW_TILE).min(y1));
            if let Some((u, v)) = tile_flow(prev, next, &tile) {
                sum_u += u;
                sum_v += v;
                tiles += 1;
            }
            tx += FLOW_TILE;
        }
        ty += FLOW_TILE;
    }

    if tiles == 0 {
        (0.0, 0.0)
    } else {
        (sum_u / tiles as f64, sum_v / tiles as f64)
    }
}

/// Least-squares motion of one tile from spatial and temporal gradients
fn tile_flow(prev: &GrayImage, next: &GrayImage, tile: &Rect) -> Option<(f64, f64)> {
    if tile.area() < MIN_TILE_AREA {
        return None;
    }
    let (w, h) = (prev.width, prev.height);
    let (mut sxx, mut sxy, mut syy, mut sxt, mut syt) = (0.0, 0.0, 0.0, 0.0, 0.0);

    for y in tile.upper_left[1]..tile.lower_right[1] {
        let (ym, yp) = (y.saturating_sub(1), (y + 1).min(h - 1));
        for x in tile.upper_left[0]..tile.lower_right[0] {
            let (xm, xp) = (x.saturating_sub(1), (x + 1).min(w - 1));
            let dx = (xp - xm).max(1) as f64;
            let dy = (yp - ym).max(1) as f64;
            // Gradients on the average of both frames
            let ix = ((prev.at(xp, y) + next.at(xp, y)) - (prev.at(xm, y) + next.at(xm, y))) / (2.0 * dx);
            let iy = ((prev.at(x, yp) + next.at(x, yp)) - (prev.at(x, ym) + next.at(x, ym))) / (2.0 * dy);
            let it = next.at(x, y) - prev.at(x, y);
            sxx += ix * ix;
            sxy += ix * iy;
            syy += iy * iy;
            sxt += ix * it;
            syt += iy * it;
        }
    }

    let n = tile.area() as f64;
    let (a, b, d) = (sxx / n, sxy / n, syy / n);
    let det = a * d - b * b;
    let trace = a + d;
    let min_eig = trace / 2.0 - ((trace * trace / 4.0) - det).max(0.0).sqrt();
    if min_eig < MIN_EIGENVALUE || det.abs() < f64::EPSILON {
        return None;
    }
    let (bx, by) = (-sxt / n, -syt / n);
    let u = (d * bx - b * by) / det;
    let v = (a * by - b * bx) / det;
    if u.is_finite() && v.is_finite() {
        Some((u, v))
    } else {
        None
    }
}

/// Region mean (0-255) of pixels inside `bounds` whose gray level reaches `threshold`
fn bright_mask_mean(frame: &Frame, region: &Rect, bounds: &HsvBounds, threshold: u8) -> f64 {
    region_mean(region, |x, y| {
        let [b, g, r] = frame.bgr(x, y);
        if bounds.contains(bgr_to_hsv(b, g, r)) && gray_level(b, g, r) > threshold {
            255.0
        } else {
            0.0
        }
    })
}

/// Region mean gray level of the image masked to `bounds` (masked-out pixels count as 0)
fn masked_gray_mean(frame: &Frame, region: &Rect, bounds: &HsvBounds) -> f64 {
    region_mean(region, |x, y| {
        let [b, g, r] = frame.bgr(x, y);
        if bounds.contains(bgr_to_hsv(b, g, r)) {
            gray_level(b, g, r) as f64
        } else {
            0.0
        }
    })
}

fn region_mean(region: &Rect, value: impl Fn(u32, u32) -> f64) -> f64 {
    let area = region.area();
    if area == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for y in region.upper_left[1]..region.lower_right[1] {
        for x in region.upper_left[0]..region.lower_right[0] {
            sum += value(x, y);
        }
    }
    sum / area as f64
}
