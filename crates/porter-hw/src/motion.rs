//! Frame-difference motion detection.
//!
//! Each call samples the frame on a fixed pixel grid and compares it with
//! the sample retained from the previous call. A sampled pixel counts as
//! changed when the mean absolute RGB difference exceeds
//! `pixel_threshold`; motion is reported when the changed pixels exceed
//! `changed_fraction` of the sampled pixels. Exactly one previous sample is
//! kept and it is replaced on every call.

use crate::frame::{Frame, RGB_CHANNELS};
use serde::Deserialize;

/// Motion sensitivity. Lower thresholds trigger on smaller changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Per-pixel mean channel difference (0-255) above which a pixel has changed.
    pub pixel_threshold: u8,
    /// Fraction of sampled pixels that must change to report motion.
    pub changed_fraction: f32,
    /// Compare every `stride`-th pixel along both axes (1 = every pixel).
    pub stride: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 30,
            changed_fraction: 0.02,
            stride: 2,
        }
    }
}

/// Pixels sampled from one frame plus the geometry they were sampled at.
struct MotionSample {
    width: u32,
    height: u32,
    stride: usize,
    pixels: Vec<[u8; 3]>,
}

impl MotionSample {
    fn take(frame: &Frame, stride: usize) -> Self {
        let w = frame.width as usize;
        let h = frame.height as usize;
        let mut pixels = Vec::with_capacity(w.div_ceil(stride) * h.div_ceil(stride));

        for y in (0..h).step_by(stride) {
            for x in (0..w).step_by(stride) {
                let i = (y * w + x) * RGB_CHANNELS;
                if let Some(px) = frame.data.get(i..i + RGB_CHANNELS) {
                    pixels.push([px[0], px[1], px[2]]);
                }
            }
        }

        Self {
            width: frame.width,
            height: frame.height,
            stride,
            pixels,
        }
    }

    fn same_geometry(&self, other: &MotionSample) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.stride == other.stride
            && self.pixels.len() == other.pixels.len()
    }
}

/// Stateful motion detector for a single stream.
pub struct MotionDetector {
    config: MotionConfig,
    previous: Option<MotionSample>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Compare `frame` against the previous sample and retain it as the new baseline.
    ///
    /// Returns false on the first call, after [`reset`](Self::reset), and
    /// whenever the frame geometry differs from the baseline.
    pub fn sample(&mut self, frame: &Frame) -> bool {
        let current = MotionSample::take(frame, self.config.stride.max(1));

        let motion = match &self.previous {
            Some(previous) if previous.same_geometry(&current) => {
                let changed = count_changed(
                    &previous.pixels,
                    &current.pixels,
                    self.config.pixel_threshold,
                );
                let sampled = current.pixels.len();
                let motion = sampled > 0
                    && changed as f32 > self.config.changed_fraction * sampled as f32;
                tracing::trace!(changed, sampled, motion, "motion sample");
                motion
            }
            Some(_) => {
                tracing::debug!(
                    width = frame.width,
                    height = frame.height,
                    "frame geometry changed; re-baselining"
                );
                false
            }
            None => false,
        };

        self.previous = Some(current);
        motion
    }

    /// Drop the retained sample; the next call re-baselines.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }
}

/// Count pixels whose mean absolute channel difference exceeds `threshold`.
fn count_changed(previous: &[[u8; 3]], current: &[[u8; 3]], threshold: u8) -> usize {
    // mean > t  <=>  sum > 3t, kept in integers.
    let limit = threshold as u16 * 3;
    previous
        .iter()
        .zip(current)
        .filter(|(a, b)| {
            let sum: u16 = a
                .iter()
                .zip(b.iter())
                .map(|(&p, &c)| p.abs_diff(c) as u16)
                .sum();
            sum > limit
        })
        .count()
}
