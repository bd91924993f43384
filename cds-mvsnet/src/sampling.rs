//! Placement of the depth hypotheses of every stage.

use crate::config::SamplerConfig;
use crate::error::ensure_shape;
use crate::{MvsError, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip};

/// Per-pixel depth hypotheses together with the window they were drawn from.
#[derive(Debug, Clone)]
pub struct DepthRange {
    /// `(B, D, h, w)`, strictly increasing along the depth axis.
    pub samples: Array4<f32>,
    /// `(B, h, w)` first hypothesis.
    pub lower: Array3<f32>,
    /// `(B, h, w)` last hypothesis.
    pub upper: Array3<f32>,
    /// `(B, h, w)` spacing of consecutive hypotheses.
    pub interval: Array3<f32>,
}

/// Draws `D` evenly spaced hypotheses per pixel.
///
/// The first stage covers the whole depth range. Later stages cover a window around
/// the current estimate which grows with the uncertainty of that estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepthRangeSampler {
    config: SamplerConfig,
}

impl DepthRangeSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    /// The factor applied to the nominal window for an uncertainty of `u`.
    ///
    /// Monotonically non-decreasing, `min_scale` at zero uncertainty. NaN counts as zero.
    pub fn window_scale(&self, u: f32) -> f32 {
        let u = if u.is_nan() { 0.0 } else { u };
        let SamplerConfig {
            min_scale,
            max_scale,
            uncertainty_gain,
        } = self.config;
        (min_scale + uncertainty_gain * u).max(min_scale).min(max_scale)
    }

    /// Hypotheses spread uniformly over `[depth_min[b], depth_max[b]]` at every pixel.
    pub fn uniform(
        &self,
        depth_min: ArrayView1<f32>,
        depth_max: ArrayView1<f32>,
        ndepth: usize,
        height: usize,
        width: usize,
    ) -> Result<DepthRange> {
        let batch = depth_min.len();
        check_bounds(depth_min, depth_max, ndepth)?;
        let mut range = DepthRange::zeros(batch, ndepth, height, width);
        for b in 0..batch {
            let (lo, hi) = (depth_min[b], depth_max[b]);
            range.fill_batch(b, |_, _| (lo, hi));
        }
        Ok(range)
    }

    /// Hypotheses in a window around `current`, a `(B, h, w)` depth map.
    ///
    /// The nominal half-width of the window is `ndepth / 2 * interval_pixel[b]`. It is
    /// scaled by [`DepthRangeSampler::window_scale`] of the uncertainty when one is
    /// given, limited to the depth range and shifted to lie inside of it.
    pub fn around(
        &self,
        current: ArrayView3<f32>,
        ndepth: usize,
        interval_pixel: ArrayView1<f32>,
        uncertainty: Option<ArrayView3<f32>>,
        depth_min: ArrayView1<f32>,
        depth_max: ArrayView1<f32>,
    ) -> Result<DepthRange> {
        let (batch, height, width) = current.dim();
        ensure_shape("depth range", &[batch], depth_min.shape())?;
        ensure_shape("depth interval", &[batch], interval_pixel.shape())?;
        check_bounds(depth_min, depth_max, ndepth)?;
        if let Some(u) = uncertainty {
            ensure_shape("uncertainty", current.shape(), u.shape())?;
        }
        if let Some(&step) = interval_pixel.iter().find(|&&i| !(i > 0.0 && i.is_finite())) {
            return Err(MvsError::InvalidConfig(format!(
                "depth interval must be positive, got {}",
                step
            )));
        }

        let mut range = DepthRange::zeros(batch, ndepth, height, width);
        for b in 0..batch {
            let (min, max) = (depth_min[b], depth_max[b]);
            let nominal = ndepth as f32 / 2.0 * interval_pixel[b];
            let scale: Array2<f32> = match uncertainty {
                Some(u) => u.slice(s![b, .., ..]).mapv(|u| self.window_scale(u)),
                None => Array2::ones((height, width)),
            };
            let center = current.slice(s![b, .., ..]);
            range.fill_batch(b, |y, x| {
                let c = center[[y, x]];
                let c = if c.is_finite() { c } else { 0.5 * (min + max) };
                let span = (2.0 * nominal * scale[[y, x]]).min(max - min);
                shift_inside(c - 0.5 * span, span, min, max)
            });
        }
        Ok(range)
    }
}

impl DepthRange {
    fn zeros(batch: usize, ndepth: usize, height: usize, width: usize) -> Self {
        Self {
            samples: Array4::zeros((batch, ndepth, height, width)),
            lower: Array3::zeros((batch, height, width)),
            upper: Array3::zeros((batch, height, width)),
            interval: Array3::zeros((batch, height, width)),
        }
    }

    /// Fills batch element `b` with the window `window(y, x) = (lo, hi)` of every pixel.
    fn fill_batch(&mut self, b: usize, window: impl Fn(usize, usize) -> (f32, f32)) {
        let ndepth = self.samples.len_of(Axis(1));
        let mut samples = self.samples.slice_mut(s![b, .., .., ..]);
        Zip::indexed(samples.lanes_mut(Axis(0)))
            .and(self.lower.slice_mut(s![b, .., ..]))
            .and(self.upper.slice_mut(s![b, .., ..]))
            .and(self.interval.slice_mut(s![b, .., ..]))
            .for_each(|(y, x), lane, lower, upper, interval| {
                let (lo, hi) = window(y, x);
                *lower = lo;
                *upper = hi;
                *interval = (hi - lo) / (ndepth - 1) as f32;
                linspace_into(lane, lo, hi);
            });
    }
}

fn check_bounds(depth_min: ArrayView1<f32>, depth_max: ArrayView1<f32>, ndepth: usize) -> Result<()> {
    if ndepth < 2 {
        return Err(MvsError::InvalidConfig(format!(
            "at least 2 depth hypotheses are needed, got {}",
            ndepth
        )));
    }
    ensure_shape("depth range", depth_min.shape(), depth_max.shape())?;
    for (&min, &max) in depth_min.iter().zip(depth_max.iter()) {
        if !(min.is_finite() && max.is_finite() && max > min) {
            return Err(MvsError::InvalidDepthRange { min, max });
        }
    }
    Ok(())
}

/// Moves the window `[lo, lo + span]` into `[min, max]` without changing its width.
fn shift_inside(lo: f32, span: f32, min: f32, max: f32) -> (f32, f32) {
    if lo < min {
        (min, (min + span).min(max))
    } else if lo + span > max {
        ((max - span).max(min), max)
    } else {
        (lo, lo + span)
    }
}

fn linspace_into(mut lane: ArrayViewMut1<f32>, lo: f32, hi: f32) {
    let last = lane.len() - 1;
    let step = (hi - lo) / last as f32;
    for (i, v) in lane.iter_mut().enumerate() {
        *v = if i == last { hi } else { lo + i as f32 * step };
    }
}
