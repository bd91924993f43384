//! Side outputs that supervise the cascade during training.

use crate::error::ensure_shape;
use crate::ops::EPSILON;
use crate::Result;
use ndarray::{concatenate, s, Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis, Zip};

/// Expected depth of a coarse probability volume restricted to the window of the next stage.
///
/// `prob` and `values` are the `(B, D, h, w)` probability volume and hypotheses of the
/// coarse stage, `lower` and `upper` the `(B, h, w)` window of the next stage at the
/// same resolution. The mass of the hypotheses inside the window is renormalized before
/// taking the expectation; without any mass the window center is used.
pub fn loss_strategy_depth(
    prob: ArrayView4<f32>,
    values: ArrayView4<f32>,
    lower: ArrayView3<f32>,
    upper: ArrayView3<f32>,
) -> Result<Array3<f32>> {
    ensure_shape("hypotheses", prob.shape(), values.shape())?;
    let (b, _, h, w) = prob.dim();
    ensure_shape("window lower bound", &[b, h, w], lower.shape())?;
    ensure_shape("window upper bound", &[b, h, w], upper.shape())?;
    let mut depth = Array3::zeros((b, h, w));
    Zip::from(&mut depth)
        .and(prob.lanes(Axis(1)))
        .and(values.lanes(Axis(1)))
        .and(&lower)
        .and(&upper)
        .for_each(|depth, prob, values, &lo, &hi| {
            let (mass, moment) = prob
                .iter()
                .zip(values.iter())
                .filter(|&(_, &d)| d >= lo && d <= hi)
                .fold((0.0, 0.0), |(m, e), (&p, &d)| (m + p, e + p * d));
            *depth = if mass > EPSILON {
                (moment / mass).max(lo).min(hi)
            } else {
                0.5 * (lo + hi)
            };
        });
    Ok(depth)
}

/// One-hot style target marking the hypotheses close to the ground-truth depth.
///
/// A hypothesis is marked when `|hyp - gt| / (base_interval * ratio) < 0.5 / ratio`.
/// An all-ones channel is appended, giving `(B, D + 1, h, w)`.
pub fn feature_target(
    hypotheses: ArrayView4<f32>,
    gt: ArrayView3<f32>,
    base_interval: ArrayView1<f32>,
    ratio: f32,
) -> Result<Array4<f32>> {
    let (b, _, h, w) = hypotheses.dim();
    ensure_shape("ground-truth depth", &[b, h, w], gt.shape())?;
    ensure_shape("base interval", &[b], base_interval.shape())?;
    let mut target = Array4::zeros(hypotheses.raw_dim());
    for (i, &interval) in base_interval.iter().enumerate() {
        let gt = gt.slice(s![i, .., ..]);
        let scale = interval * ratio;
        let threshold = 0.5 / ratio;
        Zip::from(target.slice_mut(s![i, .., .., ..]).lanes_mut(Axis(0)))
            .and(hypotheses.slice(s![i, .., .., ..]).lanes(Axis(0)))
            .and(&gt)
            .for_each(|mut target, hyp, &gt| {
                Zip::from(&mut target).and(&hyp).for_each(|t, &d| {
                    if ((d - gt) / scale).abs() < threshold {
                        *t = 1.0;
                    }
                });
            });
    }
    let ones = Array4::ones((b, 1, h, w));
    Ok(concatenate(Axis(1), &[target.view(), ones.view()])?)
}
