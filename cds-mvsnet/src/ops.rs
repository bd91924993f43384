//! Volume and map operations shared by the stage modules.
//!
//! Volumes follow the `(batch, depth, height, width)` layout, maps the
//! `(batch, height, width)` layout.

use ndarray::{s, Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis, Zip};

/// Guards every division by an accumulated weight.
pub(crate) const EPSILON: f32 = 1e-6;

/// Softmax over the depth axis of a `(B, D, H, W)` volume.
pub fn softmax_depth(scores: ArrayView4<f32>) -> Array4<f32> {
    let mut out = scores.to_owned();
    for mut lane in out.lanes_mut(Axis(1)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// Shannon entropy of every per-pixel distribution of a `(B, D, H, W)` volume.
///
/// Zero probabilities contribute nothing (`0 * ln 0 = 0`).
pub fn entropy_depth(prob: ArrayView4<f32>) -> Array3<f32> {
    prob.map_axis(Axis(1), |lane| {
        lane.iter()
            .filter(|&&p| p > 0.0)
            .map(|&p| -p * p.ln())
            .sum()
    })
}

/// Index and value of the first maximum of a lane.
pub(crate) fn argmax(lane: ArrayView1<f32>) -> (usize, f32) {
    lane.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Source taps of one output coordinate for half-pixel aligned bilinear resampling.
#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

fn taps(input: usize, output: usize) -> Vec<Tap> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|dst| {
            let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
            let lo = (src.floor() as usize).min(input - 1);
            let hi = (lo + 1).min(input - 1);
            Tap {
                lo,
                hi,
                frac: src - lo as f32,
            }
        })
        .collect()
}

/// Bilinear resampling of `(B, H, W)` maps to `(B, height, width)`.
///
/// Pixel centers are aligned (`align_corners = false`), which keeps a constant map
/// constant and never produces values outside the range of the input.
pub fn resize_bilinear(map: ArrayView3<f32>, height: usize, width: usize) -> Array3<f32> {
    let (batch, in_h, in_w) = map.dim();
    if (in_h, in_w) == (height, width) {
        return map.to_owned();
    }
    debug_assert!(in_h > 0 && in_w > 0, "cannot resample an empty map");
    let ys = taps(in_h, height);
    let xs = taps(in_w, width);
    Array3::from_shape_fn((batch, height, width), |(b, y, x)| {
        let ty = ys[y];
        let tx = xs[x];
        let top = map[[b, ty.lo, tx.lo]] * (1.0 - tx.frac) + map[[b, ty.lo, tx.hi]] * tx.frac;
        let bottom = map[[b, ty.hi, tx.lo]] * (1.0 - tx.frac) + map[[b, ty.hi, tx.hi]] * tx.frac;
        top * (1.0 - ty.frac) + bottom * ty.frac
    })
}

/// Bilinear resampling of every channel plane of a `(B, C, H, W)` tensor.
pub fn resize_planes(planes: ArrayView4<f32>, height: usize, width: usize) -> Array4<f32> {
    let (batch, channels, in_h, in_w) = planes.dim();
    if (in_h, in_w) == (height, width) {
        return planes.to_owned();
    }
    let mut out = Array4::zeros((batch, channels, height, width));
    for (mut out_b, in_b) in out.outer_iter_mut().zip(planes.outer_iter()) {
        let resized = resize_bilinear(in_b, height, width);
        out_b.assign(&resized);
    }
    out
}

/// Averages non-overlapping `factor x factor` blocks of a `(B, C, H, W)` tensor.
///
/// Trailing rows and columns that do not fill a block are dropped.
pub fn area_pool(planes: ArrayView4<f32>, factor: usize) -> Array4<f32> {
    if factor == 1 {
        return planes.to_owned();
    }
    let (batch, channels, in_h, in_w) = planes.dim();
    let (height, width) = (in_h / factor, in_w / factor);
    let norm = 1.0 / (factor * factor) as f32;
    let mut out = Array4::zeros((batch, channels, height, width));
    for b in 0..batch {
        for c in 0..channels {
            let plane = planes.slice(s![b, c, ..height * factor, ..width * factor]);
            Zip::from(out.slice_mut(s![b, c, .., ..]))
                .and(plane.exact_chunks((factor, factor)))
                .for_each(|o, block| *o = block.sum() * norm);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;

    #[test]
    fn softmax_sums_to_one() {
        let scores = Array::from_shape_fn((2, 5, 3, 4), |(b, d, y, x)| {
            (b as f32 - d as f32 * 3.0 + y as f32 * 0.5 - x as f32).sin() * 40.0
        });
        let prob = softmax_depth(scores.view());
        for lane in prob.lanes(Axis(1)) {
            assert_relative_eq!(lane.sum(), 1.0, epsilon = 1e-5);
            assert!(lane.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn entropy_of_uniform_and_peaked() {
        let uniform = Array4::from_elem((1, 4, 1, 1), 0.25f32);
        assert_relative_eq!(entropy_depth(uniform.view())[[0, 0, 0]], 4f32.ln(), epsilon = 1e-6);
        let mut peaked = Array4::zeros((1, 4, 1, 1));
        peaked[[0, 2, 0, 0]] = 1.0f32;
        let entropy = entropy_depth(peaked.view())[[0, 0, 0]];
        assert!(entropy.is_finite());
        assert_relative_eq!(entropy, 0.0);
    }

    #[test]
    fn resize_keeps_constant_maps() {
        let map = Array3::from_elem((2, 4, 6), 7.5f32);
        let up = resize_bilinear(map.view(), 8, 12);
        assert!(up.iter().all(|&v| (v - 7.5).abs() < 1e-6));
    }

    #[test]
    fn resize_matches_half_pixel_convention() {
        // A 2 pixel ramp upsampled by 2 gives the classic quarter-pixel interpolation.
        let map = Array3::from_shape_vec((1, 1, 2), vec![0.0f32, 4.0]).unwrap();
        let up = resize_bilinear(map.view(), 1, 4);
        let expected = [0.0, 1.0, 3.0, 4.0];
        for (&v, &e) in up.iter().zip(expected.iter()) {
            assert_relative_eq!(v, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn area_pool_averages_blocks() {
        let planes = Array::from_shape_fn((1, 1, 4, 5), |(_, _, y, x)| (y * 5 + x) as f32);
        let pooled = area_pool(planes.view(), 2);
        assert_eq!(pooled.dim(), (1, 1, 2, 2));
        assert_relative_eq!(pooled[[0, 0, 0, 0]], (0.0 + 1.0 + 5.0 + 6.0) / 4.0);
        assert_relative_eq!(pooled[[0, 0, 1, 1]], (12.0 + 13.0 + 17.0 + 18.0) / 4.0);
    }

    #[test]
    fn argmax_takes_first_peak() {
        let lane = ndarray::arr1(&[0.1f32, 0.4, 0.4, 0.1]);
        assert_eq!(argmax(lane.view()), (1, 0.4));
    }
}
