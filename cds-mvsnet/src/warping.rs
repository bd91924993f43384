//! Plane-sweep warping of source features into the reference view.

use crate::error::ensure_shape;
use crate::{MvsError, Result};
use mvs_epipolar::CameraMatrix;
use nalgebra::{Matrix3, Vector3};
use ndarray::{s, Array5, ArrayView2, ArrayView4};

/// Points closer than this to the source image plane are treated as invisible.
const MIN_PROJECTED_DEPTH: f32 = 1e-6;

/// Bilinear sample weights of one sub-pixel location with zero padding.
///
/// Taps that fall outside of the image are dropped, which is equivalent to sampling
/// a zero border.
#[derive(Debug, Clone, Copy, Default)]
struct Footprint {
    taps: [(usize, usize, f32); 4],
    len: usize,
}

impl Footprint {
    fn new(x: f32, y: f32, height: usize, width: usize) -> Self {
        let mut footprint = Footprint::default();
        // Also rejects NaN.
        if !(x > -1.0 && y > -1.0 && x < width as f32 && y < height as f32) {
            return footprint;
        }
        let (x0, y0) = (x.floor(), y.floor());
        let (fx, fy) = (x - x0, y - y0);
        let (x0, y0) = (x0 as isize, y0 as isize);
        for (dy, wy) in [(0, 1.0 - fy), (1, fy)] {
            for (dx, wx) in [(0, 1.0 - fx), (1, fx)] {
                let (yy, xx) = (y0 + dy, x0 + dx);
                let w = wy * wx;
                if w > 0.0 && yy >= 0 && xx >= 0 && (yy as usize) < height && (xx as usize) < width
                {
                    footprint.taps[footprint.len] = (yy as usize, xx as usize, w);
                    footprint.len += 1;
                }
            }
        }
        footprint
    }

    #[inline]
    fn sample(&self, plane: &ArrayView2<f32>) -> f32 {
        self.taps[..self.len]
            .iter()
            .map(|&(y, x, w)| plane[[y, x]] * w)
            .sum()
    }
}

/// Warps `(B, C, H, W)` source features into the reference view for every depth hypothesis.
///
/// For the reference pixel `(x, y)` at hypothesis `d`, the warped feature is the source
/// feature at the pixel where `P_src * inverse(P_ref) * (x d, y d, d, 1)` lands. The
/// result is `(B, C, D, H, W)` with `D` taken from the `(B, D, H, W)` hypotheses, which
/// may differ per pixel. Locations outside the source image, or behind the source
/// camera, read zero.
pub fn warp_features(
    source: ArrayView4<f32>,
    source_cameras: &[CameraMatrix],
    reference_cameras: &[CameraMatrix],
    hypotheses: ArrayView4<f32>,
) -> Result<Array5<f32>> {
    let (batch, channels, height, width) = source.dim();
    let (hyp_batch, ndepth, hyp_h, hyp_w) = hypotheses.dim();
    ensure_shape(
        "depth hypotheses",
        &[batch, ndepth, height, width],
        &[hyp_batch, ndepth, hyp_h, hyp_w],
    )?;
    ensure_shape("source cameras", &[batch], &[source_cameras.len()])?;
    ensure_shape("reference cameras", &[batch], &[reference_cameras.len()])?;

    let mut warped = Array5::zeros((batch, channels, ndepth, height, width));
    for b in 0..batch {
        let relative = source_cameras[b]
            .relative_to(&reference_cameras[b])
            .ok_or(MvsError::SingularCamera(b))?;
        let rotation: Matrix3<f32> = relative.fixed_slice::<3, 3>(0, 0).into_owned().cast();
        let translation: Vector3<f32> = relative.fixed_slice::<3, 1>(0, 3).into_owned().cast();
        let sample = source.slice(s![b, .., .., ..]);
        let planes: Vec<ArrayView2<f32>> = sample.outer_iter().collect();
        for y in 0..height {
            for x in 0..width {
                let ray = rotation * Vector3::new(x as f32, y as f32, 1.0);
                for d in 0..ndepth {
                    let point = ray * hypotheses[[b, d, y, x]] + translation;
                    if point.z <= MIN_PROJECTED_DEPTH {
                        continue;
                    }
                    let footprint =
                        Footprint::new(point.x / point.z, point.y / point.z, height, width);
                    if footprint.len == 0 {
                        continue;
                    }
                    for (c, plane) in planes.iter().enumerate() {
                        warped[[b, c, d, y, x]] = footprint.sample(plane);
                    }
                }
            }
        }
    }
    Ok(warped)
}
