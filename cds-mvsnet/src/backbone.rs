//! Multi-scale feature extraction for the reference and source views.

use crate::layers::{Conv2d, ConvBnRelu};
use crate::ops::area_pool;
use crate::{MvsError, Result, NUM_STAGES};
use nalgebra::Vector3;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};
use rand::Rng;

/// Features of one view at one stage resolution.
#[derive(Debug, Clone)]
pub struct FeatureMap {
    /// `(B, C, h, w)`
    pub features: Array4<f32>,
    /// `(B)` summary of the normal curvature of the view.
    pub nc_sum: Array1<f32>,
    /// `(B, h, w)` normal curvature along the epipolar direction.
    pub nc_map: Array3<f32>,
}

/// Extracts a feature pyramid from a batch of images.
pub trait FeatureBackbone: Send + Sync {
    /// `images` is `(B, 3, H, W)`, `epipoles` holds one homogeneous epipole per batch
    /// element in pixel coordinates of `images`. The returned maps go from the coarsest
    /// to the finest stage.
    fn extract(
        &self,
        images: ArrayView4<f32>,
        epipoles: &[Vector3<f64>],
        temperature: f32,
    ) -> Result<[FeatureMap; NUM_STAGES]>;

    /// Channels of the features of every stage.
    fn out_channels(&self) -> [usize; NUM_STAGES];
}

#[derive(Debug, Clone)]
struct Level {
    scale: usize,
    stem: ConvBnRelu,
    head: Conv2d,
}

impl Level {
    fn new<R: Rng + ?Sized>(scale: usize, channels: usize, rng: &mut R) -> Self {
        Self {
            scale,
            stem: ConvBnRelu::new(3, channels, rng),
            head: Conv2d::new(channels, channels, 3, true, rng),
        }
    }

    fn extract(
        &self,
        images: ArrayView4<f32>,
        epipoles: &[Vector3<f64>],
        temperature: f32,
    ) -> Result<FeatureMap> {
        let pooled = area_pool(images, self.scale);
        let features = self.head.forward(self.stem.forward(pooled.view())?.view())?;
        let gray = pooled.mean_axis(Axis(1)).ok_or_else(|| {
            MvsError::InvalidConfig("images need at least one channel".into())
        })?;
        let (batch, height, width) = gray.dim();
        let mut nc_map = Array3::zeros((batch, height, width));
        for (b, epipole) in epipoles.iter().enumerate() {
            let curvature = epipolar_curvature(
                gray.index_axis(Axis(0), b),
                epipole,
                self.scale as f64,
                temperature,
            );
            nc_map.index_axis_mut(Axis(0), b).assign(&curvature);
        }
        let nc_sum = nc_map.sum_axis(Axis(2)).sum_axis(Axis(1)) / (height * width).max(1) as f32;
        Ok(FeatureMap {
            features,
            nc_sum,
            nc_map,
        })
    }
}

/// Unit direction from a pixel towards a homogeneous epipole.
///
/// Works for epipoles at infinity. A zero epipole, or a pixel on the epipole, falls
/// back to the image rows.
fn epipolar_direction(epipole: &Vector3<f64>, x: f64, y: f64) -> (f32, f32) {
    let dx = epipole.x - x * epipole.z;
    let dy = epipole.y - y * epipole.z;
    let norm = dx.hypot(dy);
    if norm > 1e-12 {
        ((dx / norm) as f32, (dy / norm) as f32)
    } else {
        (1.0, 0.0)
    }
}

/// Bounded magnitude of the second derivative of `gray` along the epipolar lines.
///
/// Derivatives are central differences with replicated borders. The magnitude `m` is
/// mapped to `m / (m + temperature)`, so the result lies in `[0, 1)`.
fn epipolar_curvature(
    gray: ArrayView2<f32>,
    epipole: &Vector3<f64>,
    scale: f64,
    temperature: f32,
) -> Array2<f32> {
    let (height, width) = gray.dim();
    let softness = temperature.max(1e-6);
    let at = |y: isize, x: isize| {
        let y = y.max(0).min(height as isize - 1) as usize;
        let x = x.max(0).min(width as isize - 1) as usize;
        gray[[y, x]]
    };
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (yi, xi) = (y as isize, x as isize);
        let center = at(yi, xi);
        let dxx = at(yi, xi + 1) - 2.0 * center + at(yi, xi - 1);
        let dyy = at(yi + 1, xi) - 2.0 * center + at(yi - 1, xi);
        let dxy = 0.25
            * (at(yi + 1, xi + 1) - at(yi + 1, xi - 1) - at(yi - 1, xi + 1)
                + at(yi - 1, xi - 1));
        // Pixel center of this level in the coordinates of the full image.
        let (ux, uy) = epipolar_direction(
            epipole,
            (x as f64 + 0.5) * scale - 0.5,
            (y as f64 + 0.5) * scale - 0.5,
        );
        let magnitude = (ux * ux * dxx + 2.0 * ux * uy * dxy + uy * uy * dyy).abs();
        magnitude / (magnitude + softness)
    })
}

/// Reference backbone: area pooling to every stage resolution followed by two convolutions.
///
/// The normal curvature is computed on the pooled intensity, so it does not depend on
/// the learned parameters.
#[derive(Debug, Clone)]
pub struct CurvaturePyramid {
    levels: [Level; NUM_STAGES],
}

impl CurvaturePyramid {
    pub fn new<R: Rng + ?Sized>(
        scales: [usize; NUM_STAGES],
        channels: [usize; NUM_STAGES],
        rng: &mut R,
    ) -> Self {
        Self {
            levels: [
                Level::new(scales[0], channels[0], rng),
                Level::new(scales[1], channels[1], rng),
                Level::new(scales[2], channels[2], rng),
            ],
        }
    }
}

impl FeatureBackbone for CurvaturePyramid {
    fn extract(
        &self,
        images: ArrayView4<f32>,
        epipoles: &[Vector3<f64>],
        temperature: f32,
    ) -> Result<[FeatureMap; NUM_STAGES]> {
        if images.len_of(Axis(0)) != epipoles.len() {
            return Err(MvsError::ShapeMismatch {
                what: "epipoles",
                expected: vec![images.len_of(Axis(0))],
                actual: vec![epipoles.len()],
            });
        }
        let [coarse, middle, fine] = &self.levels;
        Ok([
            coarse.extract(images, epipoles, temperature)?,
            middle.extract(images, epipoles, temperature)?,
            fine.extract(images, epipoles, temperature)?,
        ])
    }

    fn out_channels(&self) -> [usize; NUM_STAGES] {
        let [coarse, middle, fine] = &self.levels;
        [
            coarse.head.out_channels(),
            middle.head.out_channels(),
            fine.head.out_channels(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn pyramid() -> CurvaturePyramid {
        CurvaturePyramid::new([4, 2, 1], [8, 4, 2], &mut Pcg64::seed_from_u64(9))
    }

    #[test]
    fn stage_shapes_follow_scales() {
        let images = Array4::from_shape_fn((2, 3, 16, 12), |(b, c, y, x)| {
            ((b + c) as f32 + 0.3 * x as f32 * y as f32).sin()
        });
        let epipoles = [Vector3::new(1.0, 0.0, 0.0), Vector3::new(100.0, 8.0, 1.0)];
        let maps = pyramid().extract(images.view(), &epipoles, 1.0).unwrap();
        assert_eq!(maps[0].features.dim(), (2, 8, 4, 3));
        assert_eq!(maps[1].features.dim(), (2, 4, 8, 6));
        assert_eq!(maps[2].features.dim(), (2, 2, 16, 12));
        for map in maps.iter() {
            assert_eq!(map.nc_sum.len(), 2);
            assert!(map.nc_map.iter().all(|&v| (0.0..1.0).contains(&v)));
        }
    }

    #[test]
    fn curvature_follows_epipolar_direction() {
        // Intensity varies along x only, so curvature exists along rows only.
        let gray = Array2::from_shape_fn((5, 7), |(_, x)| (x as f32).powi(2));
        let along = epipolar_curvature(gray.view(), &Vector3::new(1.0, 0.0, 0.0), 1.0, 1.0);
        let across = epipolar_curvature(gray.view(), &Vector3::new(0.0, 1.0, 0.0), 1.0, 1.0);
        assert_relative_eq!(along[[2, 3]], 2.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(across[[2, 3]], 0.0);
    }

    #[test]
    fn finite_epipole_points_at_pixel() {
        let (ux, uy) = epipolar_direction(&Vector3::new(20.0, 10.0, 2.0), 10.0, 1.0);
        assert_relative_eq!(ux, 0.0);
        assert_relative_eq!(uy, 1.0);
        assert_eq!(epipolar_direction(&Vector3::zeros(), 3.0, 4.0), (1.0, 0.0));
    }

    #[test]
    fn rejects_missing_epipoles() {
        let images = Array4::zeros((2, 3, 8, 8));
        assert!(pyramid()
            .extract(images.view(), &[Vector3::new(1.0, 0.0, 0.0)], 1.0)
            .is_err());
    }
}
