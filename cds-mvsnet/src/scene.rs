//! A synthetic scene with known depth for exercising the cascade.

use crate::model::{ModelInput, StageProjections};
use crate::{MvsError, MvsNetConfig, Result, NUM_STAGES};
use mvs_epipolar::CameraPair;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array, Array2, Array3, Array5};

/// A textured plane facing a row of cameras.
///
/// The reference camera sits at the origin looking down `+z`, the source cameras are
/// shifted along `+x` by multiples of `baseline`. All cameras share the intrinsics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneScene {
    pub batch: usize,
    pub views: usize,
    pub height: usize,
    pub width: usize,
    pub focal: f64,
    pub baseline: f64,
    /// Distance of the plane from the reference camera.
    pub plane_depth: f32,
    pub depth_min: f32,
    pub depth_max: f32,
    pub ground_truth: bool,
    pub temperature: f32,
}

impl Default for PlaneScene {
    fn default() -> Self {
        Self {
            batch: 1,
            views: 3,
            height: 32,
            width: 32,
            focal: 32.0,
            baseline: 2.0,
            plane_depth: 40.0,
            depth_min: 10.0,
            depth_max: 100.0,
            ground_truth: false,
            temperature: 1.0,
        }
    }
}

impl PlaneScene {
    pub fn with_size(self, height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            ..self
        }
    }

    pub fn with_views(self, views: usize) -> Self {
        Self { views, ..self }
    }

    pub fn with_batch(self, batch: usize) -> Self {
        Self { batch, ..self }
    }

    pub fn with_plane_depth(self, plane_depth: f32) -> Self {
        Self {
            plane_depth,
            ..self
        }
    }

    pub fn with_ground_truth(self, ground_truth: bool) -> Self {
        Self {
            ground_truth,
            ..self
        }
    }

    pub fn intrinsics(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal,
            0.0,
            self.width as f64 / 2.0,
            0.0,
            self.focal,
            self.height as f64 / 2.0,
            0.0,
            0.0,
            1.0,
        )
    }

    /// `(B, N)` cameras of the full resolution images.
    pub fn cameras(&self) -> Array2<CameraPair> {
        let k = self.intrinsics();
        Array2::from_shape_fn((self.batch, self.views), |(_, v)| {
            let center = Vector3::new(self.baseline * v as f64, 0.0, 0.0);
            CameraPair::from_parts(k, Matrix3::identity(), -center)
        })
    }

    /// Renders the plane into every view, `(B, N, 3, H, W)`.
    pub fn images(&self) -> Array5<f32> {
        let (cx, cy) = (self.width as f64 / 2.0, self.height as f64 / 2.0);
        let z = self.plane_depth as f64;
        Array::from_shape_fn(
            (self.batch, self.views, 3, self.height, self.width),
            |(b, v, c, y, x)| {
                let world_x = self.baseline * v as f64 + (x as f64 - cx) * z / self.focal;
                let world_y = (y as f64 - cy) * z / self.focal;
                texture(world_x, world_y, c, b)
            },
        )
    }

    /// Builds the input of a forward pass with the resolutions `config` expects.
    pub fn input(&self, config: &MvsNetConfig) -> Result<ModelInput> {
        let coarsest = config.stage_scales[0] * if config.refine { 2 } else { 1 };
        if self.height < coarsest || self.width < coarsest {
            return Err(MvsError::InvalidConfig(format!(
                "a {}x{} scene is too small for a stage scale of {}",
                self.width, self.height, coarsest
            )));
        }
        let ndepth = config.ndepths[0];
        let step = (self.depth_max - self.depth_min) / (ndepth - 1) as f32;
        let depth_values = Array2::from_shape_fn((self.batch, ndepth), |(_, i)| {
            if i + 1 == ndepth {
                self.depth_max
            } else {
                self.depth_min + i as f32 * step
            }
        });
        let cameras = self.cameras();
        let gt_depths = if self.ground_truth {
            let (height, width) = if config.refine {
                (self.height / 2, self.width / 2)
            } else {
                (self.height, self.width)
            };
            let at = |scale: usize| {
                Array3::from_elem((self.batch, height / scale, width / scale), self.plane_depth)
            };
            let scales: [usize; NUM_STAGES] = config.stage_scales;
            Some([at(scales[0]), at(scales[1]), at(scales[2])])
        } else {
            None
        };
        Ok(ModelInput {
            images: self.images(),
            projections: StageProjections::from_full_resolution(cameras.view(), config.stage_scales),
            depth_values,
            gt_depths,
            temperature: self.temperature,
        })
    }
}

/// Smooth, non-repeating intensity pattern of the plane.
fn texture(x: f64, y: f64, channel: usize, batch: usize) -> f32 {
    let phase = channel as f64 * 0.9 + batch as f64 * 0.37;
    let value = 0.5
        + 0.2 * (0.9 * x + phase).sin()
        + 0.15 * (1.3 * y - 0.5 * x).cos()
        + 0.1 * (0.31 * x * y.sin() + phase).sin();
    value as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn plane_points_project_consistently() {
        let scene = PlaneScene::default();
        let cameras = scene.cameras();
        let reference = cameras[[0, 0]].camera_matrix();
        let source = cameras[[0, 2]].camera_matrix();
        let point = Vector4::new(3.0, -2.0, scene.plane_depth as f64, 1.0);
        let (r, s) = (reference.project(point).unwrap(), source.project(point).unwrap());
        // The source camera is 4 units to the right, so the point moves left by f * 4 / z.
        assert_relative_eq!(r.x - s.x, 32.0 * 4.0 / 40.0, epsilon = 1e-9);
        assert_relative_eq!(r.y, s.y, epsilon = 1e-9);
        // One pixel of disparity per view.
        let scene = PlaneScene {
            focal: 40.0,
            baseline: 1.0,
            ..scene
        };
        let images = scene.images();
        for (y, x) in [(3, 4), (17, 20), (30, 29)] {
            for c in 0..3 {
                assert_relative_eq!(
                    images[[0, 2, c, y, x]],
                    images[[0, 0, c, y, x + 2]],
                    epsilon = 1e-5
                );
            }
        }
    }

    #[test]
    fn input_matches_configuration() {
        let config = MvsNetConfig::default();
        let input = PlaneScene::default()
            .with_ground_truth(true)
            .input(&config)
            .unwrap();
        assert_eq!(input.images.dim(), (1, 3, 3, 32, 32));
        assert_eq!(input.depth_values.dim(), (1, 48));
        assert_eq!(input.depth_values[[0, 47]], 100.0);
        let gt = input.gt_depths.unwrap();
        assert_eq!(gt[0].dim(), (1, 8, 8));
        assert_eq!(gt[2].dim(), (1, 32, 32));
        assert_eq!(input.projections[0].dim(), (1, 3));
    }

    #[test]
    fn rejects_tiny_scenes() {
        let config = MvsNetConfig::default();
        assert!(PlaneScene::default().with_size(2, 2).input(&config).is_err());
    }
}
