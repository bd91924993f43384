use crate::error::ensure_shape;
use crate::layers::{Conv2d, ConvBnRelu};
use crate::ops::resize_planes;
use crate::Result;
use ndarray::{concatenate, s, Array4, ArrayView1, ArrayView4, Axis};
use rand::Rng;

/// Refines a depth map with the help of the reference image.
pub trait DepthRefiner: Send + Sync {
    /// * `image` - `(B, 3, H, W)` reference image
    /// * `depth` - `(B, 1, h, w)` depth in units of the base depth interval
    /// * `depth_min`, `depth_max` - `(B)` depth range in the same units
    fn refine(
        &self,
        image: ArrayView4<f32>,
        depth: ArrayView4<f32>,
        depth_min: ArrayView1<f32>,
        depth_max: ArrayView1<f32>,
    ) -> Result<Array4<f32>>;
}

/// Predicts a residual from the image and the depth and adds it to the depth.
#[derive(Debug, Clone)]
pub struct ResidualRefinement {
    layers: [ConvBnRelu; 2],
    residual: Conv2d,
}

impl ResidualRefinement {
    pub const HIDDEN_CHANNELS: usize = 8;

    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let hidden = Self::HIDDEN_CHANNELS;
        Self {
            layers: [ConvBnRelu::new(4, hidden, rng), ConvBnRelu::new(hidden, hidden, rng)],
            residual: Conv2d::new(hidden, 1, 3, true, rng),
        }
    }

    pub fn from_layers(layers: [ConvBnRelu; 2], residual: Conv2d) -> Self {
        Self { layers, residual }
    }
}

impl DepthRefiner for ResidualRefinement {
    fn refine(
        &self,
        image: ArrayView4<f32>,
        depth: ArrayView4<f32>,
        depth_min: ArrayView1<f32>,
        depth_max: ArrayView1<f32>,
    ) -> Result<Array4<f32>> {
        let (batch, _, height, width) = depth.dim();
        ensure_shape("depth to refine", &[batch, 1, height, width], depth.shape())?;
        ensure_shape("reference image batch", &[batch], &[image.len_of(Axis(0))])?;
        ensure_shape("depth range", &[batch], depth_min.shape())?;
        ensure_shape("depth range", &[batch], depth_max.shape())?;
        let image = resize_planes(image, height, width);
        let mut x = concatenate(Axis(1), &[image.view(), depth.view()])?;
        for layer in self.layers.iter() {
            x = layer.forward(x.view())?;
        }
        let mut refined = self.residual.forward(x.view())?;
        refined += &depth;
        for (b, (&lo, &hi)) in depth_min.iter().zip(depth_max.iter()).enumerate() {
            refined
                .slice_mut(s![b, .., .., ..])
                .mapv_inplace(|d| d.max(lo).min(hi));
        }
        Ok(refined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn zero_residual_keeps_depth() {
        let mut rng = Pcg64::seed_from_u64(2);
        let layers = [ConvBnRelu::new(4, 8, &mut rng), ConvBnRelu::new(8, 8, &mut rng)];
        let residual = Conv2d::from_weights(Array4::zeros((1, 8, 3, 3)), Some(Array1::zeros(1))).unwrap();
        let refiner = ResidualRefinement::from_layers(layers, residual);
        let image = Array4::from_elem((1, 3, 8, 8), 0.5);
        let depth = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| 10.0 + (y + x) as f32);
        let refined = refiner
            .refine(image.view(), depth.view(), arr1(&[0.0]).view(), arr1(&[100.0]).view())
            .unwrap();
        assert_eq!(refined, depth);
    }

    #[test]
    fn output_is_clamped_to_range() {
        let refiner = ResidualRefinement::new(&mut Pcg64::seed_from_u64(5));
        let image = Array4::from_shape_fn((2, 3, 6, 6), |(b, c, y, x)| ((b + c + y * x) as f32).sin());
        let depth = Array4::from_elem((2, 1, 6, 6), 3.0);
        let refined = refiner
            .refine(image.view(), depth.view(), arr1(&[2.9, 0.0]).view(), arr1(&[3.1, 1.0]).view())
            .unwrap();
        assert!(refined.slice(s![0, .., .., ..]).iter().all(|&d| (2.9..=3.1).contains(&d)));
        assert!(refined.slice(s![1, .., .., ..]).iter().all(|&d| d == 1.0));
    }
}
