use crate::layers::Conv3d;
use crate::Result;
use ndarray::{Array5, ArrayView5};
use rand::Rng;

/// Turns an aggregated `(B, C, D, h, w)` cost volume into `(B, 1, D, h, w)` scores.
pub trait CostRegularizer: Send + Sync {
    fn regularize(&self, cost: ArrayView5<f32>) -> Result<Array5<f32>>;
}

/// Two 3d convolutions with a rectifier in between.
#[derive(Debug, Clone)]
pub struct Conv3dRegularizer {
    hidden: Conv3d,
    score: Conv3d,
}

impl Conv3dRegularizer {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, base_channels: usize, rng: &mut R) -> Self {
        Self {
            hidden: Conv3d::new(in_channels, base_channels, 3, true, rng),
            score: Conv3d::new(base_channels, 1, 3, true, rng),
        }
    }

    pub fn from_layers(hidden: Conv3d, score: Conv3d) -> Self {
        Self { hidden, score }
    }

    pub fn in_channels(&self) -> usize {
        self.hidden.in_channels()
    }
}

impl CostRegularizer for Conv3dRegularizer {
    fn regularize(&self, cost: ArrayView5<f32>) -> Result<Array5<f32>> {
        let mut hidden = self.hidden.forward(cost)?;
        hidden.mapv_inplace(|v| v.max(0.0));
        self.score.forward(hidden.view())
    }
}
