use crate::layers::{Conv2d, ConvBnRelu};
use crate::ops::sigmoid;
use crate::Result;
use ndarray::{Array4, ArrayView4};
use rand::Rng;

/// Estimates the per-pixel uncertainty of a `(B, D, h, w)` probability volume as a
/// non-negative `(B, 1, h, w)` map.
pub trait UncertaintyEstimator: Send + Sync {
    fn estimate(&self, prob_volume: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Reference uncertainty estimation module.
#[derive(Debug, Clone)]
pub struct Rem {
    features: ConvBnRelu,
    head: Conv2d,
}

impl Rem {
    pub const HIDDEN_CHANNELS: usize = 16;

    /// An estimator for volumes with `ndepth` hypotheses.
    pub fn new<R: Rng + ?Sized>(ndepth: usize, rng: &mut R) -> Self {
        Self {
            features: ConvBnRelu::new(ndepth, Self::HIDDEN_CHANNELS, rng),
            head: Conv2d::new(Self::HIDDEN_CHANNELS, 1, 1, true, rng),
        }
    }

    pub fn from_layers(features: ConvBnRelu, head: Conv2d) -> Self {
        Self { features, head }
    }
}

impl UncertaintyEstimator for Rem {
    fn estimate(&self, prob_volume: ArrayView4<f32>) -> Result<Array4<f32>> {
        let hidden = self.features.forward(prob_volume)?;
        let mut uncertainty = self.head.forward(hidden.view())?;
        uncertainty.mapv_inplace(sigmoid);
        Ok(uncertainty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn uncertainty_is_a_bounded_map() {
        let rem = Rem::new(6, &mut Pcg64::seed_from_u64(4));
        let prob = Array4::from_elem((1, 6, 5, 7), 1.0 / 6.0);
        let u = rem.estimate(prob.view()).unwrap();
        assert_eq!(u.dim(), (1, 1, 5, 7));
        assert!(u.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn rejects_other_hypothesis_counts() {
        let rem = Rem::new(6, &mut Pcg64::seed_from_u64(4));
        let prob = Array4::from_elem((1, 8, 5, 7), 0.125);
        assert!(rem.estimate(prob.view()).is_err());
    }
}
