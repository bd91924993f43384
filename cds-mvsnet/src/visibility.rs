use crate::error::ensure_shape;
use crate::layers::{Conv2d, ConvBnRelu};
use crate::ops::{entropy_depth, sigmoid, softmax_depth};
use crate::{MvsError, Result};
use ndarray::{stack, Array3, ArrayView3, ArrayView4, Axis};
use rand::Rng;

/// Entropy of the softmax-normalized matching similarity of every reference pixel.
///
/// A flat distribution (high entropy) means the source view did not discriminate between
/// the depth hypotheses at that pixel, which usually indicates occlusion or a textureless
/// region. The normalization is a constant of the visibility computation, never a learned
/// path.
pub fn similarity_entropy(similarity: ArrayView4<f32>) -> Array3<f32> {
    entropy_depth(softmax_depth(similarity).view())
}

/// Predicts how much a source view should contribute to every reference pixel.
///
/// Input is the two-channel map `[entropy, reference normal curvature]`, output a
/// `(B, H, W)` weight in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct VisibilityNet {
    layers: [ConvBnRelu; 3],
    head: Conv2d,
}

impl VisibilityNet {
    pub const INPUT_CHANNELS: usize = 2;
    pub const HIDDEN_CHANNELS: usize = 16;

    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let hidden = Self::HIDDEN_CHANNELS;
        Self {
            layers: [
                ConvBnRelu::new(Self::INPUT_CHANNELS, hidden, rng),
                ConvBnRelu::new(hidden, hidden, rng),
                ConvBnRelu::new(hidden, hidden, rng),
            ],
            head: Conv2d::new(hidden, 1, 1, true, rng),
        }
    }

    /// Assembles the network from existing layers, checking that the channels chain up.
    pub fn from_layers(layers: [ConvBnRelu; 3], head: Conv2d) -> Result<Self> {
        let mut channels = Self::INPUT_CHANNELS;
        for layer in layers.iter() {
            ensure_shape("visibility layer input", &[channels], &[layer.in_channels()])?;
            channels = layer.out_channels();
        }
        ensure_shape("visibility head input", &[channels], &[head.in_channels()])?;
        if head.out_channels() != 1 {
            return Err(MvsError::InvalidConfig(format!(
                "visibility head must produce 1 channel, got {}",
                head.out_channels()
            )));
        }
        Ok(Self { layers, head })
    }

    pub fn forward(
        &self,
        entropy: ArrayView3<f32>,
        norm_curvature: ArrayView3<f32>,
    ) -> Result<Array3<f32>> {
        ensure_shape("normal curvature map", entropy.shape(), norm_curvature.shape())?;
        let mut x = stack(Axis(1), &[entropy.view(), norm_curvature.view()])?;
        for layer in self.layers.iter() {
            x = layer.forward(x.view())?;
        }
        let mut logits = self.head.forward(x.view())?;
        logits.mapv_inplace(sigmoid);
        Ok(logits.index_axis_move(Axis(1), 0))
    }
}
