//! Visibility-weighted accumulation of per-view matching costs.
//!
//! Every source view produces one [`ViewContribution`]. Contributions are summed with
//! [`ViewContribution::combine`], which is associative and commutative, so the views can
//! be reduced in any order or in parallel. [`ViewContribution::finish`] normalizes the sums.

use crate::error::ensure_shape;
use crate::ops::EPSILON;
use crate::Result;
use log::warn;
use ndarray::{concatenate, Array1, Array3, Array4, Array5, ArrayView4, ArrayView5, Axis};

/// Elementwise product of the reference features with warped source features.
///
/// `reference` is `(B, C, h, w)`, `warped` is `(B, C, D, h, w)`; the product keeps the
/// shape of `warped`.
pub fn correlate(reference: ArrayView4<f32>, mut warped: Array5<f32>) -> Result<Array5<f32>> {
    let (b, c, _, h, w) = warped.dim();
    ensure_shape("reference features", &[b, c, h, w], reference.shape())?;
    warped *= &reference.insert_axis(Axis(2));
    Ok(warped)
}

/// Sums a `(B, C, D, h, w)` product over its channels into a `(B, D, h, w)` similarity.
pub fn similarity(product: ArrayView5<f32>) -> Array4<f32> {
    product.sum_axis(Axis(1))
}

/// The weighted statistics of one or more source views.
#[derive(Debug, Clone)]
pub struct ViewContribution {
    weighted_volume: Array5<f32>,
    weight: Array3<f32>,
    weighted_similarity: Array4<f32>,
    weighted_gt_similarity: Option<Array4<f32>>,
    norm_curvature: Array1<f32>,
    views: usize,
}

impl ViewContribution {
    /// Weighs the statistics of a single source view.
    ///
    /// * `product` - `(B, C, D, h, w)` output of [`correlate`]
    /// * `weight` - `(B, h, w)` visibility of the view
    /// * `norm_curvature` - `(B)` mean of the reference and source curvature sums
    /// * `gt_similarity` - `(B, 1, h, w)` similarity at the ground-truth depth
    pub fn new(
        mut product: Array5<f32>,
        weight: Array3<f32>,
        norm_curvature: Array1<f32>,
        gt_similarity: Option<Array4<f32>>,
    ) -> Result<Self> {
        let (b, _, d, h, w) = product.dim();
        ensure_shape("visibility weight", &[b, h, w], weight.shape())?;
        ensure_shape("normal curvature", &[b], norm_curvature.shape())?;
        let pixel_weight = weight.view().insert_axis(Axis(1));
        let mut weighted_similarity = similarity(product.view());
        weighted_similarity *= &pixel_weight;
        product *= &pixel_weight.insert_axis(Axis(1));
        let weighted_gt_similarity = match gt_similarity {
            Some(mut gt) => {
                ensure_shape("ground-truth similarity", &[b, 1, h, w], gt.shape())?;
                gt *= &pixel_weight;
                Some(gt)
            }
            None => None,
        };
        debug_assert_eq!(weighted_similarity.dim(), (b, d, h, w));
        Ok(Self {
            weighted_volume: product,
            weight,
            weighted_similarity,
            weighted_gt_similarity,
            norm_curvature,
            views: 1,
        })
    }

    /// Number of source views folded into this contribution.
    pub fn views(&self) -> usize {
        self.views
    }

    /// Sums two contributions of the same stage.
    pub fn combine(mut self, other: Self) -> Self {
        self.weighted_volume += &other.weighted_volume;
        self.weight += &other.weight;
        self.weighted_similarity += &other.weighted_similarity;
        self.norm_curvature += &other.norm_curvature;
        self.weighted_gt_similarity = match (self.weighted_gt_similarity, other.weighted_gt_similarity) {
            (Some(mut a), Some(b)) => {
                a += &b;
                Some(a)
            }
            _ => None,
        };
        self.views += other.views;
        self
    }

    /// Normalizes the accumulated sums by the accumulated visibility.
    pub fn finish(self) -> Result<CostAggregation> {
        if self.weight.iter().all(|&w| w < EPSILON) {
            warn!(
                "visibility of all {} source views is close to zero, cost volume degenerates to zero",
                self.views
            );
        }
        let norm = self.weight.mapv(|w| 1.0 / (w + EPSILON)).insert_axis(Axis(1));
        let mut volume = self.weighted_volume;
        volume *= &norm.view().insert_axis(Axis(1));
        let mut feature_distance = self.weighted_similarity;
        feature_distance *= &norm;
        if let Some(mut gt) = self.weighted_gt_similarity {
            gt *= &norm;
            feature_distance = concatenate(Axis(1), &[feature_distance.view(), gt.view()])?;
        }
        let norm_curvature = self.norm_curvature / self.views as f32;
        Ok(CostAggregation {
            volume,
            feature_distance,
            norm_curvature,
        })
    }
}

/// The normalized result of accumulating all source views of a stage.
#[derive(Debug, Clone)]
pub struct CostAggregation {
    /// `(B, C, D, h, w)` visibility-weighted average of the correlation volumes.
    pub volume: Array5<f32>,
    /// `(B, D, h, w)` visibility-weighted average similarity, `(B, D + 1, h, w)` when
    /// the ground-truth similarity is appended.
    pub feature_distance: Array4<f32>,
    /// `(B)` mean normal curvature over the source views.
    pub norm_curvature: Array1<f32>,
}
