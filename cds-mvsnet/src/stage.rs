//! One resolution level of the cascade.

use crate::aggregation::{correlate, similarity, ViewContribution};
use crate::backbone::FeatureMap;
use crate::depth::DepthNet;
use crate::error::ensure_shape;
use crate::regularizer::CostRegularizer;
use crate::sampling::DepthRange;
use crate::supervision::feature_target;
use crate::uncertainty::UncertaintyEstimator;
use crate::visibility::{similarity_entropy, VisibilityNet};
use crate::warping::warp_features;
use crate::{MvsError, Result};
use log::{debug, trace};
use mvs_epipolar::{CameraMatrix, CameraPair};
use ndarray::{Array1, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Ground-truth depth of the reference view at the resolution of a stage.
#[derive(Debug, Clone, Copy)]
pub struct GroundTruth<'a> {
    /// `(B, h, w)`
    pub depth: ArrayView3<'a, f32>,
    /// `(B)` base spacing of the depth hypotheses.
    pub base_interval: ArrayView1<'a, f32>,
}

/// The features a source view is matched with.
///
/// The features of the reference do not depend on the source view, but its normal
/// curvature is taken along the epipolar lines of this particular pair.
#[derive(Debug, Clone, Copy)]
pub struct ViewPair<'a> {
    pub reference: &'a FeatureMap,
    pub source: &'a FeatureMap,
}

/// Everything a stage produces.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// `(B, h, w)`
    pub depth: Array3<f32>,
    /// `(B, h, w)` in `[0, 1]`
    pub photometric_confidence: Array3<f32>,
    /// `(B, D, h, w)`
    pub prob_volume: Array4<f32>,
    /// `(B, D, h, w)` the hypotheses the probability volume refers to.
    pub depth_values: Array4<f32>,
    /// `(B, h, w)` spacing of the hypotheses.
    pub interval: Array3<f32>,
    /// `(B, h, w)`, only for stages with an uncertainty estimator.
    pub uncertainty: Option<Array3<f32>>,
    /// `(B, D, h, w)` visibility-weighted similarity, with the ground-truth similarity
    /// appended along the depth axis when ground truth was given.
    pub feature_distance: Array4<f32>,
    /// `(B)` mean normal curvature of the reference and source views.
    pub norm_curvature: Array1<f32>,
    /// `(B, D + 1, h, w)` hypotheses close to the ground truth, when ground truth was given.
    pub feature_target: Option<Array4<f32>>,
}

/// Warping, visibility-weighted aggregation, regularization and depth estimation at one
/// resolution. Every stage of the cascade is a `Stage`; only the coarser ones carry an
/// uncertainty estimator.
pub struct Stage {
    index: usize,
    ndepth: usize,
    interval_ratio: f32,
    visibility: VisibilityNet,
    depth_net: DepthNet,
    uncertainty: Option<Box<dyn UncertaintyEstimator>>,
}

impl Stage {
    pub fn new(
        index: usize,
        ndepth: usize,
        interval_ratio: f32,
        visibility: VisibilityNet,
        depth_net: DepthNet,
        uncertainty: Option<Box<dyn UncertaintyEstimator>>,
    ) -> Self {
        Self {
            index,
            ndepth,
            interval_ratio,
            visibility,
            depth_net,
            uncertainty,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ndepth(&self) -> usize {
        self.ndepth
    }

    pub fn interval_ratio(&self) -> f32 {
        self.interval_ratio
    }

    pub fn has_uncertainty(&self) -> bool {
        self.uncertainty.is_some()
    }

    /// Runs the stage.
    ///
    /// * `pairs` - the reference and source features of every source view at this stage
    /// * `projections` - `(B, N)` cameras scaled to this stage, the reference first
    /// * `range` - the hypotheses to test
    pub fn forward(
        &self,
        pairs: &[ViewPair],
        projections: ArrayView2<CameraPair>,
        range: &DepthRange,
        regularizer: &dyn CostRegularizer,
        ground_truth: Option<GroundTruth>,
    ) -> Result<StageOutput> {
        let views = pairs.len() + 1;
        let (batch, projected_views) = projections.dim();
        if views != projected_views {
            return Err(MvsError::ViewCount {
                features: views,
                projections: projected_views,
            });
        }
        let first = pairs.first().ok_or_else(|| {
            MvsError::InvalidConfig(format!(
                "stage {} needs a reference and at least one source view",
                self.index
            ))
        })?;
        let samples = range.samples.view();
        if samples.len_of(Axis(1)) != self.ndepth {
            return Err(MvsError::HypothesisCount {
                expected: self.ndepth,
                actual: samples.len_of(Axis(1)),
            });
        }
        let (ref_batch, _, height, width) = first.reference.features.dim();
        ensure_shape("reference batch", &[batch], &[ref_batch])?;
        for pair in pairs.iter() {
            ensure_shape(
                "reference features",
                first.reference.features.shape(),
                pair.reference.features.shape(),
            )?;
        }
        ensure_shape(
            "depth hypotheses",
            &[batch, self.ndepth, height, width],
            samples.shape(),
        )?;
        if let Some(gt) = ground_truth {
            ensure_shape("ground-truth depth", &[batch, height, width], gt.depth.shape())?;
        }
        debug!(
            "stage {}: {} views at {}x{}, {} hypotheses",
            self.index, views, width, height, self.ndepth
        );

        let reference_cameras = cameras(projections.column(0));
        let gt_hypotheses = ground_truth.map(|gt| gt.depth.insert_axis(Axis(1)));
        let observe = |v: usize| {
            trace!("stage {}: warping view {}", self.index, v);
            self.observe(
                &pairs[v - 1],
                &reference_cameras,
                &cameras(projections.column(v)),
                samples,
                gt_hypotheses,
            )
        };

        #[cfg(feature = "rayon")]
        let total = (1..views)
            .into_par_iter()
            .map(observe)
            .try_reduce_with(|a, b| Ok(a.combine(b)))
            .transpose()?;
        #[cfg(not(feature = "rayon"))]
        let total = (1..views).map(observe).try_fold(
            None,
            |acc: Option<ViewContribution>, contribution| -> Result<_> {
                let contribution = contribution?;
                Ok(Some(match acc {
                    Some(acc) => acc.combine(contribution),
                    None => contribution,
                }))
            },
        )?;

        let aggregation = total
            .ok_or(MvsError::ViewCount {
                features: views,
                projections: projected_views,
            })?
            .finish()?;
        let cost = regularizer.regularize(aggregation.volume.view())?;
        let estimate = self.depth_net.forward(
            cost.view(),
            samples,
            self.ndepth,
            range.interval.view(),
            None,
        )?;
        let uncertainty = match &self.uncertainty {
            Some(estimator) => Some(
                estimator
                    .estimate(estimate.prob_volume.view())?
                    .index_axis_move(Axis(1), 0),
            ),
            None => None,
        };
        let target = match ground_truth {
            Some(gt) => Some(feature_target(
                samples,
                gt.depth,
                gt.base_interval,
                self.interval_ratio,
            )?),
            None => None,
        };

        Ok(StageOutput {
            depth: estimate.depth,
            photometric_confidence: estimate.confidence,
            prob_volume: estimate.prob_volume,
            depth_values: range.samples.clone(),
            interval: range.interval.clone(),
            uncertainty,
            feature_distance: aggregation.feature_distance,
            norm_curvature: aggregation.norm_curvature,
            feature_target: target,
        })
    }

    /// Warps one source view and weighs it by its visibility along the epipolar
    /// direction of the pair.
    fn observe(
        &self,
        pair: &ViewPair,
        reference_cameras: &[CameraMatrix],
        source_cameras: &[CameraMatrix],
        hypotheses: ArrayView4<f32>,
        gt_hypotheses: Option<ArrayView4<f32>>,
    ) -> Result<ViewContribution> {
        let ViewPair { reference, source } = *pair;
        ensure_shape(
            "source features",
            reference.features.shape(),
            source.features.shape(),
        )?;
        let warped = warp_features(
            source.features.view(),
            source_cameras,
            reference_cameras,
            hypotheses,
        )?;
        let product = correlate(reference.features.view(), warped)?;
        let entropy = similarity_entropy(similarity(product.view()).view());
        let weight = self.visibility.forward(entropy.view(), reference.nc_map.view())?;
        trace!(
            "stage {}: mean visibility {:.3}",
            self.index,
            weight.mean().unwrap_or(0.0)
        );
        let norm_curvature = (&reference.nc_sum + &source.nc_sum) / 2.0;
        let gt_similarity = match gt_hypotheses {
            Some(gt) => {
                let warped = warp_features(
                    source.features.view(),
                    source_cameras,
                    reference_cameras,
                    gt,
                )?;
                Some(similarity(correlate(reference.features.view(), warped)?.view()))
            }
            None => None,
        };
        ViewContribution::new(product, weight, norm_curvature, gt_similarity)
    }
}

fn cameras(pairs: ArrayView1<CameraPair>) -> Vec<CameraMatrix> {
    pairs.iter().map(CameraPair::camera_matrix).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DepthMode;
    use crate::regularizer::Conv3dRegularizer;
    use crate::sampling::DepthRangeSampler;
    use crate::uncertainty::Rem;
    use nalgebra::{Matrix3, Vector3};
    use ndarray::{arr1, Array2};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn feature_map(seed: f32) -> FeatureMap {
        FeatureMap {
            features: Array4::from_shape_fn((1, 4, 6, 8), |(_, c, y, x)| {
                (seed + c as f32 + 0.4 * x as f32 - 0.3 * y as f32).sin()
            }),
            nc_sum: arr1(&[seed]),
            nc_map: Array3::from_elem((1, 6, 8), 0.2),
        }
    }

    fn projections(views: usize) -> Array2<CameraPair> {
        let k = Matrix3::new(8.0, 0.0, 4.0, 0.0, 8.0, 3.0, 0.0, 0.0, 1.0);
        Array2::from_shape_fn((1, views), |(_, v)| {
            CameraPair::from_parts(k, Matrix3::identity(), Vector3::new(-0.1 * v as f64, 0.0, 0.0))
        })
    }

    fn stage(uncertainty: bool) -> (Stage, Conv3dRegularizer) {
        let mut rng = Pcg64::seed_from_u64(11);
        let rem: Option<Box<dyn UncertaintyEstimator>> = if uncertainty {
            Some(Box::new(Rem::new(5, &mut rng)))
        } else {
            None
        };
        let stage = Stage::new(
            0,
            5,
            1.0,
            VisibilityNet::new(&mut rng),
            DepthNet::new(DepthMode::Regression),
            rem,
        );
        (stage, Conv3dRegularizer::new(4, 4, &mut rng))
    }

    fn range() -> DepthRange {
        DepthRangeSampler::default()
            .uniform(arr1(&[2.0]).view(), arr1(&[10.0]).view(), 5, 6, 8)
            .unwrap()
    }

    /// Pairs the first map, as the reference, with each of the others.
    fn pairs(maps: &[FeatureMap]) -> Vec<ViewPair> {
        maps[1..]
            .iter()
            .map(|source| ViewPair {
                reference: &maps[0],
                source,
            })
            .collect()
    }

    #[test]
    fn produces_stage_maps() {
        let (stage, reg) = stage(true);
        let maps = [feature_map(0.0), feature_map(0.5), feature_map(1.0)];
        let output = stage
            .forward(&pairs(&maps), projections(3).view(), &range(), &reg, None)
            .unwrap();
        assert_eq!(output.depth.dim(), (1, 6, 8));
        assert_eq!(output.prob_volume.dim(), (1, 5, 6, 8));
        assert_eq!(output.feature_distance.dim(), (1, 5, 6, 8));
        assert_eq!(output.uncertainty.map(|u| u.dim()), Some((1, 6, 8)));
        assert!(output.feature_target.is_none());
        // (0 + 0.5) / 2 and (0 + 1) / 2 averaged over the two source views.
        assert!((output.norm_curvature[0] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn reference_curvature_comes_from_each_pair() {
        let (stage, reg) = stage(false);
        let maps = [feature_map(0.0), feature_map(0.5), feature_map(1.0)];
        let mut along_second = feature_map(0.0);
        along_second.nc_sum = arr1(&[0.3]);
        along_second.nc_map.fill(0.7);
        let distinct = [
            ViewPair {
                reference: &maps[0],
                source: &maps[1],
            },
            ViewPair {
                reference: &along_second,
                source: &maps[2],
            },
        ];
        let output = stage
            .forward(&distinct, projections(3).view(), &range(), &reg, None)
            .unwrap();
        // (0 + 0.5) / 2 and (0.3 + 1) / 2 averaged over the two source views.
        assert!((output.norm_curvature[0] - 0.45).abs() < 1e-6);

        let shared = stage
            .forward(&pairs(&maps), projections(3).view(), &range(), &reg, None)
            .unwrap();
        assert!(output
            .feature_distance
            .iter()
            .zip(shared.feature_distance.iter())
            .any(|(a, b)| (a - b).abs() > 1e-6));
    }

    #[test]
    fn ground_truth_adds_supervision() {
        let (stage, reg) = stage(false);
        let maps = [feature_map(0.0), feature_map(0.5)];
        let gt = Array3::from_elem((1, 6, 8), 4.0f32);
        let base_interval = arr1(&[2.0f32]);
        let output = stage
            .forward(
                &pairs(&maps),
                projections(2).view(),
                &range(),
                &reg,
                Some(GroundTruth {
                    depth: gt.view(),
                    base_interval: base_interval.view(),
                }),
            )
            .unwrap();
        assert!(output.uncertainty.is_none());
        assert_eq!(output.feature_distance.dim(), (1, 6, 6, 8));
        let target = output.feature_target.unwrap();
        assert_eq!(target.dim(), (1, 6, 6, 8));
        // Hypotheses 2, 4, 6, 8, 10; only 4 is within half an interval.
        assert_eq!(target[[0, 1, 3, 3]], 1.0);
        assert_eq!(target.index_axis(Axis(1), 0).sum(), 0.0);
        assert_eq!(target[[0, 5, 0, 0]], 1.0);
    }

    #[test]
    fn rejects_mismatched_views() {
        let (stage, reg) = stage(false);
        let maps = [feature_map(0.0), feature_map(0.5)];
        assert!(matches!(
            stage.forward(&pairs(&maps), projections(3).view(), &range(), &reg, None),
            Err(MvsError::ViewCount {
                features: 2,
                projections: 3
            })
        ));
        assert!(matches!(
            stage.forward(&[], projections(1).view(), &range(), &reg, None),
            Err(MvsError::InvalidConfig(_))
        ));
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn parallel_reduction_matches_sequential_fold() {
        let (stage, reg) = stage(false);
        let maps = [
            feature_map(0.0),
            feature_map(0.5),
            feature_map(1.0),
            feature_map(1.5),
            feature_map(2.0),
        ];
        let pairs = pairs(&maps);
        let projections = projections(maps.len());
        let range = range();
        let parallel = stage
            .forward(&pairs, projections.view(), &range, &reg, None)
            .unwrap();

        let reference_cameras = cameras(projections.column(0));
        let sequential = pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| {
                stage
                    .observe(
                        pair,
                        &reference_cameras,
                        &cameras(projections.column(i + 1)),
                        range.samples.view(),
                        None,
                    )
                    .unwrap()
            })
            .fold(None, |acc: Option<ViewContribution>, c| {
                Some(match acc {
                    Some(acc) => acc.combine(c),
                    None => c,
                })
            })
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(parallel.feature_distance.dim(), sequential.feature_distance.dim());
        for (a, b) in parallel
            .feature_distance
            .iter()
            .zip(sequential.feature_distance.iter())
        {
            assert!((a - b).abs() < 1e-5, "{} != {}", a, b);
        }
        assert!((parallel.norm_curvature[0] - sequential.norm_curvature[0]).abs() < 1e-6);
    }
}
