//! The coarse-to-fine cascade.

use crate::backbone::{CurvaturePyramid, FeatureBackbone};
use crate::config::MvsNetConfig;
use crate::depth::DepthNet;
use crate::error::ensure_shape;
use crate::ops::{resize_bilinear, resize_planes};
use crate::refinement::{DepthRefiner, ResidualRefinement};
use crate::regularizer::{Conv3dRegularizer, CostRegularizer};
use crate::sampling::{DepthRange, DepthRangeSampler};
use crate::stage::{GroundTruth, Stage, StageOutput, ViewPair};
use crate::supervision::loss_strategy_depth;
use crate::uncertainty::{Rem, UncertaintyEstimator};
use crate::visibility::VisibilityNet;
use crate::{MvsError, Result, NUM_STAGES};
use derive_more::{Deref, DerefMut, From};
use log::{debug, info, warn};
use mvs_epipolar::{fundamental_matrix, CameraPair};
use nalgebra::Vector3;
use ndarray::{s, Array1, Array2, Array3, Array5, ArrayView2, ArrayView5, Axis};
use rand::SeedableRng;
use rand_pcg::Pcg64;

/// Cameras of every view, one set per stage resolution.
///
/// Each stage holds a `(B, N)` array whose cameras project into the feature maps of
/// that stage, view 0 being the reference.
#[derive(Debug, Clone, PartialEq, Deref, DerefMut, From)]
pub struct StageProjections(pub [Array2<CameraPair>; NUM_STAGES]);

impl StageProjections {
    /// Derives the stage cameras from cameras of the full resolution images.
    pub fn from_full_resolution(cameras: ArrayView2<CameraPair>, scales: [usize; NUM_STAGES]) -> Self {
        let at = |scale: usize| cameras.mapv(|pair| pair.scaled(1.0 / scale as f64));
        Self([at(scales[0]), at(scales[1]), at(scales[2])])
    }

    fn scaled(&self, factor: f64) -> Self {
        let [a, b, c] = &self.0;
        let at = |cameras: &Array2<CameraPair>| cameras.mapv(|pair| pair.scaled(factor));
        Self([at(a), at(b), at(c)])
    }
}

/// Input of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// `(B, N, 3, H, W)`, view 0 is the reference.
    pub images: Array5<f32>,
    pub projections: StageProjections,
    /// `(B, D)` initial hypotheses. Only the first two and the last value are used: they
    /// define the depth range and the base depth interval.
    pub depth_values: Array2<f32>,
    /// Ground-truth depth of the reference view at every stage resolution.
    pub gt_depths: Option<[Array3<f32>; NUM_STAGES]>,
    /// Softness of the normal curvature.
    pub temperature: f32,
}

/// Output of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// One output per stage, coarsest first.
    pub stages: Vec<StageOutput>,
    /// Depth of the coarse stage restricted to the window of the following stage.
    pub intermediate_depths: Vec<Array3<f32>>,
    /// The final depth, refined when refinement is enabled.
    pub refined_depth: Array3<f32>,
}

impl ModelOutput {
    /// The depth of the finest stage.
    pub fn depth(&self) -> Option<&Array3<f32>> {
        self.stages.last().map(|stage| &stage.depth)
    }

    /// The photometric confidence of the finest stage.
    pub fn photometric_confidence(&self) -> Option<&Array3<f32>> {
        self.stages.last().map(|stage| &stage.photometric_confidence)
    }
}

/// Cost regularizers of the cascade.
pub enum CostRegularization {
    /// One regularizer serves every stage.
    Shared(Box<dyn CostRegularizer>),
    PerStage([Box<dyn CostRegularizer>; NUM_STAGES]),
}

impl CostRegularization {
    fn get(&self, stage: usize) -> &dyn CostRegularizer {
        match self {
            CostRegularization::Shared(regularizer) => regularizer.as_ref(),
            CostRegularization::PerStage(regularizers) => regularizers[stage].as_ref(),
        }
    }
}

/// The learned collaborators of the cascade.
pub struct Components {
    pub backbone: Box<dyn FeatureBackbone>,
    pub regularization: CostRegularization,
    /// Uncertainty estimators of every stage but the last.
    pub uncertainty: [Box<dyn UncertaintyEstimator>; NUM_STAGES - 1],
    /// Required exactly when refinement is enabled.
    pub refiner: Option<Box<dyn DepthRefiner>>,
}

impl Components {
    /// The reference implementations, initialized from `rng`.
    pub fn reference(config: &MvsNetConfig, rng: &mut Pcg64) -> Self {
        let backbone = CurvaturePyramid::new(config.stage_scales, config.feature_channels, rng);
        let channels = config.feature_channels;
        let base = config.regularizer_base_channels;
        let regularization = if config.share_cost_regularizer {
            CostRegularization::Shared(Box::new(Conv3dRegularizer::new(channels[0], base[0], rng)))
        } else {
            let regularizers: [Box<dyn CostRegularizer>; NUM_STAGES] = [
                Box::new(Conv3dRegularizer::new(channels[0], base[0], rng)),
                Box::new(Conv3dRegularizer::new(channels[1], base[1], rng)),
                Box::new(Conv3dRegularizer::new(channels[2], base[2], rng)),
            ];
            CostRegularization::PerStage(regularizers)
        };
        let uncertainty: [Box<dyn UncertaintyEstimator>; NUM_STAGES - 1] = [
            Box::new(Rem::new(config.ndepths[0], rng)),
            Box::new(Rem::new(config.ndepths[1], rng)),
        ];
        let refiner = if config.refine {
            Some(Box::new(ResidualRefinement::new(rng)) as Box<dyn DepthRefiner>)
        } else {
            None
        };
        Self {
            backbone: Box::new(backbone),
            regularization,
            uncertainty,
            refiner,
        }
    }
}

/// Cascaded multi-view stereo with visibility-weighted cost aggregation.
///
/// ```
/// use cds_mvsnet::{CdsMvsNet, MvsNetConfig, PlaneScene};
///
/// let config = MvsNetConfig {
///     ndepths: [8, 4, 2],
///     feature_channels: [4, 4, 4],
///     regularizer_base_channels: [4, 4, 4],
///     ..Default::default()
/// };
/// let net = CdsMvsNet::new(config).unwrap();
/// let input = PlaneScene::default().with_size(16, 16).input(&config).unwrap();
/// let output = net.forward(&input).unwrap();
/// assert_eq!(output.refined_depth.dim(), (1, 16, 16));
/// ```
pub struct CdsMvsNet {
    config: MvsNetConfig,
    sampler: DepthRangeSampler,
    backbone: Box<dyn FeatureBackbone>,
    regularization: CostRegularization,
    stages: Vec<Stage>,
    refiner: Option<Box<dyn DepthRefiner>>,
}

impl CdsMvsNet {
    /// Builds the network with the reference components.
    ///
    /// Visibility networks are initialized from `seed`, every other component from
    /// `seed + 1`, so swapping components keeps the visibility parameters.
    pub fn new(config: MvsNetConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = Pcg64::seed_from_u64(config.seed.wrapping_add(1));
        let components = Components::reference(&config, &mut rng);
        Self::with_components(config, components)
    }

    pub fn with_components(config: MvsNetConfig, components: Components) -> Result<Self> {
        config.validate()?;
        if config.refine != components.refiner.is_some() {
            return Err(MvsError::InvalidConfig(format!(
                "refinement is {} but a refiner was {}",
                if config.refine { "enabled" } else { "disabled" },
                if components.refiner.is_some() { "given" } else { "not given" }
            )));
        }
        let mut rng = Pcg64::seed_from_u64(config.seed);
        let depth_net = DepthNet::new(config.depth_mode).with_confidence_window(config.confidence_window);
        let [coarse, middle] = components.uncertainty;
        let mut uncertainty = [Some(coarse), Some(middle), None];
        let stages = uncertainty
            .iter_mut()
            .enumerate()
            .map(|(index, estimator)| {
                Stage::new(
                    index,
                    config.ndepths[index],
                    config.depth_interval_ratios[index],
                    VisibilityNet::new(&mut rng),
                    depth_net,
                    estimator.take(),
                )
            })
            .collect();
        Ok(Self {
            config,
            sampler: DepthRangeSampler::new(config.sampler),
            backbone: components.backbone,
            regularization: components.regularization,
            stages,
            refiner: components.refiner,
        })
    }

    pub fn config(&self) -> &MvsNetConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs the cascade.
    ///
    /// Fails without producing any output if the input does not fit the configuration.
    pub fn forward(&self, input: &ModelInput) -> Result<ModelOutput> {
        let (batch, views, channels, height, width) = input.images.dim();
        ensure_shape("image channels", &[3], &[channels])?;
        if views < 2 {
            return Err(MvsError::InvalidConfig(format!(
                "a reference and at least one source view are needed, got {} views",
                views
            )));
        }
        for cameras in input.projections.iter() {
            let (camera_batch, camera_views) = cameras.dim();
            ensure_shape("projection batch", &[batch], &[camera_batch])?;
            if camera_views != views {
                return Err(MvsError::ViewCount {
                    features: views,
                    projections: camera_views,
                });
            }
        }
        let (processed_h, processed_w) = if self.config.refine {
            ((height / 2).max(1), (width / 2).max(1))
        } else {
            (height, width)
        };
        for (index, &scale) in self.config.stage_scales.iter().enumerate() {
            if height == 0 || width == 0 || processed_h / scale == 0 || processed_w / scale == 0 {
                return Err(MvsError::InvalidConfig(format!(
                    "{}x{} images leave no pixels at stage {} (scale {})",
                    width, height, index, scale
                )));
            }
        }
        let bounds = DepthBounds::new(input.depth_values.view(), batch)?;
        info!(
            "forward pass: batch {}, {} views at {}x{}, depth mode {}",
            batch, views, width, height, self.config.depth_mode
        );

        let resize = if self.config.refine { 0.5 } else { 1.0 };
        let halved;
        let images = if self.config.refine {
            halved = half_resolution(input.images.view());
            halved.view()
        } else {
            input.images.view()
        };
        let projections = if self.config.refine {
            input.projections.scaled(resize)
        } else {
            input.projections.clone()
        };

        let epipoles = self.epipoles(&input.projections[NUM_STAGES - 1], resize);
        let reference_images = images.index_axis(Axis(1), 0);
        let pyramids = epipoles
            .iter()
            .enumerate()
            .map(|(i, pair)| {
                let reference =
                    self.backbone
                        .extract(reference_images, &pair.reference, input.temperature)?;
                let source = self.backbone.extract(
                    images.index_axis(Axis(1), i + 1),
                    &pair.source,
                    input.temperature,
                )?;
                Ok((reference, source))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut outputs: Vec<StageOutput> = Vec::with_capacity(NUM_STAGES);
        let mut intermediate_depths = Vec::new();
        for (index, stage) in self.stages.iter().enumerate() {
            let pairs: Vec<ViewPair> = pyramids
                .iter()
                .map(|(reference, source)| ViewPair {
                    reference: &reference[index],
                    source: &source[index],
                })
                .collect();
            let (_, _, stage_h, stage_w) = pairs[0].reference.features.dim();
            let interval_pixel = &bounds.base_interval * self.config.depth_interval_ratios[index];
            let range = match outputs.last() {
                None => self.sampler.uniform(
                    bounds.min.view(),
                    bounds.max.view(),
                    stage.ndepth(),
                    stage_h,
                    stage_w,
                )?,
                Some(previous) => {
                    self.resample(previous, stage.ndepth(), interval_pixel.view(), &bounds, stage_h, stage_w)?
                }
            };
            if index == 1 {
                let coarse = &outputs[0];
                let (_, coarse_h, coarse_w) = coarse.depth.dim();
                let window = self.resample(
                    coarse,
                    stage.ndepth(),
                    interval_pixel.view(),
                    &bounds,
                    coarse_h,
                    coarse_w,
                )?;
                intermediate_depths.push(loss_strategy_depth(
                    coarse.prob_volume.view(),
                    coarse.depth_values.view(),
                    window.lower.view(),
                    window.upper.view(),
                )?);
            }
            debug!(
                "stage {}: depth window [{:.3}, {:.3}]",
                index,
                range.lower.fold(f32::INFINITY, |m, &v| m.min(v)),
                range.upper.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
            );
            let ground_truth = input.gt_depths.as_ref().map(|gt| GroundTruth {
                depth: gt[index].view(),
                base_interval: bounds.base_interval.view(),
            });
            let output = stage.forward(
                &pairs,
                projections[index].view(),
                &range,
                self.regularization.get(index),
                ground_truth,
            )?;
            outputs.push(output);
        }

        let last = outputs
            .last()
            .ok_or_else(|| MvsError::InvalidConfig("the cascade has no stages".into()))?;
        let refined_depth = match &self.refiner {
            Some(refiner) => self.refine(refiner.as_ref(), input, &last.depth, &bounds)?,
            None => last.depth.clone(),
        };
        Ok(ModelOutput {
            stages: outputs,
            intermediate_depths,
            refined_depth,
        })
    }

    /// Hypotheses around the depth of `previous`, at `height x width`.
    fn resample(
        &self,
        previous: &StageOutput,
        ndepth: usize,
        interval_pixel: ndarray::ArrayView1<f32>,
        bounds: &DepthBounds,
        height: usize,
        width: usize,
    ) -> Result<DepthRange> {
        let current = resize_bilinear(previous.depth.view(), height, width);
        let uncertainty = previous
            .uncertainty
            .as_ref()
            .map(|u| resize_bilinear(u.view(), height, width));
        self.sampler.around(
            current.view(),
            ndepth,
            interval_pixel,
            uncertainty.as_ref().map(|u| u.view()),
            bounds.min.view(),
            bounds.max.view(),
        )
    }

    /// Epipoles of every reference/source pair in pixel coordinates of the processed
    /// images, one entry per source view.
    fn epipoles(&self, cameras: &Array2<CameraPair>, resize: f64) -> Vec<PairEpipoles> {
        let factor = self.config.stage_scales[NUM_STAGES - 1] as f64 * resize;
        let (batch, views) = cameras.dim();
        (1..views)
            .map(|v| {
                let mut pair = PairEpipoles {
                    reference: Vec::with_capacity(batch),
                    source: Vec::with_capacity(batch),
                };
                for b in 0..batch {
                    let f = fundamental_matrix(&cameras[[b, 0]], &cameras[[b, v]]);
                    let e = f.and_then(|f| f.epipole());
                    pair.reference.push(scale_epipole(e, factor, b, 0));
                    let e = f.and_then(|f| f.transpose().epipole());
                    pair.source.push(scale_epipole(e, factor, b, v));
                }
                pair
            })
            .collect()
    }

    /// Refines the final depth at the resolution of the input images.
    fn refine(
        &self,
        refiner: &dyn DepthRefiner,
        input: &ModelInput,
        depth: &Array3<f32>,
        bounds: &DepthBounds,
    ) -> Result<Array3<f32>> {
        let (batch, _, _, height, width) = input.images.dim();
        let scale = self.config.stage_scales[NUM_STAGES - 1];
        let interval = bounds.base_interval.view().into_shape((batch, 1, 1))?;
        let depth = resize_bilinear(depth.view(), height / scale, width / scale);
        let normalized = (&depth / &interval).insert_axis(Axis(1));
        let refined = refiner.refine(
            input.images.index_axis(Axis(1), 0),
            normalized.view(),
            (&bounds.min / &bounds.base_interval).view(),
            (&bounds.max / &bounds.base_interval).view(),
        )?;
        Ok(&refined.index_axis_move(Axis(1), 0) * &interval)
    }
}

fn scale_epipole(epipole: Option<Vector3<f64>>, factor: f64, b: usize, v: usize) -> Vector3<f64> {
    match epipole {
        Some(e) => Vector3::new(e.x * factor, e.y * factor, e.z),
        None => {
            warn!("view {} of batch element {} has no epipolar geometry with the reference", v, b);
            Vector3::zeros()
        }
    }
}

fn half_resolution(images: ArrayView5<f32>) -> Array5<f32> {
    let (batch, views, channels, height, width) = images.dim();
    let (h, w) = ((height / 2).max(1), (width / 2).max(1));
    let mut halved = Array5::zeros((batch, views, channels, h, w));
    for v in 0..views {
        let resized = resize_planes(images.index_axis(Axis(1), v), h, w);
        halved.slice_mut(s![.., v, .., .., ..]).assign(&resized);
    }
    halved
}

/// Epipoles of one reference/source pair, one per batch element.
struct PairEpipoles {
    reference: Vec<Vector3<f64>>,
    source: Vec<Vector3<f64>>,
}

/// Depth range and base hypothesis spacing of every batch element.
struct DepthBounds {
    min: Array1<f32>,
    max: Array1<f32>,
    base_interval: Array1<f32>,
}

impl DepthBounds {
    fn new(depth_values: ArrayView2<f32>, batch: usize) -> Result<Self> {
        let (values_batch, count) = depth_values.dim();
        ensure_shape("depth values batch", &[batch], &[values_batch])?;
        if count < 2 {
            return Err(MvsError::InvalidConfig(format!(
                "at least 2 initial depth values are needed, got {}",
                count
            )));
        }
        let min = depth_values.column(0).to_owned();
        let max = depth_values.column(count - 1).to_owned();
        let base_interval = &depth_values.column(1) - &depth_values.column(0);
        for ((&lo, &hi), &step) in min.iter().zip(max.iter()).zip(base_interval.iter()) {
            if !(lo.is_finite() && hi.is_finite() && hi > lo && step > 0.0) {
                return Err(MvsError::InvalidDepthRange { min: lo, max: hi });
            }
        }
        Ok(Self {
            min,
            max,
            base_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn bounds_from_depth_values() {
        let bounds = DepthBounds::new(arr2(&[[10.0, 12.5, 15.0, 17.5]]).view(), 1).unwrap();
        assert_eq!(bounds.min[0], 10.0);
        assert_eq!(bounds.max[0], 17.5);
        assert_eq!(bounds.base_interval[0], 2.5);
        assert!(matches!(
            DepthBounds::new(arr2(&[[10.0, 9.0, 8.0]]).view(), 1),
            Err(MvsError::InvalidDepthRange { .. })
        ));
        assert!(DepthBounds::new(arr2(&[[1.0, 2.0]]).view(), 2).is_err());
    }

    #[test]
    fn halving_keeps_constant_images() {
        let images = Array5::from_elem((1, 2, 3, 8, 6), 0.25f32);
        let halved = half_resolution(images.view());
        assert_eq!(halved.dim(), (1, 2, 3, 4, 3));
        assert!(halved.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn refinement_needs_a_refiner() {
        let config = MvsNetConfig {
            refine: true,
            ..Default::default()
        };
        let mut rng = Pcg64::seed_from_u64(0);
        let mut components = Components::reference(&config, &mut rng);
        components.refiner = None;
        assert!(matches!(
            CdsMvsNet::with_components(config, components),
            Err(MvsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn only_coarse_stages_estimate_uncertainty() {
        let net = CdsMvsNet::new(MvsNetConfig::default()).unwrap();
        let flags: Vec<bool> = net.stages().iter().map(Stage::has_uncertainty).collect();
        assert_eq!(flags, vec![true, true, false]);
    }
}
