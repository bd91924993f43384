//! Cascaded multi-view stereo with visibility-aware cost aggregation.
//!
//! The network estimates the depth map of a reference view from one or more source
//! views in three stages that go from coarse to fine. Each stage
//!
//! 1. places depth hypotheses, uniformly over the depth range for the first stage and
//!    in a window around the previous estimate afterwards,
//! 2. warps the source features onto the hypothesis planes of the reference camera,
//! 3. weighs every source view by a predicted visibility and averages the
//!    correlation volumes,
//! 4. regularizes the averaged cost and turns it into a probability volume, a depth
//!    map and a confidence map.
//!
//! The uncertainty of the coarse stages controls how wide the window of the following
//! stage is. The learned collaborators (feature backbone, cost regularizer,
//! uncertainty estimator and refinement) sit behind traits; seeded reference
//! implementations are provided.
//!
//! ```
//! use cds_mvsnet::{CdsMvsNet, DepthMode, MvsNetConfig, PlaneScene};
//!
//! let config = MvsNetConfig {
//!     ndepths: [8, 4, 2],
//!     feature_channels: [4, 4, 4],
//!     regularizer_base_channels: [4, 4, 4],
//!     depth_mode: DepthMode::Regression,
//!     ..Default::default()
//! };
//! let net = CdsMvsNet::new(config).unwrap();
//! let input = PlaneScene::default().with_size(16, 16).input(&config).unwrap();
//! let output = net.forward(&input).unwrap();
//! assert_eq!(output.stages.len(), 3);
//! assert!(output.refined_depth.iter().all(|&d| (10.0..=100.0).contains(&d)));
//! ```

mod aggregation;
mod backbone;
mod config;
mod depth;
mod error;
mod layers;
mod model;
mod ops;
mod refinement;
mod regularizer;
mod sampling;
mod scene;
mod stage;
mod supervision;
mod uncertainty;
mod visibility;
mod warping;

/// Number of stages of the cascade.
pub const NUM_STAGES: usize = 3;

pub use aggregation::{correlate, similarity, CostAggregation, ViewContribution};
pub use backbone::{CurvaturePyramid, FeatureBackbone, FeatureMap};
pub use config::{ConfidenceWindow, DepthMode, MvsNetConfig, SamplerConfig};
pub use depth::{DepthEstimate, DepthNet};
pub use error::{MvsError, Result};
pub use layers::{BatchNorm2d, Conv2d, Conv3d, ConvBnRelu};
pub use model::{
    CdsMvsNet, Components, CostRegularization, ModelInput, ModelOutput, StageProjections,
};
pub use ops::{area_pool, entropy_depth, resize_bilinear, resize_planes, softmax_depth};
pub use refinement::{DepthRefiner, ResidualRefinement};
pub use regularizer::{Conv3dRegularizer, CostRegularizer};
pub use sampling::{DepthRange, DepthRangeSampler};
pub use scene::PlaneScene;
pub use stage::{GroundTruth, Stage, StageOutput, ViewPair};
pub use supervision::{feature_target, loss_strategy_depth};
pub use uncertainty::{Rem, UncertaintyEstimator};
pub use visibility::{similarity_entropy, VisibilityNet};
pub use warping::warp_features;

pub use mvs_epipolar::{CameraMatrix, CameraPair};
