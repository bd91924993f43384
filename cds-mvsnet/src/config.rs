use crate::{MvsError, Result, NUM_STAGES};
use derive_more::Display;
use std::str::FromStr;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// How a probability volume is turned into a depth map.
///
/// The mode is fixed when a [`crate::DepthNet`] is constructed.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(rename_all = "lowercase"))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum DepthMode {
    /// Expectation of the hypotheses under the probability volume.
    #[display(fmt = "regression")]
    Regression,
    /// Winner-take-all: the hypothesis with the highest probability.
    #[display(fmt = "classification")]
    Classification,
    /// Peak hypothesis refined towards its neighbours by the sampling interval.
    #[display(fmt = "unification")]
    Unification,
}

impl Default for DepthMode {
    fn default() -> Self {
        DepthMode::Unification
    }
}

impl FromStr for DepthMode {
    type Err = MvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regression" => Ok(DepthMode::Regression),
            "classification" => Ok(DepthMode::Classification),
            "unification" => Ok(DepthMode::Unification),
            other => Err(MvsError::UnsupportedMode(other.to_owned())),
        }
    }
}

/// The hypotheses summed into the regression-mode photometric confidence.
///
/// The window covers `before` hypotheses below and `after` hypotheses above the
/// expected hypothesis index.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfidenceWindow {
    pub before: usize,
    pub after: usize,
}

impl Default for ConfidenceWindow {
    fn default() -> Self {
        Self {
            before: 1,
            after: 2,
        }
    }
}

/// Controls how uncertainty widens the depth window of the next stage.
///
/// The window scale is `clamp(min_scale + uncertainty_gain * u, min_scale, max_scale)`.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Scale of the window for a fully certain pixel.
    pub min_scale: f32,
    /// Largest scale any uncertainty can produce.
    pub max_scale: f32,
    /// Growth of the scale per unit of uncertainty.
    pub uncertainty_gain: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min_scale: 0.5,
            max_scale: 2.0,
            uncertainty_gain: 1.5,
        }
    }
}

/// The configuration of the cascade.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MvsNetConfig {
    /// Number of depth hypotheses of every stage.
    pub ndepths: [usize; NUM_STAGES],
    /// Multiplier of the base depth interval that spaces each stage's hypotheses.
    pub depth_interval_ratios: [f32; NUM_STAGES],
    /// Downsampling factor of every stage relative to the processed image.
    pub stage_scales: [usize; NUM_STAGES],
    /// Channels of the reference backbone features per stage.
    pub feature_channels: [usize; NUM_STAGES],
    /// Hidden channels of the reference cost regularizer per stage.
    pub regularizer_base_channels: [usize; NUM_STAGES],
    pub depth_mode: DepthMode,
    pub confidence_window: ConfidenceWindow,
    pub sampler: SamplerConfig,
    /// Run the refinement network on the final depth. Images are processed at half resolution.
    pub refine: bool,
    /// Use one cost regularizer for all stages.
    pub share_cost_regularizer: bool,
    /// Seed of the generator that initializes every parameter.
    pub seed: u64,
}

impl Default for MvsNetConfig {
    fn default() -> Self {
        Self {
            ndepths: [48, 32, 8],
            depth_interval_ratios: [4.0, 2.0, 1.0],
            stage_scales: [4, 2, 1],
            feature_channels: [32, 16, 8],
            regularizer_base_channels: [8, 8, 8],
            depth_mode: DepthMode::default(),
            confidence_window: ConfidenceWindow::default(),
            sampler: SamplerConfig::default(),
            refine: false,
            share_cost_regularizer: false,
            seed: 1234,
        }
    }
}

impl MvsNetConfig {
    /// Checks the invariants the cascade relies on.
    pub fn validate(&self) -> Result<()> {
        if let Some(&n) = self.ndepths.iter().find(|&&n| n < 2) {
            return Err(MvsError::InvalidConfig(format!(
                "every stage needs at least 2 depth hypotheses, got {}",
                n
            )));
        }
        if self
            .depth_interval_ratios
            .iter()
            .any(|&r| !(r > 0.0 && r.is_finite()))
        {
            return Err(MvsError::InvalidConfig(format!(
                "depth interval ratios must be positive, got {:?}",
                self.depth_interval_ratios
            )));
        }
        if self.stage_scales.iter().any(|&s| s == 0) {
            return Err(MvsError::InvalidConfig(format!(
                "stage scales must be at least 1, got {:?}",
                self.stage_scales
            )));
        }
        if self.stage_scales.windows(2).any(|w| w[0] < w[1]) {
            return Err(MvsError::InvalidConfig(format!(
                "stages must go from coarse to fine, got scales {:?}",
                self.stage_scales
            )));
        }
        if self.feature_channels.iter().any(|&c| c == 0)
            || self.regularizer_base_channels.iter().any(|&c| c == 0)
        {
            return Err(MvsError::InvalidConfig("channel counts must be non-zero".into()));
        }
        if self.share_cost_regularizer && self.feature_channels.windows(2).any(|w| w[0] != w[1]) {
            return Err(MvsError::InvalidConfig(
                "a shared cost regularizer needs the same feature channels at every stage".into(),
            ));
        }
        let sampler = &self.sampler;
        if !(sampler.min_scale > 0.0
            && sampler.max_scale >= sampler.min_scale
            && sampler.uncertainty_gain >= 0.0)
        {
            return Err(MvsError::InvalidConfig(format!(
                "invalid sampler configuration {:?}",
                sampler
            )));
        }
        Ok(())
    }
}
