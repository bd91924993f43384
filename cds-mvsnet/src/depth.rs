use crate::config::{ConfidenceWindow, DepthMode};
use crate::error::ensure_shape;
use crate::ops::{argmax, softmax_depth, EPSILON};
use crate::{MvsError, Result};
use ndarray::{Array3, Array4, ArrayView1, ArrayView3, ArrayView4, ArrayView5, Axis, Zip};

/// Depth, confidence and the probability volume they were read from.
#[derive(Debug, Clone)]
pub struct DepthEstimate {
    /// `(B, h, w)`
    pub depth: Array3<f32>,
    /// `(B, h, w)` in `[0, 1]`
    pub confidence: Array3<f32>,
    /// `(B, D, h, w)`, sums to one along the depth axis.
    pub prob_volume: Array4<f32>,
}

/// Turns a regularized cost volume into a depth map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthNet {
    mode: DepthMode,
    window: ConfidenceWindow,
}

impl DepthNet {
    pub fn new(mode: DepthMode) -> Self {
        Self {
            mode,
            window: ConfidenceWindow::default(),
        }
    }

    /// Replaces the hypothesis window summed into the regression confidence.
    pub fn with_confidence_window(self, window: ConfidenceWindow) -> Self {
        Self { window, ..self }
    }

    pub fn mode(&self) -> DepthMode {
        self.mode
    }

    /// Estimates depth and confidence.
    ///
    /// * `cost_reg` - `(B, 1, D, h, w)` regularized cost volume
    /// * `depth_values` - `(B, D, h, w)` increasing depth hypotheses
    /// * `num_depth` - the number of hypotheses the caller sampled
    /// * `interval` - `(B, h, w)` hypothesis spacing, used by unification
    /// * `prior` - `(B, D, h, w)` logits added before normalization
    pub fn forward(
        &self,
        cost_reg: ArrayView5<f32>,
        depth_values: ArrayView4<f32>,
        num_depth: usize,
        interval: ArrayView3<f32>,
        prior: Option<ArrayView4<f32>>,
    ) -> Result<DepthEstimate> {
        let (batch, channels, ndepth, height, width) = cost_reg.dim();
        ensure_shape("regularized cost channels", &[1], &[channels])?;
        if ndepth != num_depth {
            return Err(MvsError::HypothesisCount {
                expected: num_depth,
                actual: ndepth,
            });
        }
        if depth_values.len_of(Axis(1)) != num_depth {
            return Err(MvsError::HypothesisCount {
                expected: num_depth,
                actual: depth_values.len_of(Axis(1)),
            });
        }
        ensure_shape(
            "depth hypotheses",
            &[batch, num_depth, height, width],
            depth_values.shape(),
        )?;
        ensure_shape("depth interval", &[batch, height, width], interval.shape())?;

        let mut scores = cost_reg.index_axis(Axis(1), 0).to_owned();
        if let Some(prior) = prior {
            ensure_shape("depth prior", scores.shape(), prior.shape())?;
            scores += &prior;
        }
        let prob_volume = softmax_depth(scores.view());

        let mut depth = Array3::zeros((batch, height, width));
        let mut confidence = Array3::zeros((batch, height, width));
        let window = self.window;
        let mode = self.mode;
        Zip::from(&mut depth)
            .and(&mut confidence)
            .and(prob_volume.lanes(Axis(1)))
            .and(depth_values.lanes(Axis(1)))
            .and(&interval)
            .for_each(|depth, confidence, prob, hypotheses, &step| {
                let (d, c) = match mode {
                    DepthMode::Regression => (
                        regression(prob, hypotheses),
                        local_mass(prob, window),
                    ),
                    DepthMode::Classification => winner_take_all(prob, hypotheses),
                    DepthMode::Unification => unity_regression(prob, hypotheses, step),
                };
                *depth = d;
                *confidence = c;
            });

        Ok(DepthEstimate {
            depth,
            confidence,
            prob_volume,
        })
    }
}

/// Expected depth, kept within the hypotheses.
fn regression(prob: ArrayView1<f32>, hypotheses: ArrayView1<f32>) -> f32 {
    let expected = prob.dot(&hypotheses);
    let (lo, hi) = (hypotheses[0], hypotheses[hypotheses.len() - 1]);
    expected.max(lo).min(hi)
}

/// Probability mass around the expected hypothesis index.
fn local_mass(prob: ArrayView1<f32>, window: ConfidenceWindow) -> f32 {
    let last = prob.len() - 1;
    let expected_index: f32 = prob.iter().enumerate().map(|(i, &p)| i as f32 * p).sum();
    let index = (expected_index.floor().max(0.0) as usize).min(last);
    let start = index.saturating_sub(window.before);
    let end = (index + window.after).min(last);
    prob.slice(ndarray::s![start..=end]).sum().min(1.0)
}

fn winner_take_all(prob: ArrayView1<f32>, hypotheses: ArrayView1<f32>) -> (f32, f32) {
    let (k, p) = argmax(prob);
    (hypotheses[k], p)
}

/// Refines the peak hypothesis towards the heavier of its two neighbours.
///
/// The offset is the probability imbalance of the neighbours relative to the mass of
/// the three hypotheses around the peak, in units of `interval`. Missing neighbours at
/// either end have no mass.
fn unity_regression(prob: ArrayView1<f32>, hypotheses: ArrayView1<f32>, interval: f32) -> (f32, f32) {
    let (k, peak) = argmax(prob);
    let dk = hypotheses[k];
    let (below_p, below_d) = match k.checked_sub(1) {
        Some(i) => (prob[i], hypotheses[i]),
        None => (0.0, dk),
    };
    let (above_p, above_d) = match hypotheses.get(k + 1) {
        Some(&d) => (prob[k + 1], d),
        None => (0.0, dk),
    };
    let mass = below_p + peak + above_p;
    let offset = if mass > EPSILON {
        (above_p - below_p) / mass
    } else {
        0.0
    };
    let depth = (dk + interval * offset).max(below_d).min(above_d);
    (depth, peak)
}
