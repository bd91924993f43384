use thiserror::Error;

/// Errors surfaced by a forward pass.
///
/// Every variant except [`MvsError::UnsupportedMode`] is a precondition failure caused
/// by inputs or components that do not fit together. None of them are transient, so
/// nothing here is ever retried.
#[derive(Debug, Error)]
pub enum MvsError {
    #[error("unsupported depth estimation mode `{0}`, expected regression, classification or unification")]
    UnsupportedMode(String),
    #[error("stage declares {expected} depth hypotheses but received {actual}")]
    HypothesisCount { expected: usize, actual: usize },
    #[error("got features of {features} views but projections of {projections} views")]
    ViewCount { features: usize, projections: usize },
    #[error("{what}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("invalid depth range [{min}, {max}]")]
    InvalidDepthRange { min: f32, max: f32 },
    #[error("camera matrix of batch element {0} is not invertible")]
    SingularCamera(usize),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = core::result::Result<T, MvsError>;

/// Fails with [`MvsError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn ensure_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MvsError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}
