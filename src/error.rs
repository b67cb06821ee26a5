use thiserror::Error;

/// Failures that stop training or scoring.
///
/// Numerical trouble (ill-conditioned covariances, ALS that never settles,
/// windows too short to filter) is not in here: those paths recover locally
/// and report through return values instead.
#[derive(Error, Debug)]
pub enum TlccaError {
    /// A required table is missing or inconsistent with the rest of the model.
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// Caller supplied data with the wrong shape or out-of-range identifiers.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Neither the Chebyshev design nor the Butterworth fallback produced a filter.
    #[error("filter design failed for sub-band {band}: {reason}")]
    FilterDesign { band: usize, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, TlccaError>;
