use thiserror::Error;

/// Failures surfaced by kernels, linear algebra and variational strategies.
#[derive(Error, Debug)]
pub enum GpError {
    /// Cholesky factorization failed even after the bounded jitter retries.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// q(u) is neither a multivariate normal nor a point mass.
    #[error("invalid variational distribution ({name}): expected a multivariate normal or a delta distribution")]
    InvalidDistribution { name: String },

    /// Input dimensionality or pairing does not match what the operation needs.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, GpError>;

impl GpError {
    pub fn invalid_distribution(name: impl Into<String>) -> Self {
        GpError::InvalidDistribution { name: name.into() }
    }
}
