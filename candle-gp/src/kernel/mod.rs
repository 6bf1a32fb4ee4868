//! Stationary kernels evaluated with Monte-Carlo spectral integration.

mod grid;
mod spectral_flow;

pub use grid::{check_num_dims, pairwise_differences};
pub use spectral_flow::SpectralFlowKernel;

use std::path::Path;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{GpError, Result};

/// Covariance function between two point sets
pub trait KernelT {
    /// Input dimensionality D the kernel is configured for
    fn num_dims(&self) -> usize;

    /// Covariance between `x1` and `x2`
    ///
    /// # Arguments
    /// * `x1` - `[*batch, n, D]`
    /// * `x2` - `[*batch, m, D]` (`m == n` when `diag`)
    /// * `diag` - only the elementwise pairs `k(x1[i], x2[i])`
    /// * `last_dim_is_batch` - treat each input column as its own 1-D problem
    ///
    /// # Returns
    /// `[*batch, n, m]`, or `[*batch, n]` when `diag`. With
    /// `last_dim_is_batch` a `D` axis is inserted before the last two.
    fn evaluate(&self, x1: &Tensor, x2: &Tensor, diag: bool, last_dim_is_batch: bool)
        -> Result<Tensor>;

    /// Full covariance matrix `[*batch, n, m]`
    fn forward(&self, x1: &Tensor, x2: &Tensor) -> Result<Tensor> {
        self.evaluate(x1, x2, false, false)
    }
}

/// Monte-Carlo estimator of the spectral integral
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpectralEstimator {
    /// uniform average of `cos(2π zᵀΔ)` over the draws
    Mean,
    /// self-normalized average weighted by the flow density of each draw
    ///
    /// The weights already sum to one, so the estimate is `Σ_s w_s cos(·)`.
    /// Averaging the weighted terms instead (an extra `1/S`) would scale
    /// the kernel down to `k(0) = 1/S`.
    Importance,
}

impl SpectralEstimator {
    /// Draws per evaluation unless configured otherwise
    pub fn default_num_samples(&self) -> usize {
        match self {
            SpectralEstimator::Mean => 2000,
            SpectralEstimator::Importance => 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralKernelConfig {
    /// input dimensionality D
    pub num_dims: usize,
    /// number of autoregressive blocks in the flow
    pub stack_size: usize,
    /// hidden layer widths of each block, as multiples of D
    pub hidden_factors: Vec<usize>,
    /// frequency draws per evaluation; `None` picks the estimator's default
    pub num_samples: Option<usize>,
    pub estimator: SpectralEstimator,
    pub init_lengthscale: f64,
    /// one lengthscale per input dimension
    pub ard: bool,
    /// seed of the base-distribution draws
    pub seed: u64,
}

impl Default for SpectralKernelConfig {
    fn default() -> Self {
        Self {
            num_dims: 1,
            stack_size: 1,
            hidden_factors: vec![8, 8],
            num_samples: None,
            estimator: SpectralEstimator::Mean,
            init_lengthscale: 1.0,
            ard: false,
            seed: 42,
        }
    }
}

impl SpectralKernelConfig {
    pub fn new(num_dims: usize, estimator: SpectralEstimator) -> Self {
        Self {
            num_dims,
            estimator,
            ..Default::default()
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
            .unwrap_or_else(|| self.estimator.default_num_samples())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_dims == 0 {
            return Err(GpError::Config("num_dims must be at least 1".into()));
        }
        if self.stack_size == 0 {
            return Err(GpError::Config("stack_size must be at least 1".into()));
        }
        if self.num_samples() == 0 {
            return Err(GpError::Config("num_samples must be at least 1".into()));
        }
        if !(self.init_lengthscale > 0.0 && self.init_lengthscale.is_finite()) {
            return Err(GpError::Config(format!(
                "lengthscale must be strictly positive, got {}",
                self.init_lengthscale
            )));
        }
        if self.hidden_factors.iter().any(|&f| f == 0) {
            return Err(GpError::Config("hidden factors must be positive".into()));
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GpError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| GpError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| GpError::Config(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| GpError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Strictly positive lengthscale stored on the log scale, shape `[1, D]`
/// with ARD or `[1, 1]` shared across dimensions.
pub struct Lengthscale {
    log_value: Tensor,
}

impl Lengthscale {
    pub fn new(num_dims: usize, ard: bool, init: f64, vb: VarBuilder) -> Result<Self> {
        if !(init > 0.0 && init.is_finite()) {
            return Err(GpError::Config(format!(
                "lengthscale must be strictly positive, got {}",
                init
            )));
        }
        let d = if ard { num_dims } else { 1 };
        let log_value =
            vb.get_with_hints((1, d), "log_lengthscale", candle_nn::Init::Const(init.ln()))?;
        Ok(Self { log_value })
    }

    pub fn value(&self) -> Result<Tensor> {
        Ok(self.log_value.exp()?)
    }

    /// `x / lengthscale`, broadcast over the last dimension
    pub fn rescale(&self, x: &Tensor) -> Result<Tensor> {
        let ls = self.value()?.to_dtype(x.dtype())?;
        let ls = ls.squeeze(0)?;
        Ok(x.broadcast_div(&ls)?)
    }
}
