//! Variational inference over inducing points.
//!
//! A [`VariationalStrategy`] turns q(u), a distribution over function values
//! at M inducing points, into a predictive distribution at query points,
//! and supplies `KL(q(u) ‖ p(u))` for the training objective.
//!
//! # Example
//!
//! ```ignore
//! let q = CholeskyVariationalDistribution::new(m, &[], DType::F64, &device, VariationalConfig::default())?;
//! let mut strategy = VariationalStrategy::new(&gp, &z, &q, WhitenedMapper::default(), true)?;
//!
//! // training step
//! strategy.train();
//! let out = strategy.call(&x, CallOptions::default())?;
//! let kl = strategy.kl_divergence()?;
//!
//! // prediction
//! strategy.eval();
//! let out = strategy.call(&x_new, CallOptions::default())?;
//! ```

mod cache;
mod cholesky_variational;
mod delta_variational;
mod inducing;
mod joint;
mod mean_field;
mod strategy;
mod traits;
mod unwhitened;
mod whitened;

pub use cache::{CacheKey, CacheStats, StrategyCache};
pub use cholesky_variational::CholeskyVariationalDistribution;
pub use delta_variational::DeltaVariationalDistribution;
pub use inducing::InducingPointStore;
pub use joint::{joint_prior, JointPrior};
pub use mean_field::MeanFieldVariationalDistribution;
pub use strategy::{CallOptions, Mode, StrategyOutput, VariationalStrategy};
pub use traits::{MarginalContext, PredictiveMapper, VariationalDistributionT};
pub use unwhitened::UnwhitenedMapper;
pub use whitened::WhitenedMapper;

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::distributions::standard_normal;
use crate::error::{GpError, Result};

/// Initialization of variational generators
#[derive(Clone, Debug)]
pub struct VariationalConfig {
    /// std of the noise added to the prior mean at initialization
    pub mean_init_std: f64,
    /// seed of that noise
    pub seed: u64,
}

impl Default for VariationalConfig {
    fn default() -> Self {
        Self {
            mean_init_std: 1e-3,
            seed: 0,
        }
    }
}

impl VariationalConfig {
    pub fn new(mean_init_std: f64, seed: u64) -> Self {
        Self {
            mean_init_std,
            seed,
        }
    }
}

/// Diagonal jitter of the predictive mappers
#[derive(Clone, Debug)]
pub struct MapperConfig {
    /// added to K_zz before factorization
    pub inducing_jitter: f64,
    /// added to the predictive covariance
    pub data_jitter: f64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            inducing_jitter: 1e-3,
            data_jitter: 1e-4,
        }
    }
}

/// Right-aligned broadcast of two batch shapes
pub fn broadcast_batch(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![1; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(GpError::ShapeMismatch(format!(
                    "batch shapes {:?} and {:?} do not broadcast",
                    a, b
                )))
            }
        };
    }
    Ok(out)
}

/// `prior_mean + std * ε` broadcast to `shape`, in the generator's dtype
pub(crate) fn perturbed_mean<R: Rng + ?Sized>(
    rng: &mut R,
    prior_mean: &Tensor,
    shape: &[usize],
    std: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let noise = (standard_normal(rng, shape, dtype, device)? * std)?;
    let mean = prior_mean
        .to_dtype(dtype)?
        .broadcast_as(shape)
        .map_err(|_| {
            GpError::ShapeMismatch(format!(
                "prior mean {:?} does not fit variational shape {:?}",
                prior_mean.dims(),
                shape
            ))
        })?;
    Ok((mean + noise)?.contiguous()?)
}
