use std::cell::RefCell;
use std::f64::consts::PI;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use log::debug;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::grid::{check_num_dims, pairwise_differences};
use super::{KernelT, Lengthscale, SpectralEstimator, SpectralKernelConfig};
use crate::distributions::Normal;
use crate::error::{GpError, Result};
use crate::flow::{FlowStack, TransformedDistribution};

/// Stationary kernel whose spectral density is a learned normalizing flow
///
/// By Bochner's theorem
///
/// k(x, x') = E_{z ~ q}[cos(2π zᵀ(x - x') / ℓ)]
///
/// where q is a standard normal pushed through the flow. Every evaluation
/// draws a fresh batch of S frequencies, so the estimate is stochastic but
/// differentiable w.r.t. the lengthscale and the flow parameters.
///
/// * [`SpectralEstimator::Mean`]: uniform average over S = 2000 draws
/// * [`SpectralEstimator::Importance`]: S = 1000 draws, averaged with
///   weights `softmax(log q(z))` over the sample axis
pub struct SpectralFlowKernel {
    config: SpectralKernelConfig,
    lengthscale: Lengthscale,
    flow: FlowStack,
    base: Normal,
    rng: RefCell<SmallRng>,
}

impl SpectralFlowKernel {
    pub fn new(config: SpectralKernelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let d = config.num_dims;

        let lengthscale = Lengthscale::new(
            d,
            config.ard,
            config.init_lengthscale,
            vb.pp("lengthscale"),
        )?;
        let flow = FlowStack::autoregressive(
            d,
            config.stack_size,
            &config.hidden_factors,
            vb.pp("flow"),
        )?;
        let base = Normal::standard(d, vb.dtype(), vb.device())?;
        let rng = RefCell::new(SmallRng::seed_from_u64(config.seed));

        Ok(Self {
            config,
            lengthscale,
            flow,
            base,
            rng,
        })
    }

    pub fn config(&self) -> &SpectralKernelConfig {
        &self.config
    }

    pub fn lengthscale(&self) -> &Lengthscale {
        &self.lengthscale
    }

    pub fn flow(&self) -> &FlowStack {
        &self.flow
    }

    pub fn dtype(&self) -> DType {
        self.base.loc().dtype()
    }

    /// Restart the frequency draws from `seed`
    pub fn reseed(&self, seed: u64) {
        *self.rng.borrow_mut() = SmallRng::seed_from_u64(seed);
    }

    /// Draw S frequencies from the flow
    ///
    /// # Returns
    /// `(z, log_q)` with shapes `[S, D]` and `[S]`
    pub fn draw_frequencies(&self) -> Result<(Tensor, Tensor)> {
        let num_samples = self.config.num_samples();
        let spectral = TransformedDistribution::new(self.base.clone(), &self.flow)?;
        let mut rng = self.rng.borrow_mut();
        let draws = spectral.rsample_with_log_prob(&mut *rng, num_samples)?;
        debug!(
            "drew {} spectral frequencies ({:?} estimator)",
            num_samples, self.config.estimator
        );
        Ok(draws)
    }

    /// Monte-Carlo cosine integral over a grid of differences
    ///
    /// # Arguments
    /// * `diffs` - `[..., D]` rescaled differences
    ///
    /// # Returns
    /// `[...]`
    fn spectral_average(&self, diffs: &Tensor) -> Result<Tensor> {
        let dims = diffs.dims().to_vec();
        let d = dims[dims.len() - 1];
        let lead = dims[..dims.len() - 1].to_vec();
        let num_pairs: usize = lead.iter().product();

        let (z_sd, log_q_s) = self.draw_frequencies()?;
        let diffs_pd = diffs.reshape((num_pairs, d))?;

        // [P, S]
        let phase_ps = (diffs_pd.matmul(&z_sd.t()?.contiguous()?)? * (2.0 * PI))?;
        let cos_ps = phase_ps.cos()?;

        let k_p = match self.config.estimator {
            SpectralEstimator::Mean => cos_ps.mean(1)?,
            SpectralEstimator::Importance => {
                let w_s = importance_weights(&log_q_s)?;
                // weighted sum, not a weighted mean
                cos_ps.broadcast_mul(&w_s.unsqueeze(0)?)?.sum(1)?
            }
        };
        Ok(k_p.reshape(lead)?)
    }
}

/// Self-normalized weights over the last axis, `exp(l - max l) / Σ exp(l - max l)`
pub fn importance_weights(log_q: &Tensor) -> Result<Tensor> {
    let last = log_q.rank() - 1;
    let shifted = log_q.broadcast_sub(&log_q.max_keepdim(last)?)?;
    let w = shifted.exp()?;
    Ok(w.broadcast_div(&w.sum_keepdim(last)?)?)
}

/// `[*batch, n, D] -> [*batch, D, n, 1]`
fn columns_as_batch(x: &Tensor) -> Result<Tensor> {
    let r = x.rank();
    Ok(x.transpose(r - 2, r - 1)?.contiguous()?.unsqueeze(r)?)
}

impl KernelT for SpectralFlowKernel {
    fn num_dims(&self) -> usize {
        self.config.num_dims
    }

    fn evaluate(
        &self,
        x1: &Tensor,
        x2: &Tensor,
        diag: bool,
        last_dim_is_batch: bool,
    ) -> Result<Tensor> {
        if last_dim_is_batch {
            if self.config.num_dims != 1 {
                return Err(GpError::ShapeMismatch(format!(
                    "last_dim_is_batch needs a one-dimensional kernel, this one has {} dims",
                    self.config.num_dims
                )));
            }
            if x1.rank() < 2 || x2.rank() < 2 {
                return Err(GpError::ShapeMismatch(format!(
                    "kernel inputs must be [*batch, n, D], got {:?} and {:?}",
                    x1.dims(),
                    x2.dims()
                )));
            }
        } else {
            check_num_dims(x1, self.config.num_dims)?;
            check_num_dims(x2, self.config.num_dims)?;
        }

        let dtype = self.dtype();
        let x1_ = self.lengthscale.rescale(&x1.to_dtype(dtype)?)?;
        let x2_ = if x1.id() == x2.id() {
            x1_.clone()
        } else {
            self.lengthscale.rescale(&x2.to_dtype(dtype)?)?
        };

        let (x1_, x2_) = if last_dim_is_batch {
            (columns_as_batch(&x1_)?, columns_as_batch(&x2_)?)
        } else {
            (x1_, x2_)
        };

        let diffs = pairwise_differences(&x1_, &x2_, diag)?;
        self.spectral_average(&diffs)
    }
}
