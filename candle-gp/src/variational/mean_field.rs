use std::cell::RefCell;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::traits::VariationalDistributionT;
use super::{perturbed_mean, VariationalConfig};
use crate::distributions::{Distribution, MultivariateNormal};
use crate::error::{GpError, Result};
use crate::linalg::diag_embed;

/// Mean-field q(u) = N(μ, diag(σ²))
///
/// Parameters are stored as mean μ and log standard deviation ln(σ),
/// both `[*batch, M]`.
pub struct MeanFieldVariationalDistribution {
    batch_shape: Vec<usize>,
    num_inducing: usize,
    /// Variational mean μ
    mean: Var,
    /// Log standard deviation ln(σ)
    ln_std: Var,
    config: VariationalConfig,
    rng: RefCell<SmallRng>,
}

impl MeanFieldVariationalDistribution {
    /// μ = 0, ln_std = 0 (σ = 1)
    pub fn new(
        num_inducing: usize,
        batch_shape: &[usize],
        dtype: DType,
        device: &Device,
        config: VariationalConfig,
    ) -> Result<Self> {
        let mut shape = batch_shape.to_vec();
        shape.push(num_inducing);
        let mean = Var::zeros(shape.clone(), dtype, device)?;
        let ln_std = Var::zeros(shape, dtype, device)?;
        let rng = RefCell::new(SmallRng::seed_from_u64(config.seed));
        Ok(Self {
            batch_shape: batch_shape.to_vec(),
            num_inducing,
            mean,
            ln_std,
            config,
            rng,
        })
    }

    pub fn mean(&self) -> &Tensor {
        self.mean.as_tensor()
    }

    /// σ = exp(ln_std)
    pub fn std(&self) -> Result<Tensor> {
        Ok(self.ln_std.exp()?)
    }
}

impl VariationalDistributionT for MeanFieldVariationalDistribution {
    fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }

    fn num_inducing(&self) -> usize {
        self.num_inducing
    }

    /// μ = μ_p + ε σ_init and σ = sqrt(diag Σ_p)
    fn initialize_variational_distribution(&self, prior: &MultivariateNormal) -> Result<()> {
        let (dtype, device) = (self.mean.dtype(), self.mean.device());
        let mean = perturbed_mean(
            &mut *self.rng.borrow_mut(),
            prior.mean(),
            self.mean.dims(),
            self.config.mean_init_std,
            dtype,
            device,
        )?;
        self.mean.set(&mean)?;

        // ln σ = 0.5 * ln σ²
        let ln_std = (prior.variance()?.to_dtype(dtype)?.log()? * 0.5)?;
        let ln_std = ln_std.broadcast_as(self.ln_std.dims()).map_err(|_| {
            GpError::ShapeMismatch(format!(
                "prior variance {:?} does not fit variational shape {:?}",
                ln_std.dims(),
                self.ln_std.dims()
            ))
        })?;
        self.ln_std.set(&ln_std.contiguous()?)?;
        Ok(())
    }

    fn distribution(&self) -> Result<Distribution> {
        let scale_tril = diag_embed(&self.std()?)?;
        let q = MultivariateNormal::from_scale_tril(self.mean.as_tensor().clone(), scale_tril)?;
        Ok(q.into())
    }

    fn vars(&self) -> Vec<Var> {
        vec![self.mean.clone(), self.ln_std.clone()]
    }
}
