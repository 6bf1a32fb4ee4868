use std::cell::RefCell;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::traits::VariationalDistributionT;
use super::{perturbed_mean, VariationalConfig};
use crate::distributions::{Distribution, MultivariateNormal};
use crate::error::{GpError, Result};
use crate::linalg::{eye, tril_mask, JitterConfig};

/// Full-covariance q(u) = N(m, L Lᵀ)
///
/// Parameters are the mean m `[*batch, M]` and an unconstrained square
/// matrix `[*batch, M, M]` whose lower triangle is L.
pub struct CholeskyVariationalDistribution {
    batch_shape: Vec<usize>,
    num_inducing: usize,
    mean: Var,
    chol: Var,
    tril: Tensor,
    config: VariationalConfig,
    jitter: JitterConfig,
    rng: RefCell<SmallRng>,
}

impl CholeskyVariationalDistribution {
    /// Starts at N(0, I)
    pub fn new(
        num_inducing: usize,
        batch_shape: &[usize],
        dtype: DType,
        device: &Device,
        config: VariationalConfig,
    ) -> Result<Self> {
        let mut mean_shape = batch_shape.to_vec();
        mean_shape.push(num_inducing);
        let mut chol_shape = mean_shape.clone();
        chol_shape.push(num_inducing);

        let mean = Var::zeros(mean_shape, dtype, device)?;
        let identity = eye(num_inducing, dtype, device)?
            .broadcast_as(chol_shape)?
            .contiguous()?;
        let chol = Var::from_tensor(&identity)?;
        let tril = tril_mask(num_inducing, dtype, device)?;
        let rng = RefCell::new(SmallRng::seed_from_u64(config.seed));

        Ok(Self {
            batch_shape: batch_shape.to_vec(),
            num_inducing,
            mean,
            chol,
            tril,
            config,
            jitter: JitterConfig::default(),
            rng,
        })
    }

    pub fn mean(&self) -> &Tensor {
        self.mean.as_tensor()
    }

    /// L, `[*batch, M, M]`
    pub fn scale_tril(&self) -> Result<Tensor> {
        Ok(self.chol.as_tensor().broadcast_mul(&self.tril)?)
    }
}

impl VariationalDistributionT for CholeskyVariationalDistribution {
    fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }

    fn num_inducing(&self) -> usize {
        self.num_inducing
    }

    /// m = μ_p + ε σ_init and L = chol(Σ_p)
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

        let l = prior.scale_tril(&self.jitter)?.to_dtype(dtype)?;
        let l = l.broadcast_as(self.chol.dims()).map_err(|_| {
            GpError::ShapeMismatch(format!(
                "prior covariance {:?} does not fit variational shape {:?}",
                l.dims(),
                self.chol.dims()
            ))
        })?;
        self.chol.set(&l.contiguous()?)?;
        Ok(())
    }

    fn distribution(&self) -> Result<Distribution> {
        let q = MultivariateNormal::from_scale_tril(self.mean.as_tensor().clone(), self.scale_tril()?)?;
        Ok(q.into())
    }

    fn vars(&self) -> Vec<Var> {
        vec![self.mean.clone(), self.chol.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_starts_at_standard_normal() -> Result<()> {
        let q = CholeskyVariationalDistribution::new(
            3,
            &[2],
            DType::F64,
            &Device::Cpu,
            VariationalConfig::default(),
        )?;
        match q.distribution()? {
            Distribution::MultivariateNormal(d) => {
                assert_eq!(d.mean().dims(), &[2, 3]);
                let cov: Vec<Vec<Vec<f64>>> = d.covariance().to_vec3()?;
                assert_eq!(cov[1][1][1], 1.0);
                assert_eq!(cov[1][0][1], 0.0);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        Ok(())
    }

    #[test]
    fn test_initialize_from_prior() -> Result<()> {
        let q = CholeskyVariationalDistribution::new(
            2,
            &[],
            DType::F64,
            &Device::Cpu,
            VariationalConfig::new(0.0, 1),
        )?;
        let mean = Tensor::new(&[1.0f64, -1.0], &Device::Cpu)?;
        let cov = Tensor::new(&[[4.0f64, 2.0], [2.0, 2.0]], &Device::Cpu)?;
        let prior = MultivariateNormal::new(mean, cov)?;
        q.initialize_variational_distribution(&prior)?;

        assert_eq!(q.mean().to_vec1::<f64>()?, vec![1.0, -1.0]);
        let l: Vec<Vec<f64>> = q.scale_tril()?.to_vec2()?;
        assert_abs_diff_eq!(l[0][0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[1][0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[1][1], 1.0, epsilon = 1e-12);
        assert_eq!(l[0][1], 0.0);
        Ok(())
    }
}
