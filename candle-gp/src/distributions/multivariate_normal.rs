use candle_core::{DType, Tensor};
use rand::Rng;

use super::{standard_normal, LN_2PI};
use crate::error::{GpError, Result};
use crate::linalg::{
    batch_lower_triangular_inverse, diagonal, from_dmatrices, safe_cholesky, solve_psd,
    to_dmatrices, JitterConfig,
};
use crate::settings;

/// Batched multivariate normal N(μ, Σ)
///
/// * `mean` - `[*batch, M]`
/// * `covariance` - `[*batch, M, M]`
///
/// When built from a lower-triangular scale `L` the factor is kept, so
/// log-determinants and KL terms stay differentiable through it.
#[derive(Clone, Debug)]
pub struct MultivariateNormal {
    mean: Tensor,
    covariance: Tensor,
    scale_tril: Option<Tensor>,
}

impl MultivariateNormal {
    pub fn new(mean: Tensor, covariance: Tensor) -> Result<Self> {
        check_shapes(&mean, &covariance)?;
        Ok(Self {
            mean,
            covariance,
            scale_tril: None,
        })
    }

    /// Σ = L Lᵀ
    pub fn from_scale_tril(mean: Tensor, scale_tril: Tensor) -> Result<Self> {
        check_shapes(&mean, &scale_tril)?;
        let covariance = scale_tril.matmul(&scale_tril.t()?)?;
        Ok(Self {
            mean,
            covariance,
            scale_tril: Some(scale_tril),
        })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn covariance(&self) -> &Tensor {
        &self.covariance
    }

    /// Marginal variances, `[*batch, M]`
    pub fn variance(&self) -> Result<Tensor> {
        diagonal(&self.covariance)
    }

    pub fn batch_shape(&self) -> &[usize] {
        let dims = self.mean.dims();
        &dims[..dims.len() - 1]
    }

    pub fn event_size(&self) -> usize {
        let dims = self.mean.dims();
        dims[dims.len() - 1]
    }

    pub fn dtype(&self) -> DType {
        self.mean.dtype()
    }

    /// Lower Cholesky factor of Σ in the working dtype. A stored factor is
    /// returned as is; otherwise it is computed (detached) with jitter retries.
    pub fn scale_tril(&self, jitter: &JitterConfig) -> Result<Tensor> {
        match &self.scale_tril {
            Some(l) => Ok(l.clone()),
            None => Ok(safe_cholesky(&self.covariance, jitter)?.to_dtype(self.dtype())?),
        }
    }

    /// log |Σ| per batch, `[*batch]`
    pub fn logdet(&self, jitter: &JitterConfig) -> Result<Tensor> {
        let l = self.scale_tril(jitter)?;
        let diag = diagonal(&l)?;
        Ok((diag.abs()?.log()?.sum(diag.rank() - 1)? * 2.0)?)
    }

    /// δᵀ Σ⁻¹ δ over the last dimension of `diff` (`[..., *batch, M]`).
    ///
    /// Uses `L⁻¹δ` from a dense factor, unless preconditioning is enabled and
    /// M exceeds `settings::max_cholesky_size()`: then `x = Σ⁻¹δ` comes from
    /// preconditioned CG and the quadratic is formed as `2δᵀx - xᵀΣx`, which
    /// has the same value and gradient at the solution.
    pub fn inv_quad(&self, diff: &Tensor, jitter: &JitterConfig) -> Result<Tensor> {
        let m = self.event_size();
        let iterative = settings::max_preconditioner_size() > 0
            && m > settings::max_cholesky_size()
            && diff.dims() == self.mean.dims();

        if iterative {
            let (batch, covs) = to_dmatrices(&self.covariance)?;
            let (_, rhs) = to_dmatrices(&diff.unsqueeze(diff.rank())?)?;
            let solved = covs
                .iter()
                .zip(rhs.iter())
                .map(|(c, b)| solve_psd(c, b, jitter))
                .collect::<Result<Vec<_>>>()?;
            let x = from_dmatrices(&batch, &solved, diff.device())?
                .to_dtype(diff.dtype())?
                .squeeze(diff.rank())?;

            let two_dx = ((diff * &x)?.sum(diff.rank() - 1)? * 2.0)?;
            let sigma_x = self
                .covariance
                .matmul(&x.unsqueeze(x.rank())?)?
                .squeeze(x.rank())?;
            let x_sigma_x = (&x * sigma_x)?.sum(x.rank() - 1)?;
            return Ok((two_dx - x_sigma_x)?);
        }

        let l = self.scale_tril(jitter)?;
        let l_inv = batch_lower_triangular_inverse(&l.detach())?.to_dtype(diff.dtype())?;
        let w = l_inv.broadcast_matmul(&diff.unsqueeze(diff.rank())?)?;
        Ok(w.sqr()?.sum(w.rank() - 1)?.sum(w.rank() - 2)?)
    }

    /// log N(value; μ, Σ)
    ///
    /// # Arguments
    /// * `value` - `[..., *batch, M]`
    ///
    /// # Returns
    /// `[..., *batch]`
    pub fn log_prob(&self, value: &Tensor, jitter: &JitterConfig) -> Result<Tensor> {
        let diff = value.broadcast_sub(&self.mean)?;
        let quad = self.inv_quad(&diff, jitter)?;
        let logdet = self.logdet(jitter)?;
        let constant = self.event_size() as f64 * LN_2PI;
        Ok(((quad.broadcast_add(&logdet)? + constant)? * (-0.5))?)
    }

    /// μ + L ε
    ///
    /// # Returns
    /// `[n, *batch, M]`
    pub fn sample_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        n: usize,
        jitter: &JitterConfig,
    ) -> Result<Tensor> {
        let mut shape = vec![n];
        shape.extend_from_slice(self.mean.dims());
        let eps = standard_normal(rng, &shape, self.dtype(), self.mean.device())?;
        let l = self.scale_tril(jitter)?;
        let rank = eps.rank();
        let l_eps = l
            .broadcast_matmul(&eps.unsqueeze(rank)?)?
            .squeeze(rank)?;
        Ok(l_eps.broadcast_add(&self.mean)?)
    }
}

fn check_shapes(mean: &Tensor, matrix: &Tensor) -> Result<()> {
    let md = mean.dims();
    let cd = matrix.dims();
    let ok = !md.is_empty()
        && cd.len() == md.len() + 1
        && cd[..md.len()] == *md
        && cd[cd.len() - 1] == md[md.len() - 1];
    if !ok {
        return Err(GpError::ShapeMismatch(format!(
            "multivariate normal: mean {:?} is incompatible with matrix {:?}",
            md, cd
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MaxCholeskySize, MaxPreconditionerSize};
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn example() -> Result<MultivariateNormal> {
        let mean = Tensor::new(&[0.5f64, -1.0, 0.0], &Device::Cpu)?;
        let cov = Tensor::new(
            &[[2.0f64, 0.3, 0.1], [0.3, 1.0, 0.2], [0.1, 0.2, 0.5]],
            &Device::Cpu,
        )?;
        MultivariateNormal::new(mean, cov)
    }

    #[test]
    fn test_rejects_bad_shapes() -> Result<()> {
        let mean = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        let cov = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            MultivariateNormal::new(mean, cov),
            Err(GpError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_log_prob_at_mean() -> Result<()> {
        let mvn = example()?;
        let jitter = JitterConfig::default();
        let lp: f64 = mvn.log_prob(mvn.mean(), &jitter)?.to_scalar()?;

        let det: f64 = 2.0 * (1.0 * 0.5 - 0.04) - 0.3 * (0.3 * 0.5 - 0.02) + 0.1 * (0.06 - 0.1);
        let expected = -0.5 * (det.ln() + 3.0 * LN_2PI);
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_iterative_inv_quad_matches_dense() -> Result<()> {
        let mvn = example()?;
        let jitter = JitterConfig::default();
        let diff = Tensor::new(&[1.0f64, 0.5, -2.0], &Device::Cpu)?;

        let dense: f64 = {
            let _off = MaxPreconditionerSize::scoped(0);
            mvn.inv_quad(&diff, &jitter)?.to_scalar()?
        };
        let iterative: f64 = {
            let _on = MaxPreconditionerSize::scoped(2);
            let _small = MaxCholeskySize::scoped(1);
            mvn.inv_quad(&diff, &jitter)?.to_scalar()?
        };
        assert_abs_diff_eq!(dense, iterative, epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn test_sample_shape() -> Result<()> {
        let mvn = example()?;
        let mut rng = SmallRng::seed_from_u64(1);
        let s = mvn.sample_with(&mut rng, 4, &JitterConfig::default())?;
        assert_eq!(s.dims(), &[4, 3]);
        Ok(())
    }
}
