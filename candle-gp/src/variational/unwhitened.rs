use candle_core::Tensor;

use super::joint::JointPrior;
use super::traits::{MarginalContext, PredictiveMapper};
use super::{broadcast_batch, MapperConfig};
use crate::distributions::MultivariateNormal;
use crate::error::Result;
use crate::linalg::{add_jitter, batch_lower_triangular_inverse};
use crate::model::GpModelT;

/// q(u) lives directly on the function values at the inducing points.
///
/// With W = K_zz⁻¹ K_zx and q(u) = N(m, S):
///
/// * mean = μ_x + Wᵀ (m - μ_z)
/// * covar = K_xx - K_xz K_zz⁻¹ K_zx + Wᵀ S W
#[derive(Clone, Debug, Default)]
pub struct UnwhitenedMapper {
    config: MapperConfig,
}

impl UnwhitenedMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self { config }
    }
}

impl PredictiveMapper for UnwhitenedMapper {
    fn config(&self) -> &MapperConfig {
        &self.config
    }

    fn prior_distribution<M: GpModelT>(
        &self,
        model: &M,
        inducing_points: &Tensor,
        batch_shape: &[usize],
    ) -> Result<MultivariateNormal> {
        let out = model.forward(inducing_points)?;
        let m = out.event_size();
        let batch = broadcast_batch(out.batch_shape(), batch_shape)?;

        let mut mean_shape = batch;
        mean_shape.push(m);
        let mut covar_shape = mean_shape.clone();
        covar_shape.push(m);

        let mean = out.mean().broadcast_as(mean_shape)?.contiguous()?;
        let covar = add_jitter(out.covariance(), self.config.inducing_jitter)?
            .broadcast_as(covar_shape)?
            .contiguous()?;
        MultivariateNormal::new(mean, covar)
    }

    fn marginalize<M: GpModelT>(
        &self,
        ctx: &mut MarginalContext<'_, M>,
        joint: &JointPrior,
        inducing_values: &Tensor,
        variational_inducing_covar: Option<&Tensor>,
    ) -> Result<MultivariateNormal> {
        let dtype = joint.test_mean.dtype();

        let l = ctx.cholesky_factor(&joint.induc_induc)?;
        let l_inv = batch_lower_triangular_inverse(&l)?.to_dtype(dtype)?;

        // A = L⁻¹ K_zx and W = L⁻ᵀ A
        let a = l_inv.broadcast_matmul(&joint.induc_data)?;
        let interp = l_inv.t()?.broadcast_matmul(&a)?;
        let interp_t = interp.t()?;

        let centered = inducing_values
            .to_dtype(dtype)?
            .broadcast_sub(&joint.induc_mean)?;
        let centered = centered.unsqueeze(centered.rank())?;
        let mean = interp_t.broadcast_matmul(&centered)?;
        let mean = mean.squeeze(mean.rank() - 1)?.broadcast_add(&joint.test_mean)?;

        let explained = a.t()?.matmul(&a)?;
        let mut covar = (&joint.data_data - explained)?;
        if let Some(s) = variational_inducing_covar {
            let s = s.to_dtype(dtype)?;
            let spread = interp_t.broadcast_matmul(&s.broadcast_matmul(&interp)?)?;
            covar = covar.broadcast_add(&spread)?;
        }
        let covar = add_jitter(&covar, self.config.data_jitter)?;

        MultivariateNormal::new(mean.contiguous()?, covar.contiguous()?)
    }
}
