use candle_core::Tensor;

use super::joint::JointPrior;
use super::traits::{MarginalContext, PredictiveMapper};
use super::MapperConfig;
use crate::distributions::MultivariateNormal;
use crate::error::Result;
use crate::linalg::{add_jitter, batch_lower_triangular_inverse, eye};
use crate::model::GpModelT;

/// Whitened parameterization: u = L v with K_zz = L Lᵀ and q over v.
///
/// With A = L⁻¹ K_zx and q(v) = N(m, S):
///
/// * mean = Aᵀ m + μ_x
/// * covar = K_xx + Aᵀ (S - I) A
///
/// The prior over v is N(0, I).
#[derive(Clone, Debug, Default)]
pub struct WhitenedMapper {
    config: MapperConfig,
}

impl WhitenedMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self { config }
    }
}

impl PredictiveMapper for WhitenedMapper {
    fn config(&self) -> &MapperConfig {
        &self.config
    }

    fn prior_distribution<M: GpModelT>(
        &self,
        _model: &M,
        inducing_points: &Tensor,
        batch_shape: &[usize],
    ) -> Result<MultivariateNormal> {
        let m = inducing_points.dim(inducing_points.rank() - 2)?;
        let (dtype, device) = (inducing_points.dtype(), inducing_points.device());

        let mut mean_shape = batch_shape.to_vec();
        mean_shape.push(m);
        let mut covar_shape = mean_shape.clone();
        covar_shape.push(m);

        let mean = Tensor::zeros(mean_shape, dtype, device)?;
        let scale_tril = eye(m, dtype, device)?
            .broadcast_as(covar_shape)?
            .contiguous()?;
        MultivariateNormal::from_scale_tril(mean, scale_tril)
    }

    fn marginalize<M: GpModelT>(
        &self,
        ctx: &mut MarginalContext<'_, M>,
        joint: &JointPrior,
        inducing_values: &Tensor,
        variational_inducing_covar: Option<&Tensor>,
    ) -> Result<MultivariateNormal> {
        let dtype = joint.test_mean.dtype();
        let m = joint.induc_induc.dim(joint.induc_induc.rank() - 1)?;

        let l = ctx.cholesky_factor(&joint.induc_induc)?;
        let l_inv = batch_lower_triangular_inverse(&l)?.to_dtype(dtype)?;

        // A = L⁻¹ K_zx, [*batch, M, n]
        let interp = l_inv.broadcast_matmul(&joint.induc_data)?;
        let interp_t = interp.t()?;

        let v = inducing_values.to_dtype(dtype)?;
        let v = v.unsqueeze(v.rank())?;
        let mean = interp_t.broadcast_matmul(&v)?;
        let mean = mean.squeeze(mean.rank() - 1)?.broadcast_add(&joint.test_mean)?;

        let eye_m = eye(m, dtype, interp.device())?;
        let middle = match variational_inducing_covar {
            Some(s) => s.to_dtype(dtype)?.broadcast_sub(&eye_m)?,
            None => eye_m.neg()?,
        };
        let correction = interp_t.broadcast_matmul(&middle.broadcast_matmul(&interp)?)?;
        let covar = joint.data_data.broadcast_add(&correction)?;
        let covar = add_jitter(&covar, self.config.data_jitter)?;

        MultivariateNormal::new(mean.contiguous()?, covar.contiguous()?)
    }
}
