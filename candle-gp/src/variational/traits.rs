use candle_core::{Tensor, Var};

use super::cache::StrategyCache;
use super::joint::{joint_prior, JointPrior};
use super::MapperConfig;
use crate::distributions::{Distribution, MultivariateNormal};
use crate::error::Result;
use crate::linalg::JitterConfig;
use crate::model::GpModelT;

/// Parameterized q(u) over the function values at the inducing points
pub trait VariationalDistributionT {
    /// Leading batch dimensions of q(u)
    fn batch_shape(&self) -> &[usize];

    /// Number of inducing points M
    fn num_inducing(&self) -> usize;

    /// Set the parameters from the prior p(u)
    fn initialize_variational_distribution(&self, prior: &MultivariateNormal) -> Result<()>;

    /// The current q(u)
    fn distribution(&self) -> Result<Distribution>;

    /// Trainable parameters
    fn vars(&self) -> Vec<Var> {
        vec![]
    }
}

/// What a mapper may use while marginalizing
pub struct MarginalContext<'c, M> {
    model: &'c M,
    cache: &'c mut StrategyCache,
    jitter: &'c JitterConfig,
}

impl<'c, M: GpModelT> MarginalContext<'c, M> {
    pub fn new(model: &'c M, cache: &'c mut StrategyCache, jitter: &'c JitterConfig) -> Self {
        Self {
            model,
            cache,
            jitter,
        }
    }

    pub fn model(&self) -> &'c M {
        self.model
    }

    pub fn jitter(&self) -> &JitterConfig {
        self.jitter
    }

    /// Memoized double-precision Cholesky factor, see [`StrategyCache::cholesky_factor`]
    pub fn cholesky_factor(&mut self, matrix: &Tensor) -> Result<Tensor> {
        self.cache.cholesky_factor(matrix, self.jitter)
    }
}

/// Maps inducing values to a predictive distribution at query points
pub trait PredictiveMapper {
    fn config(&self) -> &MapperConfig;

    /// p(u) in the mapper's parameterization
    ///
    /// * `inducing_points` - `[*batch, M, D]`
    /// * `batch_shape` - batch shape of q(u)
    fn prior_distribution<M: GpModelT>(
        &self,
        model: &M,
        inducing_points: &Tensor,
        batch_shape: &[usize],
    ) -> Result<MultivariateNormal>;

    /// Joint prior over `[Z; X]` with `inducing_jitter` on K_zz
    ///
    /// * `x` - `[*batch, n, D]` query points
    /// * `inducing_points` - `[*batch, M, D]`
    fn joint_prior<M: GpModelT>(
        &self,
        model: &M,
        x: &Tensor,
        inducing_points: &Tensor,
    ) -> Result<JointPrior> {
        joint_prior(model, x, inducing_points, self.config().inducing_jitter)
    }

    /// q(f(x)) = ∫ p(f(x) | u) q(u) du
    ///
    /// Every marginalization of one call shares `joint`, so stochastic
    /// kernels are evaluated once and K_zz keeps its Cholesky memo.
    ///
    /// # Arguments
    /// * `joint` - prior blocks from [`PredictiveMapper::joint_prior`]
    /// * `inducing_values` - `[*batch, M]` mean of q(u)
    /// * `variational_inducing_covar` - `[*batch, M, M]` covariance of q(u),
    ///   `None` for a point mass
    fn marginalize<M: GpModelT>(
        &self,
        ctx: &mut MarginalContext<'_, M>,
        joint: &JointPrior,
        inducing_values: &Tensor,
        variational_inducing_covar: Option<&Tensor>,
    ) -> Result<MultivariateNormal>;
}
