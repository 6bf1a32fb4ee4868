use candle_core::Tensor;
use log::debug;

use super::cache::StrategyCache;
use super::inducing::InducingPointStore;
use super::traits::{MarginalContext, PredictiveMapper, VariationalDistributionT};
use super::broadcast_batch;
use crate::distributions::{kl_divergence, Distribution, MultivariateNormal};
use crate::error::{GpError, Result};
use crate::linalg::JitterConfig;
use crate::model::GpModelT;
use crate::settings::MaxPreconditionerSize;

/// Training or evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CallOptions {
    /// return the raw model prior at `x`
    pub prior: bool,
    /// also return the mean-only (MAP) predictive
    pub return_map: bool,
}

impl CallOptions {
    pub fn prior() -> Self {
        Self {
            prior: true,
            return_map: false,
        }
    }

    pub fn with_map() -> Self {
        Self {
            prior: false,
            return_map: true,
        }
    }
}

pub struct StrategyOutput {
    pub predictive: MultivariateNormal,
    /// predictive under the point estimate of u, when requested
    pub map: Option<MultivariateNormal>,
}

/// Sparse variational GP strategy
///
/// Holds the model and the variational generator by reference; owns the
/// inducing points, the mapper and a cache that lives for one mode epoch.
/// Every transition into training, and every transition out of it,
/// empties the cache. In training mode each call starts from an empty
/// cache since parameters may have moved since the last step.
pub struct VariationalStrategy<'a, M, V, P> {
    model: &'a M,
    store: InducingPointStore<'a, V>,
    mapper: P,
    cache: StrategyCache,
    mode: Mode,
    jitter: JitterConfig,
}

impl<'a, M, V, P> VariationalStrategy<'a, M, V, P>
where
    M: GpModelT,
    V: VariationalDistributionT,
    P: PredictiveMapper,
{
    /// A new strategy starts in training mode and uninitialized
    ///
    /// # Arguments
    /// * `model` - GP prior
    /// * `inducing_points` - `[*batch, M, D]` or `[M]`
    /// * `generator` - q(u)
    /// * `mapper` - whitened or unwhitened marginalization
    /// * `learn_inducing_locations` - trainable vs fixed inducing points
    pub fn new(
        model: &'a M,
        inducing_points: &Tensor,
        generator: &'a V,
        mapper: P,
        learn_inducing_locations: bool,
    ) -> Result<Self> {
        let store = InducingPointStore::new(inducing_points, generator, learn_inducing_locations)?;
        Ok(Self {
            model,
            store,
            mapper,
            cache: StrategyCache::new(),
            mode: Mode::Train,
            jitter: JitterConfig::default(),
        })
    }

    pub fn with_jitter(mut self, jitter: JitterConfig) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode == Mode::Train || mode == Mode::Train {
            self.cache.invalidate();
        }
        self.mode = mode;
    }

    pub fn train(&mut self) {
        self.set_mode(Mode::Train);
    }

    pub fn eval(&mut self) {
        self.set_mode(Mode::Eval);
    }

    pub fn cache(&self) -> &StrategyCache {
        &self.cache
    }

    pub fn store(&self) -> &InducingPointStore<'a, V> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut InducingPointStore<'a, V> {
        &mut self.store
    }

    pub fn model(&self) -> &'a M {
        self.model
    }

    pub fn mapper(&self) -> &P {
        &self.mapper
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    /// Run the strategy on query points `x` (`[*batch, n, D]` or `[n]`).
    ///
    /// Order within one call: empty the cache (training only), initialize
    /// q(u) from the prior on the first call, fetch q(u), broadcast inputs,
    /// marginalize. The model is evaluated once on `[Z; X]` and both the
    /// predictive and the MAP predictive come from that evaluation.
    ///
    /// The store counts as initialized as soon as q(u) has been set from
    /// the prior, even if the rest of the call fails. Cache entries are
    /// committed only when the whole call succeeds.
    pub fn call(&mut self, x: &Tensor, options: CallOptions) -> Result<StrategyOutput> {
        if options.prior {
            return Ok(StrategyOutput {
                predictive: self.model.forward(x)?,
                map: None,
            });
        }

        let mut scratch = self.cache.clone();
        if self.mode == Mode::Train {
            scratch.invalidate();
        }

        if !self.store.is_initialized() {
            let prior = prior_in(self.model, &self.mapper, &self.store, &mut scratch)?;
            self.store
                .generator()
                .initialize_variational_distribution(&prior)?;
            self.store.mark_initialized();
            debug!(
                "initialized q(u) from the prior over {} inducing points",
                self.store.num_inducing()
            );
        }

        let (x, z) = expand_to_batch(
            x,
            self.store.inducing_points(),
            self.store.generator().batch_shape(),
        )?;

        let q = scratch
            .variational_distribution_or_insert_with(|| self.store.variational_distribution())?;
        let (inducing_values, inducing_covar) = match &q {
            Distribution::MultivariateNormal(q) => (q.mean(), Some(q.covariance())),
            Distribution::Delta(q) => (q.mean(), None),
            other => return Err(GpError::invalid_distribution(other.type_name())),
        };

        let joint = self.mapper.joint_prior(self.model, &x, &z)?;
        let mut ctx = MarginalContext::new(self.model, &mut scratch, &self.jitter);
        let predictive =
            self.mapper
                .marginalize(&mut ctx, &joint, inducing_values, inducing_covar)?;
        let map = match (options.return_map, inducing_covar) {
            (false, _) => None,
            // a point mass has nothing to drop
            (true, None) => Some(predictive.clone()),
            (true, Some(_)) => Some(
                self.mapper
                    .marginalize(&mut ctx, &joint, inducing_values, None)?,
            ),
        };

        self.cache = scratch;
        Ok(StrategyOutput { predictive, map })
    }

    /// p(u) at the current inducing points, memoized within a mode epoch
    pub fn prior_distribution(&mut self) -> Result<MultivariateNormal> {
        prior_in(self.model, &self.mapper, &self.store, &mut self.cache)
    }

    /// q(u), memoized within a mode epoch
    pub fn variational_distribution(&mut self) -> Result<Distribution> {
        let store = &self.store;
        self.cache
            .variational_distribution_or_insert_with(|| store.variational_distribution())
    }

    /// Memoized double-precision Cholesky factor of `matrix`
    pub fn cholesky_factor(&mut self, matrix: &Tensor) -> Result<Tensor> {
        self.cache.cholesky_factor(matrix, &self.jitter)
    }

    /// KL(q(u) ‖ p(u)) with exact linear algebra
    ///
    /// # Returns
    /// `[*batch]`
    pub fn kl_divergence(&mut self) -> Result<Tensor> {
        let _exact = MaxPreconditionerSize::scoped(0);
        let q = self.variational_distribution()?;
        let p = self.prior_distribution()?;
        kl_divergence(&q, &p, &self.jitter)
    }
}

fn prior_in<M, V, P>(
    model: &M,
    mapper: &P,
    store: &InducingPointStore<'_, V>,
    cache: &mut StrategyCache,
) -> Result<MultivariateNormal>
where
    M: GpModelT,
    V: VariationalDistributionT,
    P: PredictiveMapper,
{
    cache.prior_distribution_or_insert_with(|| {
        mapper.prior_distribution(
            model,
            store.inducing_points(),
            store.generator().batch_shape(),
        )
    })
}

/// Broadcast `x` (`[*bx, n, D]`) and `z` (`[*bz, M, D]`) to a common
/// `[*batch, ., D]` that also covers the batch shape of q(u)
fn expand_to_batch(x: &Tensor, z: &Tensor, batch_shape: &[usize]) -> Result<(Tensor, Tensor)> {
    let x = if x.rank() == 1 {
        x.unsqueeze(1)?
    } else {
        x.clone()
    };
    if x.rank() < 2 {
        return Err(GpError::ShapeMismatch(format!(
            "inputs must be [*batch, n, D], got {:?}",
            x.dims()
        )));
    }
    let (xd, zd) = (x.dims(), z.dims());
    if xd[xd.len() - 1] != zd[zd.len() - 1] {
        return Err(GpError::ShapeMismatch(format!(
            "inputs {:?} and inducing points {:?} differ in dimensionality",
            xd, zd
        )));
    }

    let batch = broadcast_batch(&xd[..xd.len() - 2], &zd[..zd.len() - 2])?;
    let batch = broadcast_batch(&batch, batch_shape)?;

    let expand = |t: &Tensor| -> Result<Tensor> {
        let d = t.dims();
        let mut shape = batch.clone();
        shape.extend_from_slice(&d[d.len() - 2..]);
        Ok(t.broadcast_as(shape)?.contiguous()?)
    };
    Ok((expand(&x)?, expand(z)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use crate::settings;
    use crate::variational::{
        CacheKey, CholeskyVariationalDistribution, UnwhitenedMapper, VariationalConfig,
        WhitenedMapper,
    };
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device, Var};
    use std::cell::Cell;

    /// Deterministic RBF prior that counts its evaluations
    struct CountingModel {
        calls: Cell<usize>,
    }

    impl CountingModel {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
            }
        }
    }

    impl GpModelT for CountingModel {
        fn forward(&self, x: &Tensor) -> Result<MultivariateNormal> {
            self.calls.set(self.calls.get() + 1);
            let r = x.rank();
            let diffs = x.unsqueeze(r - 1)?.broadcast_sub(&x.unsqueeze(r - 2)?)?;
            let sq = diffs.sqr()?.sum(r)?;
            let covar = (sq * (-0.5))?.exp()?;
            let dims = x.dims();
            let mean = Tensor::zeros(&dims[..r - 1], x.dtype(), x.device())?;
            MultivariateNormal::new(mean, covar)
        }
    }

    /// Cholesky generator that counts initializations, optionally handing out
    /// an unsupported distribution
    struct CountingGenerator {
        inner: CholeskyVariationalDistribution,
        inits: Cell<usize>,
        unsupported: Cell<bool>,
    }

    impl CountingGenerator {
        fn new(m: usize) -> Result<Self> {
            let inner = CholeskyVariationalDistribution::new(
                m,
                &[],
                DType::F64,
                &Device::Cpu,
                VariationalConfig::new(0.0, 0),
            )?;
            Ok(Self {
                inner,
                inits: Cell::new(0),
                unsupported: Cell::new(false),
            })
        }
    }

    impl VariationalDistributionT for CountingGenerator {
        fn batch_shape(&self) -> &[usize] {
            self.inner.batch_shape()
        }

        fn num_inducing(&self) -> usize {
            self.inner.num_inducing()
        }

        fn initialize_variational_distribution(&self, prior: &MultivariateNormal) -> Result<()> {
            self.inits.set(self.inits.get() + 1);
            self.inner.initialize_variational_distribution(prior)
        }

        fn distribution(&self) -> Result<Distribution> {
            if self.unsupported.get() {
                let m = self.inner.num_inducing();
                return Ok(Normal::standard(m, DType::F64, &Device::Cpu)?.into());
            }
            self.inner.distribution()
        }

        fn vars(&self) -> Vec<Var> {
            self.inner.vars()
        }
    }

    fn inducing(m: usize) -> Result<Tensor> {
        let pts: Vec<f64> = (0..m).map(|i| i as f64 * 0.5).collect();
        Ok(Tensor::from_vec(pts, m, &Device::Cpu)?)
    }

    fn queries() -> Result<Tensor> {
        Ok(Tensor::new(&[[0.25f64], [1.1]], &Device::Cpu)?)
    }

    #[test]
    fn test_initializes_once() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(4)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(4)?, &generator, WhitenedMapper::default(), false)?;
        strategy.eval();
        assert!(!strategy.is_initialized());

        strategy.call(&queries()?, CallOptions::default())?;
        strategy.call(&queries()?, CallOptions::default())?;
        assert_eq!(generator.inits.get(), 1);
        assert!(strategy.is_initialized());

        strategy.train();
        strategy.call(&queries()?, CallOptions::default())?;
        assert_eq!(generator.inits.get(), 1);
        Ok(())
    }

    #[test]
    fn test_prior_bypasses_inducing_machinery() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(4)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(4)?, &generator, UnwhitenedMapper::default(), true)?;
        let out = strategy.call(&queries()?, CallOptions::prior())?;
        assert_eq!(out.predictive.mean().dims(), &[2]);
        assert!(out.map.is_none());
        assert_eq!(model.calls.get(), 1);
        assert_eq!(generator.inits.get(), 0);
        assert!(strategy.cache().is_empty());
        Ok(())
    }

    #[test]
    fn test_mode_transitions_invalidate() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(3)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(3)?, &generator, UnwhitenedMapper::default(), false)?;
        strategy.eval();

        let kzz = model.forward(strategy.store().inducing_points())?.covariance().clone();
        strategy.prior_distribution()?;
        strategy.prior_distribution()?;
        strategy.cholesky_factor(&kzz)?;
        strategy.cholesky_factor(&kzz)?;
        let stats = strategy.cache().stats();
        assert_eq!(stats.prior_computations, 1);
        assert_eq!(stats.cholesky_factorizations, 1);

        // eval -> eval keeps the epoch
        strategy.eval();
        strategy.prior_distribution()?;
        assert_eq!(strategy.cache().stats().prior_computations, 1);

        strategy.train();
        assert!(!strategy.cache().is_cached(CacheKey::PriorDistribution));
        assert!(!strategy.cache().is_cached(CacheKey::CholeskyFactor));
        strategy.prior_distribution()?;
        strategy.cholesky_factor(&kzz)?;
        let stats = strategy.cache().stats();
        assert_eq!(stats.prior_computations, 2);
        assert_eq!(stats.cholesky_factorizations, 2);

        // train -> eval empties again
        strategy.eval();
        assert!(strategy.cache().is_empty());
        Ok(())
    }

    #[test]
    fn test_training_calls_recompute() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(3)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(3)?, &generator, UnwhitenedMapper::default(), false)?;

        strategy.call(&queries()?, CallOptions::default())?;
        let first = strategy.cache().stats();
        strategy.call(&queries()?, CallOptions::default())?;
        let second = strategy.cache().stats();
        assert_eq!(second.variational_fetches, first.variational_fetches + 1);
        assert_eq!(second.invalidations, first.invalidations + 1);

        strategy.eval();
        strategy.call(&queries()?, CallOptions::default())?;
        let third = strategy.cache().stats();
        strategy.call(&queries()?, CallOptions::default())?;
        assert_eq!(strategy.cache().stats().variational_fetches, third.variational_fetches);
        Ok(())
    }

    #[test]
    fn test_unsupported_distribution_leaves_cache() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(3)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(3)?, &generator, WhitenedMapper::default(), false)?;

        strategy.call(&queries()?, CallOptions::default())?;
        let before = strategy.cache().stats();
        let cached: Vec<bool> = [
            CacheKey::CholeskyFactor,
            CacheKey::PriorDistribution,
            CacheKey::VariationalDistribution,
        ]
        .iter()
        .map(|&k| strategy.cache().is_cached(k))
        .collect();

        generator.unsupported.set(true);
        match strategy.call(&queries()?, CallOptions::default()) {
            Err(GpError::InvalidDistribution { name }) => assert_eq!(name, "Normal"),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("expected an error"),
        }

        assert_eq!(strategy.cache().stats(), before);
        let after: Vec<bool> = [
            CacheKey::CholeskyFactor,
            CacheKey::PriorDistribution,
            CacheKey::VariationalDistribution,
        ]
        .iter()
        .map(|&k| strategy.cache().is_cached(k))
        .collect();
        assert_eq!(cached, after);
        Ok(())
    }

    #[test]
    fn test_failed_first_call_still_initializes_once() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(3)?;
        generator.unsupported.set(true);
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(3)?, &generator, WhitenedMapper::default(), false)?;
        strategy.eval();

        assert!(strategy.call(&queries()?, CallOptions::default()).is_err());
        assert!(strategy.is_initialized());
        assert_eq!(generator.inits.get(), 1);
        assert!(strategy.cache().is_empty());
        assert_eq!(strategy.cache().stats().prior_computations, 0);

        generator.unsupported.set(false);
        strategy.call(&queries()?, CallOptions::default())?;
        assert_eq!(generator.inits.get(), 1);
        Ok(())
    }

    #[test]
    fn test_kl_zero_at_whitened_prior() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(4)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(4)?, &generator, WhitenedMapper::default(), false)?;
        strategy.eval();
        strategy.call(&queries()?, CallOptions::default())?;

        let kl: f64 = strategy.kl_divergence()?.to_scalar()?;
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-10);
        assert_eq!(
            settings::max_preconditioner_size(),
            settings::DEFAULT_MAX_PRECONDITIONER_SIZE
        );
        Ok(())
    }

    #[test]
    fn test_kl_positive_after_moving_q() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(3)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(3)?, &generator, UnwhitenedMapper::default(), false)?;
        strategy.call(&queries()?, CallOptions::default())?;

        let vars = generator.vars();
        let shifted = (vars[0].as_tensor() + 0.7)?;
        vars[0].set(&shifted)?;
        let shrunk = (vars[1].as_tensor() * 0.5)?;
        vars[1].set(&shrunk)?;

        strategy.train();
        let kl: f64 = strategy.kl_divergence()?.to_scalar()?;
        assert!(kl > 0.0);
        Ok(())
    }

    #[test]
    fn test_predictive_shapes_and_map() -> Result<()> {
        let model = CountingModel::new();
        let generator = CountingGenerator::new(4)?;
        let mut strategy =
            VariationalStrategy::new(&model, &inducing(4)?, &generator, UnwhitenedMapper::default(), true)?;
        strategy.eval();
        let out = strategy.call(&queries()?, CallOptions::with_map())?;
        assert_eq!(out.predictive.mean().dims(), &[2]);
        assert_eq!(out.predictive.covariance().dims(), &[2, 2]);

        let map = out.map.expect("map predictive");
        // same mean, no q(u) spread in the MAP covariance
        let a: Vec<f64> = out.predictive.mean().to_vec1()?;
        let b: Vec<f64> = map.mean().to_vec1()?;
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
        let va: Vec<f64> = out.predictive.variance()?.to_vec1()?;
        let vb: Vec<f64> = map.variance()?.to_vec1()?;
        for (x, y) in va.iter().zip(vb.iter()) {
            assert!(*x >= *y - 1e-12);
        }
        assert_eq!(strategy.store().vars().len(), 3);
        Ok(())
    }

    fn spectral_map_matches_predictive<P: PredictiveMapper>(mapper: P) -> Result<()> {
        use crate::kernel::{SpectralEstimator, SpectralFlowKernel, SpectralKernelConfig};
        use crate::model::ApproximateGp;
        use candle_nn::{VarBuilder, VarMap};

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        let config = SpectralKernelConfig {
            num_samples: Some(256),
            ..SpectralKernelConfig::new(1, SpectralEstimator::Mean)
        };
        let kernel = SpectralFlowKernel::new(config, vb.pp("kernel"))?;
        let gp = ApproximateGp::new(kernel, vb.pp("gp"))?;

        let q = CholeskyVariationalDistribution::new(
            4,
            &[],
            DType::F64,
            &Device::Cpu,
            VariationalConfig::new(0.5, 3),
        )?;
        let mut strategy = VariationalStrategy::new(&gp, &inducing(4)?, &q, mapper, false)?;
        strategy.eval();

        let x = Tensor::new(&[[0.2f64], [0.9], [1.4]], &Device::Cpu)?;
        let out = strategy.call(&x, CallOptions::with_map())?;
        let map = out.map.expect("map predictive");

        let a: Vec<f64> = out.predictive.mean().to_vec1()?;
        let b: Vec<f64> = map.mean().to_vec1()?;
        assert_eq!(a, b);
        assert!(a.iter().any(|m| m.abs() > 1e-6));

        let va: Vec<f64> = out.predictive.variance()?.to_vec1()?;
        let vb: Vec<f64> = map.variance()?.to_vec1()?;
        for (x, y) in va.iter().zip(vb.iter()) {
            assert!(*x >= *y - 1e-12);
        }

        assert_eq!(strategy.cache().stats().cholesky_factorizations, 1);
        assert!(strategy.cache().is_cached(CacheKey::CholeskyFactor));
        Ok(())
    }

    #[test]
    fn test_spectral_map_shares_kernel_draws() -> Result<()> {
        spectral_map_matches_predictive(UnwhitenedMapper::default())?;
        spectral_map_matches_predictive(WhitenedMapper::default())
    }
}
