use candle_core::{Tensor, TensorId};
use log::debug;

use crate::distributions::{Distribution, MultivariateNormal};
use crate::error::Result;
use crate::linalg::{safe_cholesky, JitterConfig};

/// Names of the memoized entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKey {
    CholeskyFactor,
    PriorDistribution,
    VariationalDistribution,
}

/// How often each entry had to be (re)computed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cholesky_factorizations: usize,
    pub prior_computations: usize,
    pub variational_fetches: usize,
    pub invalidations: usize,
}

/// Per-strategy memoization, valid within one mode epoch
#[derive(Clone, Debug, Default)]
pub struct StrategyCache {
    cholesky_factor: Option<(TensorId, Tensor)>,
    prior_distribution: Option<MultivariateNormal>,
    variational_distribution: Option<Distribution>,
    stats: CacheStats,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry
    pub fn invalidate(&mut self) {
        self.cholesky_factor = None;
        self.prior_distribution = None;
        self.variational_distribution = None;
        self.stats.invalidations += 1;
        debug!("variational strategy cache invalidated");
    }

    pub fn is_cached(&self, key: CacheKey) -> bool {
        match key {
            CacheKey::CholeskyFactor => self.cholesky_factor.is_some(),
            CacheKey::PriorDistribution => self.prior_distribution.is_some(),
            CacheKey::VariationalDistribution => self.variational_distribution.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cholesky_factor.is_none()
            && self.prior_distribution.is_none()
            && self.variational_distribution.is_none()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Lower Cholesky factor of `matrix` in double precision.
    ///
    /// The entry is keyed by the identity of `matrix`; a different tensor
    /// replaces it.
    pub fn cholesky_factor(&mut self, matrix: &Tensor, jitter: &JitterConfig) -> Result<Tensor> {
        if let Some((id, l)) = &self.cholesky_factor {
            if *id == matrix.id() {
                return Ok(l.clone());
            }
        }
        let l = safe_cholesky(matrix, jitter)?;
        self.stats.cholesky_factorizations += 1;
        self.cholesky_factor = Some((matrix.id(), l.clone()));
        Ok(l)
    }

    pub fn prior_distribution_or_insert_with<F>(&mut self, compute: F) -> Result<MultivariateNormal>
    where
        F: FnOnce() -> Result<MultivariateNormal>,
    {
        if let Some(prior) = &self.prior_distribution {
            return Ok(prior.clone());
        }
        let prior = compute()?;
        self.stats.prior_computations += 1;
        self.prior_distribution = Some(prior.clone());
        Ok(prior)
    }

    pub fn variational_distribution_or_insert_with<F>(&mut self, fetch: F) -> Result<Distribution>
    where
        F: FnOnce() -> Result<Distribution>,
    {
        if let Some(q) = &self.variational_distribution {
            return Ok(q.clone());
        }
        let q = fetch()?;
        self.stats.variational_fetches += 1;
        self.variational_distribution = Some(q.clone());
        Ok(q)
    }
}
