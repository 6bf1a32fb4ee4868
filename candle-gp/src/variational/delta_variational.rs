use std::cell::RefCell;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::traits::VariationalDistributionT;
use super::{perturbed_mean, VariationalConfig};
use crate::distributions::{Delta, Distribution, MultivariateNormal};
use crate::error::Result;

/// Point mass q(u) = δ(u - m) for MAP inference over the inducing values
pub struct DeltaVariationalDistribution {
    batch_shape: Vec<usize>,
    num_inducing: usize,
    location: Var,
    config: VariationalConfig,
    rng: RefCell<SmallRng>,
}

impl DeltaVariationalDistribution {
    pub fn new(
        num_inducing: usize,
        batch_shape: &[usize],
        dtype: DType,
        device: &Device,
        config: VariationalConfig,
    ) -> Result<Self> {
        let mut shape = batch_shape.to_vec();
        shape.push(num_inducing);
        let location = Var::zeros(shape, dtype, device)?;
        let rng = RefCell::new(SmallRng::seed_from_u64(config.seed));
        Ok(Self {
            batch_shape: batch_shape.to_vec(),
            num_inducing,
            location,
            config,
            rng,
        })
    }

    pub fn location(&self) -> &Tensor {
        self.location.as_tensor()
    }
}

impl VariationalDistributionT for DeltaVariationalDistribution {
    fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }

    fn num_inducing(&self) -> usize {
        self.num_inducing
    }

    fn initialize_variational_distribution(&self, prior: &MultivariateNormal) -> Result<()> {
        let location = perturbed_mean(
            &mut *self.rng.borrow_mut(),
            prior.mean(),
            self.location.dims(),
            self.config.mean_init_std,
            self.location.dtype(),
            self.location.device(),
        )?;
        self.location.set(&location)?;
        Ok(())
    }

    fn distribution(&self) -> Result<Distribution> {
        Ok(Delta::new(self.location.as_tensor().clone()).into())
    }

    fn vars(&self) -> Vec<Var> {
        vec![self.location.clone()]
    }
}
