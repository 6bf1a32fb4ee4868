//! Distributions over function values.
//!
//! Only the operations the kernels and variational strategies consume are
//! provided: sampling, log-density, moments and analytic KL divergence.

mod delta;
mod kl;
mod multivariate_normal;
mod normal;

pub use delta::Delta;
pub use kl::kl_divergence;
pub use multivariate_normal::MultivariateNormal;
pub use normal::Normal;

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;

/// Closed set of distributions a variational generator may hand out.
#[derive(Clone, Debug)]
pub enum Distribution {
    MultivariateNormal(MultivariateNormal),
    Delta(Delta),
    Normal(Normal),
}

impl Distribution {
    pub fn type_name(&self) -> &'static str {
        match self {
            Distribution::MultivariateNormal(_) => "MultivariateNormal",
            Distribution::Delta(_) => "Delta",
            Distribution::Normal(_) => "Normal",
        }
    }

    pub fn mean(&self) -> &Tensor {
        match self {
            Distribution::MultivariateNormal(d) => d.mean(),
            Distribution::Delta(d) => d.mean(),
            Distribution::Normal(d) => d.loc(),
        }
    }
}

impl From<MultivariateNormal> for Distribution {
    fn from(d: MultivariateNormal) -> Self {
        Distribution::MultivariateNormal(d)
    }
}

impl From<Delta> for Distribution {
    fn from(d: Delta) -> Self {
        Distribution::Delta(d)
    }
}

impl From<Normal> for Distribution {
    fn from(d: Normal) -> Self {
        Distribution::Normal(d)
    }
}

/// Standard normal draws from `rng`, so that seeded generators reproduce
/// tensors bit for bit (candle's CPU `randn` cannot be seeded).
pub fn standard_normal<R: Rng + ?Sized>(
    rng: &mut R,
    shape: &[usize],
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape.to_vec(), device)?.to_dtype(dtype)?)
}

pub(crate) const LN_2PI: f64 = 1.8378770664093453;
