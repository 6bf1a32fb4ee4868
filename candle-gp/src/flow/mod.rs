//! Normalizing flows for spectral densities.
//!
//! A [`FlowStack`] is a non-empty sequence of [`Transform`]s applied in
//! order; [`TransformedDistribution`] pushes a standard normal base through it.

mod affine_autoregressive;
mod made;
mod masked_linear;

pub use affine_autoregressive::AffineAutoregressive;
pub use made::Made;
pub use masked_linear::MaskedLinear;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::Rng;

use crate::distributions::Normal;
use crate::error::{GpError, Result};

/// Invertible map on the last dimension
pub trait Transform {
    /// # Returns `(y, log|det ∂y/∂x|)` with the log-determinant shaped like
    /// `x` minus its last dimension
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)>;

    /// # Returns `(x, log|det ∂x/∂y|)`
    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Reverses the coordinate order so stacked autoregressive blocks see
/// every ordering direction
pub struct Reverse {
    dim: usize,
}

impl Reverse {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn permute(&self, x: &Tensor) -> Result<Tensor> {
        let idx: Vec<u32> = (0..self.dim as u32).rev().collect();
        let idx = Tensor::from_vec(idx, self.dim, x.device())?;
        Ok(x.index_select(&idx, x.rank() - 1)?)
    }

    fn zero_log_det(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.zeros_like()?.sum(x.rank() - 1)?)
    }
}

impl Transform for Reverse {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.permute(x)?, self.zero_log_det(x)?))
    }

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.permute(y)?, self.zero_log_det(y)?))
    }
}

/// Non-empty composition of transforms
pub struct FlowStack {
    dim: usize,
    transforms: Vec<Box<dyn Transform>>,
}

impl FlowStack {
    pub fn new(dim: usize, transforms: Vec<Box<dyn Transform>>) -> Result<Self> {
        if transforms.is_empty() {
            return Err(GpError::Config("a flow needs at least one transform".into()));
        }
        Ok(Self { dim, transforms })
    }

    /// `stack_size` affine autoregressive blocks separated by coordinate
    /// reversals. Hidden layer `l` of every block is `hidden_factors[l] * dim` wide.
    pub fn autoregressive(
        dim: usize,
        stack_size: usize,
        hidden_factors: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        if stack_size == 0 {
            return Err(GpError::Config("stack_size must be at least 1".into()));
        }
        let hidden_widths: Vec<usize> = hidden_factors.iter().map(|f| f * dim).collect();

        let mut transforms: Vec<Box<dyn Transform>> = Vec::with_capacity(2 * stack_size - 1);
        for b in 0..stack_size {
            if b > 0 {
                transforms.push(Box::new(Reverse::new(dim)));
            }
            let block = AffineAutoregressive::new(dim, &hidden_widths, vb.pp(format!("block.{}", b)))?;
            transforms.push(Box::new(block));
        }
        Self::new(dim, transforms)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for FlowStack {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut y = x.clone();
        let mut log_det: Option<Tensor> = None;
        for t in self.transforms.iter() {
            let (next, ld) = t.forward(&y)?;
            y = next;
            log_det = Some(match log_det {
                Some(acc) => (acc + ld)?,
                None => ld,
            });
        }
        match log_det {
            Some(ld) => Ok((y, ld)),
            None => Err(GpError::Config("empty flow".into())),
        }
    }

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut x = y.clone();
        let mut log_det: Option<Tensor> = None;
        for t in self.transforms.iter().rev() {
            let (prev, ld) = t.inverse(&x)?;
            x = prev;
            log_det = Some(match log_det {
                Some(acc) => (acc + ld)?,
                None => ld,
            });
        }
        match log_det {
            Some(ld) => Ok((x, ld)),
            None => Err(GpError::Config("empty flow".into())),
        }
    }
}

/// Base distribution pushed through a flow
pub struct TransformedDistribution<'a> {
    base: Normal,
    flow: &'a FlowStack,
}

impl<'a> TransformedDistribution<'a> {
    pub fn new(base: Normal, flow: &'a FlowStack) -> Result<Self> {
        let d = base.event_size()?;
        if d != flow.dim() {
            return Err(GpError::ShapeMismatch(format!(
                "base distribution has {} dims, flow expects {}",
                d,
                flow.dim()
            )));
        }
        Ok(Self { base, flow })
    }

    /// Reparameterized draws with their log densities
    ///
    /// log q(z) = log N(ε) - log|det ∂z/∂ε|
    ///
    /// # Returns
    /// `(z, log_q)` with shapes `[n, D]` and `[n]`
    pub fn rsample_with_log_prob<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        n: usize,
    ) -> Result<(Tensor, Tensor)> {
        let (eps, _) = self.base.sample_with(rng, n)?;
        let base_log_prob = self.base.log_prob(&eps)?;
        let (z, log_det) = self.flow.forward(&eps)?;
        Ok((z, (base_log_prob - log_det)?))
    }

    /// Reparameterized draws, `[n, D]`
    pub fn rsample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Result<Tensor> {
        let (eps, _) = self.base.sample_with(rng, n)?;
        Ok(self.flow.forward(&eps)?.0)
    }

    /// log q(z) through the inverse flow
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        let (eps, log_det_inv) = self.flow.inverse(z)?;
        Ok((self.base.log_prob(&eps)? + log_det_inv)?)
    }
}
