use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::made::Made;
use super::Transform;
use crate::error::Result;

const LOG_SCALE_MIN: f64 = -5.0;
const LOG_SCALE_MAX: f64 = 3.0;

/// Affine autoregressive transform `y = μ(x) + exp(s(x)) ⊙ x`.
///
/// μ_i and s_i depend on `x_{<i}` only, so the forward pass is a single
/// conditioner evaluation and the inverse takes D sequential passes.
/// The conditioner's output layer starts at zero: a fresh transform is the
/// identity.
pub struct AffineAutoregressive {
    made: Made,
}

impl AffineAutoregressive {
    pub fn new(dim: usize, hidden_widths: &[usize], vb: VarBuilder) -> Result<Self> {
        let made = Made::new(dim, hidden_widths, 2, vb.pp("made"))?;
        Ok(Self { made })
    }

    pub fn dim(&self) -> usize {
        self.made.dim()
    }

    fn shift_and_log_scale(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let parts = self.made.forward_split(x, 2)?;
        let log_scale = parts[1].clamp(LOG_SCALE_MIN, LOG_SCALE_MAX)?;
        Ok((parts[0].clone(), log_scale))
    }
}

impl Transform for AffineAutoregressive {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (shift, log_scale) = self.shift_and_log_scale(x)?;
        let y = (x * log_scale.exp()?)?.add(&shift)?;
        let log_det = log_scale.sum(log_scale.rank() - 1)?;
        Ok((y, log_det))
    }

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        // after pass i the first i coordinates are exact
        let mut x = y.zeros_like()?;
        for _ in 0..self.dim() {
            let (shift, log_scale) = self.shift_and_log_scale(&x)?;
            x = (y - &shift)?.mul(&log_scale.neg()?.exp()?)?;
        }
        let (_, log_scale) = self.shift_and_log_scale(&x)?;
        let log_det = log_scale.sum(log_scale.rank() - 1)?.neg()?;
        Ok((x, log_det))
    }
}
