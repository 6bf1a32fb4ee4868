use candle_core::Tensor;

use crate::error::Result;

/// Point mass at `location` (`[*batch, M]`)
#[derive(Clone, Debug)]
pub struct Delta {
    location: Tensor,
}

impl Delta {
    pub fn new(location: Tensor) -> Self {
        Self { location }
    }

    pub fn mean(&self) -> &Tensor {
        &self.location
    }

    pub fn batch_shape(&self) -> &[usize] {
        let dims = self.location.dims();
        &dims[..dims.len() - 1]
    }

    /// 0 where `value` hits the location exactly, -inf elsewhere
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let hit = value
            .broadcast_eq(&self.location)?
            .to_dtype(self.location.dtype())?;
        let log_hit = hit.log()?;
        Ok(log_hit.sum(log_hit.rank() - 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_log_prob() -> Result<()> {
        let loc = Tensor::new(&[1.0f32, 2.0], &Device::Cpu)?;
        let delta = Delta::new(loc.clone());

        let at: f32 = delta.log_prob(&loc)?.to_scalar()?;
        assert_eq!(at, 0.0);

        let off = Tensor::new(&[1.0f32, 2.5], &Device::Cpu)?;
        let away: f32 = delta.log_prob(&off)?.to_scalar()?;
        assert!(away.is_infinite() && away < 0.0);
        Ok(())
    }
}
