use candle_core::Tensor;

use crate::error::{GpError, Result};

/// Check that `x` is `[*batch, n, D]` with `D == num_dims`
pub fn check_num_dims(x: &Tensor, num_dims: usize) -> Result<()> {
    if x.rank() < 2 {
        return Err(GpError::ShapeMismatch(format!(
            "kernel inputs must be [*batch, n, D], got {:?}",
            x.dims()
        )));
    }
    let d = x.dim(x.rank() - 1)?;
    if d != num_dims {
        return Err(GpError::ShapeMismatch(format!(
            "kernel expects {} input dimensions, got {}",
            num_dims, d
        )));
    }
    Ok(())
}

/// Differences between the rows of `x1` and `x2`
///
/// * full: `[*batch, n, 1, D] - [*batch, 1, m, D] -> [*batch, n, m, D]`
/// * diag: `[*batch, n, D] - [*batch, n, D] -> [*batch, n, D]`
pub fn pairwise_differences(x1: &Tensor, x2: &Tensor, diag: bool) -> Result<Tensor> {
    let (r1, r2) = (x1.rank(), x2.rank());
    if r1 < 2 || r2 < 2 {
        return Err(GpError::ShapeMismatch(format!(
            "kernel inputs must be [*batch, n, D], got {:?} and {:?}",
            x1.dims(),
            x2.dims()
        )));
    }
    if x1.dim(r1 - 1)? != x2.dim(r2 - 1)? {
        return Err(GpError::ShapeMismatch(format!(
            "inputs differ in the last dimension: {:?} vs {:?}",
            x1.dims(),
            x2.dims()
        )));
    }

    if diag {
        if x1.dims() != x2.dims() {
            return Err(GpError::ShapeMismatch(format!(
                "diagonal evaluation needs paired inputs, got {:?} and {:?}",
                x1.dims(),
                x2.dims()
            )));
        }
        return Ok((x1 - x2)?);
    }

    let left = x1.unsqueeze(r1 - 1)?;
    let right = x2.unsqueeze(r2 - 2)?;
    left.broadcast_sub(&right).map_err(|e| {
        GpError::ShapeMismatch(format!(
            "cannot pair {:?} with {:?}: {}",
            x1.dims(),
            x2.dims(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_full_grid() -> Result<()> {
        let x1 = Tensor::new(&[[0.0f64], [1.0], [3.0]], &Device::Cpu)?;
        let x2 = Tensor::new(&[[1.0f64], [2.0]], &Device::Cpu)?;
        let d = pairwise_differences(&x1, &x2, false)?;
        assert_eq!(d.dims(), &[3, 2, 1]);
        let v: Vec<Vec<f64>> = d.squeeze(2)?.to_vec2()?;
        assert_eq!(v, vec![vec![-1.0, -2.0], vec![0.0, -1.0], vec![2.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn test_batched_grid_shape() -> Result<()> {
        let x1 = Tensor::zeros((4, 3, 2), candle_core::DType::F32, &Device::Cpu)?;
        let x2 = Tensor::zeros((4, 5, 2), candle_core::DType::F32, &Device::Cpu)?;
        assert_eq!(pairwise_differences(&x1, &x2, false)?.dims(), &[4, 3, 5, 2]);
        Ok(())
    }

    #[test]
    fn test_diag_requires_pairs() -> Result<()> {
        let x1 = Tensor::new(&[[0.0f64, 1.0], [1.0, 1.0]], &Device::Cpu)?;
        let x2 = Tensor::new(&[[0.0f64, 1.0]], &Device::Cpu)?;
        assert!(matches!(
            pairwise_differences(&x1, &x2, true),
            Err(GpError::ShapeMismatch(_))
        ));
        assert!(matches!(check_num_dims(&x1, 3), Err(GpError::ShapeMismatch(_))));
        Ok(())
    }
}
