//! Numerically guarded linear algebra.
//!
//! candle has no Cholesky, so batched tensors are copied into `f64` nalgebra
//! matrices, factorized there and copied back. Factors are constants of the
//! current step as far as autograd is concerned.

mod cholesky;
mod solve;

pub use cholesky::{
    cholesky_logdet, cholesky_solve, lower_triangular_inverse, psd_safe_cholesky, CholeskyFactor,
    JitterConfig,
};
pub use solve::{inv_quad, pivoted_cholesky, solve_psd, PcgConfig, PivotedCholeskyPreconditioner};

use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;

use crate::error::{GpError, Result};

/// Split a `[*batch, r, c]` tensor into `f64` matrices (row-major batch order).
///
/// # Returns `(batch_shape, matrices)`
pub fn to_dmatrices(t: &Tensor) -> Result<(Vec<usize>, Vec<DMatrix<f64>>)> {
    let dims = t.dims();
    if dims.len() < 2 {
        return Err(GpError::ShapeMismatch(format!(
            "expected a [*batch, r, c] tensor, got {:?}",
            dims
        )));
    }
    let (r, c) = (dims[dims.len() - 2], dims[dims.len() - 1]);
    let batch = dims[..dims.len() - 2].to_vec();

    let num_batch: usize = batch.iter().product();
    if r * c == 0 {
        return Ok((batch, vec![DMatrix::zeros(r, c); num_batch]));
    }

    let flat: Vec<f64> = t
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1()?;

    let mats = flat
        .chunks(r * c)
        .map(|chunk| DMatrix::from_row_slice(r, c, chunk))
        .collect::<Vec<_>>();

    Ok((batch, mats))
}

/// Stack matrices back into a `[*batch, r, c]` `F64` tensor
pub fn from_dmatrices(batch: &[usize], mats: &[DMatrix<f64>], device: &Device) -> Result<Tensor> {
    let (r, c) = match mats.first() {
        Some(m) => (m.nrows(), m.ncols()),
        None => (0, 0),
    };
    let mut flat = Vec::with_capacity(mats.len() * r * c);
    for m in mats {
        for i in 0..r {
            for j in 0..c {
                flat.push(m[(i, j)]);
            }
        }
    }
    let mut shape = batch.to_vec();
    shape.extend_from_slice(&[r, c]);
    Ok(Tensor::from_vec(flat, shape, device)?)
}

/// Batched [`psd_safe_cholesky`]: `[*batch, n, n] -> [*batch, n, n]` lower
/// factors, always computed and returned in double precision.
pub fn safe_cholesky(matrix: &Tensor, jitter: &JitterConfig) -> Result<Tensor> {
    let (batch, mats) = to_dmatrices(matrix)?;
    let factors = mats
        .iter()
        .map(|m| psd_safe_cholesky(m, jitter).map(|f| f.l))
        .collect::<Result<Vec<_>>>()?;
    from_dmatrices(&batch, &factors, matrix.device())
}

/// Batched inverse of lower-triangular factors, returned in `F64`
pub fn batch_lower_triangular_inverse(l: &Tensor) -> Result<Tensor> {
    let (batch, mats) = to_dmatrices(l)?;
    let inverses = mats
        .iter()
        .map(lower_triangular_inverse)
        .collect::<Result<Vec<_>>>()?;
    from_dmatrices(&batch, &inverses, l.device())
}

/// Identity matrix tensor `[n, n]`
pub fn eye(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?)
}

/// Lower-triangular mask `[n, n]` (ones on and below the diagonal)
pub fn tril_mask(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f64> = (0..n * n)
        .map(|k| if k % n <= k / n { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?)
}

/// Diagonal of a `[*batch, n, n]` tensor as `[*batch, n]`
pub fn diagonal(matrix: &Tensor) -> Result<Tensor> {
    let rank = matrix.rank();
    let n = matrix.dim(rank - 1)?;
    let mask = eye(n, matrix.dtype(), matrix.device())?;
    Ok(matrix.broadcast_mul(&mask)?.sum(rank - 1)?)
}

/// `[*batch, n] -> [*batch, n, n]` with `v` on the diagonal
pub fn diag_embed(v: &Tensor) -> Result<Tensor> {
    let rank = v.rank();
    let n = v.dim(rank - 1)?;
    let mask = eye(n, v.dtype(), v.device())?;
    Ok(v.unsqueeze(rank)?.broadcast_mul(&mask)?)
}

/// `matrix + value * I` on the last two dimensions
pub fn add_jitter(matrix: &Tensor, value: f64) -> Result<Tensor> {
    let n = matrix.dim(matrix.rank() - 1)?;
    let jitter = (eye(n, matrix.dtype(), matrix.device())? * value)?;
    Ok(matrix.broadcast_add(&jitter)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_batched_safe_cholesky() -> Result<()> {
        let data = vec![
            4.0f32, 2.0, 2.0, 3.0, //
            1.0, 0.5, 0.5, 1.0,
        ];
        let a = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu)?;
        let l = safe_cholesky(&a, &JitterConfig::default())?;

        assert_eq!(l.dims(), &[2, 2, 2]);
        assert_eq!(l.dtype(), DType::F64);

        let recon = l.matmul(&l.t()?)?;
        let expected = a.to_dtype(DType::F64)?;
        let diff: f64 = (recon - expected)?.abs()?.sum_all()?.to_scalar()?;
        assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_tril_and_diagonal() -> Result<()> {
        let mask: Vec<Vec<f32>> = tril_mask(3, DType::F32, &Device::Cpu)?.to_vec2()?;
        assert_eq!(mask[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(mask[2], vec![1.0, 1.0, 1.0]);

        let m = Tensor::from_vec(vec![1f32, 2., 3., 4.], (2, 2), &Device::Cpu)?;
        let d: Vec<f32> = diagonal(&m)?.to_vec1()?;
        assert_eq!(d, vec![1.0, 4.0]);

        let j: Vec<Vec<f32>> = add_jitter(&m, 0.5)?.to_vec2()?;
        assert_eq!(j, vec![vec![1.5, 2.0], vec![3.0, 4.5]]);

        let v = Tensor::new(&[[1f32, 2.0]], &Device::Cpu)?;
        let e: Vec<Vec<Vec<f32>>> = diag_embed(&v)?.to_vec3()?;
        assert_eq!(e[0], vec![vec![1.0, 0.0], vec![0.0, 2.0]]);
        Ok(())
    }
}
