use candle_core::Tensor;

use crate::error::{GpError, Result};
use crate::linalg::add_jitter;
use crate::model::GpModelT;

/// Blocks of the joint prior over `[u, f(x)]`, all from one model evaluation
pub struct JointPrior {
    /// μ_z, `[*batch, M]`
    pub induc_mean: Tensor,
    /// μ_x, `[*batch, n]`
    pub test_mean: Tensor,
    /// K_zz + jitter I
    pub induc_induc: Tensor,
    /// K_zx, `[*batch, M, n]`
    pub induc_data: Tensor,
    /// K_xx, `[*batch, n, n]`
    pub data_data: Tensor,
}

/// Evaluate the model once on `cat([z, x])` so every block shares the same
/// kernel evaluation, then split.
pub fn joint_prior<M: GpModelT>(
    model: &M,
    x: &Tensor,
    z: &Tensor,
    inducing_jitter: f64,
) -> Result<JointPrior> {
    let r = z.rank();
    if x.rank() != r {
        return Err(GpError::ShapeMismatch(format!(
            "inducing points {:?} and inputs {:?} differ in rank",
            z.dims(),
            x.dims()
        )));
    }
    let m = z.dim(r - 2)?;
    let n = x.dim(r - 2)?;

    let full_inputs = Tensor::cat(&[z, x], r - 2)?;
    let full = model.forward(&full_inputs)?;
    let mean = full.mean();
    let covar = full.covariance();
    let (mr, cr) = (mean.rank(), covar.rank());

    // matmul needs contiguous blocks
    let block = |rows: usize, nr: usize, cols: usize, nc: usize| -> Result<Tensor> {
        Ok(covar
            .narrow(cr - 2, rows, nr)?
            .narrow(cr - 1, cols, nc)?
            .contiguous()?)
    };

    Ok(JointPrior {
        induc_mean: mean.narrow(mr - 1, 0, m)?.contiguous()?,
        test_mean: mean.narrow(mr - 1, m, n)?.contiguous()?,
        induc_induc: add_jitter(&block(0, m, 0, m)?, inducing_jitter)?,
        induc_data: block(0, m, m, n)?,
        data_data: block(m, n, m, n)?,
    })
}
