use candle_core::Tensor;

use super::{Distribution, MultivariateNormal};
use crate::error::{GpError, Result};
use crate::linalg::{batch_lower_triangular_inverse, JitterConfig};

/// Analytic KL(q ‖ p) against a Gaussian p.
///
/// * q = N(μq, Σq): `0.5 * [tr(Σp⁻¹Σq) + (μp-μq)ᵀΣp⁻¹(μp-μq) - M + log|Σp| - log|Σq|]`
/// * q = δ(u): `-log p(u)`
///
/// Any other q has no analytic form here.
///
/// # Returns
/// `[*batch]`
pub fn kl_divergence(
    q: &Distribution,
    p: &MultivariateNormal,
    jitter: &JitterConfig,
) -> Result<Tensor> {
    match q {
        Distribution::MultivariateNormal(q) => gaussian_kl(q, p, jitter),
        Distribution::Delta(q) => Ok(p.log_prob(q.mean(), jitter)?.neg()?),
        other => Err(GpError::invalid_distribution(other.type_name())),
    }
}

fn gaussian_kl(
    q: &MultivariateNormal,
    p: &MultivariateNormal,
    jitter: &JitterConfig,
) -> Result<Tensor> {
    if q.mean().dims() != p.mean().dims() {
        return Err(GpError::ShapeMismatch(format!(
            "kl divergence: q is {:?}, p is {:?}",
            q.mean().dims(),
            p.mean().dims()
        )));
    }
    let m = q.event_size() as f64;
    let dtype = q.dtype();

    // tr(Σp⁻¹Σq) = ||Lp⁻¹ Lq||²_F
    let lp = p.scale_tril(jitter)?;
    let lp_inv = batch_lower_triangular_inverse(&lp.detach())?.to_dtype(dtype)?;
    let lq = q.scale_tril(jitter)?;
    let a = lp_inv.matmul(&lq)?;
    let trace = a.sqr()?.sum(a.rank() - 1)?.sum(a.rank() - 2)?;

    let diff = (p.mean() - q.mean())?;
    let mahalanobis = p.inv_quad(&diff, jitter)?;

    let logdet_p = p.logdet(jitter)?;
    let logdet_q = q.logdet(jitter)?;

    let kl = ((trace + mahalanobis)? - m)?;
    let kl = ((kl + logdet_p)? - logdet_q)?;
    Ok((kl * 0.5)?)
}
