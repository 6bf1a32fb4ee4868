use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use super::cholesky::{cholesky_solve, psd_safe_cholesky, JitterConfig};
use crate::error::{GpError, Result};
use crate::settings;

/// Conjugate gradient stopping rule
#[derive(Debug, Clone)]
pub struct PcgConfig {
    pub max_iter: usize,
    pub rel_tol: f64,
}

impl Default for PcgConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            rel_tol: 1e-10,
        }
    }
}

/// Solve `cov · X = rhs` for a symmetric PSD `cov`.
///
/// Dense Cholesky is used unless preconditioning is enabled
/// (`settings::max_preconditioner_size() > 0`) and the matrix is larger than
/// `settings::max_cholesky_size()`; then preconditioned conjugate gradients run
/// with a pivoted-Cholesky preconditioner of that rank.
pub fn solve_psd(
    cov: &DMatrix<f64>,
    rhs: &DMatrix<f64>,
    jitter: &JitterConfig,
) -> Result<DMatrix<f64>> {
    let n = cov.nrows();
    if rhs.nrows() != n {
        return Err(GpError::ShapeMismatch(format!(
            "solve: matrix is {} x {}, rhs has {} rows",
            n,
            cov.ncols(),
            rhs.nrows()
        )));
    }

    let rank = settings::max_preconditioner_size();
    if rank == 0 || n <= settings::max_cholesky_size() {
        let factor = psd_safe_cholesky(cov, jitter)?;
        return cholesky_solve(&factor.l, rhs);
    }

    debug!("pcg solve: n = {}, preconditioner rank = {}", n, rank);
    let precond = PivotedCholeskyPreconditioner::new(cov, rank.min(n))?;
    let config = PcgConfig::default();

    let mut out = DMatrix::<f64>::zeros(n, rhs.ncols());
    for (j, b) in rhs.column_iter().enumerate() {
        let x = pcg(cov, &b.into_owned(), &precond, &config)?;
        out.set_column(j, &x);
    }
    Ok(out)
}

/// `rhs^T cov^{-1} rhs`, one value per column of `rhs`
pub fn inv_quad(cov: &DMatrix<f64>, rhs: &DMatrix<f64>, jitter: &JitterConfig) -> Result<Vec<f64>> {
    let x = solve_psd(cov, rhs, jitter)?;
    Ok(rhs
        .column_iter()
        .zip(x.column_iter())
        .map(|(b, x)| b.dot(&x))
        .collect())
}

/// Low-rank plus diagonal approximation `P = L_k L_k^T + D` of a PSD matrix,
/// applied through the Woodbury identity.
pub struct PivotedCholeskyPreconditioner {
    l_nk: DMatrix<f64>,
    inv_diag: DVector<f64>,
    inner_chol: DMatrix<f64>,
}

impl PivotedCholeskyPreconditioner {
    pub fn new(matrix: &DMatrix<f64>, rank: usize) -> Result<Self> {
        let n = matrix.nrows();
        let l_nk = pivoted_cholesky(matrix, rank);
        let k = l_nk.ncols();

        let max_diag = matrix.diagonal().iter().cloned().fold(0.0_f64, f64::max);
        let floor = (1e-6 * max_diag).max(1e-12);

        let approx_diag = (&l_nk * l_nk.transpose()).diagonal();
        let inv_diag = DVector::from_fn(n, |i, _| {
            1.0 / (matrix[(i, i)] - approx_diag[i]).max(floor)
        });

        // I + L^T D^{-1} L
        let scaled = DMatrix::from_fn(n, k, |i, j| l_nk[(i, j)] * inv_diag[i]);
        let inner = DMatrix::<f64>::identity(k, k) + l_nk.transpose() * scaled;
        let inner_chol = psd_safe_cholesky(&inner, &JitterConfig::default())?.l;

        Ok(Self {
            l_nk,
            inv_diag,
            inner_chol,
        })
    }

    pub fn rank(&self) -> usize {
        self.l_nk.ncols()
    }

    /// P^{-1} v = D^{-1} v - D^{-1} L (I + L^T D^{-1} L)^{-1} L^T D^{-1} v
    pub fn apply(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        let dv = v.component_mul(&self.inv_diag);
        if self.rank() == 0 {
            return Ok(dv);
        }
        let proj = self.l_nk.transpose() * &dv;
        let proj = DMatrix::from_column_slice(proj.len(), 1, proj.as_slice());
        let inner = cholesky_solve(&self.inner_chol, &proj)?;
        let correction = (&self.l_nk * inner.column(0)).component_mul(&self.inv_diag);
        Ok(dv - correction)
    }
}

/// Rank-`rank` pivoted Cholesky; stops early once the residual diagonal vanishes.
/// Rows stay in the original order.
pub fn pivoted_cholesky(matrix: &DMatrix<f64>, rank: usize) -> DMatrix<f64> {
    let n = matrix.nrows();
    let rank = rank.min(n);
    let mut d: Vec<f64> = matrix.diagonal().iter().cloned().collect();
    let mut perm: Vec<usize> = (0..n).collect();
    let mut l = DMatrix::<f64>::zeros(n, rank);
    let mut taken = 0;

    for m in 0..rank {
        let (best, _) = perm[m..]
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &p)| {
                if d[p] > bv {
                    (i, d[p])
                } else {
                    (bi, bv)
                }
            });
        perm.swap(m, m + best);

        let pm = perm[m];
        let pivot = d[pm];
        if pivot <= 1e-12 {
            break;
        }
        let l_mm = pivot.sqrt();
        l[(pm, m)] = l_mm;

        for &pj in perm.iter().skip(m + 1) {
            let mut val = matrix[(pm, pj)];
            for t in 0..m {
                val -= l[(pm, t)] * l[(pj, t)];
            }
            val /= l_mm;
            l[(pj, m)] = val;
            d[pj] -= val * val;
        }
        d[pm] = 0.0;
        taken = m + 1;
    }

    l.columns(0, taken).into_owned()
}

fn pcg(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    precond: &PivotedCholeskyPreconditioner,
    config: &PcgConfig,
) -> Result<DVector<f64>> {
    let n = b.len();
    let b_norm = b.norm();
    let mut x = DVector::<f64>::zeros(n);
    if b_norm == 0.0 {
        return Ok(x);
    }

    let mut r = b.clone();
    let mut z = precond.apply(&r)?;
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    for _ in 0..config.max_iter {
        let ap = a * &p;
        let p_ap = p.dot(&ap);
        if p_ap <= 0.0 {
            return Err(GpError::Numerical(
                "conjugate gradients hit a non-positive curvature direction".to_string(),
            ));
        }
        let alpha = rz / p_ap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);

        if r.norm() <= config.rel_tol * b_norm {
            return Ok(x);
        }

        z = precond.apply(&r)?;
        let rz_new = r.dot(&z);
        let beta = rz_new / rz;
        p = &z + &p * beta;
        rz = rz_new;
    }

    warn!(
        "conjugate gradients did not converge after {} iterations (residual {:.2e})",
        config.max_iter,
        r.norm() / b_norm
    );
    Ok(x)
}
