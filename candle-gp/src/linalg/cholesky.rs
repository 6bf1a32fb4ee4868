use log::warn;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{GpError, Result};

/// Diagonal jitter schedule for [`psd_safe_cholesky`].
///
/// The first attempt adds nothing; attempt `i` (0-based) then adds
/// `initial * growth^i` to the diagonal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JitterConfig {
    pub initial: f64,
    pub max_tries: usize,
    pub growth: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            initial: 1e-8,
            max_tries: 3,
            growth: 10.0,
        }
    }
}

impl JitterConfig {
    pub fn new(initial: f64, max_tries: usize) -> Self {
        Self {
            initial,
            max_tries,
            ..Default::default()
        }
    }

    /// Largest jitter this schedule will ever add.
    pub fn max_jitter(&self) -> f64 {
        if self.max_tries == 0 {
            0.0
        } else {
            self.initial * self.growth.powi(self.max_tries as i32 - 1)
        }
    }
}

/// Lower-triangular factor together with how much jitter it took.
#[derive(Debug, Clone)]
pub struct CholeskyFactor {
    pub l: DMatrix<f64>,
    pub jitter: f64,
    pub retries: usize,
}

/// Cholesky factorization of a symmetric PSD matrix that tolerates
/// floating-point loss of definiteness by retrying with diagonal jitter.
///
/// # Arguments
/// * `matrix` - symmetric matrix (n x n), only the lower triangle is read
/// * `config` - jitter schedule
///
/// # Returns
/// `CholeskyFactor` with `L L^T = matrix + jitter * I`
pub fn psd_safe_cholesky(matrix: &DMatrix<f64>, config: &JitterConfig) -> Result<CholeskyFactor> {
    if !matrix.is_square() {
        return Err(GpError::ShapeMismatch(format!(
            "cholesky needs a square matrix, got {} x {}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }

    if matrix.iter().any(|x| x.is_nan()) {
        return Err(GpError::Numerical(
            "cholesky input contains NaN entries".to_string(),
        ));
    }

    if let Some(chol) = matrix.clone().cholesky() {
        return Ok(CholeskyFactor {
            l: chol.l(),
            jitter: 0.0,
            retries: 0,
        });
    }

    let n = matrix.nrows();
    let mut jittered = matrix.clone();
    let mut jitter_prev = 0.0;

    for i in 0..config.max_tries {
        let jitter_new = config.initial * config.growth.powi(i as i32);
        for d in 0..n {
            jittered[(d, d)] += jitter_new - jitter_prev;
        }
        jitter_prev = jitter_new;

        if let Some(chol) = jittered.clone().cholesky() {
            warn!(
                "matrix not positive definite, added jitter of {:.1e} to the diagonal",
                jitter_new
            );
            return Ok(CholeskyFactor {
                l: chol.l(),
                jitter: jitter_new,
                retries: i + 1,
            });
        }
    }

    Err(GpError::Numerical(format!(
        "matrix ({} x {}) not positive definite even with jitter {:.1e} added to the diagonal",
        n,
        n,
        jitter_prev
    )))
}

/// Solve `L L^T x = rhs` given the lower factor `L`.
pub fn cholesky_solve(l: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let y = l
        .solve_lower_triangular(rhs)
        .ok_or_else(|| GpError::Numerical("singular cholesky factor".to_string()))?;
    l.transpose()
        .solve_upper_triangular(&y)
        .ok_or_else(|| GpError::Numerical("singular cholesky factor".to_string()))
}

/// `L^{-1}` for a lower-triangular `L`
pub fn lower_triangular_inverse(l: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = l.nrows();
    l.solve_lower_triangular(&DMatrix::identity(n, n))
        .ok_or_else(|| GpError::Numerical("singular lower-triangular matrix".to_string()))
}

/// log |L L^T| = 2 * sum log L[i,i]
pub fn cholesky_logdet(l: &DMatrix<f64>) -> f64 {
    2.0 * l.diagonal().iter().map(|x| x.abs().ln()).sum::<f64>()
}
