//! Thread-local numerical settings with scoped overrides.
//!
//! A guard returned by `scoped` swaps in the new value and restores the previous
//! one when dropped, so overrides nest:
//!
//! ```ignore
//! let _exact = MaxPreconditionerSize::scoped(0);
//! // every solve in this scope uses a dense Cholesky factor
//! ```

use std::cell::Cell;

pub const DEFAULT_MAX_PRECONDITIONER_SIZE: usize = 15;
pub const DEFAULT_MAX_CHOLESKY_SIZE: usize = 800;

thread_local! {
    static MAX_PRECONDITIONER_SIZE: Cell<usize> = const { Cell::new(DEFAULT_MAX_PRECONDITIONER_SIZE) };
    static MAX_CHOLESKY_SIZE: Cell<usize> = const { Cell::new(DEFAULT_MAX_CHOLESKY_SIZE) };
}

/// Rank of the pivoted-Cholesky preconditioner used by iterative solves.
/// Zero disables the iterative path entirely.
pub fn max_preconditioner_size() -> usize {
    MAX_PRECONDITIONER_SIZE.with(|c| c.get())
}

/// Matrices up to this size are always solved with a dense Cholesky factor.
pub fn max_cholesky_size() -> usize {
    MAX_CHOLESKY_SIZE.with(|c| c.get())
}

#[must_use = "the setting is restored as soon as the guard is dropped"]
pub struct MaxPreconditionerSize {
    previous: usize,
}

impl MaxPreconditionerSize {
    pub fn scoped(size: usize) -> Self {
        let previous = MAX_PRECONDITIONER_SIZE.with(|c| c.replace(size));
        Self { previous }
    }
}

impl Drop for MaxPreconditionerSize {
    fn drop(&mut self) {
        MAX_PRECONDITIONER_SIZE.with(|c| c.set(self.previous));
    }
}

#[must_use = "the setting is restored as soon as the guard is dropped"]
pub struct MaxCholeskySize {
    previous: usize,
}

impl MaxCholeskySize {
    pub fn scoped(size: usize) -> Self {
        let previous = MAX_CHOLESKY_SIZE.with(|c| c.replace(size));
        Self { previous }
    }
}

impl Drop for MaxCholeskySize {
    fn drop(&mut self) {
        MAX_CHOLESKY_SIZE.with(|c| c.set(self.previous));
    }
}
