use std::cell::OnceCell;

use candle_core::{Tensor, Var};

use super::traits::VariationalDistributionT;
use crate::distributions::Distribution;
use crate::error::{GpError, Result};

enum InducingPoints {
    Learnable(Var),
    Fixed(Tensor),
}

/// Inducing locations `[*batch, M, D]` plus the generator of q(u)
///
/// The `initialized` flag flips once and stays set for the lifetime of the
/// store.
pub struct InducingPointStore<'a, V> {
    points: InducingPoints,
    generator: &'a V,
    initialized: OnceCell<()>,
}

impl<'a, V: VariationalDistributionT> InducingPointStore<'a, V> {
    /// # Arguments
    /// * `points` - `[*batch, M, D]`, or `[M]` for one-dimensional inputs
    /// * `generator` - q(u) over the M inducing values
    /// * `learn_inducing_locations` - register the points as a trainable `Var`
    pub fn new(points: &Tensor, generator: &'a V, learn_inducing_locations: bool) -> Result<Self> {
        let points = if points.rank() == 1 {
            points.unsqueeze(1)?
        } else {
            points.clone()
        };
        if points.rank() < 2 {
            return Err(GpError::ShapeMismatch(format!(
                "inducing points must be [*batch, M, D], got {:?}",
                points.dims()
            )));
        }
        let m = points.dim(points.rank() - 2)?;
        if m != generator.num_inducing() {
            return Err(GpError::ShapeMismatch(format!(
                "{} inducing points but the variational distribution has {}",
                m,
                generator.num_inducing()
            )));
        }

        let points = if learn_inducing_locations {
            InducingPoints::Learnable(Var::from_tensor(&points)?)
        } else {
            InducingPoints::Fixed(points.detach())
        };

        Ok(Self {
            points,
            generator,
            initialized: OnceCell::new(),
        })
    }

    pub fn inducing_points(&self) -> &Tensor {
        match &self.points {
            InducingPoints::Learnable(v) => v.as_tensor(),
            InducingPoints::Fixed(t) => t,
        }
    }

    pub fn num_inducing(&self) -> usize {
        self.generator.num_inducing()
    }

    pub fn is_learnable(&self) -> bool {
        matches!(self.points, InducingPoints::Learnable(_))
    }

    /// Replace the locations, keeping their shape
    pub fn set_inducing_points(&mut self, points: &Tensor) -> Result<()> {
        if points.dims() != self.inducing_points().dims() {
            return Err(GpError::ShapeMismatch(format!(
                "new inducing points {:?} vs {:?}",
                points.dims(),
                self.inducing_points().dims()
            )));
        }
        match &mut self.points {
            InducingPoints::Learnable(v) => v.set(&points.contiguous()?)?,
            InducingPoints::Fixed(t) => *t = points.detach(),
        }
        Ok(())
    }

    /// Trainable locations and variational parameters
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = self.generator.vars();
        if let InducingPoints::Learnable(v) = &self.points {
            vars.push(v.clone());
        }
        vars
    }

    pub fn generator(&self) -> &'a V {
        self.generator
    }

    pub fn variational_distribution(&self) -> Result<Distribution> {
        self.generator.distribution()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get().is_some()
    }

    pub(crate) fn mark_initialized(&self) {
        let _ = self.initialized.set(());
    }
}
