use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::distributions::MultivariateNormal;
use crate::error::Result;
use crate::kernel::KernelT;

/// GP prior over function values at a set of inputs
pub trait GpModelT {
    /// p(f(x)) for `x` of shape `[*batch, n, D]`
    fn forward(&self, x: &Tensor) -> Result<MultivariateNormal>;
}

/// m(x) = c
pub struct ConstantMean {
    constant: Tensor,
}

impl ConstantMean {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let constant = vb.get_with_hints(1, "constant", candle_nn::Init::Const(0.0))?;
        Ok(Self { constant })
    }

    pub fn constant(&self) -> &Tensor {
        &self.constant
    }

    /// `[*batch, n, D] -> [*batch, n]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        let shape = &dims[..dims.len() - 1];
        let zeros = Tensor::zeros(shape, self.constant.dtype(), x.device())?;
        Ok(zeros.broadcast_add(&self.constant)?)
    }
}

/// Constant mean plus any kernel
pub struct ApproximateGp<K> {
    mean: ConstantMean,
    kernel: K,
}

impl<K: KernelT> ApproximateGp<K> {
    pub fn new(kernel: K, vb: VarBuilder) -> Result<Self> {
        let mean = ConstantMean::new(vb.pp("mean"))?;
        Ok(Self { mean, kernel })
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn mean_module(&self) -> &ConstantMean {
        &self.mean
    }
}

impl<K: KernelT> GpModelT for ApproximateGp<K> {
    fn forward(&self, x: &Tensor) -> Result<MultivariateNormal> {
        let mean = self.mean.forward(x)?;
        let covar = self.kernel.forward(x, x)?.to_dtype(mean.dtype())?;
        MultivariateNormal::new(mean, covar)
    }
}
