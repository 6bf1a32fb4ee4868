use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, Module};

//////////////////////////////////////////////
// Linear module with a fixed connectivity mask //
//////////////////////////////////////////////

/// `y = x (W ⊙ mask)ᵀ + b`; the mask zeroes connections that would break
/// the autoregressive ordering.
#[derive(Clone, Debug)]
pub struct MaskedLinear {
    weight_oi: Tensor,
    mask_oi: Tensor,
    bias_o: Tensor,
}

impl MaskedLinear {
    pub fn new(weight_oi: Tensor, mask_oi: Tensor, bias_o: Tensor) -> Self {
        Self {
            weight_oi,
            mask_oi,
            bias_o,
        }
    }

    pub fn weight(&self) -> Result<Tensor> {
        self.weight_oi.mul(&self.mask_oi)
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask_oi
    }
}

impl Module for MaskedLinear {
    fn forward(&self, h_ni: &Tensor) -> Result<Tensor> {
        let w_io = self.weight()?.t()?;
        h_ni.broadcast_matmul(&w_io)?.broadcast_add(&self.bias_o)
    }
}

/// Masked linear layer with Kaiming-normal weights
///
/// * `mask` - row-major `out_dim x in_dim` 0/1 connectivity
pub fn masked_linear(
    in_dim: usize,
    out_dim: usize,
    mask: &[f32],
    vb: candle_nn::VarBuilder,
) -> Result<MaskedLinear> {
    masked_linear_with_init(in_dim, out_dim, mask, candle_nn::init::DEFAULT_KAIMING_NORMAL, vb)
}

/// Masked linear layer whose weights and bias start at zero
pub fn masked_linear_zero(
    in_dim: usize,
    out_dim: usize,
    mask: &[f32],
    vb: candle_nn::VarBuilder,
) -> Result<MaskedLinear> {
    masked_linear_with_init(in_dim, out_dim, mask, candle_nn::init::ZERO, vb)
}

fn masked_linear_with_init(
    in_dim: usize,
    out_dim: usize,
    mask: &[f32],
    init_ws: Init,
    vb: candle_nn::VarBuilder,
) -> Result<MaskedLinear> {
    debug_assert_eq!(mask.len(), in_dim * out_dim);
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    let mask = mask_tensor(out_dim, in_dim, mask, ws.dtype(), ws.device())?;
    Ok(MaskedLinear::new(ws, mask, bs))
}

fn mask_tensor(
    out_dim: usize,
    in_dim: usize,
    mask: &[f32],
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    Tensor::from_vec(mask.to_vec(), (out_dim, in_dim), device)?.to_dtype(dtype)
}

/// MADE degrees of the inputs: 1..=D
pub fn input_degrees(dim: usize) -> Vec<usize> {
    (1..=dim).collect()
}

/// MADE degrees of a hidden layer, cycling through 1..D-1.
/// With a single input there is nothing to condition on, so every hidden
/// unit gets degree 0 and only sees biases.
pub fn hidden_degrees(dim: usize, width: usize) -> Vec<usize> {
    if dim <= 1 {
        vec![0; width]
    } else {
        (0..width).map(|k| k % (dim - 1) + 1).collect()
    }
}

/// Hidden unit `k` may see unit `j` of the previous layer iff `deg[k] >= deg[j]`
pub fn hidden_mask(out_deg: &[usize], in_deg: &[usize]) -> Vec<f32> {
    out_deg
        .iter()
        .flat_map(|&o| in_deg.iter().map(move |&i| if o >= i { 1.0 } else { 0.0 }))
        .collect()
}

/// Output `o` may see unit `j` iff `deg[o] > deg[j]` (strict, so y_i never sees x_i)
pub fn output_mask(out_deg: &[usize], in_deg: &[usize]) -> Vec<f32> {
    out_deg
        .iter()
        .flat_map(|&o| in_deg.iter().map(move |&i| if o > i { 1.0 } else { 0.0 }))
        .collect()
}
