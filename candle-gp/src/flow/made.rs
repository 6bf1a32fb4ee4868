use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module, VarBuilder};

use super::masked_linear::*;

/// Masked autoencoder (MADE) conditioner: alternating masked linear and
/// activation layers. Output `o` only depends on inputs with a smaller degree.
pub struct Made {
    dim: usize,
    hidden_layers: Vec<MaskedLinear>,
    activation: Activation,
    output_layer: MaskedLinear,
}

impl Module for Made {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut h = input.clone();
        for layer in self.hidden_layers.iter() {
            h = self.activation.forward(&layer.forward(&h)?)?;
        }
        self.output_layer.forward(&h)
    }
}

impl Made {
    /// `dim` inputs, `num_params * dim` outputs, one hidden layer per width
    ///
    /// # Arguments
    /// * `dim` - input dimension D
    /// * `hidden_widths` - widths of the hidden layers
    /// * `num_params` - parameters produced per input coordinate
    /// * `vb` - variable builder
    pub fn new(
        dim: usize,
        hidden_widths: &[usize],
        num_params: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_deg = input_degrees(dim);

        let mut prev_deg = in_deg.clone();
        let mut hidden_layers = Vec::with_capacity(hidden_widths.len());
        for (l, &width) in hidden_widths.iter().enumerate() {
            let deg = hidden_degrees(dim, width);
            let mask = hidden_mask(&deg, &prev_deg);
            hidden_layers.push(masked_linear(
                prev_deg.len(),
                width,
                &mask,
                vb.pp(format!("hidden.{}", l)),
            )?);
            prev_deg = deg;
        }

        let out_deg: Vec<usize> = (0..num_params).flat_map(|_| in_deg.iter().cloned()).collect();
        let mask = output_mask(&out_deg, &prev_deg);
        let output_layer =
            masked_linear_zero(prev_deg.len(), out_deg.len(), &mask, vb.pp("output"))?;

        Ok(Self {
            dim,
            hidden_layers,
            activation: Activation::Relu,
            output_layer,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Split the conditioner output into `num_params` chunks of width D
    pub fn forward_split(&self, input: &Tensor, num_params: usize) -> Result<Vec<Tensor>> {
        let out = self.forward(input)?;
        let last = out.rank() - 1;
        (0..num_params)
            .map(|p| out.narrow(last, p * self.dim, self.dim))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_made_is_autoregressive() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        let d = 3;
        let made = Made::new(d, &[12, 12], 2, vb)?;

        // make the zero-initialized output layer non-trivial
        for (name, var) in varmap.data().lock().expect("varmap lock").iter() {
            if name.starts_with("output") {
                let ones = var.as_tensor().ones_like()?;
                var.set(&ones)?;
            }
        }

        let x = Tensor::new(&[[0.1f64, 0.2, 0.3]], &Device::Cpu)?;
        let x_moved = Tensor::new(&[[0.1f64, 0.2, 5.0]], &Device::Cpu)?;

        // changing x3 may not affect any output
        let a: Vec<Vec<f64>> = made.forward(&x)?.to_vec2()?;
        let b: Vec<Vec<f64>> = made.forward(&x_moved)?.to_vec2()?;
        assert_eq!(a, b);

        let x_first = Tensor::new(&[[3.0f64, 0.2, 0.3]], &Device::Cpu)?;
        let c: Vec<Vec<f64>> = made.forward(&x_first)?.to_vec2()?;
        // outputs tied to the first coordinate (o = 0 and o = D) never see x1
        assert_eq!(a[0][0], c[0][0]);
        assert_eq!(a[0][d], c[0][d]);
        Ok(())
    }

    #[test]
    fn test_made_starts_at_zero() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let made = Made::new(2, &[8], 2, vb)?;
        let x = Tensor::new(&[[1f32, -1.0], [0.5, 2.0]], &Device::Cpu)?;
        let parts = made.forward_split(&x, 2)?;
        assert_eq!(parts.len(), 2);
        for p in parts {
            assert_eq!(p.dims(), &[2, 2]);
            let s: f32 = p.abs()?.sum_all()?.to_scalar()?;
            assert_eq!(s, 0.0);
        }
        Ok(())
    }
}
