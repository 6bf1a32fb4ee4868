use std::path::PathBuf;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;

use crate::kernel::{KernelT, SpectralEstimator, SpectralFlowKernel, SpectralKernelConfig};

use super::format_row;

#[derive(Args, Debug)]
pub struct KernelArgs {
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        required = true,
        help = "Input coordinates, row-major (n * num_dims values)"
    )]
    pub points: Vec<f64>,

    #[arg(long, default_value = "1")]
    pub num_dims: usize,

    #[arg(long, default_value = "1.0")]
    pub lengthscale: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(short, long, default_value = "mean")]
    pub estimator: SpectralEstimator,

    #[arg(long, help = "Frequency draws per evaluation (2000 for mean, 1000 for importance)")]
    pub samples: Option<usize>,

    #[arg(long, help = "Only the variances k(x_i, x_i)")]
    pub diag: bool,

    #[arg(long, help = "JSON kernel config; replaces the kernel flags above")]
    pub config: Option<PathBuf>,
}

impl KernelArgs {
    fn kernel_config(&self) -> Result<SpectralKernelConfig> {
        let config = match &self.config {
            Some(path) => {
                info!("Loading kernel config from {:?}", path);
                SpectralKernelConfig::from_json_file(path)?
            }
            None => {
                let config = SpectralKernelConfig {
                    num_dims: self.num_dims,
                    num_samples: self.samples,
                    estimator: self.estimator,
                    init_lengthscale: self.lengthscale,
                    seed: self.seed,
                    ..Default::default()
                };
                config.validate()?;
                config
            }
        };
        Ok(config)
    }
}

/// `n * d` coordinates as an `[n, d]` tensor
pub(crate) fn points_tensor(values: &[f64], d: usize, device: &Device) -> Result<Tensor> {
    if values.is_empty() {
        bail!("no points given");
    }
    if d == 0 || values.len() % d != 0 {
        bail!(
            "{} coordinates do not split into points of dimension {}",
            values.len(),
            d
        );
    }
    Ok(Tensor::from_vec(values.to_vec(), (values.len() / d, d), device)?)
}

pub fn run(args: &KernelArgs) -> Result<()> {
    let config = args.kernel_config()?;
    let device = Device::Cpu;
    let x = points_tensor(&args.points, config.num_dims, &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
    let kernel = SpectralFlowKernel::new(config, vb)?;
    info!(
        "{} points, {} dims, {:?} estimator with {} draws",
        x.dim(0)?,
        kernel.num_dims(),
        kernel.config().estimator,
        kernel.config().num_samples()
    );

    if args.diag {
        let k: Vec<f64> = kernel.evaluate(&x, &x, true, false)?.to_vec1()?;
        println!("{}", format_row(&k));
    } else {
        let k: Vec<Vec<f64>> = kernel.forward(&x, &x)?.to_vec2()?;
        for row in k {
            println!("{}", format_row(&row));
        }
    }
    Ok(())
}
