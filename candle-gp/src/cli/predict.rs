use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;

use crate::kernel::{SpectralEstimator, SpectralFlowKernel, SpectralKernelConfig};
use crate::model::{ApproximateGp, GpModelT};
use crate::variational::{
    CallOptions, CholeskyVariationalDistribution, DeltaVariationalDistribution, PredictiveMapper,
    UnwhitenedMapper, VariationalConfig, VariationalDistributionT, VariationalStrategy,
    WhitenedMapper,
};

use super::format_row;
use super::kernel::points_tensor;

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(long, default_value = "5", help = "Number of evenly spaced inducing points")]
    pub inducing: usize,

    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        required = true,
        help = "One-dimensional query points"
    )]
    pub queries: Vec<f64>,

    #[arg(long, help = "Whitened parameterization of q(u)")]
    pub whiten: bool,

    #[arg(long, help = "Point-mass q(u) (MAP inference)")]
    pub delta: bool,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(short, long, default_value = "mean")]
    pub estimator: SpectralEstimator,

    #[arg(long)]
    pub samples: Option<usize>,
}

/// `m` evenly spaced values over `[lo, hi]`
fn linspace(lo: f64, hi: f64, m: usize) -> Vec<f64> {
    if m == 1 {
        return vec![0.5 * (lo + hi)];
    }
    let step = (hi - lo) / (m - 1) as f64;
    (0..m).map(|i| lo + step * i as f64).collect()
}

pub fn run(args: &PredictArgs) -> Result<()> {
    if args.inducing == 0 {
        bail!("need at least one inducing point");
    }
    let device = Device::Cpu;
    let x = points_tensor(&args.queries, 1, &device)?;

    let lo = args.queries.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = args.queries.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let z = Tensor::from_vec(linspace(lo, hi, args.inducing), args.inducing, &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
    let config = SpectralKernelConfig {
        num_samples: args.samples,
        estimator: args.estimator,
        seed: args.seed,
        ..Default::default()
    };
    let kernel = SpectralFlowKernel::new(config, vb.pp("kernel"))?;
    let gp = ApproximateGp::new(kernel, vb.pp("gp"))?;

    let vconfig = VariationalConfig::new(VariationalConfig::default().mean_init_std, args.seed);
    info!(
        "{} inducing points on [{}, {}], {} q(u), {}",
        args.inducing,
        lo,
        hi,
        if args.delta { "delta" } else { "cholesky" },
        if args.whiten { "whitened" } else { "unwhitened" }
    );

    if args.delta {
        let q = DeltaVariationalDistribution::new(args.inducing, &[], DType::F64, &device, vconfig)?;
        with_mapper(&gp, &z, &q, &x, args.whiten)
    } else {
        let q =
            CholeskyVariationalDistribution::new(args.inducing, &[], DType::F64, &device, vconfig)?;
        with_mapper(&gp, &z, &q, &x, args.whiten)
    }
}

fn with_mapper<M, V>(gp: &M, z: &Tensor, q: &V, x: &Tensor, whiten: bool) -> Result<()>
where
    M: GpModelT,
    V: VariationalDistributionT,
{
    if whiten {
        predict(gp, z, q, WhitenedMapper::default(), x)
    } else {
        predict(gp, z, q, UnwhitenedMapper::default(), x)
    }
}

fn predict<M, V, P>(gp: &M, z: &Tensor, q: &V, mapper: P, x: &Tensor) -> Result<()>
where
    M: GpModelT,
    V: VariationalDistributionT,
    P: PredictiveMapper,
{
    let mut strategy = VariationalStrategy::new(gp, z, q, mapper, false)?;
    strategy.eval();
    let out = strategy.call(x, CallOptions::default())?;
    let kl = strategy.kl_divergence()?.to_scalar::<f64>()?;

    let xs: Vec<f64> = x.flatten_all()?.to_vec1()?;
    let mean: Vec<f64> = out.predictive.mean().to_vec1()?;
    let var: Vec<f64> = out.predictive.variance()?.to_vec1()?;

    println!("x\tmean\tvariance");
    for i in 0..xs.len() {
        println!("{}", format_row(&[xs[i], mean[i], var[i]]));
    }
    println!("kl\t{:.6}", kl);
    Ok(())
}
