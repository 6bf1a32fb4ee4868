pub mod kernel;
pub mod predict;

use clap::{Parser, Subcommand};

pub use kernel::KernelArgs;
pub use predict::PredictArgs;

#[derive(Parser)]
#[command(name = "candle-gp")]
#[command(about = "Spectral flow kernels and sparse variational GP strategies")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate a spectral flow kernel on a point set
    Kernel(KernelArgs),
    /// Predict with a variational strategy at its initialization
    Predict(PredictArgs),
}

/// Tab-separated row of fixed-precision values
pub(crate) fn format_row(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:.6}", v))
        .collect::<Vec<_>>()
        .join("\t")
}
