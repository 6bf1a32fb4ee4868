use anyhow::Result;
use candle_gp::cli::{kernel, predict, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Kernel(args) => {
            kernel::run(args)?;
        }
        Commands::Predict(args) => {
            predict::run(args)?;
        }
    }

    Ok(())
}
