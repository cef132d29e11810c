use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use panda_reach::{init_tracing, run_training, TrainConfig};

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train a PPO policy on PandaReach-v3", version)]
struct Cli {
    /// JSON training config; unset fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the training budget
    #[arg(long)]
    total_timesteps: Option<u64>,

    /// Seed environments and learner
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrainConfig::from_file(path).await?,
        None => TrainConfig::default(),
    };
    if let Some(total) = cli.total_timesteps {
        config.total_timesteps = total;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    let report = run_training(&config).await?;
    info!(
        final_model = %report.final_model.display(),
        checkpoints = report.checkpoints.len(),
        logs = %report.run_dir.display(),
        "done"
    );
    Ok(())
}
