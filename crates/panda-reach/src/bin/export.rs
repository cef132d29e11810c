use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use panda_reach::{export_policy, init_tracing, ExportConfig};

#[derive(Parser)]
#[command(name = "export")]
#[command(about = "Export the trained policy to ONNX", version)]
struct Cli {
    /// Checkpoint to export
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// ONNX output path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Skip the copy into the public models directory
    #[arg(long)]
    no_copy: bool,

    /// Destination of the public copy
    #[arg(long)]
    public_path: Option<PathBuf>,

    /// Seed for the dummy trace input
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let defaults = ExportConfig::default();
    let config = ExportConfig {
        model_path: cli.model.unwrap_or(defaults.model_path),
        output_path: cli.output.unwrap_or(defaults.output_path),
        copy_to_public: !cli.no_copy,
        public_path: cli.public_path.unwrap_or(defaults.public_path),
        seed: cli.seed,
        ..defaults
    };

    let report = export_policy(&config).await?;
    info!(
        output = %report.summary.path.display(),
        bytes = report.summary.bytes,
        public_copy = ?report.public_copy,
        "done"
    );
    Ok(())
}
