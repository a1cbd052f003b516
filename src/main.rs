// sentiment_loop - main.rs
// Load config, install tracing, dispatch the CLI

use clap::Parser;
use sentiment_loop::cli::{self, Cli};
use sentiment_loop::config_loader::load_config;
use sentiment_loop::log_sink::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config = load_config(args.config.as_deref())?;
    init_tracing(&config.log_level, config.json_logs)?;
    tracing::debug!(data_dir = %config.data_dir, artifact_dir = %config.artifact_dir, "config loaded");

    cli::run(args.command, config).await
}
