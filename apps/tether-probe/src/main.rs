mod cli;
mod relay;
mod telemetry;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("info")?;

    match Cli::parse().command {
        Commands::Connect(args) => cli::run_connect(args).await,
        Commands::Relay(args) => relay::run(args).await,
    }
}
