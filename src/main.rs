mod app;
mod archive;
mod config;
mod filter;
mod geometry;
mod pipeline;
mod schema;
mod sinks;
mod stream;
mod utils;

use anyhow::Result;
use clap::Parser;

use app::{Cli, Command, run_filter, run_infer_schema};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: tracing::Level = cli.command.common().log_level.into();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Command::Filter(args) => run_filter(args),
        Command::InferSchema(args) => run_infer_schema(args),
    }
}
