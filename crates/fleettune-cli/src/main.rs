//! fleettune - fleet-wide hardware configuration tool
//!
//! Applies CPU and platform settings (core counts, frequencies, power
//! limits, prefetchers, C-states) to the local machine or to remote
//! machines over SSH, concurrently across targets.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod changes;
mod commands;
mod targets;

/// fleettune - fleet-wide hardware configuration tool
#[derive(Parser, Debug)]
#[command(name = "fleettune")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Directory for locally staged script files (defaults to a fresh
    /// temporary directory)
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Keep temporary directories for inspection
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set hardware and OS configuration on one or more targets
    Config(commands::config::ConfigArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command {
        Commands::Config(args) => {
            runtime.block_on(commands::config::run(args, cli.temp_dir, cli.debug))
        }
    }
}
