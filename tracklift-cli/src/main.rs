mod cli;
mod commands;
mod config;
mod error;
mod job;
mod progress;

use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    commands::CommandExecutor,
    config::AppConfig,
    error::{AppError, Result},
};

const DEFAULT_LOG_FILTER: &str = "tracklift=info,tracklift_engine=info,keyvault=info";

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(args.verbose, args.quiet) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    match run(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

/// `Ok(false)` when the command ran but some track failed.
async fn run(args: Args) -> Result<bool> {
    let config = AppConfig::load(args.config.as_deref())?;
    let executor = CommandExecutor::new(config, args.quiet);

    match args.command {
        Commands::Download(download) => executor.download(download).await,
        Commands::Vault { command, store } => {
            executor.vault(command, store).await?;
            Ok(true)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("tracklift=debug,tracklift_engine=debug,keyvault=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_level(true),
        )
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
