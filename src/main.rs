//! Kolosal Supernet - Main Entry Point
//!
//! Command-line tooling around supernet search spaces, samplers and candidate pools.

use clap::Parser;
use kolosal_supernet::cli::{cmd_params, cmd_pool, cmd_sample, cmd_space, Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_supernet=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Space { config } => {
            cmd_space(config.as_deref())?;
        }
        Commands::Sample { config, seed, count } => {
            cmd_sample(config.as_deref(), seed, count)?;
        }
        Commands::Pool { config, size, seed, output } => {
            cmd_pool(config.as_deref(), size, seed, output.as_deref())?;
        }
        Commands::Params { config, arch, head_dim, kernel_size } => {
            cmd_params(config.as_deref(), arch.as_deref(), head_dim, kernel_size)?;
        }
    }

    Ok(())
}
