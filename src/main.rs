//! Transaction Swarm - synthetic transaction load for smart contract deployments
//!
//! Drives a farm of simulated wallets through behaviorally-realistic
//! interaction patterns against a chain provider, with nonce-safe concurrency,
//! retry, rate limiting, and circuit breaking.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use txswarm::cli::commands;
use txswarm::config::Config;

/// Transaction Swarm - synthetic contract load generator
#[derive(Parser)]
#[command(name = "txswarm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load simulation
    Run {
        /// Run duration in seconds (0 = until Ctrl-C), overriding the config
        #[arg(long)]
        duration: Option<u64>,

        /// RNG seed for a reproducible run, overriding the config
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show the effective configuration
    Config,

    /// List available archetypes and timing profiles
    Archetypes,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("txswarm=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run { duration, seed } => {
            if let Some(duration) = duration {
                config.simulation.duration_secs = duration;
            }
            if let Some(seed) = seed {
                config.simulation.seed = Some(seed);
            }
            commands::run(&config).await
        }
        Commands::Config => commands::show_config(&config),
        Commands::Archetypes => commands::archetypes(),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
