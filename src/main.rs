//! factoryforge - replication core for a multiplayer factory game
//!
//! `serve` hosts a sandbox world, `connect` joins one, `simulate` plays a
//! whole session over a simulated link.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::SimulateOptions;
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use factoryforge_net::NetworkPreset;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "factoryforge", version)]
#[command(about = "Replicated factory sandbox: server, client and network simulation")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the sandbox world
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Session seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Join a server and walk a square
    Connect {
        /// Server host
        #[arg(long)]
        host: Option<String>,
        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
        /// Ticks to play before leaving
        #[arg(long, default_value_t = 600)]
        ticks: u64,
    },
    /// Play a session over a simulated link
    Simulate {
        /// none, good, bad or terrible; the configured link when omitted
        #[arg(long)]
        preset: Option<NetworkPreset>,
        /// Ticks of scripted input
        #[arg(long, default_value_t = 600)]
        ticks: u64,
        /// Session and link seed
        #[arg(long)]
        seed: Option<u64>,
        /// Write a JSON report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Write the effective configuration back to the config file
    SaveConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting factoryforge v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = AppConfig::load_from_path(&cli.config);

    match cli.command {
        Command::Serve { port, seed } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(seed) = seed {
                config.server.rules.seed = seed;
            }
            commands::serve(&config).await
        }
        Command::Connect { host, port, ticks } => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            commands::connect(&config, ticks).await
        }
        Command::Simulate {
            preset,
            ticks,
            seed,
            report,
        } => {
            commands::simulate(
                &config,
                SimulateOptions {
                    preset,
                    ticks,
                    seed,
                    report,
                },
            )?;
            Ok(())
        }
        Command::SaveConfig => {
            config.save_to_path(&cli.config)?;
            info!("Configuration saved to {}", cli.config.display());
            Ok(())
        }
    }
}
