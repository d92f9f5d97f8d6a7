// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! corelink CLI
//!
//! Runs a ROM on a corelink core from the command line.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use corelink::ManagerStrategy;

mod commands;

#[derive(Parser)]
#[command(name = "corelink")]
#[command(author, version, about = "Host an emulation core from the command line", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    /// Core runs on a thread of this process
    CoLocated,
    /// Core runs inside a corelink-helper process
    Isolated,
}

impl From<Strategy> for ManagerStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::CoLocated => ManagerStrategy::CoLocated,
            Strategy::Isolated => ManagerStrategy::Isolated,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load a ROM, run it for a while, then stop
    Run {
        /// ROM file to load
        #[arg(value_name = "ROM")]
        rom: PathBuf,

        /// Core plugin locator (its file stem names the registered core)
        #[arg(long, default_value = "pattern")]
        core: PathBuf,

        /// Execution strategy (defaults to the configured one)
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,

        /// Directory holding corelink.yaml
        #[arg(long = "config-dir", value_name = "DIR")]
        config_dir: Option<PathBuf>,

        /// Helper executable for the isolated strategy
        #[arg(long, value_name = "PATH")]
        helper: Option<PathBuf>,

        /// How long to run, in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f64,

        /// Save the core's state here before stopping
        #[arg(long = "save-state", value_name = "PATH")]
        save_state: Option<PathBuf>,

        /// Restore this state right after setup
        #[arg(long = "load-state", value_name = "PATH")]
        load_state: Option<PathBuf>,

        /// Write the last output frame here as a PPM image
        #[arg(long, value_name = "PATH")]
        screenshot: Option<PathBuf>,

        /// Volume in [0, 1]
        #[arg(long)]
        volume: Option<f32>,
    },

    /// Print the startup info computed for a ROM
    Inspect {
        /// ROM file to inspect
        #[arg(value_name = "ROM")]
        rom: PathBuf,

        /// Core plugin locator
        #[arg(long, default_value = "pattern")]
        core: PathBuf,
    },

    /// List the cores this build ships with
    Cores,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run {
            rom,
            core,
            strategy,
            config_dir,
            helper,
            seconds,
            save_state,
            load_state,
            screenshot,
            volume,
        } => {
            commands::run::run(commands::run::RunOptions {
                rom,
                core,
                strategy: strategy.map(Into::into),
                config_dir,
                helper,
                seconds,
                save_state,
                load_state,
                screenshot,
                volume,
            })
            .await?;
        }
        Commands::Inspect { rom, core } => commands::inspect::run(&rom, &core)?,
        Commands::Cores => commands::inspect::cores(),
    }

    Ok(())
}
