// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # AEGIS Swarm CLI
//!
//! The `aegis-swarm` binary drives the swarm engine in-process.
//!
//! ## Commands
//!
//! - `aegis-swarm config show|validate|generate` - Configuration management
//! - `aegis-swarm simulate` - Run a synthetic workload through a swarm and report

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use aegis_swarm_cli::commands::{self, ConfigCommand, SimulateArgs};

/// AEGIS Swarm - Multi-agent orchestration engine
#[derive(Parser)]
#[command(name = "aegis-swarm")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to swarm configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_SWARM_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AEGIS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run a synthetic workload through an in-process swarm
    #[command(name = "simulate")]
    Simulate {
        #[command(flatten)]
        args: SimulateArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Simulate { args }) => commands::simulate::execute(args, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
