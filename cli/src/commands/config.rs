// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use aegis_core::domain::swarm_config::{RetryPolicy, SwarmConfig, CONFIG_PATH_ENV};

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/swarm-minimal.yaml");
const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/swarm-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./aegis-swarm.yaml)
        #[arg(short, long, default_value = "./aegis-swarm.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config =
        SwarmConfig::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./aegis-swarm.yaml");
        println!("  4. ~/.aegis/swarm.yaml");
        println!();
    }

    if as_yaml {
        let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
        print!("{}", yaml);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Swarm:".bold());
    println!("  Name: {}", config.name);
    println!("  Topology: {}", config.topology);
    println!("  Consensus threshold: {}", config.consensus_threshold);
    println!();

    println!("{}", "Capacity:".bold());
    println!("  Max agents: {}", config.max_agents);
    println!("  Queue capacity: {}", config.queue_capacity);
    println!("  Max task retries: {}", config.max_task_retries);
    println!("  Max agent restarts: {}", config.max_agent_restarts);
    println!("  Event bus capacity: {}", config.event_bus_capacity);
    println!();

    println!("{}", "Timers:".bold());
    println!("  Heartbeat timeout: {:?}", config.heartbeat_timeout);
    println!("  Maintenance interval: {:?}", config.maintenance_interval);
    println!("  Proposal timeout: {:?}", config.proposal_timeout);
    println!("  Proposal retention: {:?}", config.proposal_retention);
    println!("  Cancel grace: {:?}", config.cancel_grace);
    println!();

    println!("{}", "Retry:".bold());
    print_retry("Spawn", &config.spawn_retry);
    print_retry("Lock", &config.lock_retry);
    println!();

    Ok(())
}

fn print_retry(label: &str, policy: &RetryPolicy) {
    if policy.max_attempts <= 1 {
        println!("  {}: {}", label, "no retry".dimmed());
    } else {
        println!(
            "  {}: {} attempts, backoff {:?} → {:?}",
            label, policy.max_attempts, policy.initial_backoff, policy.max_backoff
        );
    }
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = SwarmConfig::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
