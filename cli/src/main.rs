// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # fwsync Agent CLI
//!
//! The `fwsync-agent` binary runs on every compute node and keeps the host
//! firewall in step with the cluster-wide, tag-based firewall policy.
//!
//! ## Commands
//!
//! - `fwsync-agent run` - Resync, then serve the event intake API
//! - `fwsync-agent config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use fwsync_agent::commands::{self, ConfigCommand, RunArgs};
use fwsync_core::domain::agent_config::AgentConfigManifest;

/// fwsync Agent - Per-host firewall synchronization
#[derive(Parser)]
#[command(name = "fwsync-agent")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the
    /// configured level.
    #[arg(long, global = true, env = "FWSYNC_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    #[command(name = "run")]
    Run(RunArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => {
            let config = AgentConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            let logging = &config.spec.observability.logging;
            init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format)?;
            commands::run::execute(args, config).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
