// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use fwsync_core::domain::agent_config::AgentConfigManifest;

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
        /// Output path (default: ./fwsync-config.yaml)
        #[arg(short, long, default_value = "./fwsync-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output } => generate(output).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = AgentConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. FWSYNC_CONFIG_PATH: {}",
            std::env::var("FWSYNC_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./fwsync-config.yaml");
        println!("  4. ~/.fwsync/config.yaml");
        println!("  5. /etc/fwsync/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Agent:".bold());
    println!("  Name: {}", config.metadata.name);
    match spec.server.uuid {
        Some(uuid) => println!("  Server UUID: {}", uuid),
        None => println!("  Server UUID: {}", "(not set)".dimmed()),
    }
    if let Some(datacenter) = &spec.server.datacenter {
        println!("  Datacenter: {}", datacenter);
    }
    println!();

    println!("{}", "Collaborators:".bold());
    println!(
        "  Inventory: {} {} (timeout {}s)",
        spec.inventory.command,
        spec.inventory.args.join(" "),
        spec.inventory.timeout_secs
    );
    println!("  Policy service: {} (timeout {}s)", spec.policy.endpoint, spec.policy.timeout_secs);
    println!("  VM directory: {} (timeout {}s)", spec.directory.endpoint, spec.directory.timeout_secs);
    println!(
        "  Firewall backend: {} {} (timeout {}s)",
        spec.backend.command,
        spec.backend.args.join(" "),
        spec.backend.timeout_secs
    );
    println!();

    println!("{}", "API:".bold());
    println!("  Listen: {}:{}", spec.api.bind_address, spec.api.port);
    println!();

    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        spec.observability.logging.level, spec.observability.logging.format
    );
    if spec.observability.metrics.enabled {
        println!("  Metrics: enabled on port {}", spec.observability.metrics.port);
    } else {
        println!("  Metrics: {}", "disabled".dimmed());
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = AgentConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf) -> Result<()> {
    let sample = include_str!("../../templates/config-minimal.yaml");

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
