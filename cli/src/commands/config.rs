// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate, reload

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use crate::daemon::NodeClient;
use tether_core::domain::node_config::{NodeConfigManifest, NodeRole, StorageBackendKind, CONFIG_PATH_ENV};

const AGENT_TEMPLATE: &str = include_str!("../../templates/config-agent.yaml");
const SERVER_TEMPLATE: &str = include_str!("../../templates/config-server.yaml");

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TemplateRole {
    Agent,
    Server,
}

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
        /// Output path (default: ./tether-config.yaml)
        #[arg(short, long, default_value = "./tether-config.yaml")]
        output: PathBuf,

        /// Node role the sample is written for
        #[arg(long, value_enum, default_value = "agent")]
        role: TemplateRole,
    },

    /// Ask a running node to re-read its configuration file
    Reload,
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
    client: &NodeClient,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, role } => generate(output, role),
        ConfigCommand::Reload => {
            let result = client.reload_config().await?;
            println!(
                "{}",
                format!("✓ Configuration reloaded (generation {})", result.generation).green()
            );
            Ok(())
        }
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, yaml: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

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
        println!("  3. ./tether-config.yaml");
        println!("  4. ~/.tether/config.yaml");
        println!("  5. /etc/tether/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node Identity:".bold());
    println!("  ID: {}", spec.node.id);
    println!(
        "  Role: {}",
        match spec.node.role {
            NodeRole::Agent => "agent",
            NodeRole::Server => "server",
        }
    );
    if let Some(address) = &spec.node.advertise_address {
        println!("  Advertised at: {}", address);
    }
    if let Some(agent_id) = spec.node.agent_id {
        println!("  Agent id: {}", agent_id);
    }
    println!("  API: {}:{}", spec.api.bind_address, spec.api.port);
    println!();

    println!("{}", "Delivery:".bold());
    println!(
        "  Retries: {} every {:?} (x{}, capped at {:?})",
        spec.sender.max_retries, spec.sender.retry_interval, spec.sender.retry_multiplier, spec.sender.max_retry_interval
    );
    if spec.spool.enabled {
        println!(
            "  Spool: {} ({} entries / {} bytes)",
            spec.spool.path.display(),
            spec.spool.max_entries,
            spec.spool.max_bytes
        );
    } else {
        println!("  Spool: {}", "disabled (memory only)".yellow());
    }
    println!();

    println!("{}", "Failover:".bold());
    for endpoint in &spec.failover.endpoints {
        println!("  [{}] {}", endpoint.rank, endpoint.address);
    }
    println!(
        "  Demote after {} failures, fail-back {:?}",
        spec.failover.failure_threshold, spec.failover.failback
    );
    println!();

    if spec.node.role == NodeRole::Server {
        println!("{}", "Inventory:".bold());
        match spec.storage.backend {
            StorageBackendKind::Memory => println!("  Storage: {}", "memory".yellow()),
            StorageBackendKind::Postgres => println!("  Storage: postgres"),
        }
        println!("  Request timeout: {:?}", spec.lifecycle.request_timeout);
        println!("  Delete batch size: {}", spec.deletion.batch_size);
        println!();
    }

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn template(role: TemplateRole) -> &'static str {
    match role {
        TemplateRole::Agent => AGENT_TEMPLATE,
        TemplateRole::Server => SERVER_TEMPLATE,
    }
}

fn generate(output: PathBuf, role: TemplateRole) -> Result<()> {
    std::fs::write(&output, template(role)).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
