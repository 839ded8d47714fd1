// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Tether Fleet Node CLI
//!
//! The `tether` binary runs a fleet node (agent or server role, chosen by
//! the node config) and doubles as the operator console for a running node.
//!
//! ## Commands
//!
//! - `tether run` - Run the node in the foreground
//! - `tether daemon start|stop|status` - Manage a background node
//! - `tether sender start|stop|metrics` - Command sender control
//! - `tether spool show|dump` - Inspect the durable spool
//! - `tether failover show|mark` - Failover list and endpoint health
//! - `tether ping` - Round-trip latency to a server endpoint
//! - `tether events` - Follow the node's event stream
//! - `tether config show|validate|generate|reload` - Configuration management
//! - `tether agent|resource|lifecycle ...` - Server-side inventory operations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use tether_core::domain::node_config::NodeConfigManifest;
use tether_fleet::commands::{
    self, AgentCommand, ConfigCommand, DaemonCommand, FailoverCommand, LifecycleCommand, ResourceCommand,
    SenderCommand, SpoolCommand,
};
use tether_fleet::daemon::{self, NodeClient};

/// Tether fleet node - durable command delivery and resource inventory
#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "TETHER_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Operator API port of the node to talk to
    #[arg(long, global = true, env = "TETHER_PORT", default_value = "7080")]
    port: u16,

    /// Operator API host of the node to talk to
    #[arg(long, global = true, env = "TETHER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Caller name sent to the operator API; omitted means the local operator
    #[arg(long, global = true, env = "TETHER_USER")]
    user: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node in the foreground
    #[command(name = "run")]
    Run,

    /// Manage a background node
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Command sender control
    #[command(name = "sender")]
    Sender {
        #[command(subcommand)]
        command: SenderCommand,
    },

    /// Inspect the durable command spool
    #[command(name = "spool")]
    Spool {
        #[command(subcommand)]
        command: SpoolCommand,
    },

    /// Failover list and endpoint health
    #[command(name = "failover")]
    Failover {
        #[command(subcommand)]
        command: FailoverCommand,
    },

    /// Measure round-trip latency to a server endpoint
    #[command(name = "ping")]
    Ping {
        /// Endpoint to ping (default: current failover target)
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Follow delivery, failover and inventory events of a running node
    #[command(name = "events")]
    Events,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Registered agents (server role)
    #[command(name = "agent")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Inventory resources (server role)
    #[command(name = "resource")]
    Resource {
        #[command(subcommand)]
        command: ResourceCommand,
    },

    /// Create and delete request history (server role)
    #[command(name = "lifecycle")]
    Lifecycle {
        #[command(subcommand)]
        command: LifecycleCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file unless overridden
    let logging = NodeConfigManifest::load_or_default(cli.config.clone())
        .map(|c| c.spec.observability.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format)?;

    let client = || NodeClient::new(&cli.host, cli.port, cli.user.clone());

    match cli.command {
        Some(Commands::Run) => {
            info!("Starting Tether fleet node in the foreground");
            daemon::run_node(cli.config).await
        }
        Some(Commands::Daemon { command }) => {
            commands::daemon::handle_command(command, cli.config, &cli.host, cli.port).await
        }
        Some(Commands::Sender { command }) => commands::sender::handle_command(command, &client()?).await,
        Some(Commands::Spool { command }) => commands::spool::handle_command(command, cli.config, &client()?).await,
        Some(Commands::Failover { command }) => commands::failover::handle_command(command, &client()?).await,
        Some(Commands::Ping { endpoint }) => commands::failover::ping(&client()?, endpoint).await,
        Some(Commands::Events) => commands::failover::watch(&client()?).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config, &client()?).await,
        Some(Commands::Agent { command }) => commands::inventory::handle_agent(command, &client()?).await,
        Some(Commands::Resource { command }) => commands::inventory::handle_resource(command, &client()?).await,
        Some(Commands::Lifecycle { command }) => commands::inventory::handle_lifecycle(command, &client()?).await,
        None => {
            // No command provided - show help
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

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
