// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command sender control
//!
//! Commands: start, stop, metrics

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use crate::daemon::NodeClient;

#[derive(Subcommand)]
pub enum SenderCommand {
    /// Start draining the queue and spool
    Start,

    /// Stop sending; spooled commands stay spooled
    Stop {
        /// Abort in-flight sends instead of waiting for them
        #[arg(long)]
        abort: bool,
    },

    /// Show delivery counters
    Metrics {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: SenderCommand, client: &NodeClient) -> Result<()> {
    match command {
        SenderCommand::Start => {
            let state = client.start_sender().await?;
            if state.changed {
                println!("{}", "✓ Sender started".green());
            } else {
                println!("{}", "ℹ Sender was already sending".yellow());
            }
        }
        SenderCommand::Stop { abort } => {
            let state = client.stop_sender(!abort).await?;
            if state.changed {
                println!("{}", "✓ Sender stopped".green());
            } else {
                println!("{}", "ℹ Sender was not sending".yellow());
            }
        }
        SenderCommand::Metrics { json } => {
            let metrics = client.sender_metrics().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
                return Ok(());
            }
            let state = if metrics.sending { "sending".green() } else { "stopped".red() };
            println!("{} {}", "Sender:".bold(), state);
            println!("  Sent:            {}", metrics.sent);
            println!("  Failed:          {}", metrics.failed);
            println!("  Retried:         {}", metrics.retried);
            println!("  Dropped:         {}", metrics.dropped);
            println!("  In flight:       {}", metrics.in_flight);
            println!("  Queued:          {}", metrics.queued);
            println!("  Spooled:         {} (total {})", metrics.spooled, metrics.spooled_total);
            println!("  Avg send time:   {:.1}ms", metrics.average_send_time_ms);
        }
    }
    Ok(())
}
