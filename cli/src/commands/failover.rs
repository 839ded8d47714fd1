// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Failover list, endpoint health, ping and the live event stream

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use futures::StreamExt;

use crate::daemon::NodeClient;
use tether_core::presentation::api::FailoverView;

#[derive(Subcommand)]
pub enum FailoverCommand {
    /// Show the ranked endpoint list and the current target
    Show,

    /// Mark an endpoint healthy (fail-back) or unhealthy
    Mark {
        /// Endpoint address as it appears in the list
        address: String,

        /// Mark unhealthy instead of healthy
        #[arg(long)]
        down: bool,
    },
}

pub async fn handle_command(command: FailoverCommand, client: &NodeClient) -> Result<()> {
    match command {
        FailoverCommand::Show => print_view(&client.failover().await?),
        FailoverCommand::Mark { address, down } => {
            let view = client.mark_endpoint(&address, !down).await?;
            let state = if down { "unhealthy".red() } else { "healthy".green() };
            println!("✓ {} marked {}", address, state);
            print_view(&view);
        }
    }
    Ok(())
}

fn print_view(view: &FailoverView) {
    println!("{} version {} ({:?} fail-back)", "Failover list:".bold(), view.version, view.policy);
    let current = view.current_target.as_ref().map(|e| e.address.as_str());
    for endpoint in &view.endpoints {
        let marker = if Some(endpoint.address.as_str()) == current { "*" } else { " " };
        let health = if endpoint.healthy {
            "healthy".green()
        } else {
            "unhealthy".red()
        };
        print!("  {} [{}] {} {}", marker, endpoint.rank, endpoint.address, health);
        if endpoint.consecutive_failures > 0 {
            print!(" ({} consecutive failures)", endpoint.consecutive_failures);
        }
        println!();
    }
    if current.is_none() {
        println!("{}", "  (no target: the list is empty)".yellow());
    }
}

pub async fn ping(client: &NodeClient, endpoint: Option<String>) -> Result<()> {
    let result = client.ping(endpoint).await?;
    println!("{} {} in {:.2}ms", "✓ Pong from".green(), result.endpoint, result.latency_ms);
    Ok(())
}

/// Follow the node's event stream until interrupted.
pub async fn watch(client: &NodeClient) -> Result<()> {
    let response = client.events().await?;
    println!("{}", format!("Watching events on {} (Ctrl+C to stop)", client.base_url()).dimmed());

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Event stream interrupted")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            if let Some((name, data)) = parse_frame(&frame) {
                println!("{} {}", format!("[{}]", name).cyan(), data);
            }
        }
    }
    Ok(())
}

/// Event name and data of one server-sent event frame; comments and
/// keep-alives yield nothing.
fn parse_frame(frame: &str) -> Option<(String, String)> {
    let mut name = None;
    let mut data = Vec::new();
    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim_start().to_string());
        }
    }
    if data.is_empty() {
        return None;
    }
    Some((name.unwrap_or_else(|| "message".to_string()), data.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_reads_name_and_data() {
        let frame = "event: failover\ndata: {\"type\":\"target_changed\"}\n\n";
        let (name, data) = parse_frame(frame).unwrap();
        assert_eq!(name, "failover");
        assert_eq!(data, "{\"type\":\"target_changed\"}");
    }

    #[test]
    fn test_keep_alive_comment_is_skipped() {
        assert!(parse_frame(":\n\n").is_none());
    }
}
