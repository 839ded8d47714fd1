// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Spool inspection
//!
//! `show` asks a running node; `dump` reads the spool file directly and
//! works while the node is down.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use crate::daemon::NodeClient;
use tether_core::domain::node_config::NodeConfigManifest;
use tether_core::infrastructure::spool::dump_file;
use tether_core::presentation::api::SpoolEntryView;

#[derive(Subcommand)]
pub enum SpoolCommand {
    /// List spooled commands of a running node
    Show,

    /// Decode a spool file offline
    Dump {
        /// Spool file (default: spec.spool.path of the configuration)
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(command: SpoolCommand, config_path: Option<PathBuf>, client: &NodeClient) -> Result<()> {
    match command {
        SpoolCommand::Show => {
            let view = client.spool().await?;
            println!(
                "{} {} entries, {} live bytes, {} file bytes (limit {} entries / {} bytes)",
                "Spool:".bold(),
                view.usage.entries,
                view.usage.live_bytes,
                view.usage.file_bytes,
                view.usage.max_entries,
                view.usage.max_bytes
            );
            print_entries(&view.entries);
        }
        SpoolCommand::Dump { file } => {
            let path = match file {
                Some(path) => path,
                None => {
                    NodeConfigManifest::load_or_default(config_path)
                        .context("Failed to load configuration")?
                        .spec
                        .spool
                        .path
                }
            };
            let dump = dump_file(&path).with_context(|| format!("Failed to read spool {}", path.display()))?;
            println!("{} {}", "Spool file:".bold(), dump.path.display());
            println!("  File bytes:    {}", dump.file_bytes);
            println!("  Entry records: {}", dump.entry_records);
            println!("  Ack records:   {}", dump.ack_records);
            if dump.damaged_tail_bytes > 0 {
                println!(
                    "  {}",
                    format!("Damaged tail: {} bytes (discarded on next open)", dump.damaged_tail_bytes).yellow()
                );
            }
            let entries: Vec<SpoolEntryView> = dump.live.iter().map(SpoolEntryView::from_entry).collect();
            print_entries(&entries);
        }
    }
    Ok(())
}

fn print_entries(entries: &[SpoolEntryView]) {
    if entries.is_empty() {
        println!("{}", "  (empty)".dimmed());
        return;
    }
    println!();
    println!("  {:>8}  {:<25}  {:<36}  {:<28}  {:>7}", "SEQ", "ENQUEUED", "COMMAND", "TYPE", "BYTES");
    for entry in entries {
        println!(
            "  {:>8}  {:<25}  {:<36}  {:<28}  {:>7}",
            entry.sequence,
            entry.enqueued_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry
                .command_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "<undecodable>".to_string()),
            entry.command_type.as_deref().unwrap_or("-"),
            entry.bytes
        );
        if let Some(target) = &entry.target_endpoint {
            println!("  {:>8}  -> {}", "", target);
        }
    }
}
