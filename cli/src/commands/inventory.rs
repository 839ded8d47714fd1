// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server-side inventory commands
//!
//! Commands: agent list|register|reconnected, resource show|create|import|delete,
//! lifecycle show

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use uuid::Uuid;

use crate::daemon::NodeClient;
use tether_core::application::lifecycle_coordinator::CreateResourceParams;
use tether_core::domain::agent_service::PackageDetails;
use tether_core::domain::lifecycle::{LifecycleHistory, LifecycleStatus};
use tether_core::domain::resource::{AgentId, ResourceId, ResourceTypeId};
use tether_core::presentation::inventory::{ImportResourceRequest, RegisterAgentRequest};

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List registered agents
    List,

    /// Register an agent with the inventory
    Register {
        id: i64,
        name: String,
        /// Address the server reaches the agent at
        address: String,
    },

    /// Report that an agent came back; its resources are marked UP again
    Reconnected { id: i64 },
}

#[derive(Subcommand)]
pub enum ResourceCommand {
    /// Show a resource with its availability and lifecycle history
    Show { id: i64 },

    /// Ask the owning agent to create a resource under a parent
    Create {
        /// Parent resource id
        parent: i64,

        /// Resource type id
        type_id: i64,

        name: String,

        /// Plugin configuration as a JSON document
        #[arg(long, value_name = "JSON", default_value = "{}")]
        plugin_config: String,

        /// Resource configuration as a JSON document
        #[arg(long, value_name = "JSON")]
        resource_config: Option<String>,

        /// Package to install, as NAME@VERSION
        #[arg(long, value_name = "NAME@VERSION")]
        package: Option<String>,
    },

    /// Commit a resource directly, without asking an agent
    Import {
        #[arg(long)]
        parent: Option<i64>,

        type_id: i64,

        /// Agent-side key of the resource
        key: String,

        name: String,

        /// Agent that owns the resource
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Delete a resource and its subtree
    Delete { id: i64 },
}

#[derive(Subcommand)]
pub enum LifecycleCommand {
    /// Show one create or delete request
    Show { id: Uuid },
}

pub async fn handle_agent(command: AgentCommand, client: &NodeClient) -> Result<()> {
    match command {
        AgentCommand::List => {
            let agents = client.list_agents().await?;
            if agents.is_empty() {
                println!("{}", "No agents registered".dimmed());
                return Ok(());
            }
            println!("{:>6}  {:<24}  {:<32}  {:<25}", "ID", "NAME", "ADDRESS", "LAST REPORT");
            for agent in agents {
                let last = agent
                    .last_availability_report
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let marker = if agent.backfilled { " (down)".red().to_string() } else { String::new() };
                println!("{:>6}  {:<24}  {:<32}  {:<25}{}", agent.id, agent.name, agent.address, last, marker);
            }
        }
        AgentCommand::Register { id, name, address } => {
            let agent = client
                .register_agent(&RegisterAgentRequest {
                    id: AgentId(id),
                    name,
                    address,
                })
                .await?;
            println!("{}", format!("✓ Agent {} registered as {}", agent.id, agent.name).green());
        }
        AgentCommand::Reconnected { id } => {
            client.agent_reconnected(id).await?;
            println!("{}", format!("✓ Agent {} marked reconnected", id).green());
        }
    }
    Ok(())
}

pub async fn handle_resource(command: ResourceCommand, client: &NodeClient) -> Result<()> {
    match command {
        ResourceCommand::Show { id } => {
            let view = client.show_resource(ResourceId(id)).await?;
            let resource = &view.resource;
            println!("{} {} ({})", "Resource".bold(), resource.id, resource.name);
            println!("  Type:      {}", resource.type_id);
            println!("  Key:       {}", resource.resource_key);
            println!("  Status:    {}", resource.inventory_status.as_str());
            if let Some(parent) = resource.parent_id {
                println!("  Parent:    {}", parent);
            }
            if let Some(owner) = resource.owner_agent_id {
                println!("  Owner:     agent {}", owner);
            }
            println!("  Created:   {}", resource.created_at.format("%Y-%m-%d %H:%M:%S"));
            match &view.availability {
                Some(record) => println!(
                    "  Available: {} since {}",
                    record.avail_type.as_str(),
                    record.start_time.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("  Available: {}", "unknown".dimmed()),
            }
            if !view.lifecycle.is_empty() {
                println!();
                println!("{}", "Lifecycle:".bold());
                for history in &view.lifecycle {
                    print_history_line(history);
                }
            }
        }
        ResourceCommand::Create {
            parent,
            type_id,
            name,
            plugin_config,
            resource_config,
            package,
        } => {
            let plugin_configuration =
                serde_json::from_str(&plugin_config).context("--plugin-config is not valid JSON")?;
            let resource_configuration = resource_config
                .map(|raw| serde_json::from_str(&raw).context("--resource-config is not valid JSON"))
                .transpose()?;
            let package_details = package.map(|spec| parse_package(&spec)).transpose()?;

            let history = client
                .create_resource(&CreateResourceParams {
                    parent_resource_id: ResourceId(parent),
                    resource_type_id: ResourceTypeId(type_id),
                    resource_name: name,
                    plugin_configuration,
                    resource_configuration,
                    package_details,
                })
                .await?;
            println!("{}", format!("✓ Create requested: {}", history.id).green());
            println!("  Follow it with: tether lifecycle show {}", history.id);
        }
        ResourceCommand::Import {
            parent,
            type_id,
            key,
            name,
            owner,
        } => {
            let resource = client
                .import_resource(&ImportResourceRequest {
                    parent_id: parent.map(ResourceId),
                    type_id: ResourceTypeId(type_id),
                    resource_key: key,
                    name,
                    owner_agent_id: owner.map(AgentId),
                })
                .await?;
            println!("{}", format!("✓ Resource {} imported", resource.id).green());
        }
        ResourceCommand::Delete { id } => {
            let history = client.delete_resource(ResourceId(id)).await?;
            println!("{}", format!("✓ Delete requested: {}", history.id).green());
        }
    }
    Ok(())
}

pub async fn handle_lifecycle(command: LifecycleCommand, client: &NodeClient) -> Result<()> {
    match command {
        LifecycleCommand::Show { id } => {
            let history = client.lifecycle(id).await?;
            println!("{} {}", "Request".bold(), history.id);
            println!("  Kind:      {}", history.kind.as_str());
            println!("  Status:    {}", status(history.status));
            println!("  Requested: {} by {}", history.created_at.format("%Y-%m-%d %H:%M:%S"), history.requested_by);
            if let Some(completed) = history.completed_at {
                println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(parent) = history.parent_resource_id {
                println!("  Parent:    {}", parent);
            }
            if let Some(resource) = history.resource_id {
                println!("  Resource:  {}", resource);
            }
            if let Some(name) = &history.resource_name {
                println!("  Name:      {}", name);
            }
            if let Some(key) = &history.new_resource_key {
                println!("  Key:       {}", key);
            }
            if let Some(error) = &history.error_message {
                println!("  Error:     {}", error.red());
            }
        }
    }
    Ok(())
}

fn print_history_line(history: &LifecycleHistory) {
    println!(
        "  {}  {:<6}  {:<11}  {}",
        history.created_at.format("%Y-%m-%d %H:%M:%S"),
        history.kind.as_str(),
        status(history.status),
        history.id
    );
}

fn status(status: LifecycleStatus) -> colored::ColoredString {
    match status {
        LifecycleStatus::InProgress => status.as_str().yellow(),
        LifecycleStatus::Success => status.as_str().green(),
        LifecycleStatus::Failure | LifecycleStatus::TimedOut => status.as_str().red(),
    }
}

fn parse_package(spec: &str) -> Result<PackageDetails> {
    let (name, version) = spec
        .split_once('@')
        .filter(|(name, version)| !name.is_empty() && !version.is_empty())
        .with_context(|| format!("package '{}' is not NAME@VERSION", spec))?;
    Ok(PackageDetails {
        package_name: name.to_string(),
        version: version.to_string(),
        sha256: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package() {
        let package = parse_package("agent-plugin@2.1.0").unwrap();
        assert_eq!(package.package_name, "agent-plugin");
        assert_eq!(package.version, "2.1.0");
        assert!(parse_package("agent-plugin").is_err());
        assert!(parse_package("@2.1.0").is_err());
    }
}
