// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command-based agent client
//!
//! Implements the agent-facing service traits by sending commands through
//! the node's [`CommandSender`] to the address registered for the agent.
//! Create and delete are synchronous sends; the agent only acknowledges
//! acceptance there. `remove_resource` and `request_full_availability_report`
//! are queued as volatile commands and never awaited.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::application::sender::{CommandCallback, CommandSender};
use crate::domain::agent_service::{
    CreateResourceRequest, DeleteResourceRequest, DiscoveryAgentService, RemoveResourceRequest,
    ResourceFactoryAgentService,
};
use crate::domain::command::{command_types, Command, CommandResponse};
use crate::domain::error::FleetError;
use crate::domain::repository::AgentRepository;
use crate::domain::resource::{AgentId, AgentRecord, ResourceId};

pub struct CommandAgentClient {
    sender: Arc<CommandSender>,
    agents: Arc<dyn AgentRepository>,
    timeout: Duration,
}

impl CommandAgentClient {
    pub fn new(sender: Arc<CommandSender>, agents: Arc<dyn AgentRepository>, timeout: Duration) -> Self {
        Self {
            sender,
            agents,
            timeout,
        }
    }

    async fn agent(&self, id: AgentId) -> Result<AgentRecord, FleetError> {
        self.agents
            .find_by_id(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("agent [{}]", id)))
    }

    async fn call(&self, id: AgentId, command: Command) -> Result<CommandResponse, FleetError> {
        let agent = self.agent(id).await?;
        let command = command.to_endpoint(agent.address.clone());
        let response = self.sender.send_sync(command, self.timeout).await?;
        response.into_result(&agent.address)
    }

    async fn notify(&self, id: AgentId, command: Command) -> Result<(), FleetError> {
        let agent = self.agent(id).await?;
        let command_type = command.command_type.clone();
        let callback: CommandCallback = Box::new(move |response: CommandResponse| {
            if !response.success {
                warn!(
                    agent = %id,
                    command_type = %command_type,
                    "Agent notification failed: {:?}",
                    response.error
                );
            }
        });
        debug!(agent = %id, command_type = %command.command_type, "Queueing agent notification");
        self.sender
            .send_async(command.to_endpoint(agent.address), Some(callback))
    }
}

#[async_trait]
impl ResourceFactoryAgentService for CommandAgentClient {
    async fn create_resource(&self, agent: AgentId, request: CreateResourceRequest) -> Result<(), FleetError> {
        let command = Command::with_payload(command_types::CREATE_RESOURCE, &request)?;
        self.call(agent, command).await?;
        Ok(())
    }

    async fn delete_resource(&self, agent: AgentId, request: DeleteResourceRequest) -> Result<(), FleetError> {
        let command = Command::with_payload(command_types::DELETE_RESOURCE, &request)?;
        self.call(agent, command).await?;
        Ok(())
    }
}

#[async_trait]
impl DiscoveryAgentService for CommandAgentClient {
    async fn remove_resource(&self, agent: AgentId, resource_id: ResourceId) -> Result<(), FleetError> {
        let command = Command::with_payload(command_types::REMOVE_RESOURCE, &RemoveResourceRequest { resource_id })?;
        self.notify(agent, command).await
    }

    async fn request_full_availability_report(&self, agent: AgentId) -> Result<(), FleetError> {
        let command = Command::new(command_types::REQUEST_FULL_AVAILABILITY_REPORT, serde_json::json!({}));
        self.notify(agent, command).await
    }
}
