// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Inventory
//!
//! The agent half of the lifecycle protocol. Create and delete requests from
//! the server are accepted immediately; the work runs on a background task
//! and its outcome travels back as a guaranteed `complete_create_resource` /
//! `complete_delete_resource` command, so a completion survives an agent
//! restart or a server outage.
//!
//! The agent also owns the set of resources it reports availability for.
//! `remove_resource` drops a resource from that set and
//! `request_full_availability_report` resends the whole set.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::availability::{AvailabilityReport, ResourceAvailability};
use crate::application::sender::CommandSender;
use crate::domain::agent_service::{
    CreateDeleteStatus, CreateResourceRequest, CreateResourceResponse, DeleteResourceRequest, DeleteResourceResponse,
};
use crate::domain::availability::AvailabilityType;
use crate::domain::command::{command_types, Command};
use crate::domain::error::FleetError;
use crate::domain::resource::{AgentId, ResourceId};

/// Local resource work performed by the agent's plugin container.
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    /// Create the resource and return its plugin-level key.
    async fn create(&self, request: &CreateResourceRequest) -> Result<String, FleetError>;

    async fn delete(&self, request: &DeleteResourceRequest) -> Result<(), FleetError>;
}

/// Accepts every request. Keys are derived from type and name.
pub struct AcceptAllPlugin;

#[async_trait]
impl ResourcePlugin for AcceptAllPlugin {
    async fn create(&self, request: &CreateResourceRequest) -> Result<String, FleetError> {
        Ok(format!("{}:{}", request.resource_type_id, request.resource_name))
    }

    async fn delete(&self, _request: &DeleteResourceRequest) -> Result<(), FleetError> {
        Ok(())
    }
}

pub struct AgentInventory {
    agent_id: Option<AgentId>,
    sender: Arc<CommandSender>,
    plugin: Arc<dyn ResourcePlugin>,
    reported: Mutex<BTreeMap<ResourceId, AvailabilityType>>,
}

impl AgentInventory {
    pub fn new(agent_id: Option<AgentId>, sender: Arc<CommandSender>, plugin: Arc<dyn ResourcePlugin>) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            sender,
            plugin,
            reported: Mutex::new(BTreeMap::new()),
        })
    }

    /// Start reporting `resource` with the given availability.
    pub fn track(&self, resource: ResourceId, avail_type: AvailabilityType) {
        self.reported.lock().insert(resource, avail_type);
    }

    pub fn tracked(&self) -> Vec<ResourceAvailability> {
        self.reported
            .lock()
            .iter()
            .map(|(resource_id, avail_type)| ResourceAvailability {
                resource_id: *resource_id,
                avail_type: *avail_type,
            })
            .collect()
    }

    /// Accept a create request; the completion is sent later.
    pub fn accept_create(self: &Arc<Self>, request: CreateResourceRequest) {
        info!(request_id = %request.request_id, name = %request.resource_name, "Accepted create request");
        let inventory = self.clone();
        tokio::spawn(async move {
            let response = match inventory.plugin.create(&request).await {
                Ok(key) => CreateResourceResponse {
                    request_id: request.request_id,
                    resource_key: Some(key),
                    resource_name: Some(request.resource_name.clone()),
                    status: CreateDeleteStatus::Success,
                    error_message: None,
                },
                Err(e) => {
                    warn!(request_id = %request.request_id, "Resource creation failed: {}", e);
                    CreateResourceResponse {
                        request_id: request.request_id,
                        resource_key: None,
                        resource_name: Some(request.resource_name.clone()),
                        status: CreateDeleteStatus::Failure,
                        error_message: Some(e.to_string()),
                    }
                }
            };
            inventory.complete(command_types::COMPLETE_CREATE_RESOURCE, &response);
        });
    }

    /// Accept a delete request; the completion is sent later.
    pub fn accept_delete(self: &Arc<Self>, request: DeleteResourceRequest) {
        info!(request_id = %request.request_id, resource = %request.resource_id, "Accepted delete request");
        let inventory = self.clone();
        tokio::spawn(async move {
            let response = match inventory.plugin.delete(&request).await {
                Ok(()) => {
                    inventory.reported.lock().remove(&request.resource_id);
                    DeleteResourceResponse {
                        request_id: request.request_id,
                        status: CreateDeleteStatus::Success,
                        error_message: None,
                    }
                }
                Err(e) => {
                    warn!(request_id = %request.request_id, "Resource deletion failed: {}", e);
                    DeleteResourceResponse {
                        request_id: request.request_id,
                        status: CreateDeleteStatus::Failure,
                        error_message: Some(e.to_string()),
                    }
                }
            };
            inventory.complete(command_types::COMPLETE_DELETE_RESOURCE, &response);
        });
    }

    fn complete<T: serde::Serialize>(&self, command_type: &str, response: &T) {
        let result = Command::with_payload(command_type, response)
            .and_then(|command| self.sender.send_async(command.guaranteed(), None));
        if let Err(e) = result {
            warn!(command_type, "Failed to queue completion: {}", e);
        }
    }

    /// Stop reporting on a resource the server has removed.
    pub fn remove_resource(&self, resource: ResourceId) -> bool {
        let removed = self.reported.lock().remove(&resource).is_some();
        debug!(resource = %resource, removed, "Stopped reporting resource");
        removed
    }

    /// Queue a full availability report to the current server.
    pub fn send_full_report(&self) -> Result<usize, FleetError> {
        let Some(agent_id) = self.agent_id else {
            return Err(FleetError::NotFound(
                "agent has no inventory id; set spec.node.agent_id".to_string(),
            ));
        };
        let report = AvailabilityReport {
            agent_id,
            full_report: true,
            resources: self.tracked(),
        };
        let count = report.resources.len();
        let command = Command::with_payload(command_types::AVAILABILITY_REPORT, &report)?.guaranteed();
        self.sender.send_async(command, None)?;
        info!(resources = count, "Full availability report queued");
        Ok(count)
    }
}
