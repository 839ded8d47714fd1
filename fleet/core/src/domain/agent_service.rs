// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent-Facing Service Surface
//!
//! What the server may ask of the agent that owns a resource. Create and
//! delete are acknowledged on dispatch and complete later through a separate
//! callback command (`complete_create_resource` / `complete_delete_resource`)
//! carrying the request id. `remove_resource` and
//! `request_full_availability_report` are fire-and-forget.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::error::FleetError;
use crate::domain::lifecycle::LifecycleHistoryId;
use crate::domain::resource::{AgentId, ResourceId, ResourceTypeId};

/// Outcome reported by the agent for a create or delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateDeleteStatus {
    Success,
    Failure,
}

/// Package content deployed as the new resource instead of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDetails {
    pub package_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateResourceRequest {
    pub request_id: LifecycleHistoryId,
    pub parent_resource_id: ResourceId,
    pub resource_type_id: ResourceTypeId,
    pub resource_name: String,
    #[serde(default)]
    pub plugin_configuration: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_configuration: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_details: Option<PackageDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResourceResponse {
    pub request_id: LifecycleHistoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    pub status: CreateDeleteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResourceRequest {
    pub request_id: LifecycleHistoryId,
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResourceResponse {
    pub request_id: LifecycleHistoryId,
    pub status: CreateDeleteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveResourceRequest {
    pub resource_id: ResourceId,
}

/// Resource creation and deletion on an agent.
#[async_trait]
pub trait ResourceFactoryAgentService: Send + Sync {
    /// Hand the request to the agent. `Ok` means accepted, not completed.
    async fn create_resource(&self, agent: AgentId, request: CreateResourceRequest) -> Result<(), FleetError>;

    async fn delete_resource(&self, agent: AgentId, request: DeleteResourceRequest) -> Result<(), FleetError>;
}

/// Inventory housekeeping on an agent.
#[async_trait]
pub trait DiscoveryAgentService: Send + Sync {
    /// Stop reporting on a resource and its descendants.
    async fn remove_resource(&self, agent: AgentId, resource_id: ResourceId) -> Result<(), FleetError>;

    async fn request_full_availability_report(&self, agent: AgentId) -> Result<(), FleetError>;
}
