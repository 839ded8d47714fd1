// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Inventory routes (server role only).
//!
//! Entry points for the business operations that drive the lifecycle
//! coordinator: agent registration, root import, create and delete requests
//! and request status. The caller identity comes from [`OperatorCaller`];
//! requests that carry none are refused unless they arrive over loopback.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::application::availability::AvailabilityService;
use crate::application::lifecycle_coordinator::{CreateResourceParams, ResourceFactoryInternal};
use crate::domain::authorization::{ensure_can_manage, AuthorizationService, Caller};
use crate::domain::availability::AvailabilityRecord;
use crate::domain::error::FleetError;
use crate::domain::lifecycle::{LifecycleHistory, LifecycleHistoryId};
use crate::domain::repository::{AgentRepository, ResourceRepository};
use crate::domain::resource::{AgentId, AgentRecord, NewResource, Resource, ResourceId, ResourceTypeId};
use crate::presentation::api::{ApiError, OperatorCaller};

pub struct InventoryState {
    pub lifecycle: Arc<dyn ResourceFactoryInternal>,
    pub resources: Arc<dyn ResourceRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub availability: Arc<AvailabilityService>,
    pub authz: Arc<dyn AuthorizationService>,
}

pub fn inventory_router(state: Arc<InventoryState>) -> Router {
    Router::new()
        .route("/v1/operator/agents", get(list_agents).post(register_agent))
        .route("/v1/operator/agents/{id}/reconnected", post(agent_reconnected))
        .route("/v1/operator/resources", post(create_resource))
        .route("/v1/operator/resources/import", post(import_resource))
        .route("/v1/operator/resources/{id}", get(show_resource).delete(delete_resource))
        .route("/v1/operator/lifecycle/{id}", get(show_lifecycle))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub id: AgentId,
    pub name: String,
    pub address: String,
}

/// A resource committed directly, without an agent round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResourceRequest {
    #[serde(default)]
    pub parent_id: Option<ResourceId>,
    pub type_id: ResourceTypeId,
    pub resource_key: String,
    pub name: String,
    #[serde(default)]
    pub owner_agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceView {
    pub resource: Resource,
    pub availability: Option<AvailabilityRecord>,
    pub lifecycle: Vec<LifecycleHistory>,
}

async fn list_agents(State(state): State<Arc<InventoryState>>) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    Ok(Json(state.agents.list_all().await.map_err(FleetError::from)?))
}

async fn register_agent(
    State(state): State<Arc<InventoryState>>,
    OperatorCaller(caller): OperatorCaller,
    Json(request): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<AgentRecord>), ApiError> {
    if caller != Caller::Overlord {
        return Err(FleetError::Permission(format!("{} may not register agents", caller.name())).into());
    }
    let existing = state.agents.find_by_id(request.id).await.map_err(FleetError::from)?;
    let record = AgentRecord {
        id: request.id,
        name: request.name,
        address: request.address,
        last_availability_report: existing.as_ref().and_then(|a| a.last_availability_report),
        backfilled: existing.as_ref().map(|a| a.backfilled).unwrap_or(false),
    };
    state.agents.save(&record).await.map_err(FleetError::from)?;
    info!(agent = %record.id, address = %record.address, "Agent registered");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn agent_reconnected(
    State(state): State<Arc<InventoryState>>,
    OperatorCaller(caller): OperatorCaller,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    info!(agent = id, caller = caller.name(), "Agent reported reconnected");
    state.availability.agent_reconnected(AgentId(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn create_resource(
    State(state): State<Arc<InventoryState>>,
    OperatorCaller(caller): OperatorCaller,
    Json(params): Json<CreateResourceParams>,
) -> Result<(StatusCode, Json<LifecycleHistory>), ApiError> {
    let history = state.lifecycle.create_resource(&caller, params).await?;
    Ok((StatusCode::ACCEPTED, Json(history)))
}

async fn import_resource(
    State(state): State<Arc<InventoryState>>,
    OperatorCaller(caller): OperatorCaller,
    Json(request): Json<ImportResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    match request.parent_id {
        Some(parent) => ensure_can_manage(state.authz.as_ref(), &caller, parent).await?,
        None if caller == Caller::Overlord => {}
        None => {
            return Err(FleetError::Permission(format!("{} may not import root resources", caller.name())).into());
        }
    }
    let resource = state
        .resources
        .commit_resource(&NewResource {
            parent_id: request.parent_id,
            type_id: request.type_id,
            resource_key: request.resource_key,
            name: request.name,
            owner_agent_id: request.owner_agent_id,
        })
        .await
        .map_err(FleetError::from)?;
    info!(resource = %resource.id, key = %resource.resource_key, "Resource imported");
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn show_resource(
    State(state): State<Arc<InventoryState>>,
    Path(id): Path<i64>,
) -> Result<Json<ResourceView>, ApiError> {
    let id = ResourceId(id);
    let resource = state
        .resources
        .find_by_id(id)
        .await
        .map_err(FleetError::from)?
        .ok_or_else(|| FleetError::NotFound(format!("resource [{}]", id)))?;
    let availability = state.availability.current(id).await?;
    let lifecycle = state.lifecycle.history_for_resource(id).await?;
    Ok(Json(ResourceView {
        resource,
        availability,
        lifecycle,
    }))
}

async fn delete_resource(
    State(state): State<Arc<InventoryState>>,
    OperatorCaller(caller): OperatorCaller,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<LifecycleHistory>), ApiError> {
    let history = state.lifecycle.delete_resource(&caller, ResourceId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(history)))
}

async fn show_lifecycle(
    State(state): State<Arc<InventoryState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleHistory>, ApiError> {
    let history = state
        .lifecycle
        .find_history(LifecycleHistoryId(id))
        .await?
        .ok_or_else(|| FleetError::NotFound(format!("lifecycle request [{}]", id)))?;
    Ok(Json(history))
}
