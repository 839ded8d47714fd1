// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Inventory lifecycle scenarios run against the in-memory store: completions
//! are idempotent, timed-out requests stay timed out, subtree deletion leaves
//! no dependent rows behind and agent outages only touch that agent.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use tether_core::application::availability::AvailabilityService;
use tether_core::application::lifecycle_coordinator::{
    CreateResourceParams, ResourceFactoryInternal, ResourceFactoryRemote, ResourceLifecycleCoordinator,
};
use tether_core::application::tree_deleter::ResourceTreeDeleter;
use tether_core::domain::agent_service::{
    CreateDeleteStatus, CreateResourceRequest, CreateResourceResponse, DeleteResourceRequest, DeleteResourceResponse,
    DiscoveryAgentService, ResourceFactoryAgentService,
};
use tether_core::domain::authorization::{Caller, InventoryRoleAuthorization};
use tether_core::domain::availability::AvailabilityType;
use tether_core::domain::deletion::DELETION_ORDER;
use tether_core::domain::error::FleetError;
use tether_core::domain::lifecycle::LifecycleStatus;
use tether_core::domain::node_config::{DeletionConfig, LifecycleConfig};
use tether_core::domain::repository::{AvailabilityRepository, ResourceGraphStore, ResourceRepository};
use tether_core::domain::resource::{AgentId, NewResource, ResourceId, ResourceTypeId};
use tether_core::infrastructure::event_bus::EventBus;
use tether_core::infrastructure::repositories::InMemoryFleetStore;

/// Accepts every request and remembers what it was asked to do.
#[derive(Default)]
struct RecordingAgent {
    creates: Mutex<Vec<CreateResourceRequest>>,
    deletes: Mutex<Vec<DeleteResourceRequest>>,
}

#[async_trait]
impl ResourceFactoryAgentService for RecordingAgent {
    async fn create_resource(&self, _agent: AgentId, request: CreateResourceRequest) -> Result<(), FleetError> {
        self.creates.lock().push(request);
        Ok(())
    }

    async fn delete_resource(&self, _agent: AgentId, request: DeleteResourceRequest) -> Result<(), FleetError> {
        self.deletes.lock().push(request);
        Ok(())
    }
}

#[async_trait]
impl DiscoveryAgentService for RecordingAgent {
    async fn remove_resource(&self, _agent: AgentId, _resource_id: ResourceId) -> Result<(), FleetError> {
        Ok(())
    }

    async fn request_full_availability_report(&self, _agent: AgentId) -> Result<(), FleetError> {
        Ok(())
    }
}

struct Fleet {
    store: Arc<InMemoryFleetStore>,
    agent: Arc<RecordingAgent>,
    coordinator: ResourceLifecycleCoordinator,
}

fn fleet(lifecycle: LifecycleConfig) -> Fleet {
    let store = Arc::new(InMemoryFleetStore::new());
    let agent = Arc::new(RecordingAgent::default());
    let bus = EventBus::new(64);
    let deleter = Arc::new(ResourceTreeDeleter::new(
        store.clone(),
        store.clone(),
        Arc::new(InventoryRoleAuthorization),
        agent.clone(),
        bus.clone(),
        DeletionConfig {
            batch_size: 2,
            ..DeletionConfig::default()
        },
    ));
    let coordinator = ResourceLifecycleCoordinator::new(
        store.clone(),
        store.clone(),
        agent.clone(),
        Arc::new(InventoryRoleAuthorization),
        deleter,
        bus,
        &lifecycle,
    );
    Fleet {
        store,
        agent,
        coordinator,
    }
}

async fn commit(store: &InMemoryFleetStore, parent: Option<ResourceId>, key: &str, owner: i64) -> ResourceId {
    store
        .commit_resource(&NewResource {
            parent_id: parent,
            type_id: ResourceTypeId(1),
            resource_key: key.to_string(),
            name: key.to_string(),
            owner_agent_id: Some(AgentId(owner)),
        })
        .await
        .unwrap()
        .id
}

fn params(parent: ResourceId) -> CreateResourceParams {
    CreateResourceParams {
        parent_resource_id: parent,
        resource_type_id: ResourceTypeId(4),
        resource_name: "datasource".into(),
        plugin_configuration: serde_json::json!({}),
        resource_configuration: None,
        package_details: None,
    }
}

fn success(request_id: tether_core::domain::lifecycle::LifecycleHistoryId) -> CreateResourceResponse {
    CreateResourceResponse {
        request_id,
        resource_key: Some("ds-1".into()),
        resource_name: None,
        status: CreateDeleteStatus::Success,
        error_message: None,
    }
}

#[tokio::test]
async fn test_redelivered_create_completion_commits_one_resource() {
    let fleet = fleet(LifecycleConfig::default());
    let platform = commit(&fleet.store, None, "platform", 1).await;
    let history = fleet
        .coordinator
        .create_resource(&Caller::Overlord, params(platform))
        .await
        .unwrap();

    fleet.coordinator.complete_create_resource(success(history.id)).await.unwrap();
    fleet.coordinator.complete_create_resource(success(history.id)).await.unwrap();

    assert_eq!(fleet.store.resource_count(), 2);
    let done = fleet.coordinator.find_history(history.id).await.unwrap().unwrap();
    assert_eq!(done.status, LifecycleStatus::Success);
    let created = fleet.store.find_child_by_key(Some(platform), "ds-1").await.unwrap().unwrap();
    assert_eq!(done.resource_id, Some(created.id));
}

#[tokio::test]
async fn test_late_completion_after_timeout_is_ignored() {
    let fleet = fleet(LifecycleConfig {
        request_timeout: Duration::from_millis(1),
        ..LifecycleConfig::default()
    });
    let platform = commit(&fleet.store, None, "platform", 1).await;
    let history = fleet
        .coordinator
        .create_resource(&Caller::Overlord, params(platform))
        .await
        .unwrap();
    assert_eq!(fleet.agent.creates.lock().len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fleet.coordinator.check_for_timed_out_requests().await.unwrap(), 1);
    assert_eq!(fleet.coordinator.check_for_timed_out_requests().await.unwrap(), 0);

    fleet.coordinator.complete_create_resource(success(history.id)).await.unwrap();

    let stored = fleet.coordinator.find_history(history.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LifecycleStatus::TimedOut);
    assert!(stored.error_message.unwrap().starts_with("Request with duration"));
    assert_eq!(fleet.store.resource_count(), 1);
}

#[tokio::test]
async fn test_subtree_delete_removes_descendants_and_every_dependent() {
    let fleet = fleet(LifecycleConfig::default());
    let platform = commit(&fleet.store, None, "platform", 1).await;
    let server = commit(&fleet.store, Some(platform), "server", 1).await;
    let mut subtree = vec![server];
    for key in ["ds-a", "ds-b"] {
        let child = commit(&fleet.store, Some(server), key, 1).await;
        subtree.push(child);
        subtree.push(commit(&fleet.store, Some(child), &format!("{}-pool", key), 1).await);
    }
    for id in &subtree {
        for kind in DELETION_ORDER {
            fleet.store.add_dependent(*kind, *id);
        }
    }
    fleet.store.add_dependent(DELETION_ORDER[0], platform);

    let history = fleet.coordinator.delete_resource(&Caller::Overlord, server).await.unwrap();
    assert_eq!(history.status, LifecycleStatus::InProgress);
    assert_eq!(fleet.agent.deletes.lock()[0].resource_id, server);

    fleet
        .coordinator
        .complete_delete_resource(DeleteResourceResponse {
            request_id: history.id,
            status: CreateDeleteStatus::Success,
            error_message: None,
        })
        .await
        .unwrap();

    assert_eq!(fleet.store.resource_count(), 1);
    for id in &subtree {
        assert!(ResourceRepository::find_by_id(fleet.store.as_ref(), *id).await.unwrap().is_none());
    }
    for kind in DELETION_ORDER {
        assert_eq!(
            fleet.store.count_dependents(*kind, &subtree).await.unwrap(),
            0,
            "{:?} rows left behind",
            kind
        );
    }
    assert_eq!(
        fleet.store.count_dependents(DELETION_ORDER[0], &[platform]).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_agent_outage_marks_only_its_resources_down() {
    let store = Arc::new(InMemoryFleetStore::new());
    let platform = commit(&store, None, "platform", 1).await;
    let on_seven = commit(&store, Some(platform), "host-7", 7).await;
    let also_seven = commit(&store, Some(on_seven), "db-7", 7).await;
    let on_eight = commit(&store, Some(platform), "host-8", 8).await;

    let now = Utc::now();
    for id in [on_seven, also_seven, on_eight] {
        store.record(id, AvailabilityType::Up, now).await.unwrap();
    }

    let service = AvailabilityService::new(
        store.clone(),
        store.clone(),
        Arc::new(RecordingAgent::default()),
        EventBus::new(16),
    );
    assert_eq!(service.mark_resources_down_for_agent(AgentId(7)).await.unwrap(), 2);

    for id in [on_seven, also_seven] {
        let current = service.current(id).await.unwrap().unwrap();
        assert_eq!(current.avail_type, AvailabilityType::Down);
    }
    let untouched = service.current(on_eight).await.unwrap().unwrap();
    assert_eq!(untouched.avail_type, AvailabilityType::Up);

    // already down: nothing changes the second time
    assert_eq!(service.mark_resources_down_for_agent(AgentId(7)).await.unwrap(), 0);
}
