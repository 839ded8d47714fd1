// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Lifecycle Coordinator
//!
//! Drives create and delete requests through their [`LifecycleHistory`]:
//!
//! 1. the history is persisted `IN_PROGRESS` before anything is sent,
//! 2. the request is handed to the agent owning the resource,
//! 3. the agent reports back later through `complete_create_resource` /
//!    `complete_delete_resource`,
//! 4. the timeout sweep closes whatever the agent never answered.
//!
//! Every terminal transition goes through
//! `LifecycleHistoryRepository::complete_if_in_progress`, so a late callback
//! and the sweep can never both win.
//!
//! The coordinator is exposed through two traits: [`ResourceFactoryRemote`]
//! is all an agent can reach through the command ingress, and
//! [`ResourceFactoryInternal`] is the full surface for operators and
//! in-process callers.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::interval_trigger::IntervalJob;
use crate::application::tree_deleter::ResourceTreeDeleter;
use crate::domain::agent_service::{
    CreateDeleteStatus, CreateResourceRequest, CreateResourceResponse, DeleteResourceRequest, DeleteResourceResponse,
    PackageDetails, ResourceFactoryAgentService,
};
use crate::domain::authorization::{ensure_can_manage, AuthorizationService, Caller};
use crate::domain::error::FleetError;
use crate::domain::events::InventoryEvent;
use crate::domain::lifecycle::{Completion, LifecycleHistory, LifecycleHistoryId, LifecycleKind};
use crate::domain::node_config::LifecycleConfig;
use crate::domain::repository::{LifecycleHistoryRepository, ResourceRepository};
use crate::domain::resource::{InventoryStatus, NewResource, ResourceId, ResourceTypeId};
use crate::infrastructure::event_bus::EventBus;

/// Parameters of a create request as submitted by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateResourceParams {
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

/// Operations an agent may invoke remotely.
#[async_trait]
pub trait ResourceFactoryRemote: Send + Sync {
    async fn complete_create_resource(&self, response: CreateResourceResponse) -> Result<(), FleetError>;

    async fn complete_delete_resource(&self, response: DeleteResourceResponse) -> Result<(), FleetError>;
}

/// Full coordinator surface for in-process callers.
#[async_trait]
pub trait ResourceFactoryInternal: ResourceFactoryRemote {
    async fn create_resource(&self, caller: &Caller, params: CreateResourceParams) -> Result<LifecycleHistory, FleetError>;

    async fn delete_resource(&self, caller: &Caller, resource_id: ResourceId) -> Result<LifecycleHistory, FleetError>;

    /// Mark every request older than the timeout threshold `TIMED_OUT`;
    /// returns how many transitioned.
    async fn check_for_timed_out_requests(&self) -> Result<usize, FleetError>;

    async fn find_history(&self, id: LifecycleHistoryId) -> Result<Option<LifecycleHistory>, FleetError>;

    /// Requests that created, or will delete, `resource`, oldest first.
    async fn history_for_resource(&self, resource: ResourceId) -> Result<Vec<LifecycleHistory>, FleetError>;
}

pub struct ResourceLifecycleCoordinator {
    histories: Arc<dyn LifecycleHistoryRepository>,
    resources: Arc<dyn ResourceRepository>,
    agents: Arc<dyn ResourceFactoryAgentService>,
    authz: Arc<dyn AuthorizationService>,
    deleter: Arc<ResourceTreeDeleter>,
    event_bus: EventBus,
    request_timeout: Duration,
    dispatch_timeout: Duration,
}

impl ResourceLifecycleCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        histories: Arc<dyn LifecycleHistoryRepository>,
        resources: Arc<dyn ResourceRepository>,
        agents: Arc<dyn ResourceFactoryAgentService>,
        authz: Arc<dyn AuthorizationService>,
        deleter: Arc<ResourceTreeDeleter>,
        event_bus: EventBus,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            histories,
            resources,
            agents,
            authz,
            deleter,
            event_bus,
            request_timeout: config.request_timeout,
            dispatch_timeout: config.dispatch_timeout,
        }
    }

    /// Terminal transition plus event; `None` when another path got there first.
    async fn finish(
        &self,
        id: LifecycleHistoryId,
        completion: Completion,
    ) -> Result<Option<LifecycleHistory>, FleetError> {
        let updated = self.histories.complete_if_in_progress(id, &completion).await?;
        match &updated {
            Some(history) => {
                info!(
                    history_id = %id,
                    kind = history.kind.as_str(),
                    status = history.status.as_str(),
                    "Lifecycle request completed"
                );
                self.event_bus
                    .publish_inventory_event(InventoryEvent::LifecycleRequestCompleted {
                        history_id: id,
                        kind: history.kind,
                        status: history.status,
                        completed_at: completion.completed_at,
                    });
            }
            None => debug!(history_id = %id, "Lifecycle request already terminal, completion ignored"),
        }
        Ok(updated)
    }

    /// Record an immediate dispatch failure and hand back the final history.
    async fn fail_dispatch(&self, history: LifecycleHistory, message: String) -> Result<LifecycleHistory, FleetError> {
        warn!(history_id = %history.id, kind = history.kind.as_str(), "Lifecycle dispatch failed: {}", message);
        let id = history.id;
        match self.finish(id, Completion::failure(message)).await? {
            Some(updated) => Ok(updated),
            None => Ok(self.histories.find_by_id(id).await?.unwrap_or(history)),
        }
    }

    async fn dispatch<F>(&self, send: F) -> Result<(), String>
    where
        F: std::future::Future<Output = Result<(), FleetError>> + Send,
    {
        match tokio::time::timeout(self.dispatch_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(FleetError::Timeout(self.dispatch_timeout).to_string()),
        }
    }

    /// Present and not waiting for removal.
    async fn is_inventoried(&self, id: ResourceId) -> Result<bool, FleetError> {
        Ok(self
            .resources
            .find_by_id(id)
            .await?
            .is_some_and(|r| r.inventory_status != InventoryStatus::Uninventoried))
    }

    async fn load_in_progress(
        &self,
        id: LifecycleHistoryId,
        kind: LifecycleKind,
    ) -> Result<Option<LifecycleHistory>, FleetError> {
        let Some(history) = self.histories.find_by_id(id).await? else {
            warn!(history_id = %id, kind = kind.as_str(), "Completion for unknown lifecycle request, ignoring");
            return Ok(None);
        };
        if history.kind != kind {
            return Err(FleetError::Protocol(format!(
                "lifecycle request [{}] is a {} request",
                id,
                history.kind.as_str()
            )));
        }
        if history.status.is_terminal() {
            debug!(
                history_id = %id,
                status = history.status.as_str(),
                "Completion for finished lifecycle request, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(history))
    }
}

#[async_trait]
impl ResourceFactoryRemote for ResourceLifecycleCoordinator {
    async fn complete_create_resource(&self, response: CreateResourceResponse) -> Result<(), FleetError> {
        let Some(history) = self.load_in_progress(response.request_id, LifecycleKind::Create).await? else {
            return Ok(());
        };

        let completion = match response.status {
            CreateDeleteStatus::Success => {
                let Some(resource_key) = response.resource_key.clone() else {
                    self.finish(history.id, Completion::failure("agent reported success without a resource key"))
                        .await?;
                    return Ok(());
                };
                let parent = history
                    .parent_resource_id
                    .ok_or_else(|| FleetError::Protocol(format!("create request [{}] has no parent", history.id)))?;
                let type_id = history
                    .resource_type_id
                    .ok_or_else(|| FleetError::Protocol(format!("create request [{}] has no type", history.id)))?;
                let name = response
                    .resource_name
                    .clone()
                    .or_else(|| history.resource_name.clone())
                    .unwrap_or_else(|| resource_key.clone());
                let owner = self.resources.find_owner_agent(parent).await?;

                // Find-or-insert keyed by (parent, key): a redelivered
                // response converges on the same row.
                let resource = self
                    .resources
                    .commit_resource(&NewResource {
                        parent_id: Some(parent),
                        type_id,
                        resource_key: resource_key.clone(),
                        name,
                        owner_agent_id: owner,
                    })
                    .await?;

                Completion {
                    new_resource_key: Some(resource_key),
                    resource_id: Some(resource.id),
                    ..Completion::success()
                }
            }
            CreateDeleteStatus::Failure => Completion::failure(
                response
                    .error_message
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ),
        };

        let committed = completion.resource_id;
        if self.finish(history.id, completion).await?.is_none() {
            // The agent did create it, so the row stays; only the history
            // records the request as closed.
            let closed_as = self
                .histories
                .find_by_id(history.id)
                .await?
                .map(|h| h.status.as_str())
                .unwrap_or("UNKNOWN");
            match committed {
                Some(resource) => warn!(
                    history_id = %history.id,
                    resource = %resource,
                    closed_as,
                    "Resource committed after its create request was closed; inventory keeps the resource"
                ),
                None => warn!(history_id = %history.id, closed_as, "Create request was closed before its failure arrived"),
            }
        }
        Ok(())
    }

    async fn complete_delete_resource(&self, response: DeleteResourceResponse) -> Result<(), FleetError> {
        let Some(history) = self.load_in_progress(response.request_id, LifecycleKind::Delete).await? else {
            return Ok(());
        };

        match response.status {
            CreateDeleteStatus::Success => {
                let resource = history
                    .resource_id
                    .ok_or_else(|| FleetError::Protocol(format!("delete request [{}] has no resource", history.id)))?;
                // Flagged before anything else so a failed removal below is
                // picked up again by the uninventoried purge.
                self.resources.mark_uninventoried(resource).await?;
                if self.finish(history.id, Completion::success()).await?.is_none() {
                    warn!(
                        history_id = %history.id,
                        resource = %resource,
                        "Delete request was closed before the agent confirmed; removing the resource anyway"
                    );
                }
                // The history row references the resource and goes with it.
                match self.deleter.delete_subtree(&Caller::Overlord, resource).await {
                    Ok(_) | Err(FleetError::NotFound(_)) => {}
                    Err(e) => warn!(
                        history_id = %history.id,
                        resource = %resource,
                        "Agent deleted resource, inventory removal left to the purge: {}",
                        e
                    ),
                }
            }
            CreateDeleteStatus::Failure => {
                let message = response
                    .error_message
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.finish(history.id, Completion::failure(message)).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceFactoryInternal for ResourceLifecycleCoordinator {
    async fn create_resource(&self, caller: &Caller, params: CreateResourceParams) -> Result<LifecycleHistory, FleetError> {
        let parent = params.parent_resource_id;
        ensure_can_manage(self.authz.as_ref(), caller, parent).await?;
        if !self.is_inventoried(parent).await? {
            return Err(FleetError::NotFound(format!("parent resource [{}]", parent)));
        }

        let history = LifecycleHistory::new_create(
            parent,
            params.resource_type_id,
            params.resource_name.clone(),
            caller.name(),
        );
        self.histories.insert(&history).await?;
        info!(history_id = %history.id, parent = %parent, name = %params.resource_name, "Create resource requested");

        let Some(agent) = self.resources.find_owner_agent(parent).await? else {
            return self
                .fail_dispatch(history, format!("no agent manages resource [{}]", parent))
                .await;
        };

        let request = CreateResourceRequest {
            request_id: history.id,
            parent_resource_id: parent,
            resource_type_id: params.resource_type_id,
            resource_name: params.resource_name,
            plugin_configuration: params.plugin_configuration,
            resource_configuration: params.resource_configuration,
            package_details: params.package_details,
        };
        match self.dispatch(self.agents.create_resource(agent, request)).await {
            Ok(()) => {
                debug!(history_id = %history.id, agent = %agent, "Create request accepted by agent");
                Ok(history)
            }
            Err(message) => self.fail_dispatch(history, message).await,
        }
    }

    async fn delete_resource(&self, caller: &Caller, resource_id: ResourceId) -> Result<LifecycleHistory, FleetError> {
        ensure_can_manage(self.authz.as_ref(), caller, resource_id).await?;
        if !self.is_inventoried(resource_id).await? {
            return Err(FleetError::NotFound(format!("resource [{}]", resource_id)));
        }

        let history = LifecycleHistory::new_delete(resource_id, caller.name());
        self.histories.insert(&history).await?;
        info!(history_id = %history.id, resource = %resource_id, "Delete resource requested");

        let Some(agent) = self.resources.find_owner_agent(resource_id).await? else {
            return self
                .fail_dispatch(history, format!("no agent manages resource [{}]", resource_id))
                .await;
        };

        let request = DeleteResourceRequest {
            request_id: history.id,
            resource_id,
        };
        match self.dispatch(self.agents.delete_resource(agent, request)).await {
            Ok(()) => Ok(history),
            Err(message) => self.fail_dispatch(history, message).await,
        }
    }

    async fn check_for_timed_out_requests(&self) -> Result<usize, FleetError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.request_timeout)
            .map_err(|e| FleetError::Protocol(format!("invalid request timeout: {}", e)))?;
        let stale = self.histories.find_in_progress_older_than(now - threshold).await?;

        let mut timed_out = 0;
        for history in stale {
            let duration = (now - history.created_at).num_milliseconds();
            let message = format!(
                "Request with duration {}ms exceeded the timeout threshold of {}ms",
                duration,
                threshold.num_milliseconds()
            );
            if self.finish(history.id, Completion::timed_out(message)).await?.is_some() {
                timed_out += 1;
            }
        }
        if timed_out > 0 {
            info!(count = timed_out, "Timed out stale lifecycle requests");
        }
        Ok(timed_out)
    }

    async fn find_history(&self, id: LifecycleHistoryId) -> Result<Option<LifecycleHistory>, FleetError> {
        Ok(self.histories.find_by_id(id).await?)
    }

    async fn history_for_resource(&self, resource: ResourceId) -> Result<Vec<LifecycleHistory>, FleetError> {
        Ok(self.histories.list_for_resource(resource).await?)
    }
}

/// Periodic `check_for_timed_out_requests`.
pub struct TimeoutSweepJob {
    coordinator: Arc<dyn ResourceFactoryInternal>,
}

impl TimeoutSweepJob {
    pub fn new(coordinator: Arc<dyn ResourceFactoryInternal>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl IntervalJob for TimeoutSweepJob {
    fn name(&self) -> &str {
        "lifecycle-timeout-sweep"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.coordinator.check_for_timed_out_requests().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent_service::DiscoveryAgentService;
    use crate::domain::authorization::InventoryRoleAuthorization;
    use crate::domain::lifecycle::LifecycleStatus;
    use crate::domain::node_config::DeletionConfig;
    use crate::domain::resource::AgentId;
    use crate::domain::deletion::DependentKind;
    use crate::domain::repository::{RepositoryError, ResourceGraphStore};
    use crate::infrastructure::repositories::InMemoryFleetStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeAgent {
        unreachable: bool,
        creates: Mutex<Vec<CreateResourceRequest>>,
    }

    #[async_trait]
    impl ResourceFactoryAgentService for FakeAgent {
        async fn create_resource(&self, agent: AgentId, request: CreateResourceRequest) -> Result<(), FleetError> {
            if self.unreachable {
                return Err(FleetError::transport(format!("agent-{}", agent), "connection refused"));
            }
            self.creates.lock().push(request);
            Ok(())
        }

        async fn delete_resource(&self, _agent: AgentId, _request: DeleteResourceRequest) -> Result<(), FleetError> {
            Ok(())
        }
    }

    #[async_trait]
    impl DiscoveryAgentService for FakeAgent {
        async fn remove_resource(&self, _agent: AgentId, _resource_id: ResourceId) -> Result<(), FleetError> {
            Ok(())
        }

        async fn request_full_availability_report(&self, _agent: AgentId) -> Result<(), FleetError> {
            Ok(())
        }
    }

    async fn setup(unreachable: bool) -> (Arc<InMemoryFleetStore>, Arc<FakeAgent>, ResourceLifecycleCoordinator, ResourceId) {
        let store = Arc::new(InMemoryFleetStore::new());
        let platform = store
            .commit_resource(&NewResource {
                parent_id: None,
                type_id: ResourceTypeId(1),
                resource_key: "platform".into(),
                name: "platform".into(),
                owner_agent_id: Some(AgentId(1)),
            })
            .await
            .unwrap();
        let agent = Arc::new(FakeAgent {
            unreachable,
            ..Default::default()
        });
        let (coordinator, _deleter) = build(store.clone(), store.clone(), store.clone(), agent.clone());
        (store, agent, coordinator, platform.id)
    }

    fn build(
        store: Arc<InMemoryFleetStore>,
        histories: Arc<dyn LifecycleHistoryRepository>,
        graph: Arc<dyn ResourceGraphStore>,
        agent: Arc<FakeAgent>,
    ) -> (ResourceLifecycleCoordinator, Arc<ResourceTreeDeleter>) {
        let bus = EventBus::new(64);
        let deleter = Arc::new(ResourceTreeDeleter::new(
            store.clone(),
            graph,
            Arc::new(InventoryRoleAuthorization),
            agent.clone(),
            bus.clone(),
            DeletionConfig {
                retry_delay: Duration::from_millis(1),
                ..DeletionConfig::default()
            },
        ));
        let coordinator = ResourceLifecycleCoordinator::new(
            histories,
            store,
            agent,
            Arc::new(InventoryRoleAuthorization),
            deleter.clone(),
            bus,
            &LifecycleConfig::default(),
        );
        (coordinator, deleter)
    }

    /// Fails every batch while `failing` is set.
    struct FailingGraph {
        inner: Arc<InMemoryFleetStore>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ResourceGraphStore for FailingGraph {
        async fn delete_batch(
            &self,
            ids: &[ResourceId],
            order: &[DependentKind],
        ) -> Result<Vec<ResourceId>, RepositoryError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RepositoryError::Conflict("could not serialize access".into()));
            }
            self.inner.delete_batch(ids, order).await
        }

        async fn count_dependents(&self, kind: DependentKind, ids: &[ResourceId]) -> Result<u64, RepositoryError> {
            self.inner.count_dependents(kind, ids).await
        }
    }

    /// Lets the timeout sweep win every completion race.
    struct SweepWinsHistories {
        inner: Arc<InMemoryFleetStore>,
    }

    #[async_trait]
    impl LifecycleHistoryRepository for SweepWinsHistories {
        async fn insert(&self, history: &LifecycleHistory) -> Result<(), RepositoryError> {
            self.inner.insert(history).await
        }

        async fn find_by_id(&self, id: LifecycleHistoryId) -> Result<Option<LifecycleHistory>, RepositoryError> {
            LifecycleHistoryRepository::find_by_id(self.inner.as_ref(), id).await
        }

        async fn complete_if_in_progress(
            &self,
            id: LifecycleHistoryId,
            completion: &Completion,
        ) -> Result<Option<LifecycleHistory>, RepositoryError> {
            self.inner
                .complete_if_in_progress(id, &Completion::timed_out("swept"))
                .await?;
            self.inner.complete_if_in_progress(id, completion).await
        }

        async fn find_in_progress_older_than(
            &self,
            cutoff: chrono::DateTime<Utc>,
        ) -> Result<Vec<LifecycleHistory>, RepositoryError> {
            self.inner.find_in_progress_older_than(cutoff).await
        }

        async fn list_for_resource(&self, resource: ResourceId) -> Result<Vec<LifecycleHistory>, RepositoryError> {
            self.inner.list_for_resource(resource).await
        }
    }

    fn params(parent: ResourceId) -> CreateResourceParams {
        CreateResourceParams {
            parent_resource_id: parent,
            resource_type_id: ResourceTypeId(4),
            resource_name: "datasource".into(),
            plugin_configuration: serde_json::json!({"jndi": "java:/ds"}),
            resource_configuration: None,
            package_details: None,
        }
    }

    #[tokio::test]
    async fn test_unreachable_agent_fails_immediately() {
        let (store, _agent, coordinator, platform) = setup(true).await;
        let history = coordinator
            .create_resource(&Caller::Overlord, params(platform))
            .await
            .unwrap();
        assert_eq!(history.status, LifecycleStatus::Failure);
        assert!(history.error_message.unwrap().contains("connection refused"));

        let stored = LifecycleHistoryRepository::find_by_id(store.as_ref(), history.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LifecycleStatus::Failure);
    }

    #[tokio::test]
    async fn test_create_completion_commits_resource() {
        let (store, agent, coordinator, platform) = setup(false).await;
        let history = coordinator
            .create_resource(&Caller::user("ops", true), params(platform))
            .await
            .unwrap();
        assert_eq!(history.status, LifecycleStatus::InProgress);
        assert_eq!(agent.creates.lock()[0].request_id, history.id);

        coordinator
            .complete_create_resource(CreateResourceResponse {
                request_id: history.id,
                resource_key: Some("ds-1".into()),
                resource_name: None,
                status: CreateDeleteStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();

        let done = coordinator.find_history(history.id).await.unwrap().unwrap();
        assert_eq!(done.status, LifecycleStatus::Success);
        let created = store
            .find_child_by_key(Some(platform), "ds-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.resource_id, Some(created.id));
        assert_eq!(created.owner_agent_id, Some(AgentId(1)));
    }

    #[tokio::test]
    async fn test_unauthorized_create_writes_no_history() {
        let (store, _agent, coordinator, platform) = setup(false).await;
        let err = coordinator
            .create_resource(&Caller::user("guest", false), params(platform))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Permission(_)));
        assert!(store.list_for_resource(platform).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_for_unknown_request_is_ignored() {
        let (_store, _agent, coordinator, _platform) = setup(false).await;
        coordinator
            .complete_delete_resource(DeleteResourceResponse {
                request_id: LifecycleHistoryId::new(),
                status: CreateDeleteStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_message_names_threshold() {
        let (store, _agent, coordinator, platform) = setup(false).await;
        let mut history = LifecycleHistory::new_delete(platform, "ops");
        history.created_at = Utc::now() - chrono::Duration::hours(2);
        store.insert(&history).await.unwrap();

        assert_eq!(coordinator.check_for_timed_out_requests().await.unwrap(), 1);
        let stored = coordinator.find_history(history.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LifecycleStatus::TimedOut);
        let message = stored.error_message.unwrap();
        assert!(message.starts_with("Request with duration"));
        assert!(message.ends_with("exceeded the timeout threshold of 3600000ms"));
    }

    #[tokio::test]
    async fn test_failed_inventory_removal_is_purged_later() {
        let (store, agent, _coordinator, platform) = setup(false).await;
        let server = store
            .commit_resource(&NewResource {
                parent_id: Some(platform),
                type_id: ResourceTypeId(2),
                resource_key: "server-1".into(),
                name: "server-1".into(),
                owner_agent_id: None,
            })
            .await
            .unwrap();
        let graph = Arc::new(FailingGraph {
            inner: store.clone(),
            failing: AtomicBool::new(true),
        });
        let (coordinator, deleter) = build(store.clone(), store.clone(), graph.clone(), agent);

        let history = coordinator.delete_resource(&Caller::Overlord, server.id).await.unwrap();
        coordinator
            .complete_delete_resource(DeleteResourceResponse {
                request_id: history.id,
                status: CreateDeleteStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();

        let done = coordinator.find_history(history.id).await.unwrap().unwrap();
        assert_eq!(done.status, LifecycleStatus::Success);
        let pending = ResourceRepository::find_by_id(store.as_ref(), server.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.inventory_status, InventoryStatus::Uninventoried);
        let err = coordinator.delete_resource(&Caller::Overlord, server.id).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));

        graph.failing.store(false, Ordering::SeqCst);
        assert_eq!(deleter.purge_uninventoried().await.unwrap(), 1);
        assert!(ResourceRepository::find_by_id(store.as_ref(), server.id)
            .await
            .unwrap()
            .is_none());
        assert!(ResourceRepository::find_by_id(store.as_ref(), platform)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_create_completion_losing_to_sweep_keeps_resource() {
        let (store, agent, _coordinator, platform) = setup(false).await;
        let histories = Arc::new(SweepWinsHistories { inner: store.clone() });
        let (coordinator, _deleter) = build(store.clone(), histories, store.clone(), agent);

        let history = coordinator
            .create_resource(&Caller::Overlord, params(platform))
            .await
            .unwrap();
        coordinator
            .complete_create_resource(CreateResourceResponse {
                request_id: history.id,
                resource_key: Some("ds-late".into()),
                resource_name: None,
                status: CreateDeleteStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();

        let closed = coordinator.find_history(history.id).await.unwrap().unwrap();
        assert_eq!(closed.status, LifecycleStatus::TimedOut);
        let created = store
            .find_child_by_key(Some(platform), "ds-late")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.inventory_status, InventoryStatus::Committed);
    }
}
