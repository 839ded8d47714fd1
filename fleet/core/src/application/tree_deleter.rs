// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Tree Deleter
//!
//! Removes a resource together with every descendant and every record that
//! references any of them. The subtree is flattened children-first, cut into
//! batches of `deletion.batch_size`, and each batch is removed in one storage
//! transaction walking [`DELETION_ORDER`].
//!
//! A transient persistence conflict restarts the whole operation with a fresh
//! subtree snapshot; agents may have added or removed children meanwhile.
//! Batches that already committed stay committed and are part of the result.
//!
//! Subtrees an agent already dropped are flagged `UNINVENTORIED` first; if
//! their removal fails, [`UninventoriedPurgeJob`] retries it on its interval.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::interval_trigger::IntervalJob;
use crate::domain::agent_service::DiscoveryAgentService;
use crate::domain::authorization::{ensure_can_manage, AuthorizationService, Caller};
use crate::domain::deletion::DELETION_ORDER;
use crate::domain::error::FleetError;
use crate::domain::events::InventoryEvent;
use crate::domain::node_config::DeletionConfig;
use crate::domain::repository::{ResourceGraphStore, ResourceRepository};
use crate::domain::resource::{children_first_order, ResourceId};
use crate::infrastructure::event_bus::EventBus;

pub struct ResourceTreeDeleter {
    resources: Arc<dyn ResourceRepository>,
    graph: Arc<dyn ResourceGraphStore>,
    authz: Arc<dyn AuthorizationService>,
    discovery: Arc<dyn DiscoveryAgentService>,
    event_bus: EventBus,
    config: DeletionConfig,
}

impl ResourceTreeDeleter {
    pub fn new(
        resources: Arc<dyn ResourceRepository>,
        graph: Arc<dyn ResourceGraphStore>,
        authz: Arc<dyn AuthorizationService>,
        discovery: Arc<dyn DiscoveryAgentService>,
        event_bus: EventBus,
        config: DeletionConfig,
    ) -> Self {
        Self {
            resources,
            graph,
            authz,
            discovery,
            event_bus,
            config,
        }
    }

    /// Delete `root` and its whole subtree; returns the removed ids,
    /// children before parents.
    pub async fn delete_subtree(&self, caller: &Caller, root: ResourceId) -> Result<Vec<ResourceId>, FleetError> {
        ensure_can_manage(self.authz.as_ref(), caller, root).await?;

        if self.resources.find_by_id(root).await?.is_none() {
            return Err(FleetError::NotFound(format!("resource [{}]", root)));
        }
        // Resolve before the row is gone.
        let owner = self.resources.find_owner_agent(root).await?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut removed = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.delete_pass(root, &mut removed).await {
                Ok(()) => break,
                Err(FleetError::PersistenceConflict(message)) if attempt < max_attempts => {
                    warn!(
                        root = %root,
                        attempt,
                        max_attempts,
                        removed = removed.len(),
                        "Conflict while deleting subtree, recomputing: {}",
                        message
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    warn!(root = %root, attempt, removed = removed.len(), "Subtree deletion failed: {}", e);
                    return Err(e);
                }
            }
        }

        info!(root = %root, deleted = removed.len(), attempt, caller = caller.name(), "Deleted resource subtree");

        if let Some(agent) = owner {
            let discovery = self.discovery.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery.remove_resource(agent, root).await {
                    warn!(root = %root, agent = %agent, "Failed to notify agent of removed resources: {}", e);
                }
            });
        }

        self.event_bus.publish_inventory_event(InventoryEvent::SubtreeDeleted {
            root_id: root,
            deleted_count: removed.len(),
            attempts: attempt,
            deleted_at: Utc::now(),
        });

        Ok(removed)
    }

    async fn delete_pass(&self, root: ResourceId, removed: &mut Vec<ResourceId>) -> Result<(), FleetError> {
        let edges = self.resources.load_subtree_edges(root).await?;
        if !edges.iter().any(|edge| edge.id == root) {
            // Gone since the last pass.
            return Ok(());
        }

        let order = children_first_order(root, &edges);
        let batch_size = self.config.batch_size.max(1);
        debug!(root = %root, total = order.len(), batch_size, "Computed subtree deletion order");

        for batch in order.chunks(batch_size) {
            let deleted: HashSet<ResourceId> = self
                .graph
                .delete_batch(batch, DELETION_ORDER)
                .await?
                .into_iter()
                .collect();
            if deleted.len() < batch.len() {
                debug!(
                    root = %root,
                    requested = batch.len(),
                    deleted = deleted.len(),
                    "Part of the batch was already removed elsewhere"
                );
            } else {
                debug!(root = %root, deleted = deleted.len(), "Deleted resource batch");
            }
            removed.extend(batch.iter().copied().filter(|id| deleted.contains(id)));
        }
        Ok(())
    }

    /// Remove every `UNINVENTORIED` subtree still present; returns how many
    /// subtrees were removed. Failures are logged and left for the next run.
    pub async fn purge_uninventoried(&self) -> Result<usize, FleetError> {
        let roots = self.resources.find_uninventoried_roots().await?;
        let mut purged = 0;
        for root in roots {
            match self.delete_subtree(&Caller::Overlord, root).await {
                Ok(_) | Err(FleetError::NotFound(_)) => purged += 1,
                Err(e) => warn!(root = %root, "Uninventoried subtree still present, will retry: {}", e),
            }
        }
        if purged > 0 {
            info!(count = purged, "Purged uninventoried subtrees");
        }
        Ok(purged)
    }
}

/// Periodic `purge_uninventoried`.
pub struct UninventoriedPurgeJob {
    deleter: Arc<ResourceTreeDeleter>,
}

impl UninventoriedPurgeJob {
    pub fn new(deleter: Arc<ResourceTreeDeleter>) -> Self {
        Self { deleter }
    }
}

#[async_trait]
impl IntervalJob for UninventoriedPurgeJob {
    fn name(&self) -> &str {
        "uninventoried-purge"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.deleter.purge_uninventoried().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::authorization::InventoryRoleAuthorization;
    use crate::domain::deletion::DependentKind;
    use crate::domain::repository::RepositoryError;
    use crate::domain::resource::{AgentId, NewResource, ResourceTypeId};
    use crate::domain::resource::InventoryStatus;
    use crate::infrastructure::repositories::InMemoryFleetStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDiscovery {
        removed: Mutex<Vec<(AgentId, ResourceId)>>,
    }

    #[async_trait]
    impl DiscoveryAgentService for RecordingDiscovery {
        async fn remove_resource(&self, agent: AgentId, resource_id: ResourceId) -> Result<(), FleetError> {
            self.removed.lock().push((agent, resource_id));
            Ok(())
        }

        async fn request_full_availability_report(&self, _agent: AgentId) -> Result<(), FleetError> {
            Ok(())
        }
    }

    /// Fails the first `conflicts` batches with a serialization conflict.
    struct ConflictingGraph {
        inner: Arc<InMemoryFleetStore>,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl ResourceGraphStore for ConflictingGraph {
        async fn delete_batch(
            &self,
            ids: &[ResourceId],
            order: &[DependentKind],
        ) -> Result<Vec<ResourceId>, RepositoryError> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RepositoryError::Conflict("could not serialize access".into()));
            }
            self.inner.delete_batch(ids, order).await
        }

        async fn count_dependents(&self, kind: DependentKind, ids: &[ResourceId]) -> Result<u64, RepositoryError> {
            self.inner.count_dependents(kind, ids).await
        }
    }

    /// Removes `vanishing` behind the deleter's back before the first batch.
    struct RacingGraph {
        inner: Arc<InMemoryFleetStore>,
        vanishing: Mutex<Option<ResourceId>>,
    }

    #[async_trait]
    impl ResourceGraphStore for RacingGraph {
        async fn delete_batch(
            &self,
            ids: &[ResourceId],
            order: &[DependentKind],
        ) -> Result<Vec<ResourceId>, RepositoryError> {
            let vanishing = self.vanishing.lock().take();
            if let Some(id) = vanishing {
                self.inner.delete_batch(&[id], order).await?;
            }
            self.inner.delete_batch(ids, order).await
        }

        async fn count_dependents(&self, kind: DependentKind, ids: &[ResourceId]) -> Result<u64, RepositoryError> {
            self.inner.count_dependents(kind, ids).await
        }
    }

    async fn commit(store: &InMemoryFleetStore, parent: Option<ResourceId>, key: &str) -> ResourceId {
        store
            .commit_resource(&NewResource {
                parent_id: parent,
                type_id: ResourceTypeId(1),
                resource_key: key.to_string(),
                name: key.to_string(),
                owner_agent_id: Some(AgentId(7)),
            })
            .await
            .unwrap()
            .id
    }

    fn config(batch_size: usize) -> DeletionConfig {
        DeletionConfig {
            batch_size,
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_conflict_retries_with_fresh_subtree() {
        let store = Arc::new(InMemoryFleetStore::new());
        let root = commit(&store, None, "platform").await;
        let a = commit(&store, Some(root), "a").await;
        let _b = commit(&store, Some(a), "b").await;

        let graph = Arc::new(ConflictingGraph {
            inner: store.clone(),
            conflicts: AtomicUsize::new(1),
        });
        let discovery = Arc::new(RecordingDiscovery::default());
        let deleter = ResourceTreeDeleter::new(
            store.clone(),
            graph,
            Arc::new(InventoryRoleAuthorization),
            discovery.clone(),
            EventBus::new(16),
            config(2),
        );

        let removed = deleter.delete_subtree(&Caller::Overlord, root).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(*removed.last().unwrap(), root);
        assert!(ResourceRepository::find_by_id(store.as_ref(), a).await.unwrap().is_none());

        tokio::task::yield_now().await;
        for _ in 0..10 {
            if !discovery.removed.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(discovery.removed.lock().as_slice(), &[(AgentId(7), root)]);
    }

    #[tokio::test]
    async fn test_permission_denied_deletes_nothing() {
        let store = Arc::new(InMemoryFleetStore::new());
        let root = commit(&store, None, "platform").await;
        let deleter = ResourceTreeDeleter::new(
            store.clone(),
            store.clone(),
            Arc::new(InventoryRoleAuthorization),
            Arc::new(RecordingDiscovery::default()),
            EventBus::new(16),
            config(200),
        );

        let err = deleter
            .delete_subtree(&Caller::user("guest", false), root)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Permission(_)));
        assert!(ResourceRepository::find_by_id(store.as_ref(), root).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflicts_beyond_max_attempts_surface() {
        let store = Arc::new(InMemoryFleetStore::new());
        let root = commit(&store, None, "platform").await;
        let graph = Arc::new(ConflictingGraph {
            inner: store.clone(),
            conflicts: AtomicUsize::new(10),
        });
        let deleter = ResourceTreeDeleter::new(
            store.clone(),
            graph,
            Arc::new(InventoryRoleAuthorization),
            Arc::new(RecordingDiscovery::default()),
            EventBus::new(16),
            config(200),
        );

        let err = deleter.delete_subtree(&Caller::Overlord, root).await.unwrap_err();
        assert!(matches!(err, FleetError::PersistenceConflict(_)));
        assert!(ResourceRepository::find_by_id(store.as_ref(), root).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_result_lists_only_rows_this_call_removed() {
        let store = Arc::new(InMemoryFleetStore::new());
        let root = commit(&store, None, "platform").await;
        let a = commit(&store, Some(root), "a").await;
        let b = commit(&store, Some(root), "b").await;

        let graph = Arc::new(RacingGraph {
            inner: store.clone(),
            vanishing: Mutex::new(Some(a)),
        });
        let deleter = ResourceTreeDeleter::new(
            store.clone(),
            graph,
            Arc::new(InventoryRoleAuthorization),
            Arc::new(RecordingDiscovery::default()),
            EventBus::new(16),
            config(200),
        );

        let removed = deleter.delete_subtree(&Caller::Overlord, root).await.unwrap();
        assert_eq!(removed, vec![b, root]);
        assert_eq!(store.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_retries_uninventoried_subtree() {
        let store = Arc::new(InMemoryFleetStore::new());
        let root = commit(&store, None, "platform").await;
        let server = commit(&store, Some(root), "server").await;
        let _app = commit(&store, Some(server), "app").await;
        store.mark_uninventoried(server).await.unwrap();

        let graph = Arc::new(ConflictingGraph {
            inner: store.clone(),
            conflicts: AtomicUsize::new(3),
        });
        let deleter = ResourceTreeDeleter::new(
            store.clone(),
            graph,
            Arc::new(InventoryRoleAuthorization),
            Arc::new(RecordingDiscovery::default()),
            EventBus::new(16),
            config(200),
        );

        assert_eq!(deleter.purge_uninventoried().await.unwrap(), 0);
        let pending = ResourceRepository::find_by_id(store.as_ref(), server).await.unwrap().unwrap();
        assert_eq!(pending.inventory_status, InventoryStatus::Uninventoried);

        let job = UninventoriedPurgeJob::new(Arc::new(deleter));
        job.run_once().await.unwrap();
        assert!(ResourceRepository::find_by_id(store.as_ref(), server).await.unwrap().is_none());
        assert!(store.find_uninventoried_roots().await.unwrap().is_empty());
        assert_eq!(store.resource_count(), 1);
    }
}
