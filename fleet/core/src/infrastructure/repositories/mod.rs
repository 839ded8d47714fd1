// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the persistence traits defined in
//! `crate::domain::repository`.
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresLifecycleHistoryRepository** - create/delete request histories
//! - **PostgresResourceRepository** - resource tree, availability intervals and
//!   the batched subtree deletion
//! - **PostgresAgentRepository** - agent registry and report bookkeeping
//!
//! ## In-Memory Store
//!
//! - **InMemoryFleetStore** - one lock-protected state implementing every
//!   repository trait. Each method holds the lock for its whole duration, which
//!   stands in for a database transaction.

pub mod postgres_agent;
pub mod postgres_lifecycle;
pub mod postgres_resource;

pub use postgres_agent::PostgresAgentRepository;
pub use postgres_lifecycle::PostgresLifecycleHistoryRepository;
pub use postgres_resource::PostgresResourceRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::domain::availability::{AvailabilityRecord, AvailabilityType};
use crate::domain::deletion::DependentKind;
use crate::domain::lifecycle::{Completion, LifecycleHistory, LifecycleHistoryId, LifecycleKind, LifecycleStatus};
use crate::domain::repository::{
    AgentRepository, AvailabilityRepository, LifecycleHistoryRepository, RepositoryError, ResourceGraphStore,
    ResourceRepository,
};
use crate::domain::resource::{
    AgentId, AgentRecord, InventoryStatus, NewResource, Resource, ResourceEdge, ResourceId,
};

#[derive(Default)]
struct FleetState {
    next_resource_id: i64,
    resources: BTreeMap<ResourceId, Resource>,
    histories: HashMap<LifecycleHistoryId, LifecycleHistory>,
    availability: HashMap<ResourceId, Vec<AvailabilityRecord>>,
    agents: BTreeMap<AgentId, AgentRecord>,
    /// Rows of the dependent tables without a richer in-memory model.
    dependents: HashMap<DependentKind, Vec<ResourceId>>,
}

impl FleetState {
    fn find_child(&self, parent: Option<ResourceId>, key: &str) -> Option<&Resource> {
        self.resources
            .values()
            .find(|r| r.parent_id == parent && r.resource_key == key)
    }

    fn current_availability(&self, resource: ResourceId) -> Option<&AvailabilityRecord> {
        self.availability
            .get(&resource)
            .and_then(|records| records.iter().rev().find(|r| r.is_current()))
    }

    fn record_availability(&mut self, resource: ResourceId, avail_type: AvailabilityType, at: DateTime<Utc>) -> bool {
        let records = self.availability.entry(resource).or_default();
        if let Some(open) = records.iter_mut().rev().find(|r| r.is_current()) {
            if open.avail_type == avail_type {
                return false;
            }
            open.end_time = Some(at);
        }
        records.push(AvailabilityRecord::open(resource, avail_type, at));
        true
    }

    fn history_kind_matches(kind: DependentKind, history: &LifecycleHistory) -> bool {
        match kind {
            DependentKind::CreateResourceHistory => history.kind == LifecycleKind::Create,
            DependentKind::DeleteResourceHistory => history.kind == LifecycleKind::Delete,
            _ => false,
        }
    }

    fn history_references(history: &LifecycleHistory, ids: &HashSet<ResourceId>) -> bool {
        history.parent_resource_id.is_some_and(|id| ids.contains(&id))
            || history.resource_id.is_some_and(|id| ids.contains(&id))
    }

    fn count_dependents(&self, kind: DependentKind, ids: &HashSet<ResourceId>) -> u64 {
        let generic = self
            .dependents
            .get(&kind)
            .map(|rows| rows.iter().filter(|id| ids.contains(id)).count())
            .unwrap_or(0);
        let modelled = match kind {
            DependentKind::Availability => ids
                .iter()
                .map(|id| self.availability.get(id).map_or(0, Vec::len))
                .sum(),
            DependentKind::CreateResourceHistory | DependentKind::DeleteResourceHistory => self
                .histories
                .values()
                .filter(|h| Self::history_kind_matches(kind, h) && Self::history_references(h, ids))
                .count(),
            _ => 0,
        };
        (generic + modelled) as u64
    }

    fn remove_dependents(&mut self, kind: DependentKind, ids: &HashSet<ResourceId>) {
        if let Some(rows) = self.dependents.get_mut(&kind) {
            rows.retain(|id| !ids.contains(id));
        }
        match kind {
            DependentKind::Availability => {
                for id in ids {
                    self.availability.remove(id);
                }
            }
            DependentKind::CreateResourceHistory | DependentKind::DeleteResourceHistory => {
                self.histories
                    .retain(|_, h| !(Self::history_kind_matches(kind, h) && Self::history_references(h, ids)));
            }
            _ => {}
        }
    }
}

/// In-memory implementation of every inventory repository.
#[derive(Clone, Default)]
pub struct InMemoryFleetStore {
    state: Arc<RwLock<FleetState>>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a row of a dependent table to `resource`.
    pub fn add_dependent(&self, kind: DependentKind, resource: ResourceId) {
        self.state.write().dependents.entry(kind).or_default().push(resource);
    }

    pub fn resource_count(&self) -> usize {
        self.state.read().resources.len()
    }
}

#[async_trait]
impl LifecycleHistoryRepository for InMemoryFleetStore {
    async fn insert(&self, history: &LifecycleHistory) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if state.histories.contains_key(&history.id) {
            return Err(RepositoryError::Database(format!(
                "lifecycle history {} already exists",
                history.id
            )));
        }
        state.histories.insert(history.id, history.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: LifecycleHistoryId) -> Result<Option<LifecycleHistory>, RepositoryError> {
        Ok(self.state.read().histories.get(&id).cloned())
    }

    async fn complete_if_in_progress(
        &self,
        id: LifecycleHistoryId,
        completion: &Completion,
    ) -> Result<Option<LifecycleHistory>, RepositoryError> {
        let mut state = self.state.write();
        let Some(history) = state.histories.get_mut(&id) else {
            return Ok(None);
        };
        Ok(history.complete(completion).ok().map(|()| history.clone()))
    }

    async fn find_in_progress_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LifecycleHistory>, RepositoryError> {
        let state = self.state.read();
        let mut stale: Vec<LifecycleHistory> = state
            .histories
            .values()
            .filter(|h| h.status == LifecycleStatus::InProgress && h.created_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|h| h.created_at);
        Ok(stale)
    }

    async fn list_for_resource(&self, resource: ResourceId) -> Result<Vec<LifecycleHistory>, RepositoryError> {
        let state = self.state.read();
        let ids = HashSet::from([resource]);
        let mut histories: Vec<LifecycleHistory> = state
            .histories
            .values()
            .filter(|h| FleetState::history_references(h, &ids))
            .cloned()
            .collect();
        histories.sort_by_key(|h| h.created_at);
        Ok(histories)
    }
}

#[async_trait]
impl ResourceRepository for InMemoryFleetStore {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Resource>, RepositoryError> {
        Ok(self.state.read().resources.get(&id).cloned())
    }

    async fn find_child_by_key(
        &self,
        parent: Option<ResourceId>,
        resource_key: &str,
    ) -> Result<Option<Resource>, RepositoryError> {
        Ok(self.state.read().find_child(parent, resource_key).cloned())
    }

    async fn commit_resource(&self, resource: &NewResource) -> Result<Resource, RepositoryError> {
        let mut state = self.state.write();
        if let Some(existing) = state.find_child(resource.parent_id, &resource.resource_key) {
            return Ok(existing.clone());
        }
        if let Some(parent) = resource.parent_id {
            if !state.resources.contains_key(&parent) {
                return Err(RepositoryError::NotFound(format!("parent resource {}", parent)));
            }
        }

        state.next_resource_id += 1;
        let committed = Resource {
            id: ResourceId(state.next_resource_id),
            parent_id: resource.parent_id,
            type_id: resource.type_id,
            resource_key: resource.resource_key.clone(),
            name: resource.name.clone(),
            inventory_status: InventoryStatus::Committed,
            owner_agent_id: resource.owner_agent_id,
            created_at: Utc::now(),
        };
        state.resources.insert(committed.id, committed.clone());
        Ok(committed)
    }

    async fn find_owner_agent(&self, id: ResourceId) -> Result<Option<AgentId>, RepositoryError> {
        let state = self.state.read();
        let mut cursor = state.resources.get(&id);
        while let Some(resource) = cursor {
            if resource.owner_agent_id.is_some() {
                return Ok(resource.owner_agent_id);
            }
            cursor = resource.parent_id.and_then(|p| state.resources.get(&p));
        }
        Ok(None)
    }

    async fn find_by_agent(&self, agent: AgentId) -> Result<Vec<Resource>, RepositoryError> {
        Ok(self
            .state
            .read()
            .resources
            .values()
            .filter(|r| r.owner_agent_id == Some(agent))
            .cloned()
            .collect())
    }

    async fn load_subtree_edges(&self, root: ResourceId) -> Result<Vec<ResourceEdge>, RepositoryError> {
        let state = self.state.read();
        let Some(root_resource) = state.resources.get(&root) else {
            return Ok(Vec::new());
        };

        let mut children: HashMap<ResourceId, Vec<&Resource>> = HashMap::new();
        for resource in state.resources.values() {
            if let Some(parent) = resource.parent_id {
                children.entry(parent).or_default().push(resource);
            }
        }

        let mut edges = Vec::new();
        let mut pending = vec![root_resource];
        while let Some(resource) = pending.pop() {
            edges.push(ResourceEdge {
                id: resource.id,
                parent_id: resource.parent_id,
            });
            if let Some(kids) = children.get(&resource.id) {
                pending.extend(kids.iter().copied());
            }
        }
        Ok(edges)
    }

    async fn mark_uninventoried(&self, root: ResourceId) -> Result<u64, RepositoryError> {
        let edges = self.load_subtree_edges(root).await?;
        let mut state = self.state.write();
        let mut changed = 0;
        for edge in edges {
            if let Some(resource) = state.resources.get_mut(&edge.id) {
                if resource.inventory_status != InventoryStatus::Uninventoried {
                    resource.inventory_status = InventoryStatus::Uninventoried;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn find_uninventoried_roots(&self) -> Result<Vec<ResourceId>, RepositoryError> {
        let state = self.state.read();
        let mut roots: Vec<ResourceId> = state
            .resources
            .values()
            .filter(|r| r.inventory_status == InventoryStatus::Uninventoried)
            .filter(|r| {
                r.parent_id
                    .and_then(|p| state.resources.get(&p))
                    .is_none_or(|parent| parent.inventory_status != InventoryStatus::Uninventoried)
            })
            .map(|r| r.id)
            .collect();
        roots.sort();
        Ok(roots)
    }
}

#[async_trait]
impl AvailabilityRepository for InMemoryFleetStore {
    async fn current(&self, resource: ResourceId) -> Result<Option<AvailabilityRecord>, RepositoryError> {
        Ok(self.state.read().current_availability(resource).cloned())
    }

    async fn record(
        &self,
        resource: ResourceId,
        avail_type: AvailabilityType,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();
        if !state.resources.contains_key(&resource) {
            return Err(RepositoryError::NotFound(format!("resource {}", resource)));
        }
        Ok(state.record_availability(resource, avail_type, at))
    }

    async fn mark_down_for_agent(&self, agent: AgentId, at: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.write();
        let owned: Vec<ResourceId> = state
            .resources
            .values()
            .filter(|r| r.owner_agent_id == Some(agent))
            .map(|r| r.id)
            .collect();

        let mut changed = 0;
        for id in owned {
            if state.record_availability(id, AvailabilityType::Down, at) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn history(&self, resource: ResourceId) -> Result<Vec<AvailabilityRecord>, RepositoryError> {
        Ok(self
            .state
            .read()
            .availability
            .get(&resource)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl AgentRepository for InMemoryFleetStore {
    async fn save(&self, agent: &AgentRecord) -> Result<(), RepositoryError> {
        self.state.write().agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, RepositoryError> {
        Ok(self.state.read().agents.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        Ok(self.state.read().agents.values().cloned().collect())
    }

    async fn record_availability_report(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("agent {}", id)))?;
        agent.last_availability_report = Some(at);
        Ok(())
    }

    async fn set_backfilled(&self, id: AgentId, backfilled: bool) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("agent {}", id)))?;
        agent.backfilled = backfilled;
        Ok(())
    }

    async fn find_silent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentRecord>, RepositoryError> {
        Ok(self
            .state
            .read()
            .agents
            .values()
            .filter(|a| !a.backfilled && a.last_availability_report.is_some_and(|t| t < cutoff))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResourceGraphStore for InMemoryFleetStore {
    async fn delete_batch(
        &self,
        ids: &[ResourceId],
        order: &[DependentKind],
    ) -> Result<Vec<ResourceId>, RepositoryError> {
        let mut state = self.state.write();
        let batch: HashSet<ResourceId> = ids.iter().copied().collect();

        // Same check the resources.parent_id foreign key makes.
        if let Some(orphan) = state
            .resources
            .values()
            .find(|r| !batch.contains(&r.id) && r.parent_id.is_some_and(|p| batch.contains(&p)))
        {
            return Err(RepositoryError::Conflict(format!(
                "resource {} still references a resource of the batch",
                orphan.id
            )));
        }

        for kind in order {
            state.remove_dependents(*kind, &batch);
        }
        Ok(ids.iter().filter(|id| state.resources.remove(*id).is_some()).copied().collect())
    }

    async fn count_dependents(&self, kind: DependentKind, ids: &[ResourceId]) -> Result<u64, RepositoryError> {
        let ids: HashSet<ResourceId> = ids.iter().copied().collect();
        Ok(self.state.read().count_dependents(kind, &ids))
    }
}
