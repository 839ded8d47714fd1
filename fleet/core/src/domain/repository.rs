// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the server-side inventory, defined in the domain
//! layer and implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `LifecycleHistoryRepository` | `LifecycleHistory` | `InMemoryFleetStore`, `PostgresLifecycleHistoryRepository` |
//! | `ResourceRepository` | `Resource` | `InMemoryFleetStore`, `PostgresResourceRepository` |
//! | `AvailabilityRepository` | `AvailabilityRecord` | `InMemoryFleetStore`, `PostgresResourceRepository` |
//! | `AgentRepository` | `AgentRecord` | `InMemoryFleetStore`, `PostgresAgentRepository` |
//! | `ResourceGraphStore` | resource subtree + dependents | `InMemoryFleetStore`, `PostgresResourceRepository` |
//!
//! ## Storage Backend Abstraction
//!
//! The backend is selected at node startup from `storage.backend` in
//! `tether-config.yaml`. The in-memory store is used for development and
//! tests; PostgreSQL for production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::availability::{AvailabilityRecord, AvailabilityType};
use crate::domain::deletion::DependentKind;
use crate::domain::lifecycle::{Completion, LifecycleHistory, LifecycleHistoryId};
use crate::domain::resource::{AgentId, AgentRecord, NewResource, Resource, ResourceEdge, ResourceId};

#[async_trait]
pub trait LifecycleHistoryRepository: Send + Sync {
    /// Persist a new history in its own transaction.
    async fn insert(&self, history: &LifecycleHistory) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: LifecycleHistoryId) -> Result<Option<LifecycleHistory>, RepositoryError>;

    /// Apply `completion` only if the history is still `IN_PROGRESS`.
    ///
    /// Returns the updated history when this call made the transition, and
    /// `None` when the history is unknown or already terminal.
    async fn complete_if_in_progress(
        &self,
        id: LifecycleHistoryId,
        completion: &Completion,
    ) -> Result<Option<LifecycleHistory>, RepositoryError>;

    async fn find_in_progress_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LifecycleHistory>, RepositoryError>;

    async fn list_for_resource(&self, resource: ResourceId) -> Result<Vec<LifecycleHistory>, RepositoryError>;
}

#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Resource>, RepositoryError>;

    async fn find_child_by_key(
        &self,
        parent: Option<ResourceId>,
        resource_key: &str,
    ) -> Result<Option<Resource>, RepositoryError>;

    /// Insert a committed resource, or return the existing one with the same
    /// parent and key. Repeated calls converge on a single row.
    async fn commit_resource(&self, resource: &NewResource) -> Result<Resource, RepositoryError>;

    async fn find_owner_agent(&self, id: ResourceId) -> Result<Option<AgentId>, RepositoryError>;

    async fn find_by_agent(&self, agent: AgentId) -> Result<Vec<Resource>, RepositoryError>;

    /// Parent links for `root` and all of its descendants. Read-only.
    async fn load_subtree_edges(&self, root: ResourceId) -> Result<Vec<ResourceEdge>, RepositoryError>;

    /// Flag `root` and its descendants `UNINVENTORIED`: the agent no longer
    /// has them and the rows are waiting for removal. Returns rows changed.
    async fn mark_uninventoried(&self, root: ResourceId) -> Result<u64, RepositoryError>;

    /// Topmost `UNINVENTORIED` resources, i.e. those whose parent is absent
    /// or still inventoried.
    async fn find_uninventoried_roots(&self) -> Result<Vec<ResourceId>, RepositoryError>;
}

#[async_trait]
pub trait AvailabilityRepository: Send + Sync {
    async fn current(&self, resource: ResourceId) -> Result<Option<AvailabilityRecord>, RepositoryError>;

    /// Close the open interval and open a new one if the type changed.
    /// Returns whether anything changed.
    async fn record(
        &self,
        resource: ResourceId,
        avail_type: AvailabilityType,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Bulk transition of every resource owned by `agent` to DOWN.
    /// Returns the number of resources whose availability changed.
    async fn mark_down_for_agent(&self, agent: AgentId, at: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn history(&self, resource: ResourceId) -> Result<Vec<AvailabilityRecord>, RepositoryError>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn save(&self, agent: &AgentRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<AgentRecord>, RepositoryError>;

    async fn record_availability_report(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    async fn set_backfilled(&self, id: AgentId, backfilled: bool) -> Result<(), RepositoryError>;

    /// Agents not yet backfilled whose last report predates `cutoff`.
    async fn find_silent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentRecord>, RepositoryError>;
}

#[async_trait]
pub trait ResourceGraphStore: Send + Sync {
    /// In one transaction, remove every dependent record of `ids` in `order`,
    /// then the resource rows. Returns the ids of the resource rows actually
    /// removed; ids already gone are left out.
    async fn delete_batch(
        &self,
        ids: &[ResourceId],
        order: &[DependentKind],
    ) -> Result<Vec<ResourceId>, RepositoryError>;

    /// Count dependent rows of `kind` that reference any of `ids`.
    async fn count_dependents(&self, kind: DependentKind, ids: &[ResourceId]) -> Result<u64, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Transient conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Postgres SQLSTATEs that a retry may resolve. A foreign key violation
/// during bulk deletion means a child appeared after the subtree was read.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const FOREIGN_KEY_VIOLATION: &str = "23503";

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(FOREIGN_KEY_VIOLATION) => {
                    RepositoryError::Conflict(db.message().to_string())
                }
                _ => RepositoryError::Database(err.to_string()),
            },
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
