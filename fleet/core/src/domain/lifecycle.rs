// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lifecycle History
//!
//! Durable record of an intent to create or delete a resource. A history is
//! written before the request is dispatched and reaches exactly one terminal
//! status afterwards:
//!
//! ```text
//! IN_PROGRESS ──► SUCCESS
//!             ├─► FAILURE
//!             └─► TIMED_OUT
//! ```
//!
//! Terminal states never change again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::resource::{ResourceId, ResourceTypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecycleHistoryId(pub Uuid);

impl LifecycleHistoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LifecycleHistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LifecycleHistoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleKind {
    Create,
    Delete,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    InProgress,
    Success,
    Failure,
    TimedOut,
}

impl LifecycleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "TIMED_OUT" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleHistory {
    pub id: LifecycleHistoryId,
    pub kind: LifecycleKind,
    /// Parent of the resource being created (CREATE only).
    pub parent_resource_id: Option<ResourceId>,
    /// Resource being deleted (DELETE), or the created resource once committed.
    pub resource_id: Option<ResourceId>,
    pub resource_type_id: Option<ResourceTypeId>,
    pub resource_name: Option<String>,
    /// Key reported by the agent for a created resource.
    pub new_resource_key: Option<String>,
    pub requested_by: String,
    pub status: LifecycleStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl LifecycleHistory {
    pub fn new_create(
        parent_resource_id: ResourceId,
        resource_type_id: ResourceTypeId,
        resource_name: impl Into<String>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            id: LifecycleHistoryId::new(),
            kind: LifecycleKind::Create,
            parent_resource_id: Some(parent_resource_id),
            resource_id: None,
            resource_type_id: Some(resource_type_id),
            resource_name: Some(resource_name.into()),
            new_resource_key: None,
            requested_by: requested_by.into(),
            status: LifecycleStatus::InProgress,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    pub fn new_delete(resource_id: ResourceId, requested_by: impl Into<String>) -> Self {
        Self {
            id: LifecycleHistoryId::new(),
            kind: LifecycleKind::Delete,
            parent_resource_id: None,
            resource_id: Some(resource_id),
            resource_type_id: None,
            resource_name: None,
            new_resource_key: None,
            requested_by: requested_by.into(),
            status: LifecycleStatus::InProgress,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Resource the history refers to for cascading deletion.
    pub fn referenced_resource(&self) -> Option<ResourceId> {
        match self.kind {
            LifecycleKind::Create => self.parent_resource_id,
            LifecycleKind::Delete => self.resource_id,
        }
    }

    /// Apply a terminal transition in place; fails when already terminal.
    pub fn complete(&mut self, completion: &Completion) -> Result<(), LifecycleError> {
        if self.status.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        if !completion.status.is_terminal() {
            return Err(LifecycleError::NotTerminal);
        }
        self.status = completion.status;
        self.completed_at = Some(completion.completed_at);
        self.error_message = completion.error_message.clone();
        if let Some(key) = &completion.new_resource_key {
            self.new_resource_key = Some(key.clone());
        }
        if let Some(id) = completion.resource_id {
            self.resource_id = Some(id);
        }
        Ok(())
    }
}

/// Terminal transition applied atomically by the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: LifecycleStatus,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub new_resource_key: Option<String>,
    pub resource_id: Option<ResourceId>,
}

impl Completion {
    pub fn success() -> Self {
        Self {
            status: LifecycleStatus::Success,
            completed_at: Utc::now(),
            error_message: None,
            new_resource_key: None,
            resource_id: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: LifecycleStatus::Failure,
            error_message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            status: LifecycleStatus::TimedOut,
            error_message: Some(message.into()),
            ..Self::success()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("lifecycle history {id} is already {status:?}")]
    AlreadyTerminal {
        id: LifecycleHistoryId,
        status: LifecycleStatus,
    },

    #[error("completion status must be terminal")]
    NotTerminal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_never_regresses() {
        let mut history = LifecycleHistory::new_delete(ResourceId(3), "rhq");
        history.complete(&Completion::timed_out("too slow")).unwrap();
        assert_eq!(history.status, LifecycleStatus::TimedOut);

        let err = history.complete(&Completion::success()).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyTerminal { .. }));
        assert_eq!(history.status, LifecycleStatus::TimedOut);
        assert_eq!(history.error_message.as_deref(), Some("too slow"));
    }

    #[test]
    fn test_in_progress_is_not_a_completion() {
        let mut history = LifecycleHistory::new_create(ResourceId(1), ResourceTypeId(2), "db", "admin");
        let completion = Completion {
            status: LifecycleStatus::InProgress,
            ..Completion::success()
        };
        assert!(matches!(history.complete(&completion), Err(LifecycleError::NotTerminal)));
    }

    #[test]
    fn test_referenced_resource_by_kind() {
        let create = LifecycleHistory::new_create(ResourceId(1), ResourceTypeId(2), "db", "admin");
        assert_eq!(create.referenced_resource(), Some(ResourceId(1)));
        let delete = LifecycleHistory::new_delete(ResourceId(9), "admin");
        assert_eq!(delete.referenced_resource(), Some(ResourceId(9)));
    }
}
