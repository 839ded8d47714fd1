// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Error Taxonomy
//!
//! Every component boundary translates its low-level failures (reqwest, sqlx,
//! spool I/O) into [`FleetError`]. Callers match on the variant to decide
//! whether a failure is retried, surfaced or recorded.
//!
//! | Variant | Retried by | Surfaced as |
//! |---------|-----------|-------------|
//! | `Transport` | `CommandSender` per retry policy | immediate dispatch failure |
//! | `Protocol` | never | failed callback / error |
//! | `Permission` | never | error, no partial effect |
//! | `PersistenceConflict` | `ResourceTreeDeleter` (fresh recompute) | error after last attempt |
//! | `Timeout` | sync callers decide | error, or `TIMED_OUT` history |

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("transport failure talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl FleetError {
    pub fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Transport failures and timeouts may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Permission(_) => ErrorKind::Permission,
            Self::PersistenceConflict(_) => ErrorKind::PersistenceConflict,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<RepositoryError> for FleetError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => FleetError::PersistenceConflict(msg),
            RepositoryError::NotFound(msg) => FleetError::NotFound(msg),
            other => FleetError::Storage(other.to_string()),
        }
    }
}

/// Wire-level classification carried inside a failed `CommandResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Permission,
    PersistenceConflict,
    Timeout,
    Capacity,
    NotFound,
    Storage,
    Remote,
}

/// Structured error returned by the remote side of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl ErrorInfo {
    /// Rebuild a local error from one reported by `endpoint`.
    pub fn into_fleet_error(self, endpoint: &str) -> FleetError {
        match self.kind {
            ErrorKind::Transport => FleetError::transport(endpoint, self.message),
            ErrorKind::Permission => FleetError::Permission(self.message),
            ErrorKind::PersistenceConflict => FleetError::PersistenceConflict(self.message),
            ErrorKind::Capacity => FleetError::Capacity(self.message),
            ErrorKind::NotFound => FleetError::NotFound(self.message),
            ErrorKind::Storage => FleetError::Storage(self.message),
            ErrorKind::Protocol | ErrorKind::Timeout | ErrorKind::Remote => {
                FleetError::Protocol(format!("{} reported: {}", endpoint, self.message))
            }
        }
    }
}

impl From<&FleetError> for ErrorInfo {
    fn from(err: &FleetError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_and_timeout_are_retryable() {
        assert!(FleetError::transport("http://a", "refused").is_retryable());
        assert!(FleetError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!FleetError::Protocol("bad body".into()).is_retryable());
        assert!(!FleetError::Permission("nope".into()).is_retryable());
        assert!(!FleetError::PersistenceConflict("40001".into()).is_retryable());
    }

    #[test]
    fn test_repository_conflict_maps_to_persistence_conflict() {
        let err: FleetError = RepositoryError::Conflict("serialization failure".into()).into();
        assert_eq!(err.kind(), ErrorKind::PersistenceConflict);

        let err: FleetError = RepositoryError::Database("connection reset".into()).into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
