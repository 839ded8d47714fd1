// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Spool Contract
//!
//! Ordered, persistent queue of not-yet-acknowledged commands. Entries leave
//! the spool only through an explicit [`Spool::remove`] after a confirmed ack;
//! a restart followed by [`Spool::replay_all`] yields every appended but
//! unremoved entry in original FIFO order.
//!
//! Implementations live in `crate::infrastructure::spool`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::FleetError;

/// Monotonic position of an entry; never reused, not even across restarts.
pub type Sequence = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub sequence: Sequence,
    pub serialized_command: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Point-in-time occupancy, used for capacity checks and operator output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolUsage {
    pub entries: usize,
    pub live_bytes: u64,
    pub file_bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl SpoolUsage {
    pub fn is_full(&self) -> bool {
        self.entries >= self.max_entries || self.live_bytes >= self.max_bytes
    }
}

pub trait Spool: Send + Sync {
    /// Durably append an entry and return its sequence.
    fn append(&self, serialized_command: &[u8]) -> Result<Sequence, SpoolError>;

    fn peek_oldest(&self) -> Result<Option<SpoolEntry>, SpoolError>;

    /// Acknowledge an entry. Removing an unknown sequence is a no-op.
    fn remove(&self, sequence: Sequence) -> Result<(), SpoolError>;

    fn replay_all(&self) -> Result<Vec<SpoolEntry>, SpoolError>;

    fn usage(&self) -> SpoolUsage;

    fn len(&self) -> usize {
        self.usage().entries
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("spool is full: {0}")]
    Capacity(String),

    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spool record is corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("spool encoding error: {0}")]
    Encoding(String),
}

impl From<SpoolError> for FleetError {
    fn from(err: SpoolError) -> Self {
        match err {
            SpoolError::Capacity(msg) => FleetError::Capacity(msg),
            other => FleetError::Storage(other.to_string()),
        }
    }
}
