// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::command::CommandId;
use crate::domain::lifecycle::{LifecycleHistoryId, LifecycleKind, LifecycleStatus};
use crate::domain::resource::{AgentId, ResourceId};
use crate::domain::spool::Sequence;

/// Command delivery events raised by the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    SendingStarted {
        started_at: DateTime<Utc>,
    },
    SendingStopped {
        graceful: bool,
        stopped_at: DateTime<Utc>,
    },
    CommandSpooled {
        command_id: CommandId,
        sequence: Sequence,
        spooled_at: DateTime<Utc>,
    },
    CommandDelivered {
        command_id: CommandId,
        endpoint: String,
        attempts: u32,
        delivered_at: DateTime<Utc>,
    },
    CommandAbandoned {
        command_id: CommandId,
        attempts: u32,
        reason: String,
        abandoned_at: DateTime<Utc>,
    },
}

/// Server endpoint selection events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FailoverEvent {
    TargetChanged {
        previous: Option<String>,
        current: Option<String>,
        changed_at: DateTime<Utc>,
    },
    ListReplaced {
        version: u64,
        endpoint_count: usize,
        replaced_at: DateTime<Utc>,
    },
    EndpointDemoted {
        address: String,
        consecutive_failures: u32,
        demoted_at: DateTime<Utc>,
    },
    EndpointRestored {
        address: String,
        restored_at: DateTime<Utc>,
    },
}

/// Server-side inventory events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InventoryEvent {
    LifecycleRequestCompleted {
        history_id: LifecycleHistoryId,
        kind: LifecycleKind,
        status: LifecycleStatus,
        completed_at: DateTime<Utc>,
    },
    SubtreeDeleted {
        root_id: ResourceId,
        deleted_count: usize,
        attempts: u32,
        deleted_at: DateTime<Utc>,
    },
    AgentResourcesMarkedDown {
        agent_id: AgentId,
        changed: u64,
        marked_at: DateTime<Utc>,
    },
}
