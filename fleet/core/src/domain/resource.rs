// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Inventory
//!
//! Resources form a forest through `parent_id`. A resource may be removed
//! only after all of its children, or together with them in one subtree
//! deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

numeric_id!(ResourceId);
numeric_id!(ResourceTypeId);
numeric_id!(AgentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryStatus {
    New,
    Committed,
    Uninventoried,
}

impl InventoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Committed => "COMMITTED",
            Self::Uninventoried => "UNINVENTORIED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "COMMITTED" => Some(Self::Committed),
            "UNINVENTORIED" => Some(Self::Uninventoried),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub parent_id: Option<ResourceId>,
    pub type_id: ResourceTypeId,
    pub resource_key: String,
    pub name: String,
    pub inventory_status: InventoryStatus,
    pub owner_agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
}

/// Values for committing a resource the agent reported as created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub parent_id: Option<ResourceId>,
    pub type_id: ResourceTypeId,
    pub resource_key: String,
    pub name: String,
    pub owner_agent_id: Option<AgentId>,
}

/// A managed agent and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub address: String,
    pub last_availability_report: Option<DateTime<Utc>>,
    /// Set once the agent's resources were marked DOWN for being silent.
    pub backfilled: bool,
}

/// Parent link of one resource in a loaded subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEdge {
    pub id: ResourceId,
    pub parent_id: Option<ResourceId>,
}

/// Flatten a subtree so that every child precedes its parent.
///
/// `edges` must contain `root` and may contain any superset of its
/// descendants; unrelated resources are ignored.
pub fn children_first_order(root: ResourceId, edges: &[ResourceEdge]) -> Vec<ResourceId> {
    use std::collections::{HashMap, HashSet};

    let mut children: HashMap<ResourceId, Vec<ResourceId>> = HashMap::new();
    for edge in edges {
        if let Some(parent) = edge.parent_id {
            children.entry(parent).or_default().push(edge.id);
        }
    }
    for list in children.values_mut() {
        list.sort();
    }

    // Iterative post-order so deep trees cannot overflow the stack.
    let mut ordered = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            ordered.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        if let Some(kids) = children.get(&id) {
            for kid in kids.iter().rev() {
                stack.push((*kid, false));
            }
        }
    }
    ordered
}
