// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Failover List
//!
//! Ranked, versioned set of candidate server endpoints. Rank 0 is the
//! primary. The list is an immutable value: health changes and discovery
//! proposals produce a new list that replaces the old one wholesale.
//!
//! Versions are wall-clock milliseconds, so a list built after a restart
//! still outranks one persisted or handed out before it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub address: String,
    pub rank: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_healthy() -> bool {
    true
}

impl ServerEndpoint {
    pub fn new(address: impl Into<String>, rank: u32) -> Self {
        Self {
            address: address.into(),
            rank,
            healthy: true,
            last_checked_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Whether a recovered higher-ranked endpoint takes traffic back on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailbackPolicy {
    #[default]
    Automatic,
    Manual,
}

/// A list version no older than the wall clock and strictly above `previous`.
pub fn next_list_version(previous: u64) -> u64 {
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    now.max(previous.saturating_add(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailoverList {
    pub version: u64,
    endpoints: Vec<ServerEndpoint>,
}

impl FailoverList {
    pub fn new(version: u64, mut endpoints: Vec<ServerEndpoint>) -> Self {
        endpoints.sort_by_key(|e| e.rank);
        let mut seen = std::collections::HashSet::new();
        endpoints.retain(|e| seen.insert(e.address.clone()));
        Self { version, endpoints }
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&ServerEndpoint> {
        self.endpoints.iter().find(|e| e.address == address)
    }

    /// Lowest-rank healthy endpoint. When nothing is healthy the top-ranked
    /// entry is returned anyway so callers still have somewhere to try.
    pub fn current_target(&self) -> Option<&ServerEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.healthy)
            .or_else(|| self.endpoints.first())
    }

    /// Unhealthy endpoints ranked ahead of the current target.
    pub fn failback_candidates(&self) -> Vec<ServerEndpoint> {
        let Some(current) = self.current_target() else {
            return Vec::new();
        };
        self.endpoints
            .iter()
            .filter(|e| !e.healthy && e.rank < current.rank)
            .cloned()
            .collect()
    }

    /// Copy with one endpoint modified; the version is unchanged because
    /// health is local state, not a new proposal.
    pub fn with_endpoint<F>(&self, address: &str, update: F) -> Option<Self>
    where
        F: FnOnce(&mut ServerEndpoint),
    {
        let mut next = self.clone();
        let endpoint = next.endpoints.iter_mut().find(|e| e.address == address)?;
        update(endpoint);
        Some(next)
    }

    /// Adopt health state from `previous` for endpoints present in both.
    pub fn inherit_health(mut self, previous: &FailoverList) -> Self {
        for endpoint in &mut self.endpoints {
            if let Some(old) = previous.get(&endpoint.address) {
                endpoint.healthy = old.healthy;
                endpoint.last_checked_at = old.last_checked_at;
                endpoint.consecutive_failures = old.consecutive_failures;
            }
        }
        self
    }
}
