// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Failover Manager
//!
//! Owns the node's view of the ranked server endpoints. Readers get an
//! `Arc<FailoverList>` snapshot; every change (health transition or accepted
//! proposal) builds a new list and swaps it in under a short write lock, so
//! the sender never observes a partially updated list.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Target selection, health demotion and fail-back

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::interval_trigger::IntervalJob;
use crate::domain::error::FleetError;
use crate::domain::events::FailoverEvent;
use crate::domain::failover::{FailbackPolicy, FailoverList, ServerEndpoint};
use crate::domain::node_config::FailoverConfig;
use crate::domain::transport::Transport;
use crate::infrastructure::event_bus::EventBus;

pub struct FailoverManager {
    list: RwLock<Arc<FailoverList>>,
    failure_threshold: u32,
    policy: FailbackPolicy,
    list_file: Option<PathBuf>,
    event_bus: EventBus,
}

impl FailoverManager {
    pub fn new(initial: FailoverList, config: &FailoverConfig, event_bus: EventBus) -> Self {
        Self {
            list: RwLock::new(Arc::new(initial)),
            failure_threshold: config.failure_threshold.max(1),
            policy: config.failback,
            list_file: config.list_file.clone(),
            event_bus,
        }
    }

    /// Start from the persisted list when one exists and is newer than the
    /// configured endpoints, otherwise from the configuration.
    /// `config_version` is `ConfigHandle::list_version`.
    pub fn from_config(config: &FailoverConfig, config_version: u64, event_bus: EventBus) -> Self {
        let configured = config.to_failover_list(config_version);
        let initial = match config.list_file.as_ref().map(|path| (path, std::fs::read(path))) {
            Some((path, Ok(bytes))) => match serde_json::from_slice::<FailoverList>(&bytes) {
                Ok(persisted) if persisted.version > configured.version && !persisted.is_empty() => {
                    info!(
                        path = %path.display(),
                        version = persisted.version,
                        "Loaded persisted failover list"
                    );
                    persisted
                }
                Ok(_) => configured,
                Err(e) => {
                    warn!(path = %path.display(), "Ignoring unreadable failover list file: {}", e);
                    configured
                }
            },
            _ => configured,
        };
        Self::new(initial, config, event_bus)
    }

    pub fn snapshot(&self) -> Arc<FailoverList> {
        self.list.read().clone()
    }

    pub fn current_target(&self) -> Option<ServerEndpoint> {
        self.list.read().current_target().cloned()
    }

    pub fn version(&self) -> u64 {
        self.list.read().version
    }

    pub fn policy(&self) -> FailbackPolicy {
        self.policy
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Operator or health check override: endpoint is reachable again.
    pub fn mark_healthy(&self, address: &str) -> Result<(), FleetError> {
        let changed = self.update_endpoint(address, |e| {
            e.healthy = true;
            e.consecutive_failures = 0;
            e.last_checked_at = Some(Utc::now());
        })?;
        if changed {
            info!(endpoint = address, "Endpoint marked healthy");
            self.event_bus.publish_failover_event(FailoverEvent::EndpointRestored {
                address: address.to_string(),
                restored_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Operator override: take the endpoint out of rotation immediately.
    pub fn mark_unhealthy(&self, address: &str) -> Result<(), FleetError> {
        let threshold = self.failure_threshold;
        let changed = self.update_endpoint(address, |e| {
            e.healthy = false;
            e.consecutive_failures = e.consecutive_failures.max(threshold);
            e.last_checked_at = Some(Utc::now());
        })?;
        if changed {
            warn!(endpoint = address, "Endpoint marked unhealthy");
            self.event_bus.publish_failover_event(FailoverEvent::EndpointDemoted {
                address: address.to_string(),
                consecutive_failures: threshold,
                demoted_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Count a failed ping or send. Returns true when this failure demoted
    /// the endpoint.
    pub fn record_failure(&self, address: &str) -> bool {
        let threshold = self.failure_threshold;
        let mut failures = 0;
        let result = self.update_endpoint(address, |e| {
            e.consecutive_failures = e.consecutive_failures.saturating_add(1);
            e.last_checked_at = Some(Utc::now());
            failures = e.consecutive_failures;
            if e.consecutive_failures >= threshold {
                e.healthy = false;
            }
        });
        let demoted = matches!(result, Ok(true)) && failures >= threshold;
        if demoted {
            warn!(
                endpoint = address,
                consecutive_failures = failures,
                "Endpoint demoted after consecutive failures"
            );
            self.event_bus.publish_failover_event(FailoverEvent::EndpointDemoted {
                address: address.to_string(),
                consecutive_failures: failures,
                demoted_at: Utc::now(),
            });
        } else {
            debug!(endpoint = address, consecutive_failures = failures, "Endpoint failure recorded");
        }
        demoted
    }

    /// Count a successful ping or send.
    ///
    /// An unhealthy endpoint is restored only under automatic fail-back, or
    /// when it is the endpoint currently being tried because nothing is
    /// healthy.
    pub fn record_success(&self, address: &str) {
        let snapshot = self.snapshot();
        let Some(endpoint) = snapshot.get(address) else {
            return;
        };
        if endpoint.healthy {
            if endpoint.consecutive_failures > 0 {
                let _ = self.update_endpoint(address, |e| {
                    e.consecutive_failures = 0;
                    e.last_checked_at = Some(Utc::now());
                });
            }
            return;
        }

        let is_current = snapshot.current_target().map(|t| t.address.as_str()) == Some(address);
        if self.policy == FailbackPolicy::Automatic || is_current {
            let _ = self.mark_healthy(address);
        }
    }

    /// Replace the list with a strictly newer proposal.
    pub fn propose(&self, proposal: FailoverList) -> bool {
        let (previous, next) = {
            let mut guard = self.list.write();
            if proposal.version <= guard.version {
                debug!(
                    proposed = proposal.version,
                    current = guard.version,
                    "Ignoring stale failover list proposal"
                );
                return false;
            }
            if proposal.is_empty() {
                warn!(version = proposal.version, "Ignoring empty failover list proposal");
                return false;
            }
            let next = Arc::new(proposal.inherit_health(&guard));
            let previous = std::mem::replace(&mut *guard, next.clone());
            (previous, next)
        };

        info!(
            version = next.version,
            endpoints = next.endpoints().len(),
            "Failover list replaced"
        );
        self.persist(&next);
        self.event_bus.publish_failover_event(FailoverEvent::ListReplaced {
            version: next.version,
            endpoint_count: next.endpoints().len(),
            replaced_at: Utc::now(),
        });
        self.publish_target_change(&previous, &next);
        true
    }

    /// Apply a health change to one endpoint. Returns whether the list changed.
    fn update_endpoint<F>(&self, address: &str, update: F) -> Result<bool, FleetError>
    where
        F: FnOnce(&mut ServerEndpoint),
    {
        let (previous, next) = {
            let mut guard = self.list.write();
            let Some(updated) = guard.with_endpoint(address, update) else {
                return Err(FleetError::NotFound(format!("endpoint {} is not in the failover list", address)));
            };
            if updated == **guard {
                return Ok(false);
            }
            let next = Arc::new(updated);
            let previous = std::mem::replace(&mut *guard, next.clone());
            (previous, next)
        };
        self.publish_target_change(&previous, &next);
        Ok(true)
    }

    fn publish_target_change(&self, previous: &FailoverList, next: &FailoverList) {
        let before = previous.current_target().map(|e| e.address.clone());
        let after = next.current_target().map(|e| e.address.clone());
        if before != after {
            info!(previous = ?before, current = ?after, "Failover target changed");
            self.event_bus.publish_failover_event(FailoverEvent::TargetChanged {
                previous: before,
                current: after,
                changed_at: Utc::now(),
            });
        }
    }

    fn persist(&self, list: &FailoverList) {
        let Some(path) = &self.list_file else {
            return;
        };
        let result = serde_json::to_vec_pretty(list)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                let tmp = path.with_extension("tmp");
                std::fs::write(&tmp, bytes)?;
                std::fs::rename(&tmp, path)
            });
        if let Err(e) = result {
            warn!(path = %path.display(), "Failed to persist failover list: {}", e);
        }
    }
}

/// Pings the current target and, under automatic fail-back, the demoted
/// endpoints ranked ahead of it.
pub struct HealthCheckJob {
    failover: Arc<FailoverManager>,
    transport: Arc<dyn Transport>,
    ping_timeout: Duration,
    failback_check_interval: Duration,
    last_failback_check: Mutex<Option<Instant>>,
}

impl HealthCheckJob {
    pub fn new(failover: Arc<FailoverManager>, transport: Arc<dyn Transport>, config: &FailoverConfig) -> Self {
        Self {
            failover,
            transport,
            ping_timeout: config.ping_timeout,
            failback_check_interval: config.failback_check_interval,
            last_failback_check: Mutex::new(None),
        }
    }

    fn failback_due(&self) -> bool {
        let mut last = self.last_failback_check.lock();
        let due = last.is_none_or(|at| at.elapsed() >= self.failback_check_interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    async fn reachable(&self, address: &str) -> bool {
        match self.transport.ping(address, self.ping_timeout).await {
            Ok(latency) => {
                debug!(endpoint = address, latency_ms = latency.as_millis() as u64, "Health check succeeded");
                true
            }
            Err(e) => {
                debug!(endpoint = address, "Health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl IntervalJob for HealthCheckJob {
    fn name(&self) -> &str {
        "failover-health-check"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        if let Some(target) = self.failover.current_target() {
            if self.reachable(&target.address).await {
                self.failover.record_success(&target.address);
            } else {
                self.failover.record_failure(&target.address);
            }
        }

        if self.failover.policy() == FailbackPolicy::Automatic {
            let candidates = self.failover.snapshot().failback_candidates();
            if !candidates.is_empty() && self.failback_due() {
                for candidate in candidates {
                    if self.reachable(&candidate.address).await {
                        info!(endpoint = %candidate.address, "Higher-ranked endpoint reachable again, failing back");
                        self.failover.mark_healthy(&candidate.address)?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
