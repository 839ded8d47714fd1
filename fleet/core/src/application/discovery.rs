// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Server Discovery
//!
//! Periodically collects failover list proposals from one or more
//! [`EndpointSource`]s and hands them to the [`FailoverManager`], which keeps
//! only strictly newer versions.
//!
//! | Source | Role | Version |
//! |--------|------|---------|
//! | `StaticEndpointSource` | any | configuration file modification time |
//! | `ServerPollingSource` | agent | whatever the server reports |
//! | `MembershipSource` | server | clock-based, bumped on every membership or config change |
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Failover list proposals, heartbeat membership

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::failover::FailoverManager;
use crate::application::interval_trigger::IntervalJob;
use crate::application::sender::CommandSender;
use crate::domain::command::{command_types, Command};
use crate::domain::error::FleetError;
use crate::domain::failover::{next_list_version, FailoverList, ServerEndpoint};
use crate::domain::node_config::ConfigHandle;

#[async_trait]
pub trait EndpointSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current proposal, or `None` when the source has nothing to offer.
    async fn fetch(&self) -> Result<Option<FailoverList>, FleetError>;
}

/// Endpoints from the configuration file.
pub struct StaticEndpointSource {
    config: Arc<ConfigHandle>,
}

impl StaticEndpointSource {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EndpointSource for StaticEndpointSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Option<FailoverList>, FleetError> {
        let snapshot = self.config.snapshot();
        let list = snapshot.spec.failover.to_failover_list(self.config.list_version());
        Ok((!list.is_empty()).then_some(list))
    }
}

/// Asks the current server for the cluster's list.
pub struct ServerPollingSource {
    sender: Arc<CommandSender>,
    timeout: Duration,
}

impl ServerPollingSource {
    pub fn new(sender: Arc<CommandSender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }
}

#[async_trait]
impl EndpointSource for ServerPollingSource {
    fn name(&self) -> &str {
        "server-polling"
    }

    async fn fetch(&self) -> Result<Option<FailoverList>, FleetError> {
        let command = Command::new(command_types::GET_FAILOVER_LIST, serde_json::json!({}));
        let response = self.sender.send_sync(command, self.timeout).await?;
        if !response.success {
            let message = response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "server refused get_failover_list".to_string());
            return Err(FleetError::Protocol(message));
        }
        let list: FailoverList = response.decode_result()?;
        Ok((!list.is_empty()).then_some(list))
    }
}

/// Liveness announcement exchanged between servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub address: String,
    pub rank: u32,
    pub sent_at: DateTime<Utc>,
}

struct Member {
    address: String,
    rank: u32,
    last_seen: Instant,
}

struct Membership {
    members: HashMap<String, Member>,
    version: u64,
    seen_generation: u64,
}

/// Heartbeat-driven view of the live server set, merged with the
/// statically configured endpoints.
pub struct MembershipSource {
    config: Arc<ConfigHandle>,
    member_timeout: Duration,
    state: Mutex<Membership>,
}

impl MembershipSource {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        let member_timeout = config.snapshot().spec.discovery.member_timeout;
        let seen_generation = config.generation();
        Self {
            config,
            member_timeout,
            state: Mutex::new(Membership {
                members: HashMap::new(),
                version: next_list_version(0),
                seen_generation,
            }),
        }
    }

    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut state = self.state.lock();
        let changed = match state.members.get_mut(&heartbeat.node_id) {
            Some(member) => {
                member.last_seen = Instant::now();
                let moved = member.address != heartbeat.address || member.rank != heartbeat.rank;
                member.address = heartbeat.address.clone();
                member.rank = heartbeat.rank;
                moved
            }
            None => {
                state.members.insert(
                    heartbeat.node_id.clone(),
                    Member {
                        address: heartbeat.address.clone(),
                        rank: heartbeat.rank,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        };
        if changed {
            state.version = next_list_version(state.version);
            info!(
                node_id = %heartbeat.node_id,
                address = %heartbeat.address,
                version = state.version,
                "Server membership changed"
            );
        }
    }

    fn expire(&self, state: &mut Membership) {
        let timeout = self.member_timeout;
        let before = state.members.len();
        state.members.retain(|node_id, member| {
            let alive = member.last_seen.elapsed() < timeout;
            if !alive {
                warn!(node_id = %node_id, address = %member.address, "Server member expired");
            }
            alive
        });
        if state.members.len() != before {
            state.version = next_list_version(state.version);
        }
    }

    /// The list this server hands out for `get_failover_list`.
    pub fn current_list(&self) -> FailoverList {
        let config = self.config.snapshot();
        let generation = self.config.generation();
        let mut state = self.state.lock();
        self.expire(&mut state);
        if generation != state.seen_generation {
            state.seen_generation = generation;
            state.version = next_list_version(state.version);
        }

        let mut endpoints: Vec<ServerEndpoint> = config
            .spec
            .failover
            .endpoints
            .iter()
            .map(|e| ServerEndpoint::new(e.address.clone(), e.rank))
            .collect();
        if let Some(own) = &config.spec.node.advertise_address {
            if !endpoints.iter().any(|e| &e.address == own) {
                endpoints.push(ServerEndpoint::new(own.clone(), 0));
            }
        }
        for member in state.members.values() {
            if !endpoints.iter().any(|e| e.address == member.address) {
                endpoints.push(ServerEndpoint::new(member.address.clone(), member.rank));
            }
        }
        FailoverList::new(state.version, endpoints)
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }
}

#[async_trait]
impl EndpointSource for MembershipSource {
    fn name(&self) -> &str {
        "membership"
    }

    async fn fetch(&self) -> Result<Option<FailoverList>, FleetError> {
        let list = self.current_list();
        Ok((!list.is_empty()).then_some(list))
    }
}

/// Polls every source and proposes what they return.
pub struct ServerDiscovery {
    sources: Vec<Arc<dyn EndpointSource>>,
    failover: Arc<FailoverManager>,
}

impl ServerDiscovery {
    pub fn new(sources: Vec<Arc<dyn EndpointSource>>, failover: Arc<FailoverManager>) -> Self {
        Self { sources, failover }
    }
}

#[async_trait]
impl IntervalJob for ServerDiscovery {
    fn name(&self) -> &str {
        "server-discovery"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        for source in &self.sources {
            match source.fetch().await {
                Ok(Some(list)) => {
                    let version = list.version;
                    if self.failover.propose(list) {
                        info!(source = source.name(), version, "Accepted failover list proposal");
                    }
                }
                Ok(None) => debug!(source = source.name(), "Endpoint source had no proposal"),
                Err(e) => warn!(source = source.name(), "Endpoint source failed: {}", e),
            }
        }
        Ok(())
    }
}

/// Announces this server to its configured peers.
pub struct HeartbeatJob {
    sender: Arc<CommandSender>,
    config: Arc<ConfigHandle>,
    timeout: Duration,
}

impl HeartbeatJob {
    pub fn new(sender: Arc<CommandSender>, config: Arc<ConfigHandle>, timeout: Duration) -> Self {
        Self {
            sender,
            config,
            timeout,
        }
    }
}

#[async_trait]
impl IntervalJob for HeartbeatJob {
    fn name(&self) -> &str {
        "server-heartbeat"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let config = self.config.snapshot();
        let spec = &config.spec;
        let address = spec
            .node
            .advertise_address
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", spec.api.bind_address, spec.api.port));
        let rank = spec
            .failover
            .endpoints
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.rank)
            .unwrap_or(u32::MAX);
        let heartbeat = Heartbeat {
            node_id: spec.node.id.clone(),
            address,
            rank,
            sent_at: Utc::now(),
        };

        for peer in &spec.discovery.peers {
            let command = Command::with_payload(command_types::HEARTBEAT, &heartbeat)?.to_endpoint(peer.clone());
            if let Err(e) = self.sender.send_sync(command, self.timeout).await {
                debug!(peer = %peer, "Heartbeat not delivered: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node_config::{EndpointConfig, NodeConfigManifest, NodeRole};
    use crate::infrastructure::event_bus::EventBus;

    fn server_config(member_timeout: Duration) -> Arc<ConfigHandle> {
        let mut manifest = NodeConfigManifest::default();
        manifest.spec.node.role = NodeRole::Server;
        manifest.spec.node.advertise_address = Some("http://s1:7080".to_string());
        manifest.spec.failover.endpoints = vec![EndpointConfig {
            address: "http://s1:7080".to_string(),
            rank: 0,
        }];
        manifest.spec.discovery.member_timeout = member_timeout;
        Arc::new(ConfigHandle::new(manifest, None))
    }

    fn heartbeat(node: &str, address: &str, rank: u32) -> Heartbeat {
        Heartbeat {
            node_id: node.to_string(),
            address: address.to_string(),
            rank,
            sent_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_version_bumps_on_join_and_expiry() {
        let source = MembershipSource::new(server_config(Duration::from_secs(30)));
        let initial = source.current_list();
        assert_eq!(initial.endpoints().len(), 1);

        source.record_heartbeat(&heartbeat("s2", "http://s2:7080", 1));
        let joined = source.current_list();
        assert!(joined.version > initial.version);
        assert_eq!(joined.endpoints().len(), 2);

        // A repeated heartbeat is not a membership change.
        source.record_heartbeat(&heartbeat("s2", "http://s2:7080", 1));
        assert_eq!(source.current_list().version, joined.version);

        tokio::time::advance(Duration::from_secs(31)).await;
        let expired = source.current_list();
        assert!(expired.version > joined.version);
        assert_eq!(expired.endpoints().len(), 1);
        assert_eq!(source.member_count(), 0);
    }

    #[tokio::test]
    async fn test_discovery_proposes_newer_lists_only() {
        let config = server_config(Duration::from_secs(30));
        let failover = Arc::new(FailoverManager::new(
            FailoverList::new(0, vec![ServerEndpoint::new("http://old:7080", 0)]),
            &config.snapshot().spec.failover,
            EventBus::new(16),
        ));
        let membership = Arc::new(MembershipSource::new(config.clone()));
        let sources: Vec<Arc<dyn EndpointSource>> = vec![
            membership.clone() as Arc<dyn EndpointSource>,
            Arc::new(StaticEndpointSource::new(config)) as Arc<dyn EndpointSource>,
        ];
        let discovery = ServerDiscovery::new(sources, failover.clone());

        discovery.run_once().await.unwrap();
        assert_eq!(failover.current_target().unwrap().address, "http://s1:7080");
        let version = failover.version();

        discovery.run_once().await.unwrap();
        assert_eq!(failover.version(), version);

        membership.record_heartbeat(&heartbeat("s2", "http://s2:7080", 1));
        discovery.run_once().await.unwrap();
        assert!(failover.version() > version);
        assert_eq!(failover.snapshot().endpoints().len(), 2);
    }
}
