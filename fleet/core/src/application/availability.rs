// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Availability Service
//!
//! Keeps the per-resource UP/DOWN intervals and reacts to agents going quiet.
//! An agent whose last availability report is older than
//! `availability.suspect_agent_threshold` is presumed dead: all of its
//! resources are marked DOWN in one bulk update and the agent is flagged as
//! backfilled until it reconnects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::interval_trigger::IntervalJob;
use crate::domain::agent_service::DiscoveryAgentService;
use crate::domain::availability::{AvailabilityRecord, AvailabilityType};
use crate::domain::error::FleetError;
use crate::domain::events::InventoryEvent;
use crate::domain::repository::{AgentRepository, AvailabilityRepository};
use crate::domain::resource::{AgentId, ResourceId};
use crate::infrastructure::event_bus::EventBus;

/// One entry of an agent's availability report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAvailability {
    pub resource_id: ResourceId,
    pub avail_type: AvailabilityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub agent_id: AgentId,
    #[serde(default)]
    pub full_report: bool,
    pub resources: Vec<ResourceAvailability>,
}

pub struct AvailabilityService {
    availability: Arc<dyn AvailabilityRepository>,
    agents: Arc<dyn AgentRepository>,
    discovery: Arc<dyn DiscoveryAgentService>,
    event_bus: EventBus,
}

impl AvailabilityService {
    pub fn new(
        availability: Arc<dyn AvailabilityRepository>,
        agents: Arc<dyn AgentRepository>,
        discovery: Arc<dyn DiscoveryAgentService>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            availability,
            agents,
            discovery,
            event_bus,
        }
    }

    /// Mark every resource owned by `agent` DOWN; returns how many changed.
    pub async fn mark_resources_down_for_agent(&self, agent: AgentId) -> Result<u64, FleetError> {
        let now = Utc::now();
        let changed = self.availability.mark_down_for_agent(agent, now).await?;
        info!(agent = %agent, changed, "Marked agent resources DOWN");
        self.event_bus.publish_inventory_event(InventoryEvent::AgentResourcesMarkedDown {
            agent_id: agent,
            changed,
            marked_at: now,
        });
        Ok(changed)
    }

    pub async fn record(
        &self,
        resource: ResourceId,
        avail_type: AvailabilityType,
        at: DateTime<Utc>,
    ) -> Result<bool, FleetError> {
        Ok(self.availability.record(resource, avail_type, at).await?)
    }

    pub async fn current(&self, resource: ResourceId) -> Result<Option<AvailabilityRecord>, FleetError> {
        Ok(self.availability.current(resource).await?)
    }

    /// Apply an availability report sent by an agent.
    pub async fn process_report(&self, report: &AvailabilityReport) -> Result<usize, FleetError> {
        let now = Utc::now();
        let Some(agent) = self.agents.find_by_id(report.agent_id).await? else {
            return Err(FleetError::NotFound(format!("agent [{}]", report.agent_id)));
        };

        let mut changed = 0;
        for entry in &report.resources {
            if self.availability.record(entry.resource_id, entry.avail_type, now).await? {
                changed += 1;
            }
        }
        self.agents.record_availability_report(agent.id, now).await?;
        if agent.backfilled {
            self.agents.set_backfilled(agent.id, false).await?;
            debug!(agent = %agent.id, "Backfilled agent reported again");
        }
        debug!(agent = %agent.id, entries = report.resources.len(), changed, full = report.full_report, "Processed availability report");
        Ok(changed)
    }

    /// Mark silent agents' resources DOWN; returns the agents backfilled.
    pub async fn check_for_suspect_agents(&self, threshold: Duration) -> Result<Vec<AgentId>, FleetError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| FleetError::Protocol(format!("invalid suspect threshold: {}", e)))?;
        let silent = self.agents.find_silent_since(Utc::now() - threshold).await?;

        let mut backfilled = Vec::with_capacity(silent.len());
        for agent in silent {
            warn!(
                agent = %agent.id,
                name = %agent.name,
                last_report = ?agent.last_availability_report,
                "Agent is suspect, backfilling its resources DOWN"
            );
            self.mark_resources_down_for_agent(agent.id).await?;
            self.agents.set_backfilled(agent.id, true).await?;
            backfilled.push(agent.id);
        }
        Ok(backfilled)
    }

    /// Clear the backfilled flag and ask the agent to report everything again.
    pub async fn agent_reconnected(&self, agent: AgentId) -> Result<(), FleetError> {
        self.agents.set_backfilled(agent, false).await?;
        if let Err(e) = self.discovery.request_full_availability_report(agent).await {
            warn!(agent = %agent, "Failed to request full availability report: {}", e);
        }
        Ok(())
    }
}

pub struct SuspectAgentJob {
    service: Arc<AvailabilityService>,
    threshold: Duration,
}

impl SuspectAgentJob {
    pub fn new(service: Arc<AvailabilityService>, threshold: Duration) -> Self {
        Self { service, threshold }
    }
}

#[async_trait]
impl IntervalJob for SuspectAgentJob {
    fn name(&self) -> &str {
        "suspect-agent-check"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.service.check_for_suspect_agents(self.threshold).await?;
        Ok(())
    }
}
