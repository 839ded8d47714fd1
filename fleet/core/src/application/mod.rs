// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_inventory;
pub mod availability;
pub mod discovery;
pub mod failover;
pub mod interval_trigger;
pub mod lifecycle_coordinator;
pub mod sender;
pub mod tree_deleter;

// Re-export services for convenience
pub use agent_inventory::{AcceptAllPlugin, AgentInventory, ResourcePlugin};
pub use availability::{AvailabilityService, SuspectAgentJob};
pub use discovery::{MembershipSource, ServerDiscovery};
pub use failover::{FailoverManager, HealthCheckJob};
pub use interval_trigger::{IntervalJob, IntervalTrigger, JobLock, LocalJobLock};
pub use lifecycle_coordinator::{
    ResourceFactoryInternal, ResourceFactoryRemote, ResourceLifecycleCoordinator, TimeoutSweepJob,
};
pub use sender::{CommandSender, SenderMetricsSnapshot};
pub use tree_deleter::ResourceTreeDeleter;
