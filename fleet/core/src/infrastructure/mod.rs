// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_client;
pub mod db;
pub mod event_bus;
pub mod http_transport;
pub mod job_lock;
pub mod repositories;
pub mod spool;

pub use agent_client::CommandAgentClient;
pub use event_bus::{EventBus, FleetEvent};
pub use http_transport::HttpTransport;
pub use repositories::InMemoryFleetStore;
pub use spool::{FileSpool, InMemorySpool};
