// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Tether CLI

pub mod config;
pub mod daemon;
pub mod failover;
pub mod inventory;
pub mod sender;
pub mod spool;

pub use self::config::ConfigCommand;
pub use self::daemon::DaemonCommand;
pub use self::failover::FailoverCommand;
pub use self::inventory::{AgentCommand, LifecycleCommand, ResourceCommand};
pub use self::sender::SenderCommand;
pub use self::spool::SpoolCommand;
