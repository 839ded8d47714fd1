// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::command::{Command, CommandResponse};
use crate::domain::error::FleetError;

/// Point-to-point request/response channel to a named endpoint.
///
/// Implementations translate their own failures: unreachable peers become
/// `FleetError::Transport`, expired deadlines `FleetError::Timeout`, and
/// malformed or mismatched replies `FleetError::Protocol`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandResponse, FleetError>;

    /// Round-trip latency of a lightweight liveness ping.
    async fn ping(&self, endpoint: &str, timeout: Duration) -> Result<Duration, FleetError>;
}
