// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Command Transport
//!
//! `Transport` over plain HTTP/JSON, talking to the command ingress of a
//! remote node (`crate::presentation::commands`).
//!
//! # Endpoints
//!
//! - `POST {endpoint}/v1/commands` - deliver one command, returns its `CommandResponse`
//! - `GET {endpoint}/v1/ping` - liveness check
//!
//! # Error mapping
//!
//! - connect/send failures → `FleetError::Transport`
//! - client deadline → `FleetError::Timeout`
//! - non-2xx status, undecodable body, correlation mismatch → `FleetError::Protocol`

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::domain::command::{Command, CommandResponse};
use crate::domain::error::FleetError;
use crate::domain::transport::Transport;

pub const COMMANDS_PATH: &str = "/v1/commands";
pub const PING_PATH: &str = "/v1/ping";

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }

    fn map_send_error(endpoint: &str, timeout: Duration, err: reqwest::Error) -> FleetError {
        if err.is_timeout() {
            FleetError::Timeout(timeout)
        } else if err.is_decode() {
            FleetError::Protocol(format!("undecodable response from {}: {}", endpoint, err))
        } else {
            FleetError::transport(endpoint, err)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandResponse, FleetError> {
        let url = Self::build_url(endpoint, COMMANDS_PATH);
        trace!(command_id = %command.id, command_type = %command.command_type, %url, "Sending command");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(command)
            .send()
            .await
            .map_err(|e| Self::map_send_error(endpoint, timeout, e))?;

        match response.status() {
            StatusCode::OK => {}
            status => {
                let body = response.text().await.unwrap_or_else(|_| format!("HTTP {}", status));
                return Err(FleetError::Protocol(format!(
                    "{} answered {} for command {}: {}",
                    endpoint, status, command.id, body
                )));
            }
        }

        let reply: CommandResponse = response
            .json()
            .await
            .map_err(|e| Self::map_send_error(endpoint, timeout, e))?;

        if reply.command_id != command.id {
            return Err(FleetError::Protocol(format!(
                "response correlation id {} does not match command {}",
                reply.command_id, command.id
            )));
        }
        Ok(reply)
    }

    async fn ping(&self, endpoint: &str, timeout: Duration) -> Result<Duration, FleetError> {
        let url = Self::build_url(endpoint, PING_PATH);
        let started = Instant::now();

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(endpoint, timeout, e))?;

        if !response.status().is_success() {
            return Err(FleetError::Protocol(format!(
                "{} answered {} to ping",
                endpoint,
                response.status()
            )));
        }
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_tolerates_trailing_slash() {
        assert_eq!(
            HttpTransport::build_url("http://server:7080/", COMMANDS_PATH),
            "http://server:7080/v1/commands"
        );
        assert_eq!(
            HttpTransport::build_url("http://server:7080", PING_PATH),
            "http://server:7080/v1/ping"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let transport = HttpTransport::new().unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let err = transport
            .ping("http://127.0.0.1:9", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Transport { .. } | FleetError::Timeout(_)));
    }
}
