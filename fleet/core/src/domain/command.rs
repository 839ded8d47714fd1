// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Wire Contract
//!
//! A [`Command`] is a self-contained value: everything needed to deliver it
//! again after a restart is inside the struct, so guaranteed commands can be
//! spooled as JSON and replayed. The command id is the correlation key that
//! ties a [`CommandResponse`] back to its request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::error::{ErrorInfo, ErrorKind, FleetError};

/// Well-known command types understood by the command ingress.
pub mod command_types {
    pub const PING: &str = "ping";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const GET_FAILOVER_LIST: &str = "get_failover_list";
    pub const CREATE_RESOURCE: &str = "create_resource";
    pub const DELETE_RESOURCE: &str = "delete_resource";
    pub const REMOVE_RESOURCE: &str = "remove_resource";
    pub const REQUEST_FULL_AVAILABILITY_REPORT: &str = "request_full_availability_report";
    pub const AVAILABILITY_REPORT: &str = "availability_report";
    pub const COMPLETE_CREATE_RESOURCE: &str = "complete_create_resource";
    pub const COMPLETE_DELETE_RESOURCE: &str = "complete_delete_resource";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-command delivery settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Overrides the sender's default timeout.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Subject to the sender's send throttle.
    #[serde(default)]
    pub send_throttled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub requires_guarantee: bool,
    /// Explicit endpoint; `None` means the sender's current failover target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_endpoint: Option<String>,
    #[serde(default)]
    pub config: CommandConfig,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(command_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: CommandId::new(),
            command_type: command_type.into(),
            payload,
            requires_guarantee: false,
            target_endpoint: None,
            config: CommandConfig::default(),
            created_at: Utc::now(),
        }
    }

    /// Build a command whose payload is any serializable request value.
    pub fn with_payload<T: Serialize>(
        command_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, FleetError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| FleetError::Protocol(format!("failed to encode payload: {}", e)))?;
        Ok(Self::new(command_type, value))
    }

    pub fn guaranteed(mut self) -> Self {
        self.requires_guarantee = true;
        self
    }

    pub fn to_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.target_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn send_throttled(mut self) -> Self {
        self.config.send_throttled = true;
        self
    }

    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, FleetError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FleetError::Protocol(format!(
                "malformed payload for command type '{}': {}",
                self.command_type, e
            ))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FleetError> {
        serde_json::to_vec(self)
            .map_err(|e| FleetError::Protocol(format!("failed to serialize command {}: {}", self.id, e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FleetError> {
        serde_json::from_slice(bytes)
            .map_err(|e| FleetError::Protocol(format!("failed to deserialize spooled command: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl CommandResponse {
    pub fn ok(command_id: CommandId, result: serde_json::Value) -> Self {
        Self {
            command_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn empty(command_id: CommandId) -> Self {
        Self {
            command_id,
            success: true,
            result: None,
            error: None,
        }
    }

    pub fn failed(command_id: CommandId, error: ErrorInfo) -> Self {
        Self {
            command_id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_error(command_id: CommandId, err: &FleetError) -> Self {
        Self::failed(command_id, ErrorInfo::from(err))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Turn a failed response into the error it carries.
    pub fn into_result(self, endpoint: &str) -> Result<Self, FleetError> {
        if self.success {
            return Ok(self);
        }
        Err(match self.error {
            Some(info) => info.into_fleet_error(endpoint),
            None => FleetError::Protocol(format!(
                "{} failed command {} without an error",
                endpoint, self.command_id
            )),
        })
    }

    pub fn decode_result<T: serde::de::DeserializeOwned>(&self) -> Result<T, FleetError> {
        let value = self.result.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
            .map_err(|e| FleetError::Protocol(format!("malformed result for {}: {}", self.command_id, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spooled_command_restores_identity_and_config() {
        let command = Command::new(command_types::COMPLETE_CREATE_RESOURCE, json!({"request_id": 7}))
            .guaranteed()
            .with_timeout(Duration::from_secs(30))
            .send_throttled();

        let bytes = command.to_bytes().unwrap();
        let restored = Command::from_bytes(&bytes).unwrap();

        assert_eq!(restored.id, command.id);
        assert!(restored.requires_guarantee);
        assert_eq!(restored.config.timeout, Some(Duration::from_secs(30)));
        assert!(restored.config.send_throttled);
    }

    #[test]
    fn test_decode_payload_reports_protocol_error() {
        let command = Command::new("ping", json!("not an object"));
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Expected {
            value: u32,
        }
        let err = command.decode_payload::<Expected>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_truncated_bytes_fail_to_decode() {
        let command = Command::new("ping", json!({}));
        let bytes = command.to_bytes().unwrap();
        assert!(Command::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
