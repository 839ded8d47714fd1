// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Ingress
//!
//! Receiving end of [`crate::infrastructure::http_transport::HttpTransport`].
//! Every inbound command is routed by its `command_type` to a registered
//! [`CommandHandler`]; the handler's value or error is wrapped into the
//! `CommandResponse` that travels back to the sender.
//!
//! | Role | Command types |
//! |------|---------------|
//! | both | `ping` |
//! | server | `heartbeat`, `get_failover_list`, `complete_create_resource`, `complete_delete_resource`, `availability_report` |
//! | agent | `create_resource`, `delete_resource`, `remove_resource`, `request_full_availability_report` |

use async_trait::async_trait;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::agent_inventory::AgentInventory;
use crate::application::availability::{AvailabilityReport, AvailabilityService};
use crate::application::discovery::{Heartbeat, MembershipSource};
use crate::application::lifecycle_coordinator::ResourceFactoryRemote;
use crate::domain::agent_service::{
    CreateResourceRequest, CreateResourceResponse, DeleteResourceRequest, DeleteResourceResponse,
    RemoveResourceRequest,
};
use crate::domain::command::{command_types, Command, CommandResponse};
use crate::domain::error::{ErrorInfo, ErrorKind, FleetError};
use crate::infrastructure::http_transport::{COMMANDS_PATH, PING_PATH};

/// Handles one command type.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> Result<serde_json::Value, FleetError>;
}

/// Registry from command type to handler.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandDispatcher {
    pub fn new(node_id: impl Into<String>) -> Self {
        let mut dispatcher = Self::default();
        dispatcher.register(command_types::PING, Arc::new(PingHandler { node_id: node_id.into() }));
        dispatcher
    }

    /// Handlers a server node answers.
    pub fn for_server(
        node_id: impl Into<String>,
        membership: Arc<MembershipSource>,
        lifecycle: Arc<dyn ResourceFactoryRemote>,
        availability: Arc<AvailabilityService>,
    ) -> Self {
        let mut dispatcher = Self::new(node_id);
        dispatcher
            .register(command_types::HEARTBEAT, Arc::new(HeartbeatHandler(membership.clone())))
            .register(command_types::GET_FAILOVER_LIST, Arc::new(FailoverListHandler(membership)))
            .register(command_types::COMPLETE_CREATE_RESOURCE, Arc::new(CompleteCreateHandler(lifecycle.clone())))
            .register(command_types::COMPLETE_DELETE_RESOURCE, Arc::new(CompleteDeleteHandler(lifecycle)))
            .register(command_types::AVAILABILITY_REPORT, Arc::new(AvailabilityReportHandler(availability)));
        dispatcher
    }

    /// Handlers an agent node answers.
    pub fn for_agent(node_id: impl Into<String>, inventory: Arc<AgentInventory>) -> Self {
        let mut dispatcher = Self::new(node_id);
        let handler = Arc::new(AgentInventoryHandler(inventory));
        for command_type in [
            command_types::CREATE_RESOURCE,
            command_types::DELETE_RESOURCE,
            command_types::REMOVE_RESOURCE,
            command_types::REQUEST_FULL_AVAILABILITY_REPORT,
        ] {
            dispatcher.register(command_type, handler.clone());
        }
        dispatcher
    }

    /// Register or replace the handler for `command_type`.
    pub fn register(&mut self, command_type: &str, handler: Arc<dyn CommandHandler>) -> &mut Self {
        self.handlers.insert(command_type.to_string(), handler);
        self
    }

    pub fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    pub async fn dispatch(&self, command: &Command) -> CommandResponse {
        let Some(handler) = self.handlers.get(&command.command_type) else {
            warn!(command_id = %command.id, command_type = %command.command_type, "Unknown command type");
            return CommandResponse::failed(
                command.id,
                ErrorInfo::new(
                    ErrorKind::Protocol,
                    format!("unknown command type '{}'", command.command_type),
                ),
            );
        };

        debug!(command_id = %command.id, command_type = %command.command_type, "Dispatching command");
        match handler.handle(command).await {
            Ok(serde_json::Value::Null) => CommandResponse::empty(command.id),
            Ok(result) => CommandResponse::ok(command.id, result),
            Err(e) => {
                warn!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    "Command handler failed: {}",
                    e
                );
                CommandResponse::from_error(command.id, &e)
            }
        }
    }
}

/// Router serving `POST /v1/commands` and `GET /v1/ping`.
pub fn command_router(dispatcher: Arc<CommandDispatcher>) -> Router {
    Router::new()
        .route(COMMANDS_PATH, post(receive_command))
        .route(PING_PATH, get(ping))
        .with_state(dispatcher)
}

async fn receive_command(
    State(dispatcher): State<Arc<CommandDispatcher>>,
    Json(command): Json<Command>,
) -> Json<CommandResponse> {
    Json(dispatcher.dispatch(&command).await)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

struct PingHandler {
    node_id: String,
}

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _command: &Command) -> Result<serde_json::Value, FleetError> {
        Ok(json!({ "node_id": self.node_id }))
    }
}

struct HeartbeatHandler(Arc<MembershipSource>);

#[async_trait]
impl CommandHandler for HeartbeatHandler {
    async fn handle(&self, command: &Command) -> Result<serde_json::Value, FleetError> {
        let heartbeat: Heartbeat = command.decode_payload()?;
        self.0.record_heartbeat(&heartbeat);
        Ok(serde_json::Value::Null)
    }
}

struct FailoverListHandler(Arc<MembershipSource>);

#[async_trait]
impl CommandHandler for FailoverListHandler {
    async fn handle(&self, _command: &Command) -> Result<serde_json::Value, FleetError> {
        serde_json::to_value(self.0.current_list())
            .map_err(|e| FleetError::Protocol(format!("failed to encode failover list: {}", e)))
    }
}

struct CompleteCreateHandler(Arc<dyn ResourceFactoryRemote>);

#[async_trait]
impl CommandHandler for CompleteCreateHandler {
    async fn handle(&self, command: &Command) -> Result<serde_json::Value, FleetError> {
        let response: CreateResourceResponse = command.decode_payload()?;
        self.0.complete_create_resource(response).await?;
        Ok(serde_json::Value::Null)
    }
}

struct CompleteDeleteHandler(Arc<dyn ResourceFactoryRemote>);

#[async_trait]
impl CommandHandler for CompleteDeleteHandler {
    async fn handle(&self, command: &Command) -> Result<serde_json::Value, FleetError> {
        let response: DeleteResourceResponse = command.decode_payload()?;
        self.0.complete_delete_resource(response).await?;
        Ok(serde_json::Value::Null)
    }
}

struct AvailabilityReportHandler(Arc<AvailabilityService>);

#[async_trait]
impl CommandHandler for AvailabilityReportHandler {
    async fn handle(&self, command: &Command) -> Result<serde_json::Value, FleetError> {
        let report: AvailabilityReport = command.decode_payload()?;
        let recorded = self.0.process_report(&report).await?;
        Ok(json!({ "recorded": recorded }))
    }
}

struct AgentInventoryHandler(Arc<AgentInventory>);

#[async_trait]
impl CommandHandler for AgentInventoryHandler {
    async fn handle(&self, command: &Command) -> Result<serde_json::Value, FleetError> {
        match command.command_type.as_str() {
            command_types::CREATE_RESOURCE => {
                let request: CreateResourceRequest = command.decode_payload()?;
                self.0.accept_create(request);
                Ok(serde_json::Value::Null)
            }
            command_types::DELETE_RESOURCE => {
                let request: DeleteResourceRequest = command.decode_payload()?;
                self.0.accept_delete(request);
                Ok(serde_json::Value::Null)
            }
            command_types::REMOVE_RESOURCE => {
                let request: RemoveResourceRequest = command.decode_payload()?;
                let removed = self.0.remove_resource(request.resource_id);
                Ok(json!({ "removed": removed }))
            }
            command_types::REQUEST_FULL_AVAILABILITY_REPORT => {
                let resources = self.0.send_full_report()?;
                Ok(json!({ "resources": resources }))
            }
            other => Err(FleetError::Protocol(format!("agent cannot handle '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent_service::CreateDeleteStatus;
    use crate::domain::lifecycle::LifecycleHistoryId;
    use crate::domain::node_config::{ConfigHandle, NodeConfigManifest};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingRemote {
        creates: Mutex<Vec<CreateResourceResponse>>,
    }

    #[async_trait]
    impl ResourceFactoryRemote for RecordingRemote {
        async fn complete_create_resource(&self, response: CreateResourceResponse) -> Result<(), FleetError> {
            self.creates.lock().push(response);
            Ok(())
        }

        async fn complete_delete_resource(&self, _response: DeleteResourceResponse) -> Result<(), FleetError> {
            Err(FleetError::NotFound("no such request".into()))
        }
    }

    fn dispatcher_with(remote: Arc<RecordingRemote>, membership: Arc<MembershipSource>) -> CommandDispatcher {
        let mut dispatcher = CommandDispatcher::new("server-1");
        dispatcher
            .register(command_types::HEARTBEAT, Arc::new(HeartbeatHandler(membership)))
            .register(command_types::COMPLETE_CREATE_RESOURCE, Arc::new(CompleteCreateHandler(remote.clone())))
            .register(command_types::COMPLETE_DELETE_RESOURCE, Arc::new(CompleteDeleteHandler(remote)));
        dispatcher
    }

    fn membership() -> Arc<MembershipSource> {
        Arc::new(MembershipSource::new(Arc::new(ConfigHandle::new(
            NodeConfigManifest::default(),
            None,
        ))))
    }

    #[tokio::test]
    async fn test_unknown_command_type_is_protocol_failure() {
        let dispatcher = CommandDispatcher::new("node");
        let command = Command::new("reboot_universe", json!({}));
        let response = dispatcher.dispatch(&command).await;
        assert!(!response.success);
        assert_eq!(response.command_id, command.id);
        assert_eq!(response.error_kind(), Some(ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn test_handler_errors_keep_their_kind() {
        let dispatcher = dispatcher_with(Arc::new(RecordingRemote::default()), membership());
        let response = DeleteResourceResponse {
            request_id: LifecycleHistoryId::new(),
            status: CreateDeleteStatus::Success,
            error_message: None,
        };
        let command = Command::with_payload(command_types::COMPLETE_DELETE_RESOURCE, &response).unwrap();
        let reply = dispatcher.dispatch(&command).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::NotFound));

        let malformed = Command::new(command_types::COMPLETE_CREATE_RESOURCE, json!({ "status": 3 }));
        let reply = dispatcher.dispatch(&malformed).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn test_router_delivers_completion_and_heartbeat() {
        let remote = Arc::new(RecordingRemote::default());
        let membership = membership();
        let router = command_router(Arc::new(dispatcher_with(remote.clone(), membership.clone())));

        let completion = CreateResourceResponse {
            request_id: LifecycleHistoryId::new(),
            resource_key: Some("db:orders".into()),
            resource_name: Some("orders".into()),
            status: CreateDeleteStatus::Success,
            error_message: None,
        };
        let command = Command::with_payload(command_types::COMPLETE_CREATE_RESOURCE, &completion).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri(COMMANDS_PATH)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&command).unwrap()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: CommandResponse = serde_json::from_slice(&body).unwrap();
        assert!(reply.success);
        assert_eq!(reply.command_id, command.id);
        assert_eq!(remote.creates.lock().len(), 1);

        let heartbeat = Heartbeat {
            node_id: "server-2".into(),
            address: "http://server-2:7080".into(),
            rank: 1,
            sent_at: Utc::now(),
        };
        let command = Command::with_payload(command_types::HEARTBEAT, &heartbeat).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri(COMMANDS_PATH)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&command).unwrap()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(membership.member_count(), 1);

        let request = Request::builder().uri(PING_PATH).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
