// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Operator API
//!
//! Thin administrative wrappers over the node's sender, spool, failover
//! list and configuration, plus the SSE event stream.
//!
//! | Method | Path | Action |
//! |--------|------|--------|
//! | GET | `/health` | liveness and role |
//! | POST | `/v1/operator/sender/start` | start draining |
//! | POST | `/v1/operator/sender/stop` | stop draining (`{"graceful": bool}`) |
//! | GET | `/v1/operator/sender/metrics` | `SenderMetricsSnapshot` |
//! | GET | `/v1/operator/spool` | spooled commands, oldest first |
//! | GET | `/v1/operator/failover` | current failover list and target |
//! | POST | `/v1/operator/failover/{address}/healthy` | operator fail-back |
//! | POST | `/v1/operator/failover/{address}/unhealthy` | take an endpoint out |
//! | POST | `/v1/operator/ping` | ping an endpoint (default: current target) |
//! | POST | `/v1/operator/config/reload` | re-read the configuration file |
//! | GET | `/v1/operator/events` | `FleetEvent` stream (SSE) |
//!
//! Everything except `/health` is served to loopback connections only; the
//! listener is shared with agents and peer servers.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Request, State},
    http::{request::Parts, Extensions, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::application::sender::{CommandSender, SenderMetricsSnapshot};
use crate::domain::authorization::Caller;
use crate::domain::command::{Command, CommandId};
use crate::domain::error::{ErrorKind, FleetError};
use crate::domain::failover::{FailbackPolicy, ServerEndpoint};
use crate::domain::node_config::{ConfigHandle, NodeRole};
use crate::domain::spool::{SpoolEntry, SpoolUsage};
use crate::domain::transport::Transport;
use crate::infrastructure::event_bus::{EventBus, EventBusError, FleetEvent};
use crate::presentation::commands::{command_router, CommandDispatcher};
use crate::presentation::inventory::{inventory_router, InventoryState};

pub const USER_HEADER: &str = "x-tether-user";
pub const INVENTORY_MANAGER_HEADER: &str = "x-tether-inventory-manager";

pub struct OperatorState {
    pub config: Arc<ConfigHandle>,
    pub sender: Arc<CommandSender>,
    pub transport: Arc<dyn Transport>,
    pub event_bus: EventBus,
    pub started_at: Instant,
}

/// Full HTTP surface of a node: command ingress, operator routes and, on a
/// server, the inventory routes.
pub fn app(
    dispatcher: Arc<CommandDispatcher>,
    operator: Arc<OperatorState>,
    inventory: Option<Arc<InventoryState>>,
) -> Router {
    let mut router = command_router(dispatcher).merge(operator_router(operator));
    if let Some(inventory) = inventory {
        router = router.merge(inventory_router(inventory));
    }
    router.layer(TraceLayer::new_for_http())
}

pub fn operator_router(state: Arc<OperatorState>) -> Router {
    Router::new()
        .route("/v1/operator/sender/start", post(start_sender))
        .route("/v1/operator/sender/stop", post(stop_sender))
        .route("/v1/operator/sender/metrics", get(sender_metrics))
        .route("/v1/operator/spool", get(show_spool))
        .route("/v1/operator/failover", get(show_failover))
        .route("/v1/operator/failover/{address}/healthy", post(mark_healthy))
        .route("/v1/operator/failover/{address}/unhealthy", post(mark_unhealthy))
        .route("/v1/operator/ping", post(ping_endpoint))
        .route("/v1/operator/config/reload", post(reload_config))
        .route("/v1/operator/events", get(stream_events))
        .route_layer(middleware::from_fn(require_loopback))
        .route("/health", get(health))
        .with_state(state)
}

/// Whether the connection the request arrived on is a loopback one. Requires
/// the server to be run with `into_make_service_with_connect_info`.
pub fn is_loopback(extensions: &Extensions) -> bool {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .is_some_and(|ConnectInfo(peer)| peer.ip().is_loopback())
}

async fn require_loopback(request: Request, next: Next) -> Response {
    if is_loopback(request.extensions()) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "Refused operator request from a remote peer");
    ApiError::new(StatusCode::FORBIDDEN, "operator routes are only served to local connections").into_response()
}

/// JSON error body: `{"error": "...", "kind": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: Option<ErrorKind>,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: None,
            message: message.into(),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let status = match &err {
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Permission(_) => StatusCode::FORBIDDEN,
            FleetError::Protocol(_) => StatusCode::BAD_REQUEST,
            FleetError::PersistenceConflict(_) => StatusCode::CONFLICT,
            FleetError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Transport { .. } => StatusCode::BAD_GATEWAY,
            FleetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FleetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: Some(err.kind()),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message, "kind": self.kind }))).into_response()
    }
}

/// Caller identity taken from the `x-tether-user` and
/// `x-tether-inventory-manager` headers. A request without a user acts as
/// the local operator (`Caller::Overlord`) when it arrives over loopback and
/// is refused with 401 otherwise.
pub struct OperatorCaller(pub Caller);

impl<S: Send + Sync> FromRequestParts<S> for OperatorCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
        match header(USER_HEADER) {
            Some(name) => Ok(Self(Caller::user(
                name,
                header(INVENTORY_MANAGER_HEADER)
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            ))),
            None if is_loopback(&parts.extensions) => Ok(Self(Caller::Overlord)),
            None => Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                format!("request carries no {} identity", USER_HEADER),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderStateChange {
    pub changed: bool,
    pub sending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSenderRequest {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

fn default_graceful() -> bool {
    true
}

/// One spooled command as shown to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEntryView {
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    pub bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_endpoint: Option<String>,
}

impl SpoolEntryView {
    pub fn from_entry(entry: &SpoolEntry) -> Self {
        let command = Command::from_bytes(&entry.serialized_command).ok();
        Self {
            sequence: entry.sequence,
            enqueued_at: entry.enqueued_at,
            bytes: entry.serialized_command.len(),
            command_id: command.as_ref().map(|c| c.id),
            command_type: command.as_ref().map(|c| c.command_type.clone()),
            target_endpoint: command.and_then(|c| c.target_endpoint),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolView {
    pub usage: SpoolUsage,
    pub entries: Vec<SpoolEntryView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverView {
    pub version: u64,
    pub policy: FailbackPolicy,
    pub current_target: Option<ServerEndpoint>,
    pub endpoints: Vec<ServerEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub endpoint: String,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResult {
    pub generation: u64,
}

async fn health(State(state): State<Arc<OperatorState>>) -> Json<serde_json::Value> {
    let config = state.config.snapshot();
    let role = match config.spec.node.role {
        NodeRole::Agent => "agent",
        NodeRole::Server => "server",
    };
    Json(json!({
        "status": "healthy",
        "node_id": config.spec.node.id,
        "role": role,
        "sending": state.sender.is_sending(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn start_sender(State(state): State<Arc<OperatorState>>) -> Json<SenderStateChange> {
    let changed = state.sender.start();
    info!(changed, "Operator started command sender");
    Json(SenderStateChange {
        changed,
        sending: state.sender.is_sending(),
    })
}

async fn stop_sender(
    State(state): State<Arc<OperatorState>>,
    body: Option<Json<StopSenderRequest>>,
) -> Json<SenderStateChange> {
    let graceful = body.map(|Json(b)| b.graceful).unwrap_or(true);
    let changed = state.sender.stop(graceful).await;
    info!(changed, graceful, "Operator stopped command sender");
    Json(SenderStateChange {
        changed,
        sending: state.sender.is_sending(),
    })
}

async fn sender_metrics(State(state): State<Arc<OperatorState>>) -> Json<SenderMetricsSnapshot> {
    Json(state.sender.metrics())
}

async fn show_spool(State(state): State<Arc<OperatorState>>) -> Result<Json<SpoolView>, ApiError> {
    let spool = state.sender.spool();
    let entries = spool.replay_all().map_err(FleetError::from)?;
    Ok(Json(SpoolView {
        usage: spool.usage(),
        entries: entries.iter().map(SpoolEntryView::from_entry).collect(),
    }))
}

fn failover_view(sender: &CommandSender) -> FailoverView {
    let failover = sender.failover();
    let snapshot = failover.snapshot();
    FailoverView {
        version: snapshot.version,
        policy: failover.policy(),
        current_target: failover.current_target(),
        endpoints: snapshot.endpoints().to_vec(),
    }
}

async fn show_failover(State(state): State<Arc<OperatorState>>) -> Json<FailoverView> {
    Json(failover_view(&state.sender))
}

async fn mark_healthy(
    State(state): State<Arc<OperatorState>>,
    Path(address): Path<String>,
) -> Result<Json<FailoverView>, ApiError> {
    state.sender.failover().mark_healthy(&address)?;
    info!(%address, "Operator marked endpoint healthy");
    Ok(Json(failover_view(&state.sender)))
}

async fn mark_unhealthy(
    State(state): State<Arc<OperatorState>>,
    Path(address): Path<String>,
) -> Result<Json<FailoverView>, ApiError> {
    state.sender.failover().mark_unhealthy(&address)?;
    info!(%address, "Operator marked endpoint unhealthy");
    Ok(Json(failover_view(&state.sender)))
}

async fn ping_endpoint(
    State(state): State<Arc<OperatorState>>,
    body: Option<Json<PingRequest>>,
) -> Result<Json<PingResult>, ApiError> {
    let requested = body.and_then(|Json(b)| b.endpoint);
    let endpoint = match requested {
        Some(endpoint) => endpoint,
        None => state
            .sender
            .failover()
            .current_target()
            .map(|e| e.address)
            .ok_or_else(|| FleetError::NotFound("failover list is empty".to_string()))?,
    };
    let timeout = state.config.snapshot().spec.failover.ping_timeout;
    let latency = state.transport.ping(&endpoint, timeout).await.map_err(|e| {
        warn!(%endpoint, "Operator ping failed: {}", e);
        e
    })?;
    Ok(Json(PingResult {
        endpoint,
        latency_ms: latency.as_secs_f64() * 1000.0,
    }))
}

async fn reload_config(State(state): State<Arc<OperatorState>>) -> Result<Json<ReloadResult>, ApiError> {
    let generation = state
        .config
        .reload()
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", e)))?;
    Ok(Json(ReloadResult { generation }))
}

fn event_name(event: &FleetEvent) -> &'static str {
    match event {
        FleetEvent::Delivery(_) => "delivery",
        FleetEvent::Failover(_) => "failover",
        FleetEvent::Inventory(_) => "inventory",
    }
}

fn event_stream(event_bus: &EventBus) -> impl Stream<Item = Result<Event, axum::Error>> + Send + 'static {
    stream::unfold(event_bus.subscribe(), |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let sse = Event::default().event(event_name(&event)).json_data(&event);
                    return Some((sse, receiver));
                }
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
}

async fn stream_events(State(state): State<Arc<OperatorState>>) -> impl IntoResponse {
    Sse::new(event_stream(&state.event_bus)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::failover::FailoverManager;
    use crate::domain::command::CommandResponse;
    use crate::domain::events::DeliveryEvent;
    use crate::domain::failover::FailoverList;
    use crate::domain::node_config::{FailoverConfig, NodeConfigManifest, SenderConfig};
    use crate::infrastructure::spool::InMemorySpool;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct LocalTransport;

    #[async_trait]
    impl Transport for LocalTransport {
        async fn send(&self, _endpoint: &str, command: &Command, _timeout: Duration) -> Result<CommandResponse, FleetError> {
            Ok(CommandResponse::empty(command.id))
        }

        async fn ping(&self, endpoint: &str, _timeout: Duration) -> Result<Duration, FleetError> {
            if endpoint.contains("down") {
                return Err(FleetError::transport(endpoint, "connection refused"));
            }
            Ok(Duration::from_millis(3))
        }
    }

    fn state() -> Arc<OperatorState> {
        let event_bus = EventBus::new(64);
        let failover = Arc::new(FailoverManager::new(
            FailoverList::new(
                1,
                vec![
                    ServerEndpoint::new("http://a:7080", 0),
                    ServerEndpoint::new("http://b:7080", 1),
                ],
            ),
            &FailoverConfig::default(),
            event_bus.clone(),
        ));
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport);
        let sender = CommandSender::new(
            SenderConfig::default(),
            transport.clone(),
            failover,
            Arc::new(InMemorySpool::unbounded()),
            event_bus.clone(),
        );
        Arc::new(OperatorState {
            config: Arc::new(ConfigHandle::new(NodeConfigManifest::default(), None)),
            sender,
            transport,
            event_bus,
            started_at: Instant::now(),
        })
    }

    fn local_peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50_000))
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.extension(ConnectInfo(local_peer())).body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_sender_start_stop_is_idempotent() {
        let router = operator_router(state());

        let (status, body) = call(&router, "POST", "/v1/operator/sender/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        let (_, body) = call(&router, "POST", "/v1/operator/sender/start", None).await;
        assert_eq!(body["changed"], false);

        let (_, body) = call(&router, "POST", "/v1/operator/sender/stop", Some(json!({ "graceful": false }))).await;
        assert_eq!(body["changed"], true);
        assert_eq!(body["sending"], false);

        let (_, metrics) = call(&router, "GET", "/v1/operator/sender/metrics", None).await;
        assert_eq!(metrics["sending"], false);
    }

    #[tokio::test]
    async fn test_spool_lists_guaranteed_commands() {
        let state = state();
        let command = Command::new("complete_create_resource", json!({})).guaranteed();
        let id = command.id;
        state.sender.send_async(command, None).unwrap();

        let (status, body) = call(&operator_router(state), "GET", "/v1/operator/spool", None).await;
        assert_eq!(status, StatusCode::OK);
        let view: SpoolView = serde_json::from_value(body).unwrap();
        assert_eq!(view.usage.entries, 1);
        assert_eq!(view.entries[0].command_id, Some(id));
        assert_eq!(view.entries[0].command_type.as_deref(), Some("complete_create_resource"));
    }

    #[tokio::test]
    async fn test_manual_failover_marking() {
        let router = operator_router(state());
        let address = "http%3A%2F%2Fa%3A7080";

        let (status, body) = call(&router, "POST", &format!("/v1/operator/failover/{}/unhealthy", address), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_target"]["address"], "http://b:7080");

        let (_, body) = call(&router, "POST", &format!("/v1/operator/failover/{}/healthy", address), None).await;
        assert_eq!(body["current_target"]["address"], "http://a:7080");

        let (status, body) = call(&router, "POST", "/v1/operator/failover/http%3A%2F%2Fnope/healthy", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_ping_defaults_to_current_target() {
        let router = operator_router(state());
        let (status, body) = call(&router, "POST", "/v1/operator/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["endpoint"], "http://a:7080");

        let (status, body) = call(&router, "POST", "/v1/operator/ping", Some(json!({ "endpoint": "http://down:7080" }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "transport");
    }

    #[tokio::test]
    async fn test_reload_without_file_is_rejected() {
        let router = operator_router(state());
        let (status, _) = call(&router, "POST", "/v1/operator/config/reload", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_event_stream_yields_published_events() {
        let event_bus = EventBus::new(16);
        let mut events = Box::pin(event_stream(&event_bus));
        event_bus.publish_delivery_event(DeliveryEvent::SendingStarted { started_at: Utc::now() });
        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_ok());
    }

    #[tokio::test]
    async fn test_caller_comes_from_headers() {
        let (mut parts, _) = Request::builder()
            .header(USER_HEADER, "alice")
            .header(INVENTORY_MANAGER_HEADER, "TRUE")
            .body(())
            .unwrap()
            .into_parts();
        let OperatorCaller(caller) = OperatorCaller::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(caller, Caller::user("alice", true));

        let (mut parts, _) = Request::builder()
            .extension(ConnectInfo(local_peer()))
            .body(())
            .unwrap()
            .into_parts();
        let OperatorCaller(caller) = OperatorCaller::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(caller, Caller::Overlord);
    }

    #[tokio::test]
    async fn test_remote_request_without_identity_is_unauthorized() {
        let (mut parts, _) = Request::builder()
            .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 50_000))))
            .body(())
            .unwrap()
            .into_parts();
        let rejection = OperatorCaller::from_request_parts(&mut parts, &()).await.err().unwrap();
        assert_eq!(rejection.into_response().status(), StatusCode::UNAUTHORIZED);

        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert!(OperatorCaller::from_request_parts(&mut parts, &()).await.is_err());
    }

    #[tokio::test]
    async fn test_operator_routes_refuse_remote_peers() {
        let router = operator_router(state());
        let remote = |uri: &str| {
            Request::builder()
                .method("POST")
                .uri(uri)
                .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 50_000))))
                .body(Body::empty())
                .unwrap()
        };

        let response = router.clone().oneshot(remote("/v1/operator/sender/stop")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
