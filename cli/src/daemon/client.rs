// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the operator API of a running node

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use tether_core::application::lifecycle_coordinator::CreateResourceParams;
use tether_core::application::sender::SenderMetricsSnapshot;
use tether_core::domain::lifecycle::LifecycleHistory;
use tether_core::domain::resource::{AgentRecord, Resource, ResourceId};
use tether_core::presentation::api::{
    FailoverView, PingRequest, PingResult, ReloadResult, SenderStateChange, SpoolView, StopSenderRequest,
    USER_HEADER,
};
use tether_core::presentation::inventory::{ImportResourceRequest, RegisterAgentRequest, ResourceView};

#[derive(Debug, Clone)]
pub struct NodeClient {
    client: Client,
    base_url: Url,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    kind: Option<String>,
}

impl NodeClient {
    pub fn new(host: &str, port: u16, user: Option<String>) -> Result<Self> {
        let client = Client::builder()
            // No global timeout: the event stream is long-lived
            .build()
            .context("Failed to create HTTP client")?;

        let base = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, port)
        } else {
            format!("http://{}:{}", host, port)
        };
        let base_url = Url::parse(&base).with_context(|| format!("Invalid node address {}", base))?;

        Ok(Self { client, base_url, user })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("node address {} cannot carry a path", self.base_url))?
            .extend(segments);
        Ok(url)
    }

    fn operator(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.user {
            Some(user) => builder.header(USER_HEADER, user),
            None => builder,
        }
    }

    async fn read<T: DeserializeOwned>(response: Response, action: &str) -> Result<T> {
        let response = Self::check(response, action).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", action))
    }

    async fn check(response: Response, action: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => anyhow::bail!(
                "Failed to {}: {} ({}, {})",
                action,
                body.error,
                body.kind.as_deref().unwrap_or("error"),
                status
            ),
            Err(_) => anyhow::bail!("Failed to {}: {} {}", action, status, text),
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], action: &str) -> Result<T> {
        let response = self
            .operator(self.client.get(self.url(segments)?))
            .send()
            .await
            .with_context(|| format!("Failed to {}", action))?;
        Self::read(response, action).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(&self, segments: &[&str], body: &B, action: &str) -> Result<T> {
        let response = self
            .operator(self.client.post(self.url(segments)?))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to {}", action))?;
        Self::read(response, action).await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get(&["health"], "check node health").await
    }

    pub async fn start_sender(&self) -> Result<SenderStateChange> {
        self.post(&["v1", "operator", "sender", "start"], &serde_json::json!({}), "start sender")
            .await
    }

    pub async fn stop_sender(&self, graceful: bool) -> Result<SenderStateChange> {
        self.post(
            &["v1", "operator", "sender", "stop"],
            &StopSenderRequest { graceful },
            "stop sender",
        )
        .await
    }

    pub async fn sender_metrics(&self) -> Result<SenderMetricsSnapshot> {
        self.get(&["v1", "operator", "sender", "metrics"], "read sender metrics").await
    }

    pub async fn spool(&self) -> Result<SpoolView> {
        self.get(&["v1", "operator", "spool"], "read spool").await
    }

    pub async fn failover(&self) -> Result<FailoverView> {
        self.get(&["v1", "operator", "failover"], "read failover list").await
    }

    pub async fn mark_endpoint(&self, address: &str, healthy: bool) -> Result<FailoverView> {
        let state = if healthy { "healthy" } else { "unhealthy" };
        self.post(
            &["v1", "operator", "failover", address, state],
            &serde_json::json!({}),
            "mark endpoint",
        )
        .await
    }

    pub async fn ping(&self, endpoint: Option<String>) -> Result<PingResult> {
        self.post(&["v1", "operator", "ping"], &PingRequest { endpoint }, "ping endpoint")
            .await
    }

    pub async fn reload_config(&self) -> Result<ReloadResult> {
        self.post(&["v1", "operator", "config", "reload"], &serde_json::json!({}), "reload configuration")
            .await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        self.get(&["v1", "operator", "agents"], "list agents").await
    }

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<AgentRecord> {
        self.post(&["v1", "operator", "agents"], request, "register agent").await
    }

    pub async fn agent_reconnected(&self, id: i64) -> Result<()> {
        let id = id.to_string();
        let response = self
            .operator(
                self.client
                    .post(self.url(&["v1", "operator", "agents", &id, "reconnected"])?),
            )
            .send()
            .await
            .context("Failed to report agent reconnect")?;
        Self::check(response, "report agent reconnect").await?;
        Ok(())
    }

    pub async fn create_resource(&self, params: &CreateResourceParams) -> Result<LifecycleHistory> {
        self.post(&["v1", "operator", "resources"], params, "create resource").await
    }

    pub async fn import_resource(&self, request: &ImportResourceRequest) -> Result<Resource> {
        self.post(&["v1", "operator", "resources", "import"], request, "import resource")
            .await
    }

    pub async fn show_resource(&self, id: ResourceId) -> Result<ResourceView> {
        let id = id.0.to_string();
        self.get(&["v1", "operator", "resources", &id], "show resource").await
    }

    pub async fn delete_resource(&self, id: ResourceId) -> Result<LifecycleHistory> {
        let id = id.0.to_string();
        let response = self
            .operator(self.client.delete(self.url(&["v1", "operator", "resources", &id])?))
            .send()
            .await
            .context("Failed to delete resource")?;
        Self::read(response, "delete resource").await
    }

    pub async fn lifecycle(&self, id: Uuid) -> Result<LifecycleHistory> {
        let id = id.to_string();
        self.get(&["v1", "operator", "lifecycle", &id], "show lifecycle request").await
    }

    /// Open the server-sent event stream of fleet events.
    pub async fn events(&self) -> Result<Response> {
        let response = self
            .operator(self.client.get(self.url(&["v1", "operator", "events"])?))
            .send()
            .await
            .context("Failed to open event stream")?;
        Self::check(response, "open event stream").await
    }
}
