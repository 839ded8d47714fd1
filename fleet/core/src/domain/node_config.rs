// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for Tether fleet nodes, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and role (agent or server)
// - Command sender, spool and failover settings
// - Server-side lifecycle, deletion and availability settings
// - Storage and observability settings
//
// The configuration is loaded once at startup. `ConfigHandle::reload` is the
// only way to change it afterwards.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::failover::{next_list_version, FailbackPolicy, FailoverList, ServerEndpoint};

pub const API_VERSION: &str = "tether.dev/v1";
pub const KIND: &str = "FleetConfig";
pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG_PATH";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "tether.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "FleetConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    pub node: NodeIdentity,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub sender: SenderConfig,

    #[serde(default)]
    pub spool: SpoolConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub deletion: DeletionConfig,

    #[serde(default)]
    pub availability: AvailabilityConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique stable node identifier
    pub id: String,

    #[serde(default)]
    pub role: NodeRole,

    /// Address peers use to reach this node's command endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,

    /// Inventory id the server assigned to this agent; stamped on availability reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Agent,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Commands allowed in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Volatile (non-guaranteed) commands allowed to wait in memory
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Attempts per retry cycle before a command is abandoned (volatile)
    /// or parked until the next cycle (guaranteed)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// 1.0 keeps the interval fixed; larger values back off exponentially
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_max_retry_interval", with = "humantime_serde")]
    pub max_retry_interval: Duration,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_throttle: Option<QueueThrottleConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_throttle: Option<SendThrottleConfig>,

    /// Ping the current target on this interval and toggle sending on the result
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub server_polling_interval: Option<Duration>,

    /// Start sending as soon as the node is up
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueThrottleConfig {
    pub max_commands: u32,
    #[serde(with = "humantime_serde")]
    pub burst_period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendThrottleConfig {
    pub max_commands: u32,
    #[serde(with = "humantime_serde")]
    pub quiet_period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Without a spool, guaranteed commands only survive in memory
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_spool_path")]
    pub path: PathBuf,

    #[serde(default = "default_spool_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_spool_max_bytes")]
    pub max_bytes: u64,

    /// Share of acked bytes in the file that triggers compaction
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold_percent: u8,

    #[serde(default = "default_true")]
    pub fsync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    #[serde(default)]
    pub rank: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Consecutive failed pings before the target is demoted
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub failback: FailbackPolicy,

    #[serde(default = "default_failback_check_interval", with = "humantime_serde")]
    pub failback_check_interval: Duration,

    /// Where the last accepted list is persisted between restarts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_discovery_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    /// Ask the current server for the cluster's failover list (agent role)
    #[serde(default = "default_true")]
    pub poll_server: bool,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_member_timeout", with = "humantime_serde")]
    pub member_timeout: Duration,

    /// Peer servers that receive this server's heartbeats
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    #[serde(default = "default_dispatch_timeout", with = "humantime_serde")]
    pub dispatch_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_delete_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delete_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    /// Agents silent for longer get their resources marked DOWN
    #[serde(default = "default_suspect_threshold", with = "humantime_serde")]
    pub suspect_agent_threshold: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    7080
}

fn default_max_concurrent() -> usize {
    5
}

fn default_queue_size() -> usize {
    50_000
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_retry_multiplier() -> f64 {
    1.0
}

fn default_max_retry_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_spool_path() -> PathBuf {
    PathBuf::from("data/command-spool.dat")
}

fn default_spool_max_entries() -> usize {
    50_000
}

fn default_spool_max_bytes() -> u64 {
    10_000_000
}

fn default_compact_threshold() -> u8 {
    75
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_failback_check_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_discovery_polling_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_member_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_dispatch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> usize {
    200
}

fn default_delete_attempts() -> u32 {
    3
}

fn default_delete_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_suspect_threshold() -> Duration {
    Duration::from_secs(300)
}

fn default_max_connections() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_size: default_queue_size(),
            default_timeout: default_command_timeout(),
            max_retries: default_max_retries(),
            retry_interval: default_retry_interval(),
            retry_multiplier: default_retry_multiplier(),
            max_retry_interval: default_max_retry_interval(),
            queue_throttle: None,
            send_throttle: None,
            server_polling_interval: None,
            auto_start: true,
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_spool_path(),
            max_entries: default_spool_max_entries(),
            max_bytes: default_spool_max_bytes(),
            compact_threshold_percent: default_compact_threshold(),
            fsync: true,
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![],
            health_check_interval: default_health_check_interval(),
            ping_timeout: default_ping_timeout(),
            failure_threshold: default_failure_threshold(),
            failback: FailbackPolicy::default(),
            failback_check_interval: default_failback_check_interval(),
            list_file: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval: default_discovery_polling_interval(),
            poll_server: true,
            heartbeat_interval: default_heartbeat_interval(),
            member_timeout: default_member_timeout(),
            peers: vec![],
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            sweep_interval: default_sweep_interval(),
            dispatch_timeout: default_dispatch_timeout(),
        }
    }
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_delete_attempts(),
            retry_delay: default_delete_retry_delay(),
        }
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            suspect_agent_threshold: default_suspect_threshold(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Memory,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for NodeConfigSpec {
    fn default() -> Self {
        Self {
            node: NodeIdentity {
                id: uuid::Uuid::new_v4().to_string(),
                role: NodeRole::Agent,
                advertise_address: None,
                agent_id: None,
            },
            api: ApiConfig::default(),
            sender: SenderConfig::default(),
            spool: SpoolConfig::default(),
            failover: FailoverConfig {
                endpoints: vec![EndpointConfig {
                    address: "http://127.0.0.1:7080".to_string(),
                    rank: 0,
                }],
                ..FailoverConfig::default()
            },
            discovery: DiscoveryConfig::default(),
            lifecycle: LifecycleConfig::default(),
            deletion: DeletionConfig::default(),
            availability: AvailabilityConfig::default(),
            storage: StorageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "tether-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl FailoverConfig {
    /// Failover list described by the static endpoint configuration.
    pub fn to_failover_list(&self, version: u64) -> FailoverList {
        FailoverList::new(
            version,
            self.endpoints
                .iter()
                .map(|e| ServerEndpoint::new(e.address.clone(), e.rank))
                .collect(),
        )
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. TETHER_CONFIG_PATH environment variable
    /// 2. ./tether-config.yaml (working directory)
    /// 3. ~/.tether/config.yaml (user home)
    /// 4. /etc/tether/config.yaml (system, Unix) or C:\ProgramData\Tether\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./tether-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".tether").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/tether/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Tether\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Explicit path wins over discovery.
    pub fn resolve_path(cli_path: Option<PathBuf>) -> Option<PathBuf> {
        cli_path.or_else(Self::discover_config)
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows container deployments to override config via env vars
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TETHER_NODE_ROLE") {
            match val.to_lowercase().as_str() {
                "agent" => {
                    tracing::info!("Environment override: TETHER_NODE_ROLE=agent");
                    self.spec.node.role = NodeRole::Agent;
                }
                "server" => {
                    tracing::info!("Environment override: TETHER_NODE_ROLE=server");
                    self.spec.node.role = NodeRole::Server;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for TETHER_NODE_ROLE: '{}'. Expected agent/server. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(url) = std::env::var("TETHER_DATABASE_URL") {
            tracing::info!("Environment override: TETHER_DATABASE_URL (postgres backend)");
            self.spec.storage.backend = StorageBackendKind::Postgres;
            self.spec.storage.database_url = Some(url);
        }

        if let Ok(path) = std::env::var("TETHER_SPOOL_PATH") {
            tracing::info!("Environment override: TETHER_SPOOL_PATH={}", path);
            self.spec.spool.path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("TETHER_API_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: TETHER_API_PORT={}", port);
                    self.spec.api.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for TETHER_API_PORT: '{}'. Ignoring.", val);
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        let sender = &spec.sender;
        if sender.max_concurrent == 0 {
            anyhow::bail!("spec.sender.max_concurrent must be at least 1");
        }
        if sender.queue_size == 0 {
            anyhow::bail!("spec.sender.queue_size must be at least 1");
        }
        if sender.retry_multiplier < 1.0 {
            anyhow::bail!(
                "spec.sender.retry_multiplier must be >= 1.0 so retry intervals never shrink (got {})",
                sender.retry_multiplier
            );
        }
        if sender.max_retry_interval < sender.retry_interval {
            anyhow::bail!("spec.sender.max_retry_interval must not be shorter than retry_interval");
        }
        if let Some(throttle) = &sender.queue_throttle {
            if throttle.max_commands == 0 || throttle.burst_period.is_zero() {
                anyhow::bail!("spec.sender.queue_throttle needs max_commands > 0 and a non-zero burst_period");
            }
        }
        if let Some(throttle) = &sender.send_throttle {
            if throttle.max_commands == 0 {
                anyhow::bail!("spec.sender.send_throttle.max_commands must be at least 1");
            }
        }

        let spool = &spec.spool;
        if spool.enabled {
            if spool.max_entries == 0 || spool.max_bytes == 0 {
                anyhow::bail!("spec.spool capacity must be non-zero");
            }
            if !(1..=99).contains(&spool.compact_threshold_percent) {
                anyhow::bail!(
                    "spec.spool.compact_threshold_percent must be between 1 and 99 (got {})",
                    spool.compact_threshold_percent
                );
            }
        }

        if spec.failover.failure_threshold == 0 {
            anyhow::bail!("spec.failover.failure_threshold must be at least 1");
        }
        if spec.node.role == NodeRole::Agent && spec.failover.endpoints.is_empty() {
            anyhow::bail!("an agent needs at least one entry in spec.failover.endpoints");
        }
        for endpoint in &spec.failover.endpoints {
            if endpoint.address.is_empty() {
                anyhow::bail!("failover endpoint address cannot be empty");
            }
        }

        if spec.deletion.batch_size == 0 {
            anyhow::bail!("spec.deletion.batch_size must be at least 1");
        }
        if spec.deletion.max_attempts == 0 {
            anyhow::bail!("spec.deletion.max_attempts must be at least 1");
        }

        if spec.storage.backend == StorageBackendKind::Postgres && spec.storage.database_url.is_none() {
            anyhow::bail!("spec.storage.database_url is required for the postgres backend");
        }

        Ok(())
    }
}

/// Shared, reloadable view of the node configuration.
///
/// Components take a snapshot when they are built. `reload` re-reads the
/// source file, validates it and swaps the whole manifest at once; readers
/// never observe a half-applied configuration.
pub struct ConfigHandle {
    source: Option<PathBuf>,
    current: RwLock<Arc<NodeConfigManifest>>,
    generation: AtomicU64,
    list_version: AtomicU64,
}

/// Modification time of `path` in unix milliseconds.
fn modified_millis(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}

impl ConfigHandle {
    pub fn new(config: NodeConfigManifest, source: Option<PathBuf>) -> Self {
        let list_version = source
            .as_deref()
            .and_then(modified_millis)
            .unwrap_or_else(|| next_list_version(0));
        Self {
            source,
            current: RwLock::new(Arc::new(config)),
            generation: AtomicU64::new(1),
            list_version: AtomicU64::new(list_version),
        }
    }

    /// Resolve, load and validate the configuration.
    pub fn load(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let source = NodeConfigManifest::resolve_path(cli_path);
        let config = NodeConfigManifest::load_or_default(source.clone())?;
        config.validate()?;
        Ok(Self::new(config, source))
    }

    pub fn snapshot(&self) -> Arc<NodeConfigManifest> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Version of the failover list built from the configured endpoints:
    /// the file's modification time, so an edit made while the node was down
    /// still beats a list persisted before it.
    pub fn list_version(&self) -> u64 {
        self.list_version.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Re-read the source file. On any error the current value is kept.
    pub fn reload(&self) -> anyhow::Result<u64> {
        let Some(path) = &self.source else {
            anyhow::bail!("configuration was not loaded from a file; nothing to reload");
        };
        let mut config = NodeConfigManifest::from_yaml_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to reload config at {:?}: {}", path, e))?;
        config.apply_env_overrides();
        config.validate()?;

        *self.current.write() = Arc::new(config);
        let modified = modified_millis(path).unwrap_or(0);
        let _ = self
            .list_version
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(modified.max(v.saturating_add(1))));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, "Configuration reloaded from {:?}", path);
        Ok(generation)
    }
}
