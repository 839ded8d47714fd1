// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node bootstrap
//!
//! Wires the command sender, failover, discovery and (for servers) the
//! inventory services from one configuration, serves the command and
//! operator API, and drains the sender on shutdown.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use tether_core::application::agent_inventory::{AcceptAllPlugin, AgentInventory};
use tether_core::application::availability::{AvailabilityService, SuspectAgentJob};
use tether_core::application::discovery::{
    EndpointSource, HeartbeatJob, MembershipSource, ServerDiscovery, ServerPollingSource, StaticEndpointSource,
};
use tether_core::application::failover::{FailoverManager, HealthCheckJob};
use tether_core::application::interval_trigger::{IntervalJob, IntervalTrigger, JobLock, LocalJobLock};
use tether_core::application::lifecycle_coordinator::{ResourceLifecycleCoordinator, TimeoutSweepJob};
use tether_core::application::sender::{CommandSender, ServerPollingJob};
use tether_core::application::tree_deleter::{ResourceTreeDeleter, UninventoriedPurgeJob};
use tether_core::domain::authorization::{AuthorizationService, InventoryRoleAuthorization};
use tether_core::domain::node_config::{ConfigHandle, NodeConfigManifest, NodeRole, StorageBackendKind};
use tether_core::domain::repository::{
    AgentRepository, AvailabilityRepository, LifecycleHistoryRepository, ResourceGraphStore, ResourceRepository,
};
use tether_core::domain::resource::AgentId;
use tether_core::domain::spool::Spool;
use tether_core::domain::transport::Transport;
use tether_core::infrastructure::agent_client::CommandAgentClient;
use tether_core::infrastructure::db::Database;
use tether_core::infrastructure::event_bus::EventBus;
use tether_core::infrastructure::http_transport::HttpTransport;
use tether_core::infrastructure::job_lock::PostgresAdvisoryLock;
use tether_core::infrastructure::repositories::{
    InMemoryFleetStore, PostgresAgentRepository, PostgresLifecycleHistoryRepository, PostgresResourceRepository,
};
use tether_core::infrastructure::spool::{FileSpool, InMemorySpool};
use tether_core::presentation::api::{app, OperatorState};
use tether_core::presentation::commands::CommandDispatcher;
use tether_core::presentation::inventory::InventoryState;

use super::{remove_pid_file, write_pid_file};

/// Storage handles a server node runs its inventory on.
struct Stores {
    histories: Arc<dyn LifecycleHistoryRepository>,
    resources: Arc<dyn ResourceRepository>,
    graph: Arc<dyn ResourceGraphStore>,
    availability: Arc<dyn AvailabilityRepository>,
    agents: Arc<dyn AgentRepository>,
    lock: Arc<dyn JobLock>,
}

async fn open_stores(config: &NodeConfigManifest) -> Result<Stores> {
    let storage = &config.spec.storage;
    match storage.backend {
        StorageBackendKind::Memory => {
            warn!("Inventory is kept in memory and will not survive a restart");
            let store = Arc::new(InMemoryFleetStore::new());
            Ok(Stores {
                histories: store.clone(),
                resources: store.clone(),
                graph: store.clone(),
                availability: store.clone(),
                agents: store,
                lock: Arc::new(LocalJobLock),
            })
        }
        StorageBackendKind::Postgres => {
            let url = storage
                .database_url
                .as_deref()
                .context("spec.storage.database_url is required for the postgres backend")?;
            let db = Database::new(url, storage.max_connections)
                .await
                .context("Failed to connect to the inventory database")?;
            db.apply_schema().await.context("Failed to apply inventory schema")?;
            let pool = db.get_pool().clone();
            let resources = Arc::new(PostgresResourceRepository::new(pool.clone()));
            Ok(Stores {
                histories: Arc::new(PostgresLifecycleHistoryRepository::new(pool.clone())),
                resources: resources.clone(),
                graph: resources.clone(),
                availability: resources,
                agents: Arc::new(PostgresAgentRepository::new(pool.clone())),
                lock: Arc::new(PostgresAdvisoryLock::new(pool)),
            })
        }
    }
}

/// Interval jobs started with the node and cancelled on shutdown.
#[derive(Default)]
struct Jobs(Vec<Arc<IntervalTrigger>>);

impl Jobs {
    fn spawn(&mut self, job: Arc<dyn IntervalJob>, period: Duration, lock: Option<Arc<dyn JobLock>>) {
        let trigger = Arc::new(match lock {
            Some(lock) => IntervalTrigger::with_lock(job, period, lock),
            None => IntervalTrigger::new(job, period),
        });
        trigger.clone().start();
        self.0.push(trigger);
    }

    fn shutdown(&self) {
        for trigger in &self.0 {
            trigger.shutdown_token().cancel();
        }
    }
}

pub async fn run_node(config_path: Option<PathBuf>) -> Result<()> {
    let pid = std::process::id();
    write_pid_file(pid)?;
    let _guard = PidFileGuard;

    let config = Arc::new(ConfigHandle::load(config_path).context("Failed to load configuration")?);
    let manifest = config.snapshot();
    manifest.validate().context("Configuration validation failed")?;
    let spec = &manifest.spec;

    info!(
        node_id = %spec.node.id,
        role = ?spec.node.role,
        source = ?config.source(),
        "Tether node starting (PID: {})",
        pid
    );

    if spec.observability.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], spec.observability.metrics.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics exported on {}", addr);
    }

    let event_bus = EventBus::with_default_capacity();
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let failover = Arc::new(FailoverManager::from_config(
        &spec.failover,
        config.list_version(),
        event_bus.clone(),
    ));

    let spool: Arc<dyn Spool> = if spec.spool.enabled {
        Arc::new(FileSpool::open(&spec.spool).context("Failed to open command spool")?)
    } else {
        warn!("Spool disabled; guaranteed commands are kept in memory only");
        Arc::new(InMemorySpool::new(spec.spool.max_entries, spec.spool.max_bytes))
    };

    let sender = CommandSender::new(
        spec.sender.clone(),
        transport.clone(),
        failover.clone(),
        spool,
        event_bus.clone(),
    );
    if spec.sender.auto_start {
        sender.start();
    }

    let mut jobs = Jobs::default();
    jobs.spawn(
        Arc::new(HealthCheckJob::new(failover.clone(), transport.clone(), &spec.failover)),
        spec.failover.health_check_interval,
        None,
    );
    if let Some(period) = spec.sender.server_polling_interval {
        jobs.spawn(
            Arc::new(ServerPollingJob::new(sender.clone(), spec.failover.ping_timeout)),
            period,
            None,
        );
    }

    let mut sources: Vec<Arc<dyn EndpointSource>> = vec![Arc::new(StaticEndpointSource::new(config.clone()))];

    let (dispatcher, inventory) = match spec.node.role {
        NodeRole::Server => {
            let stores = open_stores(&manifest).await?;
            let authz: Arc<dyn AuthorizationService> = Arc::new(InventoryRoleAuthorization);
            let agent_client = Arc::new(CommandAgentClient::new(
                sender.clone(),
                stores.agents.clone(),
                spec.lifecycle.dispatch_timeout,
            ));
            let deleter = Arc::new(ResourceTreeDeleter::new(
                stores.resources.clone(),
                stores.graph.clone(),
                authz.clone(),
                agent_client.clone(),
                event_bus.clone(),
                spec.deletion.clone(),
            ));
            let coordinator = Arc::new(ResourceLifecycleCoordinator::new(
                stores.histories.clone(),
                stores.resources.clone(),
                agent_client.clone(),
                authz.clone(),
                deleter.clone(),
                event_bus.clone(),
                &spec.lifecycle,
            ));
            let availability = Arc::new(AvailabilityService::new(
                stores.availability.clone(),
                stores.agents.clone(),
                agent_client,
                event_bus.clone(),
            ));

            jobs.spawn(
                Arc::new(TimeoutSweepJob::new(coordinator.clone())),
                spec.lifecycle.sweep_interval,
                Some(stores.lock.clone()),
            );
            jobs.spawn(
                Arc::new(UninventoriedPurgeJob::new(deleter)),
                spec.lifecycle.sweep_interval,
                Some(stores.lock.clone()),
            );
            jobs.spawn(
                Arc::new(SuspectAgentJob::new(
                    availability.clone(),
                    spec.availability.suspect_agent_threshold,
                )),
                spec.availability.sweep_interval,
                Some(stores.lock.clone()),
            );

            let membership = Arc::new(MembershipSource::new(config.clone()));
            sources.push(membership.clone());
            if !spec.discovery.peers.is_empty() {
                jobs.spawn(
                    Arc::new(HeartbeatJob::new(sender.clone(), config.clone(), spec.failover.ping_timeout)),
                    spec.discovery.heartbeat_interval,
                    None,
                );
            }

            let dispatcher =
                CommandDispatcher::for_server(spec.node.id.clone(), membership, coordinator.clone(), availability.clone());
            let inventory = Arc::new(InventoryState {
                lifecycle: coordinator,
                resources: stores.resources,
                agents: stores.agents,
                availability,
                authz,
            });
            (dispatcher, Some(inventory))
        }
        NodeRole::Agent => {
            if spec.discovery.poll_server {
                sources.push(Arc::new(ServerPollingSource::new(
                    sender.clone(),
                    spec.failover.ping_timeout,
                )));
            }
            let agent_inventory = AgentInventory::new(
                spec.node.agent_id.map(AgentId),
                sender.clone(),
                Arc::new(AcceptAllPlugin),
            );
            (CommandDispatcher::for_agent(spec.node.id.clone(), agent_inventory), None)
        }
    };

    if spec.discovery.enabled {
        jobs.spawn(
            Arc::new(ServerDiscovery::new(sources, failover.clone())),
            spec.discovery.polling_interval,
            None,
        );
    }

    let operator = Arc::new(OperatorState {
        config: config.clone(),
        sender: sender.clone(),
        transport,
        event_bus,
        started_at: Instant::now(),
    });
    let router = app(Arc::new(dispatcher), operator, inventory);

    let addr = format!("{}:{}", spec.api.bind_address, spec.api.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Node listening on {}", addr);

    let served = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    info!("Node shutting down");
    jobs.shutdown();
    if sender.stop(true).await {
        info!(spooled = sender.spool().len(), "Command sender drained");
    }
    if let Err(e) = &served {
        error!("{:#}", e);
    }
    served
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
