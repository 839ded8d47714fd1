// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Delivery guarantees of the command sender: spooled commands survive a
//! restart, guaranteed commands are delivered in spool order even across
//! retries, and health checks move traffic to the next ranked endpoint.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tether_core::application::failover::{FailoverManager, HealthCheckJob};
use tether_core::application::interval_trigger::IntervalJob;
use tether_core::application::sender::CommandSender;
use tether_core::domain::command::{Command, CommandId, CommandResponse};
use tether_core::domain::error::FleetError;
use tether_core::domain::failover::{FailoverList, ServerEndpoint};
use tether_core::domain::node_config::{FailoverConfig, SenderConfig, SpoolConfig};
use tether_core::domain::spool::Spool;
use tether_core::domain::transport::Transport;
use tether_core::infrastructure::event_bus::EventBus;
use tether_core::infrastructure::spool::{FileSpool, InMemorySpool};

const PRIMARY: &str = "http://primary:7080";
const SECONDARY: &str = "http://secondary:7080";

/// Transport whose failures are scripted per endpoint and per command.
#[derive(Default)]
struct ScriptedTransport {
    down: Mutex<HashSet<String>>,
    fail_once: Mutex<HashSet<CommandId>>,
    delivered: Mutex<Vec<(String, CommandId)>>,
    watched_spool: Mutex<Option<Arc<dyn Spool>>>,
    spool_at_failure: Mutex<Vec<Vec<CommandId>>>,
}

impl ScriptedTransport {
    fn delivered_ids(&self) -> Vec<CommandId> {
        self.delivered.lock().iter().map(|(_, id)| *id).collect()
    }

    fn spooled_ids(spool: &dyn Spool) -> Vec<CommandId> {
        spool
            .replay_all()
            .unwrap()
            .iter()
            .map(|entry| Command::from_bytes(&entry.serialized_command).unwrap().id)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, endpoint: &str, command: &Command, _timeout: Duration) -> Result<CommandResponse, FleetError> {
        if self.down.lock().contains(endpoint) {
            return Err(FleetError::transport(endpoint, "connection refused"));
        }
        if self.fail_once.lock().remove(&command.id) {
            if let Some(spool) = self.watched_spool.lock().as_ref() {
                self.spool_at_failure.lock().push(Self::spooled_ids(spool.as_ref()));
            }
            return Err(FleetError::transport(endpoint, "connection reset"));
        }
        self.delivered.lock().push((endpoint.to_string(), command.id));
        Ok(CommandResponse::empty(command.id))
    }

    async fn ping(&self, endpoint: &str, _timeout: Duration) -> Result<Duration, FleetError> {
        if self.down.lock().contains(endpoint) {
            Err(FleetError::transport(endpoint, "connection refused"))
        } else {
            Ok(Duration::from_millis(2))
        }
    }
}

fn sender_config() -> SenderConfig {
    SenderConfig {
        max_retries: 5,
        retry_interval: Duration::from_millis(10),
        max_retry_interval: Duration::from_millis(50),
        ..SenderConfig::default()
    }
}

fn failover_config() -> FailoverConfig {
    FailoverConfig {
        failure_threshold: 3,
        ..FailoverConfig::default()
    }
}

fn failover(endpoints: &[&str]) -> Arc<FailoverManager> {
    let endpoints = endpoints
        .iter()
        .enumerate()
        .map(|(rank, address)| ServerEndpoint::new(*address, rank as u32))
        .collect();
    Arc::new(FailoverManager::new(
        FailoverList::new(1, endpoints),
        &failover_config(),
        EventBus::new(64),
    ))
}

fn sender(transport: Arc<ScriptedTransport>, spool: Arc<dyn Spool>) -> Arc<CommandSender> {
    CommandSender::new(
        sender_config(),
        transport,
        failover(&[PRIMARY]),
        spool,
        EventBus::new(64),
    )
}

async fn wait_for_empty(spool: &dyn Spool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !spool.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("spool did not drain in time");
}

fn guaranteed(n: u32) -> Command {
    Command::new("availability_report", json!({ "n": n })).guaranteed()
}

#[tokio::test]
async fn test_spooled_commands_survive_restart_and_deliver_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = SpoolConfig {
        path: dir.path().join("commands.spool"),
        ..SpoolConfig::default()
    };

    let commands: Vec<Command> = (1..=3).map(guaranteed).collect();
    let expected: Vec<CommandId> = commands.iter().map(|c| c.id).collect();

    {
        let spool: Arc<dyn Spool> = Arc::new(FileSpool::open(&config).unwrap());
        let first = sender(Arc::new(ScriptedTransport::default()), spool);
        for command in &commands {
            first.send_async(command.clone(), None).unwrap();
        }
        // never started: the process goes away with everything still spooled
    }

    let spool: Arc<dyn Spool> = Arc::new(FileSpool::open(&config).unwrap());
    assert_eq!(ScriptedTransport::spooled_ids(spool.as_ref()), expected);

    let transport = Arc::new(ScriptedTransport::default());
    let second = sender(transport.clone(), spool.clone());
    assert!(second.start());
    wait_for_empty(spool.as_ref()).await;
    second.stop(true).await;

    assert_eq!(transport.delivered_ids(), expected);
    assert_eq!(second.metrics().sent, 3);
    drop(second);
    drop(spool);

    let reopened = FileSpool::open(&config).unwrap();
    assert!(reopened.is_empty(), "acks must be durable across a restart");
}

#[tokio::test]
async fn test_failed_guaranteed_command_blocks_later_ones_until_delivered() {
    let spool: Arc<dyn Spool> = Arc::new(InMemorySpool::unbounded());
    let transport = Arc::new(ScriptedTransport::default());
    *transport.watched_spool.lock() = Some(spool.clone());

    let commands: Vec<Command> = (1..=3).map(guaranteed).collect();
    let ids: Vec<CommandId> = commands.iter().map(|c| c.id).collect();
    transport.fail_once.lock().insert(ids[1]);

    let sender = sender(transport.clone(), spool.clone());
    for command in commands {
        sender.send_async(command, None).unwrap();
    }
    sender.start();
    wait_for_empty(spool.as_ref()).await;
    sender.stop(true).await;

    let snapshots = transport.spool_at_failure.lock().clone();
    assert_eq!(snapshots, vec![vec![ids[1], ids[2]]]);
    assert_eq!(transport.delivered_ids(), ids);

    let metrics = sender.metrics();
    assert_eq!(metrics.sent, 3);
    assert_eq!(metrics.retried, 1);
}

#[tokio::test]
async fn test_health_checks_switch_traffic_to_next_ranked_endpoint() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.down.lock().insert(PRIMARY.to_string());

    let failover = failover(&[PRIMARY, SECONDARY]);
    let job = HealthCheckJob::new(failover.clone(), transport.clone(), &failover_config());

    for _ in 0..2 {
        job.run_once().await.unwrap();
    }
    assert_eq!(failover.current_target().unwrap().address, PRIMARY);

    job.run_once().await.unwrap();
    let target = failover.current_target().unwrap();
    assert_eq!(target.address, SECONDARY);
    assert!(!failover.snapshot().get(PRIMARY).unwrap().healthy);

    let sender = CommandSender::new(
        sender_config(),
        transport.clone(),
        failover.clone(),
        Arc::new(InMemorySpool::unbounded()),
        EventBus::new(64),
    );
    sender.start();
    let command = Command::new("ping", json!({}));
    let response = sender.send_sync(command.clone(), Duration::from_secs(5)).await.unwrap();
    assert!(response.success);
    assert_eq!(
        transport.delivered.lock().clone(),
        vec![(SECONDARY.to_string(), command.id)]
    );
    sender.stop(true).await;
}

#[tokio::test]
async fn test_manual_failback_keeps_secondary_until_operator_marks_primary() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.down.lock().insert(PRIMARY.to_string());
    let config = FailoverConfig {
        failback: tether_core::domain::failover::FailbackPolicy::Manual,
        ..failover_config()
    };
    let failover = Arc::new(FailoverManager::new(
        FailoverList::new(1, vec![ServerEndpoint::new(PRIMARY, 0), ServerEndpoint::new(SECONDARY, 1)]),
        &config,
        EventBus::new(64),
    ));
    let job = HealthCheckJob::new(failover.clone(), transport.clone(), &config);
    for _ in 0..3 {
        job.run_once().await.unwrap();
    }
    assert_eq!(failover.current_target().unwrap().address, SECONDARY);

    transport.down.lock().clear();
    job.run_once().await.unwrap();
    assert_eq!(failover.current_target().unwrap().address, SECONDARY);

    failover.mark_healthy(PRIMARY).unwrap();
    assert_eq!(failover.current_target().unwrap().address, PRIMARY);
}
