// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Command Sender
//!
//! Single point through which every outbound command of a node flows.
//!
//! ```text
//!  send_async ──► guaranteed? ──yes──► Spool (append) ──┐
//!                     │                                  │ head only,
//!                     no                                 │ one in flight
//!                     ▼                                  ▼
//!               volatile queue ──────────────► drain loop ──► delivery tasks ──► Transport
//!                                (permit per     (JoinSet)        │ retry w/ backoff
//!                                 send)                           ▼
//!                                                     completion worker ──► callbacks
//! ```
//!
//! Guaranteed commands are delivered strictly in spool order: only the spool
//! head is ever in flight, and it leaves the spool only after the target
//! acknowledged it. When a head entry exhausts its retries it stays in the
//! spool and a new retry cycle starts after `max_retry_interval`.
//! Volatile commands are delivered concurrently, bounded by `max_concurrent`
//! permits shared with guaranteed and synchronous sends, and are dropped with
//! a failure callback once their retries are exhausted.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Guaranteed/volatile delivery, retry, throttling, metrics

use async_trait::async_trait;
use chrono::Utc;
use futures::future::OptionFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::failover::FailoverManager;
use crate::application::interval_trigger::IntervalJob;
use crate::domain::command::{Command, CommandId, CommandResponse};
use crate::domain::error::FleetError;
use crate::domain::events::DeliveryEvent;
use crate::domain::node_config::{SendThrottleConfig, SenderConfig};
use crate::domain::spool::{Sequence, Spool};
use crate::domain::transport::Transport;
use crate::infrastructure::event_bus::EventBus;

/// Invoked exactly once with the final response of an async command.
pub type CommandCallback = Box<dyn FnOnce(CommandResponse) + Send + 'static>;

/// Retry schedule for transport failures.
///
/// Delay before retry `n` is `interval * multiplier^(n-1)`, capped at
/// `max_interval`. The multiplier is clamped to at least 1.0 so delays never
/// shrink.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SenderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            interval: config.retry_interval,
            multiplier: config.retry_multiplier,
            max_interval: config.max_retry_interval.max(config.retry_interval),
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.interval.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Live counters. Mirrored to the `metrics` facade as they change.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    spooled: AtomicU64,
    send_time_micros: AtomicU64,
    in_flight: AtomicUsize,
}

impl SenderMetrics {
    fn record_sent(&self, elapsed: Duration) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.send_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        metrics::counter!("tether_commands_sent_total").increment(1);
        metrics::histogram!("tether_command_send_seconds").record(elapsed.as_secs_f64());
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tether_commands_failed_total").increment(1);
    }

    fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tether_commands_retried_total").increment(1);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tether_commands_dropped_total").increment(1);
    }

    fn record_spooled(&self) {
        self.spooled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tether_commands_spooled_total").increment(1);
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("tether_commands_in_flight").set(now as f64);
    }

    fn leave(&self) {
        let now = self.in_flight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("tether_commands_in_flight").set(now as f64);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderMetricsSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    /// Volatile commands waiting in memory.
    pub queued: usize,
    /// Guaranteed commands waiting in the spool.
    pub spooled: usize,
    /// Commands ever written to the spool.
    pub spooled_total: u64,
    pub dropped: u64,
    pub average_send_time_ms: f64,
    pub in_flight: usize,
    pub sending: bool,
}

/// A volatile command waiting for delivery, with its callback.
pub struct QueuedCommand {
    pub command: Command,
    pub callback: Option<CommandCallback>,
}

struct CallbackJob {
    callback: CommandCallback,
    response: CommandResponse,
}

/// Pauses throttled sends for `quiet_period` after every `max_commands`.
struct SendThrottle {
    max_commands: u32,
    quiet_period: Duration,
    enabled: AtomicBool,
    state: tokio::sync::Mutex<(u32, Option<Instant>)>,
}

impl SendThrottle {
    fn new(config: &SendThrottleConfig) -> Self {
        Self {
            max_commands: config.max_commands.max(1),
            quiet_period: config.quiet_period,
            enabled: AtomicBool::new(true),
            state: tokio::sync::Mutex::new((0, None)),
        }
    }

    async fn acquire(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(until) = state.1.take() {
            if until > Instant::now() {
                debug!("Send throttle quiet period in effect");
                tokio::time::sleep_until(until).await;
            }
        }
        state.0 += 1;
        if state.0 >= self.max_commands {
            state.0 = 0;
            state.1 = Some(Instant::now() + self.quiet_period);
        }
    }
}

struct RunHandle {
    stop: CancellationToken,
    abort: CancellationToken,
    task: JoinHandle<()>,
}

enum Delivery {
    Delivered {
        response: CommandResponse,
        endpoint: String,
        attempts: u32,
    },
    Rejected {
        error: FleetError,
        attempts: u32,
    },
    Exhausted {
        error: FleetError,
        attempts: u32,
    },
    Cancelled,
}

enum GuaranteedOutcome {
    Settled,
    Exhausted,
}

pub struct CommandSender {
    config: SenderConfig,
    transport: Arc<dyn Transport>,
    failover: Arc<FailoverManager>,
    spool: Arc<dyn Spool>,
    event_bus: EventBus,
    metrics: SenderMetrics,
    retry: RetryPolicy,
    volatile: Mutex<VecDeque<QueuedCommand>>,
    callbacks: Mutex<HashMap<CommandId, CommandCallback>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    run: Mutex<Option<RunHandle>>,
    sending: AtomicBool,
    sync_in_flight: AtomicUsize,
    sync_idle: Notify,
    completions: mpsc::UnboundedSender<CallbackJob>,
    queue_limiter: Option<DefaultDirectRateLimiter>,
    send_throttle: Option<SendThrottle>,
}

impl CommandSender {
    /// Build a sender. Must be called inside a tokio runtime: the completion
    /// worker that runs callbacks is spawned here.
    pub fn new(
        config: SenderConfig,
        transport: Arc<dyn Transport>,
        failover: Arc<FailoverManager>,
        spool: Arc<dyn Spool>,
        event_bus: EventBus,
    ) -> Arc<Self> {
        let (completions, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_completion_worker(rx));

        let queue_limiter = config.queue_throttle.as_ref().and_then(|throttle| {
            let burst = NonZeroU32::new(throttle.max_commands)?;
            let quota = Quota::with_period(throttle.burst_period / throttle.max_commands)?.allow_burst(burst);
            Some(RateLimiter::direct(quota))
        });
        let send_throttle = config.send_throttle.as_ref().map(SendThrottle::new);
        let pending = spool.len();
        if pending > 0 {
            info!(pending, "Guaranteed commands recovered from spool");
        }

        Arc::new(Self {
            retry: RetryPolicy::from_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            transport,
            failover,
            spool,
            event_bus,
            metrics: SenderMetrics::default(),
            volatile: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            run: Mutex::new(None),
            sending: AtomicBool::new(false),
            sync_in_flight: AtomicUsize::new(0),
            sync_idle: Notify::new(),
            completions,
            queue_limiter,
            send_throttle,
        })
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub fn spool(&self) -> &Arc<dyn Spool> {
        &self.spool
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    /// Start draining. Returns false when already sending.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut run = self.run.lock();
        if run.is_some() {
            return false;
        }
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let task = tokio::spawn(self.clone().drain_loop(stop.clone(), abort.clone()));
        *run = Some(RunHandle { stop, abort, task });
        self.sending.store(true, Ordering::Release);
        drop(run);

        info!(
            queued = self.volatile.lock().len(),
            spooled = self.spool.len(),
            "Command sender started"
        );
        self.event_bus.publish_delivery_event(DeliveryEvent::SendingStarted { started_at: Utc::now() });
        true
    }

    /// Stop draining. Returns false when already stopped.
    ///
    /// Graceful: no new work is dispatched, retry waits end, and sends already
    /// on the wire (sync or async) finish before this returns. Otherwise
    /// in-flight sends are cancelled; cancelled volatile commands go back to
    /// the front of the queue and spooled ones stay in the spool.
    pub async fn stop(&self, graceful: bool) -> bool {
        let Some(handle) = self.run.lock().take() else {
            return false;
        };
        self.sending.store(false, Ordering::Release);
        handle.stop.cancel();
        if !graceful {
            handle.abort.cancel();
        }
        if let Err(e) = handle.task.await {
            error!("Sender drain loop ended abnormally: {}", e);
        }
        if graceful {
            loop {
                let idle = self.sync_idle.notified();
                if self.sync_in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                idle.await;
            }
        }

        info!(graceful, "Command sender stopped");
        self.event_bus.publish_delivery_event(DeliveryEvent::SendingStopped {
            graceful,
            stopped_at: Utc::now(),
        });
        true
    }

    /// Submit a command for background delivery.
    ///
    /// Guaranteed commands are durably spooled before this returns. Admission
    /// failures are returned here and the callback is dropped uninvoked;
    /// once admitted, the callback runs exactly once on the completion worker.
    pub fn send_async(&self, command: Command, callback: Option<CommandCallback>) -> Result<(), FleetError> {
        if command.requires_guarantee {
            let bytes = command.to_bytes()?;
            // Registered before the append: the drain loop may deliver the
            // entry as soon as it is in the spool.
            if let Some(callback) = callback {
                self.callbacks.lock().insert(command.id, callback);
            }
            let sequence = match self.spool.append(&bytes) {
                Ok(sequence) => sequence,
                Err(e) => {
                    self.callbacks.lock().remove(&command.id);
                    return Err(e.into());
                }
            };
            self.metrics.record_spooled();
            debug!(command_id = %command.id, sequence, "Guaranteed command spooled");
            self.event_bus.publish_delivery_event(DeliveryEvent::CommandSpooled {
                command_id: command.id,
                sequence,
                spooled_at: Utc::now(),
            });
        } else {
            if self.spool.usage().is_full() {
                return Err(FleetError::Capacity(
                    "spool is full; volatile commands are rejected first".to_string(),
                ));
            }
            let mut queue = self.volatile.lock();
            if queue.len() >= self.config.queue_size {
                return Err(FleetError::Capacity(format!(
                    "command queue is full ({} commands)",
                    self.config.queue_size
                )));
            }
            queue.push_back(QueuedCommand { command, callback });
            metrics::gauge!("tether_commands_queued").set(queue.len() as f64);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Send one command and wait for its response. Not retried.
    pub async fn send_sync(&self, command: Command, timeout: Duration) -> Result<CommandResponse, FleetError> {
        let Some(abort) = self.run.lock().as_ref().map(|r| r.abort.clone()) else {
            return Err(FleetError::transport(
                command.target_endpoint.clone().unwrap_or_default(),
                "command sender is not sending",
            ));
        };

        self.sync_in_flight.fetch_add(1, Ordering::AcqRel);
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, self.send_sync_inner(&command, timeout)) => {
                r.unwrap_or(Err(FleetError::Timeout(timeout)))
            }
            _ = abort.cancelled() => Err(FleetError::transport(
                command.target_endpoint.clone().unwrap_or_default(),
                "command sender was stopped",
            )),
        };
        if self.sync_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.sync_idle.notify_waiters();
        }

        match &result {
            Ok(_) => {}
            Err(e) => {
                self.metrics.record_failed();
                warn!(command_id = %command.id, command_type = %command.command_type, "Synchronous send failed: {}", e);
            }
        }
        result
    }

    async fn send_sync_inner(&self, command: &Command, timeout: Duration) -> Result<CommandResponse, FleetError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FleetError::Capacity("sender permits closed".to_string()))?;
        let mut command = command.clone();
        command.config.timeout = Some(timeout);
        self.metrics.enter();
        let result = self.attempt(&command).await;
        self.metrics.leave();
        result.map(|(_, response)| response)
    }

    /// Remove and return every volatile command still waiting.
    pub fn drain_queued(&self) -> Vec<QueuedCommand> {
        let drained: Vec<_> = self.volatile.lock().drain(..).collect();
        metrics::gauge!("tether_commands_queued").set(0.0);
        drained
    }

    /// Enable or disable the send throttle's quiet periods at runtime.
    pub fn set_send_throttle_enabled(&self, enabled: bool) -> bool {
        match &self.send_throttle {
            Some(throttle) => {
                throttle.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn metrics(&self) -> SenderMetricsSnapshot {
        let sent = self.metrics.sent.load(Ordering::Relaxed);
        let total_micros = self.metrics.send_time_micros.load(Ordering::Relaxed);
        SenderMetricsSnapshot {
            sent,
            failed: self.metrics.failed.load(Ordering::Relaxed),
            retried: self.metrics.retried.load(Ordering::Relaxed),
            queued: self.volatile.lock().len(),
            spooled: self.spool.len(),
            spooled_total: self.metrics.spooled.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            average_send_time_ms: if sent == 0 {
                0.0
            } else {
                total_micros as f64 / sent as f64 / 1000.0
            },
            in_flight: self.metrics.in_flight.load(Ordering::Relaxed),
            sending: self.is_sending(),
        }
    }

    async fn drain_loop(self: Arc<Self>, stop: CancellationToken, abort: CancellationToken) {
        let mut volatile_tasks: JoinSet<()> = JoinSet::new();
        let mut guaranteed: Option<JoinHandle<GuaranteedOutcome>> = None;
        let mut guaranteed_not_before: Option<Instant> = None;

        loop {
            if guaranteed.is_none() && guaranteed_not_before.is_none_or(|t| Instant::now() >= t) {
                guaranteed_not_before = None;
                match self.spool.peek_oldest() {
                    Ok(Some(entry)) => {
                        let sender = self.clone();
                        let (stop, abort) = (stop.clone(), abort.clone());
                        guaranteed = Some(tokio::spawn(async move {
                            sender
                                .deliver_guaranteed(entry.sequence, entry.serialized_command, &stop, &abort)
                                .await
                        }));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Failed to read spool head: {}", e);
                        guaranteed_not_before = Some(Instant::now() + self.retry.interval);
                    }
                }
            }

            let has_volatile = !self.volatile.lock().is_empty();
            let backoff = guaranteed_not_before;

            tokio::select! {
                _ = stop.cancelled() => break,
                Some(joined) = OptionFuture::from(guaranteed.as_mut()) => {
                    guaranteed = None;
                    match joined {
                        Ok(GuaranteedOutcome::Settled) => {}
                        Ok(GuaranteedOutcome::Exhausted) => {
                            guaranteed_not_before = Some(Instant::now() + self.retry.max_interval);
                        }
                        Err(e) => {
                            error!("Guaranteed delivery task failed: {}", e);
                            guaranteed_not_before = Some(Instant::now() + self.retry.max_interval);
                        }
                    }
                }
                Some(joined) = volatile_tasks.join_next(), if !volatile_tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Command delivery task failed: {}", e);
                    }
                }
                permit = self.permits.clone().acquire_owned(), if has_volatile => {
                    let Ok(permit) = permit else { break };
                    let next = self.volatile.lock().pop_front();
                    if let Some(queued) = next {
                        let sender = self.clone();
                        let (stop, abort) = (stop.clone(), abort.clone());
                        volatile_tasks.spawn(async move {
                            sender.deliver_volatile(queued, permit, &stop, &abort).await;
                        });
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(backoff.unwrap_or_else(Instant::now)), if backoff.is_some() => {}
            }
        }

        if let Some(handle) = guaranteed {
            if let Err(e) = handle.await {
                error!("Guaranteed delivery task failed during shutdown: {}", e);
            }
        }
        while let Some(joined) = volatile_tasks.join_next().await {
            if let Err(e) = joined {
                error!("Command delivery task failed during shutdown: {}", e);
            }
        }
        debug!("Sender drain loop exited");
    }

    async fn deliver_guaranteed(
        &self,
        sequence: Sequence,
        bytes: Vec<u8>,
        stop: &CancellationToken,
        abort: &CancellationToken,
    ) -> GuaranteedOutcome {
        let command = match Command::from_bytes(&bytes) {
            Ok(command) => command,
            Err(e) => {
                error!(sequence, "Discarding undecodable spool entry: {}", e);
                self.metrics.record_dropped();
                self.ack_spool(sequence);
                return GuaranteedOutcome::Settled;
            }
        };

        match self.deliver(&command, None, stop, abort).await {
            Delivery::Delivered {
                response,
                endpoint,
                attempts,
            } => {
                self.ack_spool(sequence);
                self.delivered(&command, endpoint, attempts);
                let callback = self.callbacks.lock().remove(&command.id);
                self.complete(callback, response);
                GuaranteedOutcome::Settled
            }
            Delivery::Rejected { error, attempts } => {
                self.ack_spool(sequence);
                self.abandoned(&command, attempts, &error);
                let callback = self.callbacks.lock().remove(&command.id);
                self.complete(callback, CommandResponse::from_error(command.id, &error));
                GuaranteedOutcome::Settled
            }
            Delivery::Exhausted { error, attempts } => {
                warn!(
                    command_id = %command.id,
                    sequence,
                    attempts,
                    backoff = ?self.retry.max_interval,
                    "Guaranteed command exhausted its retries; keeping it spooled: {}",
                    error
                );
                GuaranteedOutcome::Exhausted
            }
            Delivery::Cancelled => GuaranteedOutcome::Settled,
        }
    }

    async fn deliver_volatile(
        &self,
        queued: QueuedCommand,
        permit: OwnedSemaphorePermit,
        stop: &CancellationToken,
        abort: &CancellationToken,
    ) {
        let QueuedCommand { command, callback } = queued;
        match self.deliver(&command, Some(permit), stop, abort).await {
            Delivery::Delivered {
                response,
                endpoint,
                attempts,
            } => {
                self.delivered(&command, endpoint, attempts);
                self.complete(callback, response);
            }
            Delivery::Rejected { error, attempts } | Delivery::Exhausted { error, attempts } => {
                self.metrics.record_dropped();
                self.abandoned(&command, attempts, &error);
                self.complete(callback, CommandResponse::from_error(command.id, &error));
            }
            Delivery::Cancelled => {
                debug!(command_id = %command.id, "Requeueing cancelled command");
                self.volatile.lock().push_front(QueuedCommand { command, callback });
            }
        }
    }

    async fn deliver(
        &self,
        command: &Command,
        mut first_permit: Option<OwnedSemaphorePermit>,
        stop: &CancellationToken,
        abort: &CancellationToken,
    ) -> Delivery {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let permit = match first_permit.take() {
                Some(permit) => permit,
                None => tokio::select! {
                    p = self.permits.clone().acquire_owned() => match p {
                        Ok(permit) => permit,
                        Err(_) => return Delivery::Cancelled,
                    },
                    _ = stop.cancelled() => return Delivery::Cancelled,
                },
            };

            if attempts == 1 {
                if let Some(limiter) = &self.queue_limiter {
                    tokio::select! {
                        _ = limiter.until_ready() => {}
                        _ = stop.cancelled() => return Delivery::Cancelled,
                    }
                }
            }
            if command.config.send_throttled {
                if let Some(throttle) = &self.send_throttle {
                    tokio::select! {
                        _ = throttle.acquire() => {}
                        _ = stop.cancelled() => return Delivery::Cancelled,
                    }
                }
            }

            self.metrics.enter();
            let result = tokio::select! {
                r = self.attempt(command) => Some(r),
                _ = abort.cancelled() => None,
            };
            self.metrics.leave();
            drop(permit);

            let error = match result {
                None => return Delivery::Cancelled,
                Some(Ok((endpoint, response))) => {
                    return Delivery::Delivered {
                        response,
                        endpoint,
                        attempts,
                    }
                }
                Some(Err(error)) if !error.is_retryable() => return Delivery::Rejected { error, attempts },
                Some(Err(error)) => error,
            };

            if attempts > self.retry.max_retries {
                return Delivery::Exhausted { error, attempts };
            }
            self.metrics.record_retried();
            let delay = self.retry.next_delay(attempts);
            warn!(
                command_id = %command.id,
                command_type = %command.command_type,
                attempt = attempts,
                retry_in = ?delay,
                "Command send failed, will retry: {}",
                error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.cancelled() => return Delivery::Cancelled,
            }
        }
    }

    /// One transport round trip. Feeds the outcome into failover health
    /// unless the command names its own endpoint.
    async fn attempt(&self, command: &Command) -> Result<(String, CommandResponse), FleetError> {
        let (endpoint, tracked) = match &command.target_endpoint {
            Some(endpoint) => (endpoint.clone(), false),
            None => match self.failover.current_target() {
                Some(target) => (target.address, true),
                None => return Err(FleetError::transport("<none>", "no server endpoint configured")),
            },
        };
        let timeout = command.config.timeout.unwrap_or(self.config.default_timeout);

        let started = Instant::now();
        match self.transport.send(&endpoint, command, timeout).await {
            Ok(response) if response.command_id != command.id => Err(FleetError::Protocol(format!(
                "response correlates to {} but {} was sent",
                response.command_id, command.id
            ))),
            Ok(response) => {
                if tracked {
                    self.failover.record_success(&endpoint);
                }
                self.metrics.record_sent(started.elapsed());
                Ok((endpoint, response))
            }
            Err(e) => {
                if tracked && e.is_retryable() {
                    self.failover.record_failure(&endpoint);
                }
                Err(e)
            }
        }
    }

    fn ack_spool(&self, sequence: Sequence) {
        if let Err(e) = self.spool.remove(sequence) {
            // The entry will be replayed; delivery is at-least-once.
            error!(sequence, "Failed to ack spool entry: {}", e);
        }
    }

    fn delivered(&self, command: &Command, endpoint: String, attempts: u32) {
        debug!(command_id = %command.id, endpoint = %endpoint, attempts, "Command delivered");
        self.event_bus.publish_delivery_event(DeliveryEvent::CommandDelivered {
            command_id: command.id,
            endpoint,
            attempts,
            delivered_at: Utc::now(),
        });
    }

    fn abandoned(&self, command: &Command, attempts: u32, error: &FleetError) {
        self.metrics.record_failed();
        warn!(
            command_id = %command.id,
            command_type = %command.command_type,
            attempts,
            guaranteed = command.requires_guarantee,
            "Command abandoned: {}",
            error
        );
        self.event_bus.publish_delivery_event(DeliveryEvent::CommandAbandoned {
            command_id: command.id,
            attempts,
            reason: error.to_string(),
            abandoned_at: Utc::now(),
        });
    }

    fn complete(&self, callback: Option<CommandCallback>, response: CommandResponse) {
        if let Some(callback) = callback {
            if self.completions.send(CallbackJob { callback, response }).is_err() {
                error!("Completion worker is gone; dropping command callback");
            }
        }
    }
}

async fn run_completion_worker(mut rx: mpsc::UnboundedReceiver<CallbackJob>) {
    while let Some(CallbackJob { callback, response }) = rx.recv().await {
        let command_id = response.command_id;
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(response))).is_err() {
            error!(command_id = %command_id, "Command callback panicked");
        }
    }
}

/// Pings the current target; stops sending when it is unreachable and
/// starts again once it answers.
pub struct ServerPollingJob {
    sender: Arc<CommandSender>,
    timeout: Duration,
}

impl ServerPollingJob {
    pub fn new(sender: Arc<CommandSender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }
}

#[async_trait]
impl IntervalJob for ServerPollingJob {
    fn name(&self) -> &str {
        "sender-server-polling"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let Some(target) = self.sender.failover.current_target() else {
            return Ok(());
        };
        match self.sender.transport.ping(&target.address, self.timeout).await {
            Ok(_) => {
                if self.sender.start() {
                    info!(endpoint = %target.address, "Server reachable, sending resumed");
                }
            }
            Err(e) => {
                if self.sender.stop(false).await {
                    warn!(endpoint = %target.address, "Server unreachable, sending stopped: {}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::failover::{FailoverList, ServerEndpoint};
    use crate::domain::node_config::FailoverConfig;
    use crate::infrastructure::spool::InMemorySpool;
    use serde_json::json;
    use tokio::sync::oneshot;

    /// Answers every command; fails the first `fail_first` sends.
    struct FlakyTransport {
        fail_first: AtomicUsize,
        sent: Mutex<Vec<CommandId>>,
    }

    impl FlakyTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicUsize::new(fail_first),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, endpoint: &str, command: &Command, _timeout: Duration) -> Result<CommandResponse, FleetError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(FleetError::transport(endpoint, "connection refused"));
            }
            self.sent.lock().push(command.id);
            Ok(CommandResponse::empty(command.id))
        }

        async fn ping(&self, _endpoint: &str, _timeout: Duration) -> Result<Duration, FleetError> {
            Ok(Duration::from_millis(1))
        }
    }

    fn config() -> SenderConfig {
        SenderConfig {
            max_retries: 2,
            retry_interval: Duration::from_millis(10),
            max_retry_interval: Duration::from_millis(50),
            ..SenderConfig::default()
        }
    }

    fn sender(transport: Arc<dyn Transport>, config: SenderConfig) -> Arc<CommandSender> {
        let failover = Arc::new(FailoverManager::new(
            FailoverList::new(1, vec![ServerEndpoint::new("http://server:7080", 0)]),
            &FailoverConfig::default(),
            EventBus::new(64),
        ));
        CommandSender::new(
            config,
            transport,
            failover,
            Arc::new(InMemorySpool::unbounded()),
            EventBus::new(64),
        )
    }

    fn callback() -> (CommandCallback, oneshot::Receiver<CommandResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
            rx,
        )
    }

    #[test]
    fn test_retry_delay_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        };
        let delays: Vec<_> = (1..=8).map(|n| policy.next_delay(n)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[3], Duration::from_secs(8));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));

        let fixed = RetryPolicy::from_config(&SenderConfig::default());
        assert_eq!(fixed.next_delay(1), fixed.next_delay(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatile_command_retried_then_delivered() {
        let transport = FlakyTransport::new(2);
        let sender = sender(transport.clone(), config());
        sender.start();

        let (cb, rx) = callback();
        sender
            .send_async(Command::new("ping", json!({})), Some(cb))
            .unwrap();

        let response = rx.await.unwrap();
        assert!(response.success);
        let metrics = sender.metrics();
        assert_eq!(metrics.sent, 1);
        assert_eq!(metrics.retried, 2);
        sender.stop(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatile_command_dropped_after_retries_with_failure_callback() {
        let transport = FlakyTransport::new(usize::MAX);
        let sender = sender(transport, config());
        sender.start();

        let (cb, rx) = callback();
        sender
            .send_async(Command::new("ping", json!({})), Some(cb))
            .unwrap();

        let response = rx.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error_kind(), Some(crate::domain::error::ErrorKind::Transport));
        let metrics = sender.metrics();
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.retried, 2);
        sender.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_guaranteed_command_stays_spooled_after_exhaustion() {
        let transport = FlakyTransport::new(4);
        let sender = sender(transport.clone(), config());
        sender.start();

        let (cb, rx) = callback();
        sender
            .send_async(Command::new("report", json!({})).guaranteed(), Some(cb))
            .unwrap();
        assert_eq!(sender.spool().len(), 1);

        // First cycle: 3 failed attempts, then a second cycle succeeds.
        let response = rx.await.unwrap();
        assert!(response.success);
        assert!(sender.spool().is_empty());
        assert_eq!(transport.sent.lock().len(), 1);
        sender.stop(true).await;
    }

    /// Records, at each append, whether the sender already holds a callback.
    struct CallbackCheckingSpool {
        inner: InMemorySpool,
        sender: std::sync::OnceLock<std::sync::Weak<CommandSender>>,
        registered_at_append: Mutex<Vec<bool>>,
    }

    impl Spool for CallbackCheckingSpool {
        fn append(&self, serialized_command: &[u8]) -> Result<Sequence, crate::domain::spool::SpoolError> {
            let registered = self
                .sender
                .get()
                .and_then(|weak| weak.upgrade())
                .is_some_and(|sender| !sender.callbacks.lock().is_empty());
            self.registered_at_append.lock().push(registered);
            self.inner.append(serialized_command)
        }

        fn peek_oldest(&self) -> Result<Option<crate::domain::spool::SpoolEntry>, crate::domain::spool::SpoolError> {
            self.inner.peek_oldest()
        }

        fn remove(&self, sequence: Sequence) -> Result<(), crate::domain::spool::SpoolError> {
            self.inner.remove(sequence)
        }

        fn replay_all(&self) -> Result<Vec<crate::domain::spool::SpoolEntry>, crate::domain::spool::SpoolError> {
            self.inner.replay_all()
        }

        fn usage(&self) -> crate::domain::spool::SpoolUsage {
            self.inner.usage()
        }
    }

    #[tokio::test]
    async fn test_callback_registered_before_entry_is_spooled() {
        let spool = Arc::new(CallbackCheckingSpool {
            inner: InMemorySpool::new(1, 1 << 20),
            sender: std::sync::OnceLock::new(),
            registered_at_append: Mutex::new(Vec::new()),
        });
        let failover = Arc::new(FailoverManager::new(
            FailoverList::new(1, vec![ServerEndpoint::new("http://server:7080", 0)]),
            &FailoverConfig::default(),
            EventBus::new(64),
        ));
        let sender = CommandSender::new(config(), FlakyTransport::new(0), failover, spool.clone(), EventBus::new(64));
        let _ = spool.sender.set(Arc::downgrade(&sender));

        let (cb, rx) = callback();
        sender.send_async(Command::new("report", json!({})).guaranteed(), Some(cb)).unwrap();
        assert_eq!(*spool.registered_at_append.lock(), vec![true]);

        // A rejected append must not leave its callback behind.
        let (cb, _rx) = callback();
        let err = sender.send_async(Command::new("report", json!({})).guaranteed(), Some(cb)).unwrap_err();
        assert!(matches!(err, FleetError::Capacity(_)));
        assert_eq!(sender.callbacks.lock().len(), 1);

        sender.start();
        assert!(rx.await.unwrap().success);
        assert!(sender.callbacks.lock().is_empty());
        sender.stop(true).await;
    }

    #[tokio::test]
    async fn test_queue_capacity_rejects_volatile() {
        let sender = sender(FlakyTransport::new(0), SenderConfig {
            queue_size: 1,
            ..config()
        });
        sender.send_async(Command::new("a", json!({})), None).unwrap();
        let err = sender.send_async(Command::new("b", json!({})), None).unwrap_err();
        assert!(matches!(err, FleetError::Capacity(_)));
        assert_eq!(sender.drain_queued().len(), 1);
    }

    #[tokio::test]
    async fn test_send_sync_requires_sending_and_checks_correlation() {
        struct WrongId;

        #[async_trait]
        impl Transport for WrongId {
            async fn send(&self, _e: &str, _c: &Command, _t: Duration) -> Result<CommandResponse, FleetError> {
                Ok(CommandResponse::empty(CommandId::new()))
            }

            async fn ping(&self, _e: &str, _t: Duration) -> Result<Duration, FleetError> {
                Ok(Duration::ZERO)
            }
        }

        let sender = sender(Arc::new(WrongId), config());
        let err = sender
            .send_sync(Command::new("ping", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Transport { .. }));

        sender.start();
        let err = sender
            .send_sync(Command::new("ping", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
        sender.stop(true).await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let sender = sender(FlakyTransport::new(0), config());
        assert!(sender.start());
        assert!(!sender.start());
        assert!(sender.is_sending());
        assert!(sender.stop(true).await);
        assert!(!sender.stop(true).await);
        assert!(!sender.metrics().sending);
    }
}
