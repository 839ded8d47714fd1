// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Interval Trigger - single-flight periodic jobs
//!
//! Every background job of a node (timeout sweep, health checks, discovery
//! polling, heartbeats, suspect-agent sweep, server polling) is an
//! [`IntervalJob`] driven by an [`IntervalTrigger`]. The trigger guarantees
//! that runs of one job never overlap: a tick that arrives while the previous
//! run is still going is skipped, not queued. Across a cluster the optional
//! [`JobLock`] extends that guarantee to every server node.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Scheduler-independent periodic execution

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait IntervalJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run_once(&self) -> anyhow::Result<()>;
}

/// Held for the duration of one run; dropping it releases the lock.
pub trait JobLease: Send {}

/// Cluster-wide mutual exclusion for scheduled jobs.
#[async_trait]
pub trait JobLock: Send + Sync {
    /// `None` means another node holds the lock right now.
    async fn try_acquire(&self, job: &str) -> anyhow::Result<Option<Box<dyn JobLease>>>;
}

/// Lock for single-node deployments; always granted.
#[derive(Debug, Default, Clone)]
pub struct LocalJobLock;

struct LocalLease;

impl JobLease for LocalLease {}

#[async_trait]
impl JobLock for LocalJobLock {
    async fn try_acquire(&self, _job: &str) -> anyhow::Result<Option<Box<dyn JobLease>>> {
        Ok(Some(Box::new(LocalLease)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Ran,
    SkippedInFlight,
    SkippedLocked,
    Failed,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct IntervalTrigger {
    job: Arc<dyn IntervalJob>,
    period: Duration,
    lock: Arc<dyn JobLock>,
    running: AtomicBool,
    shutdown_token: CancellationToken,
}

impl IntervalTrigger {
    pub fn new(job: Arc<dyn IntervalJob>, period: Duration) -> Self {
        Self::with_lock(job, period, Arc::new(LocalJobLock))
    }

    pub fn with_lock(job: Arc<dyn IntervalJob>, period: Duration, lock: Arc<dyn JobLock>) -> Self {
        Self {
            job,
            period,
            lock,
            running: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the periodic loop; the first run happens after one period.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        info!(job = self.job.name(), period = ?self.period, "Starting interval job");

        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Runs on its own task so a slow run cannot stall shutdown;
                    // overlapping ticks are rejected by `fire`.
                    let trigger = self.clone();
                    tokio::spawn(async move {
                        trigger.fire().await;
                    });
                }
                _ = self.shutdown_token.cancelled() => {
                    info!(job = self.job.name(), "Shutdown signal received, stopping interval job");
                    break;
                }
            }
        }
    }

    /// Run the job now unless a run is already in flight.
    pub async fn fire(&self) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job = self.job.name(), "Previous run still in flight, skipping tick");
            return TriggerOutcome::SkippedInFlight;
        }
        let _guard = InFlightGuard(&self.running);

        let _lease = match self.lock.try_acquire(self.job.name()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(job = self.job.name(), "Job lock held elsewhere, skipping tick");
                return TriggerOutcome::SkippedLocked;
            }
            Err(e) => {
                warn!(job = self.job.name(), "Failed to acquire job lock: {:#}", e);
                return TriggerOutcome::Failed;
            }
        };

        match self.job.run_once().await {
            Ok(()) => TriggerOutcome::Ran,
            Err(e) => {
                warn!(job = self.job.name(), "Interval job run failed: {:#}", e);
                TriggerOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingJob {
        runs: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl IntervalJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run_once(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(())
        }
    }

    struct DeniedLock;

    #[async_trait]
    impl JobLock for DeniedLock {
        async fn try_acquire(&self, _job: &str) -> anyhow::Result<Option<Box<dyn JobLease>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_overlapping_fire_is_skipped() {
        let gate = Arc::new(Notify::new());
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        let trigger = Arc::new(IntervalTrigger::new(job.clone(), Duration::from_secs(60)));

        let first = {
            let trigger = trigger.clone();
            tokio::spawn(async move { trigger.fire().await })
        };
        while !trigger.is_running() {
            tokio::task::yield_now().await;
        }

        assert_eq!(trigger.fire().await, TriggerOutcome::SkippedInFlight);
        gate.notify_one();
        assert_eq!(first.await.unwrap(), TriggerOutcome::Ran);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert!(!trigger.is_running());
    }

    #[test]
    fn test_local_lock_always_grants() {
        let lease = tokio_test::assert_ok!(tokio_test::block_on(LocalJobLock.try_acquire("counting")));
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_skips_run() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            gate: None,
        });
        let trigger = IntervalTrigger::with_lock(job.clone(), Duration::from_secs(1), Arc::new(DeniedLock));
        assert_eq!(trigger.fire().await, TriggerOutcome::SkippedLocked);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_each_period_until_cancelled() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            gate: None,
        });
        let trigger = Arc::new(IntervalTrigger::new(job.clone(), Duration::from_secs(10)));
        let token = trigger.shutdown_token();
        let handle = trigger.start();

        tokio::time::sleep(Duration::from_secs(35)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }
}
