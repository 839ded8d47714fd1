// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Advisory Job Lock
//!
//! Cluster-wide single-flight for interval jobs: a run proceeds only on the
//! server node that wins `pg_try_advisory_lock` for the job's key. The lock
//! is session scoped, so the lease keeps its pooled connection until it is
//! dropped and then unlocks on that same connection.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use tracing::{debug, warn};

use crate::application::interval_trigger::{JobLease, JobLock};

pub struct PostgresAdvisoryLock {
    pool: PgPool,
}

impl PostgresAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Stable 64-bit lock key for a job name.
pub fn advisory_key(job: &str) -> i64 {
    let hash = blake3::hash(format!("tether-job:{}", job).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    i64::from_be_bytes(bytes)
}

struct AdvisoryLease {
    job: String,
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl JobLease for AdvisoryLease {}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = self.key;
        let job = std::mem::take(&mut self.job);
        tokio::spawn(async move {
            match sqlx::query("SELECT pg_advisory_unlock($1)").bind(key).execute(&mut *conn).await {
                Ok(_) => debug!(job = %job, "Released job lock"),
                Err(e) => {
                    // Closing the session releases the lock as well.
                    warn!(job = %job, "Failed to release job lock, closing connection: {}", e);
                    drop(conn.detach());
                }
            }
        });
    }
}

#[async_trait]
impl JobLock for PostgresAdvisoryLock {
    async fn try_acquire(&self, job: &str) -> anyhow::Result<Option<Box<dyn JobLease>>> {
        let key = advisory_key(job);
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(None);
        }
        Ok(Some(Box::new(AdvisoryLease {
            job: job.to_string(),
            key,
            conn: Some(conn),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_key_is_stable_per_job() {
        assert_eq!(advisory_key("lifecycle-timeout-sweep"), advisory_key("lifecycle-timeout-sweep"));
        assert_ne!(advisory_key("lifecycle-timeout-sweep"), advisory_key("suspect-agent-check"));
    }
}
