// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Agent Repository
//!
//! Production `AgentRepository` implementation backed by the `agents` table
//! via `sqlx`. Besides the registry itself it keeps the availability-report
//! bookkeeping the suspect-agent sweep relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::repository::{AgentRepository, RepositoryError};
use crate::domain::resource::{AgentId, AgentRecord};

pub struct PostgresAgentRepository {
    pool: PgPool,
}

impl PostgresAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn update_one(
        &self,
        id: AgentId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), RepositoryError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("agent {}", id)));
        }
        Ok(())
    }
}

fn agent_from_row(row: &PgRow) -> Result<AgentRecord, RepositoryError> {
    Ok(AgentRecord {
        id: AgentId(row.try_get("id")?),
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        last_availability_report: row.try_get("last_availability_report")?,
        backfilled: row.try_get("backfilled")?,
    })
}

#[async_trait]
impl AgentRepository for PostgresAgentRepository {
    async fn save(&self, agent: &AgentRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, address, last_availability_report, backfilled)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                address = EXCLUDED.address,
                last_availability_report = EXCLUDED.last_availability_report,
                backfilled = EXCLUDED.backfilled
            "#,
        )
        .bind(agent.id.0)
        .bind(&agent.name)
        .bind(&agent.address)
        .bind(agent.last_availability_report)
        .bind(agent.backfilled)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save agent: {}", e)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, address, last_availability_report, backfilled FROM agents WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(agent_from_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, address, last_availability_report, backfilled FROM agents ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(agent_from_row).collect()
    }

    async fn record_availability_report(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update_one(
            id,
            sqlx::query("UPDATE agents SET last_availability_report = $2 WHERE id = $1")
                .bind(id.0)
                .bind(at),
        )
        .await
    }

    async fn set_backfilled(&self, id: AgentId, backfilled: bool) -> Result<(), RepositoryError> {
        self.update_one(
            id,
            sqlx::query("UPDATE agents SET backfilled = $2 WHERE id = $1")
                .bind(id.0)
                .bind(backfilled),
        )
        .await
    }

    async fn find_silent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, address, last_availability_report, backfilled
            FROM agents
            WHERE backfilled = FALSE AND last_availability_report < $1
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(agent_from_row).collect()
    }
}
