// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Lifecycle History Repository
//!
//! `LifecycleHistoryRepository` backed by the `lifecycle_history` table. The
//! terminal transition is one conditional `UPDATE ... WHERE status =
//! 'IN_PROGRESS' RETURNING`, so concurrent completions and the timeout sweep
//! serialize on the row and only one of them sees a returned row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::lifecycle::{Completion, LifecycleHistory, LifecycleHistoryId, LifecycleKind, LifecycleStatus};
use crate::domain::repository::{LifecycleHistoryRepository, RepositoryError};
use crate::domain::resource::{ResourceId, ResourceTypeId};

const HISTORY_COLUMNS: &str = "id, kind, parent_resource_id, resource_id, resource_type_id, resource_name, \
     new_resource_key, requested_by, status, created_at, completed_at, error_message";

pub struct PostgresLifecycleHistoryRepository {
    pool: PgPool,
}

impl PostgresLifecycleHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn history_from_row(row: &PgRow) -> Result<LifecycleHistory, RepositoryError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;

    Ok(LifecycleHistory {
        id: LifecycleHistoryId(row.try_get("id")?),
        kind: LifecycleKind::parse(&kind)
            .ok_or_else(|| RepositoryError::Serialization(format!("unknown lifecycle kind '{}'", kind)))?,
        parent_resource_id: row.try_get::<Option<i64>, _>("parent_resource_id")?.map(ResourceId),
        resource_id: row.try_get::<Option<i64>, _>("resource_id")?.map(ResourceId),
        resource_type_id: row.try_get::<Option<i64>, _>("resource_type_id")?.map(ResourceTypeId),
        resource_name: row.try_get("resource_name")?,
        new_resource_key: row.try_get("new_resource_key")?,
        requested_by: row.try_get("requested_by")?,
        status: LifecycleStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Serialization(format!("unknown lifecycle status '{}'", status)))?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl LifecycleHistoryRepository for PostgresLifecycleHistoryRepository {
    async fn insert(&self, history: &LifecycleHistory) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_history (
                id, kind, parent_resource_id, resource_id, resource_type_id, resource_name,
                new_resource_key, requested_by, status, created_at, completed_at, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(history.id.0)
        .bind(history.kind.as_str())
        .bind(history.parent_resource_id.map(|id| id.0))
        .bind(history.resource_id.map(|id| id.0))
        .bind(history.resource_type_id.map(|id| id.0))
        .bind(&history.resource_name)
        .bind(&history.new_resource_key)
        .bind(&history.requested_by)
        .bind(history.status.as_str())
        .bind(history.created_at)
        .bind(history.completed_at)
        .bind(&history.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: LifecycleHistoryId) -> Result<Option<LifecycleHistory>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM lifecycle_history WHERE id = $1", HISTORY_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(history_from_row).transpose()
    }

    async fn complete_if_in_progress(
        &self,
        id: LifecycleHistoryId,
        completion: &Completion,
    ) -> Result<Option<LifecycleHistory>, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE lifecycle_history SET
                status = $2,
                completed_at = $3,
                error_message = $4,
                new_resource_key = COALESCE($5, new_resource_key),
                resource_id = COALESCE($6, resource_id)
            WHERE id = $1 AND status = 'IN_PROGRESS'
            RETURNING {}
            "#,
            HISTORY_COLUMNS
        ))
        .bind(id.0)
        .bind(completion.status.as_str())
        .bind(completion.completed_at)
        .bind(&completion.error_message)
        .bind(&completion.new_resource_key)
        .bind(completion.resource_id.map(|id| id.0))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(history_from_row).transpose()
    }

    async fn find_in_progress_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LifecycleHistory>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM lifecycle_history WHERE status = 'IN_PROGRESS' AND created_at < $1 ORDER BY created_at",
            HISTORY_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    async fn list_for_resource(&self, resource: ResourceId) -> Result<Vec<LifecycleHistory>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM lifecycle_history WHERE resource_id = $1 OR parent_resource_id = $1 ORDER BY created_at",
            HISTORY_COLUMNS
        ))
        .bind(resource.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }
}
