// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Resource Repository
//!
//! Resource tree, availability intervals and the batched subtree deletion,
//! all over the `resources` table and its dependents. Tree walks use
//! recursive CTEs and never mutate.
//!
//! `delete_batch` runs one transaction per batch: one `DELETE` per
//! [`DependentKind`] in the order given, then the resource rows themselves.
//! Serialization failures, deadlocks and foreign key violations (a child
//! inserted after the subtree was read) surface as
//! `RepositoryError::Conflict` so the deleter can recompute and retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::availability::{AvailabilityRecord, AvailabilityType};
use crate::domain::deletion::DependentKind;
use crate::domain::repository::{AvailabilityRepository, RepositoryError, ResourceGraphStore, ResourceRepository};
use crate::domain::resource::{
    AgentId, InventoryStatus, NewResource, Resource, ResourceEdge, ResourceId, ResourceTypeId,
};

const RESOURCE_COLUMNS: &str = "id, parent_id, type_id, resource_key, name, inventory_status, agent_id, created_at";

pub struct PostgresResourceRepository {
    pool: PgPool,
}

impl PostgresResourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn resource_from_row(row: &PgRow) -> Result<Resource, RepositoryError> {
    let status: String = row.try_get("inventory_status")?;
    Ok(Resource {
        id: ResourceId(row.try_get("id")?),
        parent_id: row.try_get::<Option<i64>, _>("parent_id")?.map(ResourceId),
        type_id: ResourceTypeId(row.try_get("type_id")?),
        resource_key: row.try_get("resource_key")?,
        name: row.try_get("name")?,
        inventory_status: InventoryStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Serialization(format!("unknown inventory status '{}'", status)))?,
        owner_agent_id: row.try_get::<Option<i64>, _>("agent_id")?.map(AgentId),
        created_at: row.try_get("created_at")?,
    })
}

fn availability_from_row(row: &PgRow) -> Result<AvailabilityRecord, RepositoryError> {
    let avail_type: String = row.try_get("avail_type")?;
    Ok(AvailabilityRecord {
        resource_id: ResourceId(row.try_get("resource_id")?),
        avail_type: AvailabilityType::parse(&avail_type)
            .ok_or_else(|| RepositoryError::Serialization(format!("unknown availability type '{}'", avail_type)))?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

/// `DELETE` statement removing every row of `kind` that references `$1`.
fn dependent_delete_sql(kind: DependentKind) -> String {
    format!("DELETE FROM {} WHERE {}", kind.table(), dependent_predicate(kind))
}

fn dependent_predicate(kind: DependentKind) -> &'static str {
    match kind {
        DependentKind::CreateResourceHistory => {
            "kind = 'CREATE' AND (parent_resource_id = ANY($1) OR resource_id = ANY($1))"
        }
        DependentKind::DeleteResourceHistory => {
            "kind = 'DELETE' AND (parent_resource_id = ANY($1) OR resource_id = ANY($1))"
        }
        _ => "resource_id = ANY($1)",
    }
}

fn raw_ids(ids: &[ResourceId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

#[async_trait]
impl ResourceRepository for PostgresResourceRepository {
    async fn find_by_id(&self, id: ResourceId) -> Result<Option<Resource>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM resources WHERE id = $1", RESOURCE_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(resource_from_row).transpose()
    }

    async fn find_child_by_key(
        &self,
        parent: Option<ResourceId>,
        resource_key: &str,
    ) -> Result<Option<Resource>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM resources WHERE parent_id IS NOT DISTINCT FROM $1 AND resource_key = $2",
            RESOURCE_COLUMNS
        ))
        .bind(parent.map(|id| id.0))
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(resource_from_row).transpose()
    }

    async fn commit_resource(&self, resource: &NewResource) -> Result<Resource, RepositoryError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO resources (parent_id, type_id, resource_key, name, inventory_status, agent_id, created_at)
            VALUES ($1, $2, $3, $4, 'COMMITTED', $5, NOW())
            ON CONFLICT ON CONSTRAINT resources_parent_key_unique
            DO UPDATE SET resource_key = resources.resource_key
            RETURNING {}
            "#,
            RESOURCE_COLUMNS
        ))
        .bind(resource.parent_id.map(|id| id.0))
        .bind(resource.type_id.0)
        .bind(&resource.resource_key)
        .bind(&resource.name)
        .bind(resource.owner_agent_id.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;

        resource_from_row(&row)
    }

    async fn find_owner_agent(&self, id: ResourceId) -> Result<Option<AgentId>, RepositoryError> {
        let agent: Option<i64> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE ancestry AS (
                SELECT id, parent_id, agent_id, 0 AS depth FROM resources WHERE id = $1
                UNION ALL
                SELECT r.id, r.parent_id, r.agent_id, a.depth + 1
                FROM resources r JOIN ancestry a ON r.id = a.parent_id
                WHERE a.agent_id IS NULL
            )
            SELECT agent_id FROM ancestry WHERE agent_id IS NOT NULL ORDER BY depth LIMIT 1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(agent.map(AgentId))
    }

    async fn find_by_agent(&self, agent: AgentId) -> Result<Vec<Resource>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {} FROM resources WHERE agent_id = $1 ORDER BY id", RESOURCE_COLUMNS))
            .bind(agent.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(resource_from_row).collect()
    }

    async fn load_subtree_edges(&self, root: ResourceId) -> Result<Vec<ResourceEdge>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT id, parent_id FROM resources WHERE id = $1
                UNION ALL
                SELECT r.id, r.parent_id FROM resources r JOIN subtree s ON r.parent_id = s.id
            )
            SELECT id, parent_id FROM subtree
            "#,
        )
        .bind(root.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, RepositoryError>(ResourceEdge {
                    id: ResourceId(row.try_get("id")?),
                    parent_id: row.try_get::<Option<i64>, _>("parent_id")?.map(ResourceId),
                })
            })
            .collect()
    }

    async fn mark_uninventoried(&self, root: ResourceId) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT id FROM resources WHERE id = $1
                UNION ALL
                SELECT r.id FROM resources r JOIN subtree s ON r.parent_id = s.id
            )
            UPDATE resources SET inventory_status = 'UNINVENTORIED'
            WHERE id IN (SELECT id FROM subtree) AND inventory_status <> 'UNINVENTORIED'
            "#,
        )
        .bind(root.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_uninventoried_roots(&self) -> Result<Vec<ResourceId>, RepositoryError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT r.id FROM resources r
            LEFT JOIN resources p ON p.id = r.parent_id
            WHERE r.inventory_status = 'UNINVENTORIED'
              AND (p.id IS NULL OR p.inventory_status <> 'UNINVENTORIED')
            ORDER BY r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(ResourceId).collect())
    }
}

#[async_trait]
impl AvailabilityRepository for PostgresResourceRepository {
    async fn current(&self, resource: ResourceId) -> Result<Option<AvailabilityRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT resource_id, avail_type, start_time, end_time FROM availability \
             WHERE resource_id = $1 AND end_time IS NULL",
        )
        .bind(resource.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(availability_from_row).transpose()
    }

    async fn record(
        &self,
        resource: ResourceId,
        avail_type: AvailabilityType,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let open: Option<String> = sqlx::query_scalar(
            "SELECT avail_type FROM availability WHERE resource_id = $1 AND end_time IS NULL FOR UPDATE",
        )
        .bind(resource.0)
        .fetch_optional(&mut *tx)
        .await?;

        if open.as_deref() == Some(avail_type.as_str()) {
            tx.rollback().await?;
            return Ok(false);
        }
        if open.is_some() {
            sqlx::query("UPDATE availability SET end_time = $2 WHERE resource_id = $1 AND end_time IS NULL")
                .bind(resource.0)
                .bind(at)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO availability (resource_id, avail_type, start_time) VALUES ($1, $2, $3)")
            .bind(resource.0)
            .bind(avail_type.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_down_for_agent(&self, agent: AgentId, at: DateTime<Utc>) -> Result<u64, RepositoryError> {
        // One statement: close every open non-DOWN interval of the agent's
        // resources, open DOWN for those plus any resource with no interval.
        let result = sqlx::query(
            r#"
            WITH closed AS (
                UPDATE availability a SET end_time = $2
                FROM resources r
                WHERE a.resource_id = r.id AND r.agent_id = $1
                  AND a.end_time IS NULL AND a.avail_type <> 'DOWN'
                RETURNING a.resource_id
            ),
            missing AS (
                SELECT r.id AS resource_id FROM resources r
                WHERE r.agent_id = $1
                  AND NOT EXISTS (
                      SELECT 1 FROM availability a WHERE a.resource_id = r.id AND a.end_time IS NULL
                  )
            )
            INSERT INTO availability (resource_id, avail_type, start_time)
            SELECT resource_id, 'DOWN', $2 FROM closed
            UNION
            SELECT resource_id, 'DOWN', $2 FROM missing
            "#,
        )
        .bind(agent.0)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn history(&self, resource: ResourceId) -> Result<Vec<AvailabilityRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT resource_id, avail_type, start_time, end_time FROM availability \
             WHERE resource_id = $1 ORDER BY start_time, id",
        )
        .bind(resource.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(availability_from_row).collect()
    }
}

#[async_trait]
impl ResourceGraphStore for PostgresResourceRepository {
    async fn delete_batch(
        &self,
        ids: &[ResourceId],
        order: &[DependentKind],
    ) -> Result<Vec<ResourceId>, RepositoryError> {
        let ids = raw_ids(ids);
        let mut tx = self.pool.begin().await?;

        for kind in order {
            let result = sqlx::query(&dependent_delete_sql(*kind))
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                tracing::trace!(table = kind.table(), rows = result.rows_affected(), "Removed dependent rows");
            }
        }

        let removed: Vec<i64> = sqlx::query_scalar("DELETE FROM resources WHERE id = ANY($1) RETURNING id")
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed.into_iter().map(ResourceId).collect())
    }

    async fn count_dependents(&self, kind: DependentKind, ids: &[ResourceId]) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            kind.table(),
            dependent_predicate(kind)
        ))
        .bind(raw_ids(ids))
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deletion::DELETION_ORDER;

    #[test]
    fn test_history_kinds_filter_on_kind_column() {
        let sql = dependent_delete_sql(DependentKind::DeleteResourceHistory);
        assert!(sql.starts_with("DELETE FROM lifecycle_history WHERE kind = 'DELETE'"));
        assert!(dependent_delete_sql(DependentKind::CreateResourceHistory).contains("kind = 'CREATE'"));
    }

    #[test]
    fn test_every_dependent_kind_has_a_statement() {
        for kind in DELETION_ORDER {
            let sql = dependent_delete_sql(*kind);
            assert!(sql.contains(kind.table()));
            assert!(sql.contains("ANY($1)"));
        }
    }
}
