//! SQLite snapshot repository implementation.
//!
//! Implements `SnapshotRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Each run owns one row keyed by `(workflow_name, run_id)`
//! holding the snapshot as a JSON blob; persisting again overwrites it.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::repository::snapshot::SnapshotRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::Snapshot;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SnapshotRepository`.
#[derive(Clone)]
pub struct SqliteSnapshotRepository {
    pool: DatabasePool,
}

impl SqliteSnapshotRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// When the run's snapshot was last written.
    pub async fn updated_at(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let row = sqlx::query(
            "SELECT updated_at FROM workflow_snapshots WHERE workflow_name = ? AND run_id = ?",
        )
        .bind(workflow_name)
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            let raw: String = row
                .try_get("updated_at")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            parse_datetime(&raw)
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

// ---------------------------------------------------------------------------
// SnapshotRepository impl
// ---------------------------------------------------------------------------

impl SnapshotRepository for SqliteSnapshotRepository {
    async fn persist_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
        snapshot: &Snapshot,
    ) -> Result<(), RepositoryError> {
        let body = serde_json::to_string(snapshot)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO workflow_snapshots (workflow_name, run_id, snapshot, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(workflow_name, run_id) DO UPDATE SET
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow_name)
        .bind(run_id.to_string())
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::trace!(workflow = workflow_name, run_id = %run_id, bytes = body.len(), "snapshot upserted");
        Ok(())
    }

    async fn load_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> Result<Option<Snapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT snapshot FROM workflow_snapshots WHERE workflow_name = ? AND run_id = ?",
        )
        .bind(workflow_name)
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let body: String = row
                    .try_get("snapshot")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let snapshot = serde_json::from_str(&body).map_err(|e| {
                    RepositoryError::Serialization(format!("invalid snapshot JSON: {e}"))
                })?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, workflow_name: &str) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT run_id FROM workflow_snapshots WHERE workflow_name = ? ORDER BY run_id ASC",
        )
        .bind(workflow_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row
                .try_get("run_id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            runs.push(parse_uuid(&raw)?);
        }
        runs.sort();
        Ok(runs)
    }

    async fn delete_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM workflow_snapshots WHERE workflow_name = ? AND run_id = ?")
                .bind(workflow_name)
                .bind(run_id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
