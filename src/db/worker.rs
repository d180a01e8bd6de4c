//! Worker registry rows.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::decode_rows;
use crate::error::{Error, Result};
use crate::model::{TaskId, Worker, WorkerRegistration, WorkerStatus};

const WORKER_COLUMNS: &str = "id, name, worker_type, capabilities, status, current_task, last_heartbeat, performance_score, registered_at, version";

impl super::Db {
    /// Insert or overwrite a worker registration.
    pub(crate) async fn upsert_worker_row(
        &self,
        registration: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        registration.validate()?;
        let mut tx = self.pool().begin().await?;

        let existing: Option<WorkerRow> = sqlx::query_as(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1 FOR UPDATE"
        ))
        .bind(&registration.id)
        .fetch_optional(&mut *tx)
        .await?;
        let existing = existing.map(WorkerRow::try_into_worker).transpose()?;

        let worker = registration.apply(existing.as_ref(), now);

        // A concurrent first registration of the same id lands on the
        // conflict arm and becomes an overwrite.
        let row: WorkerRow = sqlx::query_as(&format!(
            "INSERT INTO workers ({WORKER_COLUMNS})
             VALUES ($1, $2, $3, $4, 'active', $5, $6, $7, $8, $9 + 1)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                worker_type = EXCLUDED.worker_type,
                capabilities = EXCLUDED.capabilities,
                status = 'active',
                last_heartbeat = EXCLUDED.last_heartbeat,
                version = workers.version + 1
             RETURNING {WORKER_COLUMNS}"
        ))
        .bind(&worker.id)
        .bind(&worker.name)
        .bind(&worker.worker_type)
        .bind(Json(&worker.capabilities))
        .bind(worker.current_task.map(|t| t.0))
        .bind(worker.last_heartbeat)
        .bind(worker.performance_score)
        .bind(worker.registered_at)
        .bind(worker.version as i64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into_worker()
    }

    pub(crate) async fn touch_worker_row(&self, id: &str, now: DateTime<Utc>) -> Result<Worker> {
        let row: Option<WorkerRow> = sqlx::query_as(&format!(
            "UPDATE workers SET status = 'active', last_heartbeat = $1, version = version + 1
             WHERE id = $2
             RETURNING {WORKER_COLUMNS}"
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("worker {id}")))?
            .try_into_worker()
    }

    pub(crate) async fn get_worker_row(&self, id: &str) -> Result<Worker> {
        let row: Option<WorkerRow> =
            sqlx::query_as(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("worker {id}")))?
            .try_into_worker()
    }

    pub(crate) async fn list_worker_rows(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id"))
            .fetch_all(self.pool())
            .await?;

        Ok(decode_rows("workers", rows, |row| {
            WorkerRow::from_row(row)?.try_into_worker()
        }))
    }

    pub(crate) async fn demote_worker_row(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE workers SET status = 'inactive', version = version + 1
             WHERE id = $1 AND status = 'active' AND last_heartbeat < $2",
        )
        .bind(id)
        .bind(stale_before)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Distinguish "not stale any more" from "gone".
            self.get_worker_row(id).await?;
        }
        Ok(rows_affected > 0)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct WorkerRow {
    id: String,
    name: String,
    worker_type: String,
    capabilities: Json<Vec<String>>,
    status: String,
    current_task: Option<Uuid>,
    last_heartbeat: DateTime<Utc>,
    performance_score: f64,
    registered_at: DateTime<Utc>,
    version: i64,
}

impl WorkerRow {
    pub(crate) fn try_into_worker(self) -> Result<Worker> {
        let status: WorkerStatus = self.status.parse()?;
        Ok(Worker {
            id: self.id,
            name: self.name,
            worker_type: self.worker_type,
            capabilities: self.capabilities.0,
            status,
            current_task: self.current_task.map(TaskId),
            last_heartbeat: self.last_heartbeat,
            performance_score: self.performance_score,
            registered_at: self.registered_at,
            version: self.version as u64,
        })
    }
}
