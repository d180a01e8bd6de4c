//! Task rows: insert, dispatch-ordered listing, transactional assignment,
//! versioned commits.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use std::time::Duration;
use uuid::Uuid;

use super::{TASK_READY_CHANNEL, decode_rows, status_strings};
use crate::db::worker::WorkerRow;
use crate::error::{Error, Result};
use crate::model::{Priority, Task, TaskId, TaskStatus};
use crate::store::{Assignment, released_worker};

const TASK_COLUMNS: &str = "id, task_type, payload, priority, timeout_ms, retry_count, max_retries, required_capabilities, status, assigned_worker, created_at, assigned_at, started_at, completed_at, result, error, version";

impl super::Db {
    pub(crate) async fn insert_task_row(&self, task: &Task) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(task.id.0)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.priority.level())
        .bind(timeout_ms(task)?)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(Json(&task.required_capabilities))
        .bind(task.status.as_str())
        .bind(&task.assigned_worker)
        .bind(task.created_at)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.version as i64)
        .execute(&mut *tx)
        .await?;

        if task.status == TaskStatus::Pending {
            // NOTIFY is transactional: only fires on commit
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(TASK_READY_CHANNEL)
                .bind(task.id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn get_task_row(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    pub(crate) async fn list_task_rows(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let rows = if statuses.is_empty() {
            sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"
            ))
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ANY($1)
                 ORDER BY created_at ASC, id ASC"
            ))
            .bind(status_strings(statuses))
            .fetch_all(self.pool())
            .await?
        };

        Ok(decode_tasks(rows))
    }

    pub(crate) async fn list_pending_rows(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(decode_tasks(rows))
    }

    pub(crate) async fn count_task_rows(&self, statuses: &[TaskStatus]) -> Result<u64> {
        let (count,): (i64,) = if statuses.is_empty() {
            sqlx::query_as("SELECT COUNT(*) FROM tasks")
                .fetch_one(self.pool())
                .await?
        } else {
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ANY($1)")
                .bind(status_strings(statuses))
                .fetch_one(self.pool())
                .await?
        };
        Ok(count as u64)
    }

    /// Pending → Assigned in one transaction. Row locks are taken task
    /// first, then worker, the same order `commit_task_row` uses.
    pub(crate) async fn assign_task_row(&self, assignment: Assignment<'_>) -> Result<Task> {
        let mut tx = self.pool().begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(assignment.task_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let mut task = row
            .ok_or_else(|| Error::NotFound(format!("task {}", assignment.task_id)))?
            .try_into_task()?;

        if task.status != TaskStatus::Pending || task.version != assignment.expected_version {
            return Err(Error::Conflict(format!(
                "task {} is {} at version {}, expected pending at {}",
                task.id, task.status, task.version, assignment.expected_version
            )));
        }

        let worker: Option<WorkerRow> = sqlx::query_as(
            "SELECT id, name, worker_type, capabilities, status, current_task, last_heartbeat, performance_score, registered_at, version
             FROM workers WHERE id = $1 FOR UPDATE",
        )
        .bind(assignment.worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let worker = worker
            .ok_or_else(|| Error::NotFound(format!("worker {}", assignment.worker_id)))?
            .try_into_worker()?;
        if !worker.is_active() {
            return Err(Error::NoEligibleWorker);
        }

        let (load,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks
             WHERE assigned_worker = $1 AND status IN ('assigned', 'in_progress')",
        )
        .bind(assignment.worker_id)
        .fetch_one(&mut *tx)
        .await?;
        if load as usize >= assignment.capacity {
            return Err(Error::NoEligibleWorker);
        }

        task.assign(assignment.worker_id, assignment.at)?;

        let row: TaskRow = sqlx::query_as(&format!(
            "UPDATE tasks SET status = 'assigned', assigned_worker = $1, assigned_at = $2, version = version + 1
             WHERE id = $3
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(assignment.worker_id)
        .bind(assignment.at)
        .bind(task.id.0)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workers SET current_task = $1, version = version + 1 WHERE id = $2",
        )
        .bind(task.id.0)
        .bind(assignment.worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into_task()
    }

    /// Versioned write of a task's mutable state.
    pub(crate) async fn commit_task_row(&self, task: &Task) -> Result<Task> {
        let mut tx = self.pool().begin().await?;

        let stored: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(task.id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let stored = stored
            .ok_or_else(|| Error::NotFound(format!("task {}", task.id)))?
            .try_into_task()?;

        if stored.version != task.version {
            return Err(Error::Conflict(format!(
                "task {} changed: version {} != {}",
                task.id, stored.version, task.version
            )));
        }

        let row: TaskRow = sqlx::query_as(&format!(
            "UPDATE tasks SET
                retry_count = $1, status = $2, assigned_worker = $3, assigned_at = $4,
                started_at = $5, completed_at = $6, result = $7, error = $8,
                version = version + 1
             WHERE id = $9 AND version = $10
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.retry_count as i32)
        .bind(task.status.as_str())
        .bind(&task.assigned_worker)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.id.0)
        .bind(task.version as i64)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(prev) = released_worker(&stored, task) {
            sqlx::query(
                "UPDATE workers SET current_task = NULL, version = version + 1
                 WHERE id = $1 AND current_task = $2",
            )
            .bind(prev)
            .bind(task.id.0)
            .execute(&mut *tx)
            .await?;
        }

        if task.status == TaskStatus::Pending {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(TASK_READY_CHANNEL)
                .bind(task.id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        row.try_into_task()
    }
}

fn decode_tasks(rows: Vec<PgRow>) -> Vec<Task> {
    decode_rows("tasks", rows, |row| TaskRow::from_row(row)?.try_into_task())
}

fn timeout_ms(task: &Task) -> Result<i64> {
    i64::try_from(task.timeout.as_millis()).map_err(|_| {
        Error::InvalidOperation(format!(
            "task timeout of {}s is too large to store",
            task.timeout.as_secs()
        ))
    })
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task_type: String,
    payload: serde_json::Value,
    priority: i16,
    timeout_ms: i64,
    retry_count: i32,
    max_retries: i32,
    required_capabilities: Json<Vec<String>>,
    status: String,
    assigned_worker: Option<String>,
    created_at: DateTime<Utc>,
    assigned_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    version: i64,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            task_type: self.task_type,
            payload: self.payload,
            priority: Priority::from_level(self.priority)?,
            timeout: Duration::from_millis(self.timeout_ms.max(0) as u64),
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            required_capabilities: self.required_capabilities.0,
            status: self.status.parse()?,
            assigned_worker: self.assigned_worker,
            created_at: self.created_at,
            assigned_at: self.assigned_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result,
            error: self.error,
            version: self.version as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;

    #[test]
    fn oversized_timeout_is_rejected_not_wrapped() {
        let task = NewTask::new("job")
            .timeout(Duration::from_secs(u64::MAX))
            .build(TaskId::new(), Utc::now(), Duration::from_secs(60), 3);
        assert!(matches!(timeout_ms(&task), Err(Error::InvalidOperation(_))));

        let task = NewTask::new("job")
            .timeout(Duration::from_millis(1500))
            .build(TaskId::new(), Utc::now(), Duration::from_secs(60), 3);
        assert_eq!(timeout_ms(&task).unwrap(), 1500);
    }
}
