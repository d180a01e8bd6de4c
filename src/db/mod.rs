//! Postgres-backed store: connection pool, migrations, health check.
//!
//! Task and worker operations live in the `task` and `worker` submodules;
//! [`Store`] is implemented here by delegating to them.

pub mod task;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::engine::shutdown_requested;
use crate::error::Result;
use crate::model::{Task, TaskId, TaskStatus, Worker, WorkerRegistration};
use crate::store::{Assignment, Store};

/// Channel notified when a task becomes pending.
pub const TASK_READY_CHANNEL: &str = "task_ready";

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward `task_ready` notifications to `waker` until shutdown, so a
    /// scheduler in this process picks up tasks created by other processes
    /// without waiting for its idle poll.
    pub async fn forward_task_ready(
        &self,
        waker: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(TASK_READY_CHANNEL).await?;
        info!(channel = TASK_READY_CHANNEL, "listening for task notifications");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                notification = listener.recv() => match notification {
                    Ok(n) => {
                        debug!(task_id = n.payload(), "notified of pending task");
                        waker.notify_one();
                    }
                    // PgListener reconnects on the next recv; the idle poll
                    // covers the gap.
                    Err(e) => warn!(error = %e, "task notification listener error"),
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for Db {
    async fn upsert_worker(
        &self,
        registration: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        self.upsert_worker_row(registration, now).await
    }

    async fn touch_worker(&self, id: &str, now: DateTime<Utc>) -> Result<Worker> {
        self.touch_worker_row(id, now).await
    }

    async fn get_worker(&self, id: &str) -> Result<Worker> {
        self.get_worker_row(id).await
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.list_worker_rows().await
    }

    async fn demote_worker(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        self.demote_worker_row(id, stale_before).await
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.insert_task_row(task).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.get_task_row(id).await
    }

    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        self.list_task_rows(statuses).await
    }

    async fn list_pending(&self) -> Result<Vec<Task>> {
        self.list_pending_rows().await
    }

    async fn count_tasks(&self, statuses: &[TaskStatus]) -> Result<u64> {
        self.count_task_rows(statuses).await
    }

    async fn assign_task(&self, assignment: Assignment<'_>) -> Result<Task> {
        self.assign_task_row(assignment).await
    }

    async fn commit_task(&self, task: &Task) -> Result<Task> {
        self.commit_task_row(task).await
    }
}

fn status_strings(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

/// Decode listed rows one at a time. A row that fails to decode is logged
/// and skipped, so one bad record cannot hide the rest of a listing.
fn decode_rows<T>(
    table: &'static str,
    rows: Vec<PgRow>,
    decode: impl Fn(&PgRow) -> Result<T>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(table, id = %row_id(row), error = %e, "skipping undecodable row");
                None
            }
        })
        .collect()
}

fn row_id(row: &PgRow) -> String {
    row.try_get::<String, _>("id")
        .or_else(|_| row.try_get::<uuid::Uuid, _>("id").map(|id| id.to_string()))
        .unwrap_or_else(|_| "?".to_string())
}
