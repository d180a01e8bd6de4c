//! Persistence boundary for worker and task records.
//!
//! Every mutation is checked against a record version (or performed inside
//! a transaction), so concurrent writers never lose each other's updates.
//! Implementations: [`MemoryStore`] for tests and single-process runs,
//! [`crate::db::Db`] for Postgres.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Task, TaskId, TaskStatus, Worker, WorkerRegistration};

/// A request to move a pending task onto a worker.
#[derive(Debug, Clone)]
pub struct Assignment<'a> {
    pub task_id: TaskId,
    /// Version of the task the scheduler observed as pending.
    pub expected_version: u64,
    pub worker_id: &'a str,
    /// Maximum number of in-flight tasks the worker may hold.
    pub capacity: usize,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Insert or overwrite a worker, marking it active with a fresh heartbeat.
    async fn upsert_worker(
        &self,
        registration: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> Result<Worker>;

    /// Record a heartbeat: active, `last_heartbeat = now`.
    async fn touch_worker(&self, id: &str, now: DateTime<Utc>) -> Result<Worker>;

    async fn get_worker(&self, id: &str) -> Result<Worker>;

    /// All workers ordered by id.
    async fn list_workers(&self) -> Result<Vec<Worker>>;

    /// Mark a worker inactive if it is still active and its last heartbeat
    /// is older than `stale_before`. Returns whether it was demoted; a
    /// heartbeat that lands first wins.
    async fn demote_worker(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool>;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Tasks in any of `statuses` (all tasks when empty), oldest first.
    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    /// Pending tasks in dispatch order.
    async fn list_pending(&self) -> Result<Vec<Task>>;

    async fn count_tasks(&self, statuses: &[TaskStatus]) -> Result<u64>;

    /// Atomically assign a pending task to an active worker with spare
    /// capacity, setting the worker's `current_task`.
    ///
    /// Fails with `Conflict` if the task is no longer pending at the
    /// expected version, and with `NoEligibleWorker` if the worker is
    /// inactive or full. On any error nothing is written.
    async fn assign_task(&self, assignment: Assignment<'_>) -> Result<Task>;

    /// Compare-and-swap a task record on its `version`, returning the stored
    /// record with the bumped version. When the task leaves flight, the
    /// previously assigned worker's `current_task` is cleared in the same
    /// write.
    async fn commit_task(&self, task: &Task) -> Result<Task>;
}

/// The worker whose slot a task gives up when moving from `before` to `after`.
pub(crate) fn released_worker<'a>(before: &'a Task, after: &Task) -> Option<&'a str> {
    let prev = before.assigned_worker.as_deref().filter(|_| before.is_in_flight())?;
    let still_held = after.is_in_flight() && after.assigned_worker.as_deref() == Some(prev);
    if still_held { None } else { Some(prev) }
}
