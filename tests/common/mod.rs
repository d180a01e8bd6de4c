//! Store wrapper shared by the monitor tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use taskmesh::error::{Error, Result};
use taskmesh::model::{Task, TaskId, TaskStatus, Worker, WorkerRegistration};
use taskmesh::store::{Assignment, MemoryStore, Store};

/// Delegates to a `MemoryStore` but fails writes for chosen records.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    broken_workers: Mutex<HashSet<String>>,
    broken_tasks: Mutex<HashSet<TaskId>>,
}

impl FaultyStore {
    /// Make `demote_worker` fail for this worker.
    pub fn break_worker(&self, id: &str) {
        self.broken_workers.lock().unwrap().insert(id.to_string());
    }

    /// Make `commit_task` fail for this task.
    pub fn break_task(&self, id: TaskId) {
        self.broken_tasks.lock().unwrap().insert(id);
    }
}

fn unavailable() -> Error {
    Error::Persistence(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl Store for FaultyStore {
    async fn upsert_worker(&self, reg: WorkerRegistration, now: DateTime<Utc>) -> Result<Worker> {
        self.inner.upsert_worker(reg, now).await
    }
    async fn touch_worker(&self, id: &str, now: DateTime<Utc>) -> Result<Worker> {
        self.inner.touch_worker(id, now).await
    }
    async fn get_worker(&self, id: &str) -> Result<Worker> {
        self.inner.get_worker(id).await
    }
    async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.inner.list_workers().await
    }
    async fn demote_worker(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        if self.broken_workers.lock().unwrap().contains(id) {
            return Err(unavailable());
        }
        self.inner.demote_worker(id, stale_before).await
    }
    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.inner.insert_task(task).await
    }
    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.inner.get_task(id).await
    }
    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        self.inner.list_tasks(statuses).await
    }
    async fn list_pending(&self) -> Result<Vec<Task>> {
        self.inner.list_pending().await
    }
    async fn count_tasks(&self, statuses: &[TaskStatus]) -> Result<u64> {
        self.inner.count_tasks(statuses).await
    }
    async fn assign_task(&self, assignment: Assignment<'_>) -> Result<Task> {
        self.inner.assign_task(assignment).await
    }
    async fn commit_task(&self, task: &Task) -> Result<Task> {
        if self.broken_tasks.lock().unwrap().contains(&task.id) {
            return Err(unavailable());
        }
        self.inner.commit_task(task).await
    }
}
