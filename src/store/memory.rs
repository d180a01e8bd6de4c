//! In-process store.
//!
//! Records are locked individually. The maps are only locked long enough to
//! look up or insert an entry, and no record is ever locked while a map lock
//! is held. When a write touches both kinds of record the task is locked
//! before the worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{Assignment, Store, released_worker};
use crate::error::{Error, Result};
use crate::model::{Task, TaskId, TaskStatus, Worker, WorkerRegistration, WorkerStatus};

type Record<T> = Arc<Mutex<T>>;

/// A worker and the tasks it currently holds.
#[derive(Debug)]
struct WorkerSlot {
    worker: Worker,
    in_flight: HashSet<TaskId>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, Record<Task>>>,
    workers: RwLock<HashMap<String, Record<WorkerSlot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn task_record(&self, id: TaskId) -> Result<Record<Task>> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| task_not_found(id))
    }

    async fn worker_record(&self, id: &str) -> Result<Record<WorkerSlot>> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| worker_not_found(id))
    }

    async fn task_snapshot(&self, statuses: &[TaskStatus]) -> Vec<Task> {
        let records: Vec<Record<Task>> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(records.len());
        for record in records {
            let task = record.lock().await;
            if statuses.is_empty() || statuses.contains(&task.status) {
                tasks.push(task.clone());
            }
        }
        tasks
    }
}

fn worker_not_found(id: &str) -> Error {
    Error::NotFound(format!("worker {id}"))
}

fn task_not_found(id: TaskId) -> Error {
    Error::NotFound(format!("task {id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_worker(
        &self,
        registration: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        registration.validate()?;
        let record = {
            let mut workers = self.workers.write().await;
            let existing = workers.get(&registration.id).cloned();
            match existing {
                Some(record) => record,
                None => {
                    let mut worker = registration.apply(None, now);
                    worker.version += 1;
                    let slot = WorkerSlot {
                        worker: worker.clone(),
                        in_flight: HashSet::new(),
                    };
                    workers.insert(worker.id.clone(), Arc::new(Mutex::new(slot)));
                    return Ok(worker);
                }
            }
        };

        let mut slot = record.lock().await;
        let mut worker = registration.apply(Some(&slot.worker), now);
        worker.version += 1;
        slot.worker = worker.clone();
        Ok(worker)
    }

    async fn touch_worker(&self, id: &str, now: DateTime<Utc>) -> Result<Worker> {
        let record = self.worker_record(id).await?;
        let mut slot = record.lock().await;
        slot.worker.status = WorkerStatus::Active;
        slot.worker.last_heartbeat = now;
        slot.worker.version += 1;
        Ok(slot.worker.clone())
    }

    async fn get_worker(&self, id: &str) -> Result<Worker> {
        let record = self.worker_record(id).await?;
        let slot = record.lock().await;
        Ok(slot.worker.clone())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let records: Vec<Record<WorkerSlot>> =
            self.workers.read().await.values().cloned().collect();
        let mut workers = Vec::with_capacity(records.len());
        for record in records {
            workers.push(record.lock().await.worker.clone());
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn demote_worker(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let record = self.worker_record(id).await?;
        let mut slot = record.lock().await;
        let worker = &mut slot.worker;
        if worker.status != WorkerStatus::Active || worker.last_heartbeat >= stale_before {
            return Ok(false);
        }
        worker.status = WorkerStatus::Inactive;
        worker.version += 1;
        Ok(true)
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(Error::Conflict(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, Arc::new(Mutex::new(task.clone())));
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let record = self.task_record(id).await?;
        let task = record.lock().await;
        Ok(task.clone())
    }

    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let mut tasks = self.task_snapshot(statuses).await;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn list_pending(&self) -> Result<Vec<Task>> {
        let mut tasks = self.task_snapshot(&[TaskStatus::Pending]).await;
        tasks.sort_by_key(|t| t.queue_key());
        Ok(tasks)
    }

    async fn count_tasks(&self, statuses: &[TaskStatus]) -> Result<u64> {
        Ok(self.task_snapshot(statuses).await.len() as u64)
    }

    async fn assign_task(&self, assignment: Assignment<'_>) -> Result<Task> {
        let task_record = self.task_record(assignment.task_id).await?;
        let worker_record = self.worker_record(assignment.worker_id).await?;

        let mut task = task_record.lock().await;
        if task.status != TaskStatus::Pending || task.version != assignment.expected_version {
            return Err(Error::Conflict(format!(
                "task {} is {} at version {}, expected pending at {}",
                task.id, task.status, task.version, assignment.expected_version
            )));
        }

        let mut slot = worker_record.lock().await;
        if !slot.worker.is_active() || slot.in_flight.len() >= assignment.capacity {
            return Err(Error::NoEligibleWorker);
        }

        let mut updated = task.clone();
        updated.assign(assignment.worker_id, assignment.at)?;
        updated.version += 1;

        slot.in_flight.insert(updated.id);
        slot.worker.current_task = Some(updated.id);
        slot.worker.version += 1;
        *task = updated.clone();
        Ok(updated)
    }

    async fn commit_task(&self, task: &Task) -> Result<Task> {
        let record = self.task_record(task.id).await?;
        let mut stored = record.lock().await;
        if stored.version != task.version {
            return Err(Error::Conflict(format!(
                "task {} changed: version {} != {}",
                task.id, stored.version, task.version
            )));
        }

        if let Some(prev) = released_worker(&stored, task) {
            // A worker that vanished from the map has no slot to release.
            if let Ok(worker_record) = self.worker_record(prev).await {
                let mut slot = worker_record.lock().await;
                slot.in_flight.remove(&task.id);
                if slot.worker.current_task == Some(task.id) {
                    slot.worker.current_task = None;
                    slot.worker.version += 1;
                }
            }
        }

        let mut updated = task.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, Priority};
    use std::time::Duration;

    fn pending(now: DateTime<Utc>) -> Task {
        NewTask::new("job")
            .priority(Priority::Medium)
            .build(TaskId::new(), now, Duration::from_secs(60), 3)
    }

    #[tokio::test]
    async fn held_task_record_does_not_block_other_records() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = pending(now);
        let b = pending(now);
        store.insert_task(&a).await.unwrap();
        store.insert_task(&b).await.unwrap();
        store
            .upsert_worker(WorkerRegistration::new("w1", "w1", "cpu"), now)
            .await
            .unwrap();

        let held = store.task_record(a.id).await.unwrap();
        let _guard = held.lock().await;

        let other = tokio::time::timeout(Duration::from_secs(1), async {
            store.get_task(b.id).await.unwrap();
            store.touch_worker("w1", now).await.unwrap();
            store
                .assign_task(Assignment {
                    task_id: b.id,
                    expected_version: b.version,
                    worker_id: "w1",
                    capacity: 1,
                    at: now,
                })
                .await
                .unwrap()
        })
        .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn load_follows_assignments_and_releases() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_worker(WorkerRegistration::new("w1", "w1", "cpu"), now)
            .await
            .unwrap();
        let a = pending(now);
        let b = pending(now);
        store.insert_task(&a).await.unwrap();
        store.insert_task(&b).await.unwrap();

        let assign = |task: &Task| Assignment {
            task_id: task.id,
            expected_version: task.version,
            worker_id: "w1",
            capacity: 1,
            at: now,
        };
        let mut assigned = store.assign_task(assign(&a)).await.unwrap();
        assert!(matches!(
            store.assign_task(assign(&b)).await,
            Err(Error::NoEligibleWorker)
        ));

        assigned.complete(serde_json::Value::Null, now).unwrap();
        store.commit_task(&assigned).await.unwrap();
        store.assign_task(assign(&b)).await.unwrap();
        assert_eq!(store.get_worker("w1").await.unwrap().current_task, Some(b.id));
    }
}
