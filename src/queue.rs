//! In-memory dispatch queue.
//!
//! Holds the pending tasks in dispatch order: priority descending, creation
//! time ascending, task id ascending. The durable store is the source of
//! truth; this queue is rebuilt from it on startup and topped up from it
//! when idle.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::model::{QueueKey, Task, TaskId, TaskStatus};

#[derive(Debug, Default)]
struct Entries {
    ordered: BTreeMap<QueueKey, Task>,
    keys: HashMap<TaskId, QueueKey>,
}

impl Entries {
    fn insert(&mut self, task: Task) {
        let key = task.queue_key();
        if let Some(old) = self.keys.insert(task.id, key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key, task);
    }

    fn remove(&mut self, id: TaskId) -> Option<Task> {
        let key = self.keys.remove(&id)?;
        self.ordered.remove(&key)
    }
}

/// Priority queue of pending tasks with wake-on-enqueue.
#[derive(Debug)]
pub struct DispatchQueue {
    entries: Mutex<Entries>,
    waker: Arc<Notify>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::with_waker(Arc::new(Notify::new()))
    }

    /// Share a waker with other components (e.g. the worker registry) so
    /// that anything making dispatch possible wakes the scheduler.
    pub fn with_waker(waker: Arc<Notify>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            waker,
        }
    }

    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.waker)
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a pending task. Re-pushing a task replaces its previous
    /// entry; its position is determined by its original priority and
    /// creation time, never by when it was pushed.
    pub fn push(&self, task: Task) {
        if task.status != TaskStatus::Pending {
            return;
        }
        self.lock().insert(task);
        self.waker.notify_one();
    }

    /// Put a popped task back without waking the scheduler. Used when the
    /// task could not be placed, so the scheduler's back-off is not cut
    /// short by its own requeue.
    pub fn requeue(&self, task: Task) {
        if task.status == TaskStatus::Pending {
            self.lock().insert(task);
        }
    }

    /// Remove and return the head of the queue. Two concurrent pops never
    /// return the same task.
    pub fn pop(&self) -> Option<Task> {
        let mut entries = self.lock();
        let (_, task) = entries.ordered.pop_first()?;
        entries.keys.remove(&task.id);
        Some(task)
    }

    pub fn remove(&self, id: TaskId) -> Option<Task> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().keys.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued tasks in dispatch order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().ordered.values().cloned().collect()
    }

    /// Replace the queue contents with `pending` (startup recovery).
    pub fn rebuild(&self, pending: Vec<Task>) -> usize {
        let mut entries = self.lock();
        *entries = Entries::default();
        for task in pending {
            if task.status == TaskStatus::Pending {
                entries.insert(task);
            }
        }
        let len = entries.ordered.len();
        drop(entries);
        if len > 0 {
            self.waker.notify_one();
        }
        len
    }

    /// Add pending tasks not already queued; returns how many were added.
    pub fn merge(&self, pending: Vec<Task>) -> usize {
        let mut entries = self.lock();
        let mut added = 0;
        for task in pending {
            if task.status == TaskStatus::Pending && !entries.keys.contains_key(&task.id) {
                entries.insert(task);
                added += 1;
            }
        }
        drop(entries);
        if added > 0 {
            self.waker.notify_one();
        }
        added
    }

    /// Wait until something is enqueued (or another component signals the
    /// waker), or until `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.waker.notified()).await;
    }
}
