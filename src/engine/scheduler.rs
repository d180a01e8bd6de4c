//! Dispatcher: drains the dispatch queue into live workers.

use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

use super::shutdown_requested;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::model::{Task, TaskId, TaskStatus, Worker};
use crate::queue::DispatchQueue;
use crate::registry::WorkerRegistry;
use crate::store::{Assignment, Store};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_transition, start_dispatch_span};

/// How many times one dispatch attempt re-reads the worker list after
/// losing a race for a worker.
const MAX_WORKER_RACES: usize = 3;

/// Result of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The queue was empty.
    Idle,
    Assigned { task_id: TaskId, worker_id: String },
    /// No active worker could take the head task; it was put back.
    NoEligibleWorker { task_id: TaskId },
    /// The task stopped being pending elsewhere (cancelled, assigned by
    /// another scheduler); it was dropped from the local queue.
    Dropped { task_id: TaskId },
    /// The assignment write failed; the task was put back unchanged.
    Failed { task_id: TaskId, error: String },
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<WorkerRegistry>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<WorkerRegistry>,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            clock,
            config,
        }
    }

    /// Pop the head of the queue and try to place it on a worker.
    pub async fn dispatch_once(&self) -> DispatchOutcome {
        let Some(task) = self.queue.pop() else {
            return DispatchOutcome::Idle;
        };

        let span = start_dispatch_span(task.id, task.priority);
        let outcome = self.place(task).instrument(span.clone()).await;

        let label = match &outcome {
            DispatchOutcome::Idle => "idle",
            DispatchOutcome::Assigned { worker_id, .. } => {
                span.record("task.worker", worker_id.as_str());
                "assigned"
            }
            DispatchOutcome::NoEligibleWorker { .. } => "no_worker",
            DispatchOutcome::Dropped { .. } => "conflict",
            DispatchOutcome::Failed { .. } => "error",
        };
        metrics::dispatch_attempts().add(1, &[KeyValue::new("outcome", label)]);
        outcome
    }

    async fn place(&self, mut task: Task) -> DispatchOutcome {
        let task_id = task.id;

        for _ in 0..MAX_WORKER_RACES {
            let worker_id = match self.select_worker(&task).await {
                Ok(Some(worker)) => worker.id,
                Ok(None) => {
                    debug!(%task_id, "no eligible worker, requeueing");
                    self.queue.requeue(task);
                    return DispatchOutcome::NoEligibleWorker { task_id };
                }
                Err(e) => return self.put_back(task, e),
            };

            let assignment = Assignment {
                task_id,
                expected_version: task.version,
                worker_id: &worker_id,
                capacity: self.config.worker_capacity,
                at: self.clock.now(),
            };

            match self.store.assign_task(assignment).await {
                Ok(assigned) => {
                    record_transition(
                        &tracing::Span::current(),
                        task_id,
                        TaskStatus::Pending,
                        TaskStatus::Assigned,
                    );
                    info!(%task_id, worker_id = %worker_id, priority = %assigned.priority, "task assigned");
                    return DispatchOutcome::Assigned { task_id, worker_id };
                }
                // The worker went away or filled up since we listed it:
                // recompute against a fresh active list.
                Err(Error::NoEligibleWorker) => {
                    debug!(%task_id, worker_id = %worker_id, "worker no longer available, reselecting");
                }
                Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => {
                    match self.store.get_task(task_id).await {
                        Ok(fresh) if fresh.status == TaskStatus::Pending => {
                            debug!(%task_id, "task changed before assignment, retrying with fresh copy");
                            task = fresh;
                        }
                        Ok(fresh) => {
                            debug!(%task_id, status = %fresh.status, "task no longer pending, dropping");
                            return DispatchOutcome::Dropped { task_id };
                        }
                        Err(Error::NotFound(_)) => return DispatchOutcome::Dropped { task_id },
                        Err(e) => return self.put_back(task, e),
                    }
                }
                Err(e) => return self.put_back(task, e),
            }
        }

        self.queue.requeue(task);
        DispatchOutcome::NoEligibleWorker { task_id }
    }

    /// Least-loaded active worker, ties broken by lowest id.
    async fn select_worker(&self, task: &Task) -> Result<Option<Worker>> {
        let active = self.registry.list_active().await?;
        if active.is_empty() {
            return Ok(None);
        }

        let in_flight = self.store.list_tasks(&TaskStatus::IN_FLIGHT).await?;
        let mut load: HashMap<&str, usize> = HashMap::new();
        for t in &in_flight {
            if let Some(worker) = t.assigned_worker.as_deref() {
                *load.entry(worker).or_default() += 1;
            }
        }

        let chosen = active
            .into_iter()
            .filter(|w| load.get(w.id.as_str()).copied().unwrap_or(0) < self.config.worker_capacity)
            .filter(|w| !self.config.match_capabilities || w.has_capabilities(&task.required_capabilities))
            .min_by(|a, b| {
                let la = load.get(a.id.as_str()).copied().unwrap_or(0);
                let lb = load.get(b.id.as_str()).copied().unwrap_or(0);
                la.cmp(&lb).then_with(|| a.id.cmp(&b.id))
            });
        Ok(chosen)
    }

    fn put_back(&self, task: Task, error: Error) -> DispatchOutcome {
        let task_id = task.id;
        warn!(%task_id, error = %error, "dispatch failed, task left pending");
        self.queue.requeue(task);
        DispatchOutcome::Failed {
            task_id,
            error: error.to_string(),
        }
    }

    /// How long to pause after `outcome` before the next attempt.
    fn pause_after(&self, outcome: &DispatchOutcome) -> Option<Duration> {
        match outcome {
            DispatchOutcome::Idle => Some(self.config.idle_poll),
            DispatchOutcome::NoEligibleWorker { .. } => Some(self.config.no_worker_backoff),
            DispatchOutcome::Failed { .. } => Some(self.config.failure_backoff),
            DispatchOutcome::Assigned { .. } | DispatchOutcome::Dropped { .. } => None,
        }
    }

    /// Pick up pending tasks written by other processes.
    async fn refill(&self) -> usize {
        match self.store.list_pending().await {
            Ok(pending) => self.queue.merge(pending),
            Err(e) => {
                warn!(error = %e, "could not refill dispatch queue from store");
                0
            }
        }
    }

    /// Dispatch until shutdown. Waits are cut short by enqueues and worker
    /// registrations.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.dispatch_once().await;
            if outcome == DispatchOutcome::Idle && self.refill().await > 0 {
                continue;
            }
            let Some(pause) = self.pause_after(&outcome) else {
                continue;
            };

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = self.queue.wait(pause) => {}
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}
