//! Timeout monitor: fails tasks that overstay their timeout and requeues
//! them while retries remain.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Span, debug, error, info, warn};

use super::shutdown_requested;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{Expiry, Task, TaskId, TaskStatus};
use crate::queue::DispatchQueue;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::record_transition;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    pub checked: usize,
    pub requeued: Vec<TaskId>,
    pub exhausted: Vec<TaskId>,
    /// Expired tasks that changed before we could fail them (usually a
    /// completion that landed first).
    pub superseded: Vec<TaskId>,
    pub errors: usize,
}

pub struct TimeoutMonitor {
    store: Arc<dyn Store>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl TimeoutMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            interval,
        }
    }

    /// Check every in-flight task once.
    pub async fn sweep(&self) -> Result<TimeoutReport> {
        let started = Instant::now();
        let in_flight = self.store.list_tasks(&TaskStatus::IN_FLIGHT).await?;
        let now = self.clock.now();

        let mut report = TimeoutReport {
            checked: in_flight.len(),
            ..Default::default()
        };

        for task in in_flight {
            if !task.is_expired(now) {
                continue;
            }
            let task_id = task.id;
            match self.expire(task, now).await {
                Ok(Expiry::Requeued { .. }) => report.requeued.push(task_id),
                Ok(Expiry::Exhausted { .. }) => report.exhausted.push(task_id),
                Err(Error::Conflict(_)) | Err(Error::InvalidState { .. }) => {
                    debug!(%task_id, "task changed before timeout could apply");
                    report.superseded.push(task_id);
                }
                Err(e) => {
                    warn!(%task_id, error = %e, "could not expire task");
                    report.errors += 1;
                }
            }
        }

        metrics::sweep_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("monitor", "timeout")],
        );
        Ok(report)
    }

    /// Fail one expired task and either put it back in the queue or leave
    /// it permanently failed. The worker's `current_task` is cleared by the
    /// same commit.
    async fn expire(&self, mut task: Task, now: DateTime<Utc>) -> Result<Expiry> {
        let from = task.status;
        let worker = task.assigned_worker.clone().unwrap_or_default();
        let expiry = task.expire(now)?;
        let committed = self.store.commit_task(&task).await?;

        let span = Span::current();
        record_transition(&span, committed.id, from, TaskStatus::Failed);
        match expiry {
            Expiry::Requeued { retry_count } => {
                record_transition(&span, committed.id, TaskStatus::Failed, TaskStatus::Pending);
                warn!(
                    task_id = %committed.id,
                    worker_id = %worker,
                    retry_count,
                    max_retries = committed.max_retries,
                    "task timed out, requeued"
                );
                metrics::tasks_timed_out().add(1, &[KeyValue::new("outcome", "requeued")]);
                self.queue.push(committed);
            }
            Expiry::Exhausted { retry_count } => {
                error!(
                    task_id = %committed.id,
                    worker_id = %worker,
                    retry_count,
                    "task timed out, retries exhausted"
                );
                metrics::tasks_timed_out().add(1, &[KeyValue::new("outcome", "exhausted")]);
            }
        }
        Ok(expiry)
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "timeout monitor started");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => warn!(error = %e, "timeout sweep failed"),
                Err(e) => error!(error = %e, "timeout sweep failed"),
            }
        }
        info!("timeout monitor stopped");
        Ok(())
    }
}
