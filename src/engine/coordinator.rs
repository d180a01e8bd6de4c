//! Coordinator: owns the engine components and exposes the external
//! operations (worker registration, task lifecycle, status).

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Span, debug, info};

use super::{HeartbeatMonitor, Scheduler, TimeoutMonitor};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskId, TaskStatus, Worker, WorkerRegistration};
use crate::queue::DispatchQueue;
use crate::registry::WorkerRegistry;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::record_transition;

/// Attempts at a read-modify-write on a task before giving up on a record
/// that keeps changing underneath us.
const MAX_COMMIT_ATTEMPTS: usize = 5;

/// Point-in-time counters for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    /// Pending tasks in the durable store.
    pub pending_count: u64,
    /// Assigned or in-progress tasks.
    pub active_task_count: u64,
    /// Tasks currently held by this process's dispatch queue.
    pub queue_size: usize,
    pub active_worker_count: usize,
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    queue: Arc<DispatchQueue>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    heartbeat: Arc<HeartbeatMonitor>,
    timeouts: Arc<TimeoutMonitor>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Wire the engine over `store`. Nothing runs until [`Coordinator::run`].
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(DispatchQueue::new());
        let registry = Arc::new(
            WorkerRegistry::new(Arc::clone(&store), Arc::clone(&clock)).with_waker(queue.waker()),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.heartbeat_interval,
            config.liveness_threshold(),
        ));
        let timeouts = Arc::new(TimeoutMonitor::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.timeout_check_interval,
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            store,
            clock,
            config,
            queue,
            registry,
            scheduler,
            heartbeat,
            timeouts,
            shutdown,
        })
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker> {
        registration.validate()?;
        self.registry.register(registration).await
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<Worker> {
        self.registry.heartbeat(worker_id).await
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.registry.list_all().await
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        self.registry.get(worker_id).await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Persist a new pending task and enqueue it for dispatch.
    pub async fn create_task(&self, new: NewTask) -> Result<TaskId> {
        if new.task_type.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "task type must not be empty".to_string(),
            ));
        }
        if new.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidOperation(
                "task timeout must be greater than zero".to_string(),
            ));
        }
        if new.max_retries == Some(0) {
            return Err(Error::InvalidOperation(
                "max_retries must be at least 1".to_string(),
            ));
        }

        let task = new.build(
            TaskId::new(),
            self.clock.now(),
            self.config.default_task_timeout,
            self.config.max_retries,
        );
        self.store.insert_task(&task).await?;

        metrics::tasks_created().add(
            1,
            &[
                KeyValue::new("task_type", task.task_type.clone()),
                KeyValue::new("priority", task.priority.to_string()),
            ],
        );
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            timeout_secs = task.timeout.as_secs(),
            "task created"
        );

        let id = task.id;
        self.queue.push(task);
        Ok(id)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.store.get_task(id).await
    }

    /// Pending tasks in dispatch order, read from the durable store.
    pub async fn list_pending_tasks(&self) -> Result<Vec<Task>> {
        self.store.list_pending().await
    }

    /// All tasks, or only those in `status`, oldest first.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        match status {
            Some(status) => self.store.list_tasks(&[status]).await,
            None => self.store.list_tasks(&[]).await,
        }
    }

    /// Worker acknowledgement: assigned → in_progress.
    pub async fn start_task(&self, id: TaskId, worker_id: &str) -> Result<Task> {
        self.update_task(id, |task, now| task.start(worker_id, now))
            .await
    }

    /// Worker-reported success. Frees the worker's slot.
    pub async fn complete_task(&self, id: TaskId, result: serde_json::Value) -> Result<Task> {
        self.update_task(id, |task, now| task.complete(result.clone(), now))
            .await
    }

    /// Worker-reported failure. Terminal; not retried.
    pub async fn fail_task(&self, id: TaskId, error: &str) -> Result<Task> {
        self.update_task(id, |task, now| task.fail(error, now)).await
    }

    /// Cancel a task that has not finished. A worker already running it is
    /// not interrupted; its later completion is rejected.
    pub async fn cancel_task(&self, id: TaskId) -> Result<Task> {
        let task = self.update_task(id, |task, now| task.cancel(now)).await?;
        self.queue.remove(id);
        Ok(task)
    }

    /// Read, apply `change`, and commit on the read version. A conflicting
    /// write (typically the timeout monitor) causes a re-read, so `change`
    /// is always judged against the latest state.
    async fn update_task<F>(&self, id: TaskId, mut change: F) -> Result<Task>
    where
        F: FnMut(&mut Task, DateTime<Utc>) -> Result<()> + Send,
    {
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let mut task = self.store.get_task(id).await?;
            let from = task.status;
            let held_slot = task.is_in_flight();
            change(&mut task, self.clock.now())?;

            match self.store.commit_task(&task).await {
                Ok(committed) => {
                    record_transition(&Span::current(), id, from, committed.status);
                    if held_slot && !committed.is_in_flight() {
                        // A worker slot opened up.
                        self.queue.waker().notify_one();
                    }
                    return Ok(committed);
                }
                Err(Error::Conflict(_)) => {
                    debug!(task_id = %id, "task changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!("task {id} kept changing")))
    }

    // -----------------------------------------------------------------------
    // Status and lifecycle
    // -----------------------------------------------------------------------

    pub async fn system_status(&self) -> Result<SystemStatus> {
        let pending_count = self.store.count_tasks(&[TaskStatus::Pending]).await?;
        let active_task_count = self.store.count_tasks(&TaskStatus::IN_FLIGHT).await?;
        let active_worker_count = self.registry.list_active().await?.len();
        Ok(SystemStatus {
            pending_count,
            active_task_count,
            queue_size: self.queue.len(),
            active_worker_count,
        })
    }

    /// Rebuild the dispatch queue from the store. In-flight tasks are left to
    /// the timeout monitor. Returns the number of tasks queued.
    pub async fn recover(&self) -> Result<usize> {
        let queued = self.queue.rebuild(self.store.list_pending().await?);
        let in_flight = self.store.count_tasks(&TaskStatus::IN_FLIGHT).await?;
        info!(queued, in_flight, "recovered dispatch state from store");
        Ok(queued)
    }

    /// Recover, then run the scheduler and both monitors until
    /// [`Coordinator::shutdown`].
    pub async fn run(&self) -> Result<()> {
        self.recover().await?;

        let scheduler = tokio::spawn(Arc::clone(&self.scheduler).run(self.shutdown.subscribe()));
        let heartbeat = tokio::spawn(Arc::clone(&self.heartbeat).run(self.shutdown.subscribe()));
        let timeouts = tokio::spawn(Arc::clone(&self.timeouts).run(self.shutdown.subscribe()));
        info!("coordinator running");

        let (scheduler, heartbeat, timeouts) = tokio::join!(scheduler, heartbeat, timeouts);
        for joined in [scheduler, heartbeat, timeouts] {
            joined.map_err(|e| Error::Other(format!("engine loop aborted: {e}")))??;
        }
        info!("coordinator stopped");
        Ok(())
    }

    /// Ask every loop to stop after its current step.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Subscribe to the shutdown flag (for auxiliary loops run alongside).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn heartbeat_monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn timeout_monitor(&self) -> &Arc<TimeoutMonitor> {
        &self.timeouts
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }
}
