//! Worker registry: registration, heartbeats and liveness queries.
//!
//! Reads always go to the store, so `list_active` reflects the latest
//! heartbeat monitor sweep rather than a cached view.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::{Worker, WorkerRegistration, WorkerStatus};
use crate::store::Store;
use crate::telemetry::metrics;

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    /// Signalled whenever a worker (re)appears, so a backed-off scheduler
    /// can retry immediately.
    waker: Option<Arc<Notify>>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            waker: None,
        }
    }

    pub fn with_waker(mut self, waker: Arc<Notify>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Idempotent upsert keyed by id. Re-registration overwrites the
    /// declared fields and reactivates the worker.
    pub async fn register(&self, registration: WorkerRegistration) -> Result<Worker> {
        let worker = self
            .store
            .upsert_worker(registration, self.clock.now())
            .await?;
        info!(
            worker_id = %worker.id,
            worker_type = %worker.worker_type,
            capabilities = ?worker.capabilities,
            "worker registered"
        );
        self.wake();
        Ok(worker)
    }

    /// Refresh a worker's liveness. An inactive worker becomes eligible
    /// again immediately.
    pub async fn heartbeat(&self, id: &str) -> Result<Worker> {
        let worker = self.store.touch_worker(id, self.clock.now()).await?;
        metrics::heartbeats().add(1, &[]);
        debug!(worker_id = %id, "heartbeat");
        self.wake();
        Ok(worker)
    }

    /// Workers currently eligible for dispatch.
    pub async fn list_active(&self) -> Result<Vec<Worker>> {
        let workers = self.store.list_workers().await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Active)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Worker> {
        self.store.get_worker(id).await
    }

    pub async fn list_all(&self) -> Result<Vec<Worker>> {
        self.store.list_workers().await
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
    }
}
