//! Heartbeat monitor: demotes workers that stopped sending heartbeats.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::shutdown_requested;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;
use crate::telemetry::metrics;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub checked: usize,
    pub demoted: Vec<String>,
    pub errors: usize,
}

pub struct HeartbeatMonitor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    /// Silence after which a worker is demoted.
    threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            threshold,
        }
    }

    /// Check every worker once. A failure on one worker is logged and the
    /// sweep continues with the rest.
    pub async fn sweep(&self) -> Result<HeartbeatReport> {
        let started = Instant::now();
        let workers = self.store.list_workers().await?;
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = HeartbeatReport {
            checked: workers.len(),
            ..Default::default()
        };

        for worker in workers {
            if !worker.is_active() || !worker.is_stale(now, self.threshold) {
                continue;
            }
            match self.store.demote_worker(&worker.id, cutoff).await {
                Ok(true) => {
                    warn!(
                        worker_id = %worker.id,
                        last_heartbeat = %worker.last_heartbeat,
                        "worker missed heartbeats, marked inactive"
                    );
                    metrics::workers_demoted().add(1, &[]);
                    report.demoted.push(worker.id);
                }
                Ok(false) => {
                    debug!(worker_id = %worker.id, "heartbeat arrived during sweep");
                }
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "could not check worker");
                    report.errors += 1;
                }
            }
        }

        metrics::sweep_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("monitor", "heartbeat")],
        );
        Ok(report)
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "heartbeat monitor started");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(_) => {}
                // Retried on the next tick.
                Err(e) if e.is_transient() => warn!(error = %e, "heartbeat sweep failed"),
                Err(e) => error!(error = %e, "heartbeat sweep failed"),
            }
        }
        info!("heartbeat monitor stopped");
        Ok(())
    }
}
