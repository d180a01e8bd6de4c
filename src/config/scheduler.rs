//! Scheduling tunables.
//!
//! The heartbeat interval and the missed-beats multiplier together define
//! how quickly a silent worker stops receiving tasks.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::task::duration_secs;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Expected heartbeat period; also the heartbeat monitor's tick.
    #[serde(rename = "heartbeat_interval_secs", with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// A worker silent for longer than `missed_heartbeats * heartbeat_interval`
    /// is demoted to inactive.
    pub missed_heartbeats: u32,

    /// Timeout monitor tick.
    #[serde(rename = "timeout_check_interval_secs", with = "duration_secs")]
    pub timeout_check_interval: Duration,

    /// Timeout applied to tasks created without one.
    #[serde(rename = "default_task_timeout_secs", with = "duration_secs")]
    pub default_task_timeout: Duration,

    /// Retry limit applied to tasks created without one.
    pub max_retries: u32,

    /// Scheduler sleep when the queue is empty (woken early on enqueue).
    #[serde(rename = "idle_poll_secs", with = "duration_secs")]
    pub idle_poll: Duration,

    /// Scheduler back-off when no worker can take the head task.
    #[serde(rename = "no_worker_backoff_secs", with = "duration_secs")]
    pub no_worker_backoff: Duration,

    /// Scheduler back-off after a failed assignment write.
    #[serde(rename = "failure_backoff_secs", with = "duration_secs")]
    pub failure_backoff: Duration,

    /// In-flight tasks a worker may hold at once. 1 is the one-task-per-worker
    /// policy.
    pub worker_capacity: usize,

    /// Only dispatch tasks to workers declaring all required capabilities.
    pub match_capabilities: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 2,
            timeout_check_interval: Duration::from_secs(30),
            default_task_timeout: Duration::from_secs(600),
            max_retries: 3,
            idle_poll: Duration::from_secs(1),
            no_worker_backoff: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(5),
            worker_capacity: 1,
            match_capabilities: false,
        }
    }
}

impl SchedulerConfig {
    /// Read and validate a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read scheduler config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad scheduler config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Silence after which a worker is considered dead.
    pub fn liveness_threshold(&self) -> Duration {
        self.heartbeat_interval
            .checked_mul(self.missed_heartbeats)
            .unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("timeout_check_interval", self.timeout_check_interval),
            ("default_task_timeout", self.default_task_timeout),
            ("idle_poll", self.idle_poll),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.missed_heartbeats == 0 {
            return Err(Error::Config(
                "missed_heartbeats must be at least 1".to_string(),
            ));
        }
        if self
            .heartbeat_interval
            .checked_mul(self.missed_heartbeats)
            .is_none()
        {
            return Err(Error::Config(
                "heartbeat_interval * missed_heartbeats overflows".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.worker_capacity == 0 {
            return Err(Error::Config(
                "worker_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
