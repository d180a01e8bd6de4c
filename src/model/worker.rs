//! Worker records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::task::TaskId;
use crate::error::{Error, Result};

pub const DEFAULT_PERFORMANCE_SCORE: f64 = 100.0;

/// A worker process known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Caller-supplied identity. Re-registering the same id overwrites.
    pub id: String,
    pub name: String,
    pub worker_type: String,
    /// Declared capabilities, in declaration order, without duplicates.
    pub capabilities: Vec<String>,

    pub status: WorkerStatus,
    /// Most recently assigned task still in flight on this worker.
    pub current_task: Option<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    pub performance_score: f64,
    pub registered_at: DateTime<Utc>,

    /// Monotonic record version for optimistic concurrency.
    pub version: u64,
}

impl Worker {
    /// Has this worker been silent for longer than `threshold`?
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match (now - self.last_heartbeat).to_std() {
            Ok(silence) => silence > threshold,
            Err(_) => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }

    /// Does this worker declare every capability in `required`?
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Inactive,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "inactive" => Ok(WorkerStatus::Inactive),
            _ => Err(Error::Other(format!("unknown worker status: {s}"))),
        }
    }
}

/// What a worker announces about itself when it (re-)registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    pub name: String,
    pub worker_type: String,
    pub capabilities: Vec<String>,
}

impl WorkerRegistration {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        worker_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            worker_type: worker_type.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn capabilities<I, S>(self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        capabilities
            .into_iter()
            .fold(self, |reg, cap| reg.capability(cap))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "worker id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply this registration on top of an existing record (or create one).
    ///
    /// Registration always (re)activates the worker and refreshes its
    /// heartbeat. Runtime state (`current_task`, `performance_score`) is
    /// kept across re-registration; a restarting worker keeps its history.
    pub fn apply(self, existing: Option<&Worker>, now: DateTime<Utc>) -> Worker {
        let capabilities = dedup_preserving_order(self.capabilities);
        match existing {
            Some(prev) => Worker {
                id: self.id,
                name: self.name,
                worker_type: self.worker_type,
                capabilities,
                status: WorkerStatus::Active,
                current_task: prev.current_task,
                last_heartbeat: now,
                performance_score: prev.performance_score,
                registered_at: prev.registered_at,
                version: prev.version,
            },
            None => Worker {
                id: self.id,
                name: self.name,
                worker_type: self.worker_type,
                capabilities,
                status: WorkerStatus::Active,
                current_task: None,
                last_heartbeat: now,
                performance_score: DEFAULT_PERFORMANCE_SCORE,
                registered_at: now,
                version: 0,
            },
        }
    }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
