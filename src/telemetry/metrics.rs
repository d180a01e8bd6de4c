//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`;
//! without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskmesh")
}

/// Counter: tasks created.
/// Labels: `task_type`, `priority`.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("taskmesh.tasks.created")
        .with_description("Number of tasks created")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskmesh.tasks.transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: scheduler dispatch attempts.
/// Labels: `outcome` ("assigned" | "no_worker" | "conflict" | "error").
pub fn dispatch_attempts() -> Counter<u64> {
    meter()
        .u64_counter("taskmesh.dispatch.attempts")
        .with_description("Number of dispatch attempts by outcome")
        .build()
}

/// Counter: tasks whose timeout expired.
/// Labels: `outcome` ("requeued" | "exhausted").
pub fn tasks_timed_out() -> Counter<u64> {
    meter()
        .u64_counter("taskmesh.tasks.timed_out")
        .with_description("Number of task timeouts")
        .build()
}

/// Counter: heartbeats received.
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("taskmesh.workers.heartbeats")
        .with_description("Number of worker heartbeats received")
        .build()
}

/// Counter: workers demoted to inactive by the heartbeat monitor.
pub fn workers_demoted() -> Counter<u64> {
    meter()
        .u64_counter("taskmesh.workers.demoted")
        .with_description("Number of workers marked inactive")
        .build()
}

/// Histogram: monitor sweep duration in milliseconds.
/// Labels: `monitor` ("heartbeat" | "timeout").
pub fn sweep_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskmesh.monitor.sweep_ms")
        .with_description("Monitor sweep duration in milliseconds")
        .with_unit("ms")
        .build()
}
