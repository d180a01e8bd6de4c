//! Telemetry initialization and span helpers.

use taskmesh::model::{Priority, TaskId, TaskStatus};
use taskmesh::telemetry::task::{record_transition, start_dispatch_span};
use taskmesh::telemetry::{TelemetryConfig, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process; a second
    // init in the same test binary returns an error instead of panicking.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "taskmesh-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn dispatch_span_records_worker_and_transitions() {
    let id = TaskId::new();
    let span = start_dispatch_span(id, Priority::High);
    span.record("task.worker", "w1");
    record_transition(&span, id, TaskStatus::Pending, TaskStatus::Assigned);
    record_transition(&span, id, TaskStatus::Assigned, TaskStatus::InProgress);
}

#[test]
fn metric_instruments_build_without_a_provider() {
    metrics::tasks_created().add(1, &[]);
    metrics::dispatch_attempts().add(1, &[opentelemetry::KeyValue::new("outcome", "assigned")]);
    metrics::tasks_timed_out().add(1, &[]);
    metrics::heartbeats().add(1, &[]);
    metrics::workers_demoted().add(1, &[]);
    metrics::sweep_duration_ms().record(1.5, &[]);
}
