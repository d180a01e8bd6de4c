//! Task span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::model::{Priority, TaskId, TaskStatus};

/// Start a span covering one dispatch attempt for a task.
pub fn start_dispatch_span(task_id: TaskId, priority: Priority) -> Span {
    tracing::info_span!(
        "task.dispatch",
        "task.id" = %task_id,
        "task.priority" = %priority,
        "task.worker" = tracing::field::Empty,
    )
}

/// Record a task state transition as an event on `span` and count it.
pub fn record_transition(span: &Span, task_id: TaskId, from: TaskStatus, to: TaskStatus) {
    span.in_scope(|| {
        tracing::info!(task_id = %task_id, from = %from, to = %to, "state_transition");
    });
    metrics::task_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
