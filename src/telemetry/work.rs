//! Work execution span helpers.
//!
//! Every claimed queue entry is processed inside a `work.execute` span.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{QueueEntry, QueueStatus};

use super::metrics;

/// Start a span for processing one queue entry.
///
/// The `work.state` field is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_work_span(entry: &QueueEntry) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.queue_type" = %entry.queue_type,
        "work.id" = %entry.id,
        "work.study" = %entry.study_storage_key,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a status change on the span and count it.
pub fn record_state_transition(span: &Span, from: QueueStatus, to: QueueStatus) {
    span.record("work.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
