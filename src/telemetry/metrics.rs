//! Metric instrument factories for tierq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tierq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for tierq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("tierq")
}

/// Counter: queue entries processed.
/// Labels: `queue_type`, `outcome` ("completed" | "deferred" | "failed" | "postponed").
pub fn entries_processed() -> Counter<u64> {
    meter()
        .u64_counter("tierq.queue.entries_processed")
        .with_description("Number of queue entries processed")
        .build()
}

/// Counter: queue entry state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("tierq.queue.state_transitions")
        .with_description("Number of queue entry state transitions")
        .build()
}

/// Counter: bytes copied to a lower tier.
pub fn bytes_migrated() -> Counter<u64> {
    meter()
        .u64_counter("tierq.migration.bytes")
        .with_description("Bytes copied by tier migrations")
        .with_unit("By")
        .build()
}

/// Counter: studies moved to a lower tier.
pub fn studies_migrated() -> Counter<u64> {
    meter()
        .u64_counter("tierq.migration.studies")
        .with_description("Studies moved to a lower tier")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tierq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: units of work re-executed after storage contention.
pub fn deadlock_retries() -> Counter<u64> {
    meter()
        .u64_counter("tierq.storage.deadlock_retries")
        .with_description("Retries caused by storage contention")
        .build()
}

/// Counter: claimed entries whose type has no registered processor.
/// Labels: `queue_type`.
pub fn entries_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("tierq.queue.unroutable")
        .with_description("Queue entries with no matching processor")
        .build()
}
