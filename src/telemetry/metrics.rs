//! Metric instrument factories for docqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"docqueue"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for docqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("docqueue")
}

/// Counter: queue operations.
/// Labels: `operation` ("send" | "get" | "get_empty" | "ack" | "ack_send" |
/// "requeue" | "count" | "reset_stuck").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("docqueue.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: claim attempts issued by a single `get` call.
pub fn get_poll_attempts() -> Histogram<u64> {
    meter()
        .u64_histogram("docqueue.get.poll_attempts")
        .with_description("Claim attempts per get call")
        .build()
}

/// Counter: indexes created by the index policy.
/// Labels: `index`.
pub fn indexes_created() -> Counter<u64> {
    meter()
        .u64_counter("docqueue.index.created")
        .with_description("Number of indexes created")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("docqueue.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
