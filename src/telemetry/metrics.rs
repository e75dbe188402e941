//! Metric instrument factories.
//!
//! Instruments come from the `"enrichq"` meter on the globally registered
//! `MeterProvider`; without one they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("enrichq")
}

/// Counter: cache lookups through `get_or_schedule`.
/// Labels: `result` ("hit" | "scheduled" | "rescheduled").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("enrichq.cache.lookups")
        .with_description("Enrichment cache lookups")
        .build()
}

/// Counter: finished population tasks.
/// Labels: `outcome` ("ok" | "error").
pub fn populations() -> Counter<u64> {
    meter()
        .u64_counter("enrichq.cache.populations")
        .with_description("Completed population fetches")
        .build()
}

/// Counter: queue operations.
/// Labels: `operation` ("enqueue" | "drop"), `side` ("front" | "back").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("enrichq.queue.operations")
        .with_description("Sequential queue operations")
        .build()
}

/// Counter: remote API responses.
/// Labels: `status`.
pub fn api_responses() -> Counter<u64> {
    meter()
        .u64_counter("enrichq.api.responses")
        .with_description("Reactions endpoint responses by status")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("enrichq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
