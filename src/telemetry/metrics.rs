//! Metric instrument factories for ai-action-streamer.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"ai-action-streamer"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for ai-action-streamer instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("ai-action-streamer")
}

/// Counter: observations handled.
/// Labels: `route` ("start" | "done" | "other").
pub fn observations_handled() -> Counter<u64> {
    meter()
        .u64_counter("streamer.observations.handled")
        .with_description("Number of task observations handled")
        .build()
}

/// Counter: observations that arrived without an event id.
pub fn uncorrelated_observations() -> Counter<u64> {
    meter()
        .u64_counter("streamer.observations.uncorrelated")
        .with_description("Observations with an empty event_id")
        .build()
}

/// Counter: malformed numeric fields coerced to a default.
/// Labels: `field`.
pub fn field_coercions() -> Counter<u64> {
    meter()
        .u64_counter("streamer.fields.coerced")
        .with_description("Malformed numeric fields replaced by a default")
        .build()
}

/// Counter: log sink append failures (swallowed).
pub fn sink_failures() -> Counter<u64> {
    meter()
        .u64_counter("streamer.sink.failures")
        .with_description("Log sink append failures")
        .build()
}

/// Counter: requests rejected at the transport layer.
/// Labels: `reason`.
pub fn rpc_errors() -> Counter<u64> {
    meter()
        .u64_counter("streamer.rpc.errors")
        .with_description("Requests answered with an error frame or dropped")
        .build()
}

/// Up/down counter: calls currently being handled.
pub fn calls_in_flight() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("streamer.rpc.in_flight")
        .with_description("Calls currently in flight")
        .build()
}

/// Histogram: call duration in milliseconds.
pub fn call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("streamer.rpc.duration_ms")
        .with_description("Call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: supervisor lifecycle transitions.
/// Labels: `from`, `to`.
pub fn lifecycle_transitions() -> Counter<u64> {
    meter()
        .u64_counter("streamer.lifecycle.transitions")
        .with_description("Number of server lifecycle transitions")
        .build()
}
