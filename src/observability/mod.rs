//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters and gauges via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `sluice_pool_hits_total` | Counter | Allocations served from a recycled region |
//! | `sluice_pool_misses_total` | Counter | Allocations that went to the allocator |
//! | `sluice_queue_depth` | Gauge | Refs pending in a queue bridge |
//! | `sluice_queue_blocked_total` | Counter | Queue sink blocked on a full queue |
//! | `sluice_refs_dropped_total` | Counter | Refs dropped on the data plane |
//! | `sluice_pump_dispatch_total` | Counter | Watcher callbacks dispatched |
//!
//! Without an installed recorder all of these are no-ops.
//!
//! ## Tracing
//!
//! Probe `Log` events that reach the end of a probe chain are emitted through
//! `tracing` under the `sluice` target. Event loops run inside a
//! `upump_loop` span.

mod metrics;
mod tracing_support;

pub use metrics::{
    init_metrics, record_pool_hit, record_pool_miss, record_pump_dispatch, record_queue_blocked,
    record_queue_depth, record_ref_dropped,
};
pub use tracing_support::{LogLevel, emit, span_loop, span_pipe};
