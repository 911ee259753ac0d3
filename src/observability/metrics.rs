//! Metrics collection using metrics-rs.

use metrics::{Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const POOL_HITS: &str = "sluice_pool_hits_total";
const POOL_MISSES: &str = "sluice_pool_misses_total";
const QUEUE_DEPTH: &str = "sluice_queue_depth";
const QUEUE_BLOCKED: &str = "sluice_queue_blocked_total";
const REFS_DROPPED: &str = "sluice_refs_dropped_total";
const PUMP_DISPATCH: &str = "sluice_pump_dispatch_total";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before installing an exporter.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        POOL_HITS,
        Unit::Count,
        "Allocations served from a recycled pool region"
    );
    metrics::describe_counter!(
        POOL_MISSES,
        Unit::Count,
        "Allocations that went to the allocator"
    );
    metrics::describe_gauge!(
        QUEUE_DEPTH,
        Unit::Count,
        "Attribute refs pending in a queue bridge"
    );
    metrics::describe_counter!(
        QUEUE_BLOCKED,
        Unit::Count,
        "Times a queue sink blocked on a full queue"
    );
    metrics::describe_counter!(
        REFS_DROPPED,
        Unit::Count,
        "Attribute refs dropped on the data plane"
    );
    metrics::describe_counter!(
        PUMP_DISPATCH,
        Unit::Count,
        "Watcher callbacks dispatched by event loops"
    );
}

/// Record an allocation served from the pool.
#[inline]
pub fn record_pool_hit(pool: &str) {
    counter!(POOL_HITS, "pool" => pool.to_string()).increment(1);
}

/// Record an allocation that missed the pool.
#[inline]
pub fn record_pool_miss(pool: &str) {
    counter!(POOL_MISSES, "pool" => pool.to_string()).increment(1);
}

/// Record the depth of a queue.
#[inline]
pub fn record_queue_depth(queue: &str, depth: usize) {
    gauge!(QUEUE_DEPTH, "queue" => queue.to_string()).set(depth as f64);
}

/// Record a queue sink blocking on a full queue.
#[inline]
pub fn record_queue_blocked(queue: &str) {
    counter!(QUEUE_BLOCKED, "queue" => queue.to_string()).increment(1);
}

/// Record an attribute ref dropped by a pipe.
#[inline]
pub fn record_ref_dropped(pipe: &'static str, reason: &'static str) {
    counter!(REFS_DROPPED, "pipe" => pipe, "reason" => reason).increment(1);
}

/// Record watcher callbacks dispatched by a loop iteration.
#[inline]
pub fn record_pump_dispatch(event_loop: &str, count: usize) {
    counter!(PUMP_DISPATCH, "loop" => event_loop.to_string()).increment(count as u64);
}
