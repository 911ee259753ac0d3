//! Shared helpers for integration tests.

#![allow(dead_code)]

use sluice::pipe::PipeCore;
use sluice::probe::{Event, FnProbe, Probe};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `sluice=info`).
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sluice=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Events seen by a probe, as `(manager, event)` pairs.
pub type Recorded = Arc<Mutex<Vec<(&'static str, &'static str)>>>;

/// A probe recording every non-log event, then passing it on.
pub fn recorder(next: Probe) -> (Probe, Recorded) {
    let events: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let probe = next.push(FnProbe::new(move |pipe: &PipeCore, event| {
        if !matches!(event, Event::Log(_)) {
            sink.lock().unwrap().push((pipe.manager_name(), event.name()));
        }
        Err(sluice::Error::Unhandled)
    }));
    (probe, events)
}

/// Count of `event` thrown by pipes of `manager`.
pub fn count(events: &Recorded, manager: &str, event: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|(m, e)| *m == manager && *e == event)
        .count()
}

/// Call `step` until `done` holds, failing after `limit`.
pub fn spin_until(limit: Duration, mut step: impl FnMut(), mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in {limit:?}");
        step();
    }
}
