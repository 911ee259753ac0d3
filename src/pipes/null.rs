//! Null pipe: discards refs.

use crate::attr::AttributeRef;
use crate::error::{Error, Result};
use crate::pipe::{Command, Pipe, PipeCore, PipeManager, PipeOps, Teardown, fourcc, provide_or_degrade};
use crate::probe::Probe;
use crate::pump::Pump;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Signature of null pipes.
pub const NULL_SIGNATURE: u32 = fourcc(b"null");

/// Allocates sinks that drop every ref.
///
/// Clones share the counter of dropped refs, across all the pipes they
/// allocated.
#[derive(Debug, Clone, Default)]
pub struct NullManager {
    count: Arc<AtomicU64>,
}

impl NullManager {
    /// A manager with a zero counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refs dropped so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl PipeManager for NullManager {
    fn signature(&self) -> u32 {
        NULL_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "null"
    }

    fn alloc(&self, probe: Probe) -> Result<Pipe> {
        let count = Arc::clone(&self.count);
        let pipe = PipeCore::create(self, probe, |_| Ok(NullOps { count }))?;
        pipe.throw_ready();
        Ok(pipe)
    }
}

struct NullOps {
    count: Arc<AtomicU64>,
}

impl PipeOps for NullOps {
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, _pump: Option<&Pump>) {
        self.count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pipe = pipe.id(), control = uref.is_control(), "dropping ref");
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::SetFlowDef(_) | Command::Flush => Ok(()),
            Command::RegisterRequest(request) => provide_or_degrade(pipe, request),
            Command::UnregisterRequest(_) => Ok(()),
            _ => Err(Error::Unhandled),
        }
    }

    fn no_ref(&self, pipe: &PipeCore) -> Teardown {
        pipe.debug(format!("dropped {} refs", self.count.load(Ordering::Relaxed)));
        Teardown::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{AttributeRefManager, flow};
    use crate::request::{Provision, Request};
    use std::sync::Mutex;

    #[test]
    fn test_counts_and_accepts_any_flow() {
        let urefs = AttributeRefManager::new();
        let mgr = NullManager::new();
        let first = mgr.alloc(Probe::end()).unwrap();
        let second = mgr.alloc(Probe::end()).unwrap();
        first.set_flow_def(&flow::alloc_def(&urefs, "anything.")).unwrap();
        first.input(urefs.alloc(), None);
        second.input(urefs.alloc_control(), None);
        assert_eq!(mgr.count(), 2);
        assert!(first.set_uri(Some("x")).unwrap_err().is_unhandled());
    }

    #[test]
    fn test_requests_resolve_unavailable() {
        let answer = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&answer);
        let request = Request::sink_latency(move |provision| {
            *slot.lock().unwrap() = Some(provision.is_unavailable());
            Ok(())
        });
        let null = NullManager::new().alloc(Probe::end()).unwrap();
        null.register_request(&request).unwrap();
        assert_eq!(*answer.lock().unwrap(), Some(true));
        assert!(matches!(
            request.provide(Provision::SinkLatency(0)),
            Err(Error::Invalid(_))
        ));
    }
}
