//! Capture sink: hands refs over to application code.
//!
//! A capture pipe keeps every ref it receives, plus the last flow
//! definition, in state shared with a [`CaptureHandle`]. It can also answer
//! the requests that usually end at a sink: the sink latency, and buffer
//! managers for the flows it accepts. With
//! [`CaptureConfig::with_deferred_requests`], requests are kept pending
//! instead so a test can answer them later, from whatever thread it likes.
//!
//! ```rust
//! use sluice::attr::{AttributeRefManager, flow};
//! use sluice::pipes::CaptureManager;
//! use sluice::probe::Probe;
//!
//! let urefs = AttributeRefManager::new();
//! let (sink, handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
//! sink.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();
//! sink.input(urefs.alloc(), None);
//! assert_eq!(handle.len(), 1);
//! ```

use crate::attr::AttributeRef;
use crate::buffer::BufferManager;
use crate::error::{Error, Result};
use crate::pipe::{
    Command, Pipe, PipeCore, PipeManager, PipeOps, Teardown, fourcc, provide_or_degrade,
    provide_ubuf_mgr,
};
use crate::probe::Probe;
use crate::pump::Pump;
use crate::request::{Provision, Request, RequestKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Signature of capture sinks.
pub const CAPTURE_SIGNATURE: u32 = fourcc(b"capt");

/// What a capture sink answers.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Answer `UbufMgr` requests with this manager, when it accepts the
    /// requested flow.
    pub ubuf_mgr: Option<Arc<dyn BufferManager>>,
    /// Answer `SinkLatency` requests with this latency, in ticks.
    pub latency: Option<u64>,
    /// Keep every request pending until [`CaptureHandle::answer_pending`].
    pub defer_requests: bool,
}

impl CaptureConfig {
    /// Answer buffer manager requests with `mgr`.
    pub fn with_ubuf_mgr(mut self, mgr: Arc<dyn BufferManager>) -> Self {
        self.ubuf_mgr = Some(mgr);
        self
    }

    /// Answer latency requests with `latency`.
    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Keep requests pending.
    pub fn with_deferred_requests(mut self) -> Self {
        self.defer_requests = true;
        self
    }
}

#[derive(Default)]
struct Captured {
    refs: Vec<AttributeRef>,
    flow_def: Option<AttributeRef>,
    pending: Vec<Request>,
    flushed: usize,
}

/// Application side of a capture sink.
///
/// Cloning shares the captured state. The handle stays valid after the
/// pipe is released.
#[derive(Clone, Default)]
pub struct CaptureHandle {
    captured: Arc<Mutex<Captured>>,
}

impl CaptureHandle {
    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.captured.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of refs received.
    pub fn len(&self) -> usize {
        self.lock().refs.len()
    }

    /// Whether no ref was received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the received refs, oldest first.
    pub fn refs(&self) -> Vec<AttributeRef> {
        self.lock().refs.iter().map(AttributeRef::duplicate).collect()
    }

    /// Take the received refs.
    pub fn take(&self) -> Vec<AttributeRef> {
        std::mem::take(&mut self.lock().refs)
    }

    /// The last flow definition set on the sink.
    pub fn flow_def(&self) -> Option<AttributeRef> {
        self.lock().flow_def.as_ref().map(AttributeRef::duplicate)
    }

    /// Number of refs dropped by `Flush`.
    pub fn flushed(&self) -> usize {
        self.lock().flushed
    }

    /// Number of requests waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// Answer every pending request with what `answer` returns. Returns the
    /// number of requests answered.
    pub fn answer_pending<F>(&self, mut answer: F) -> usize
    where
        F: FnMut(&Request) -> Provision,
    {
        let pending = std::mem::take(&mut self.lock().pending);
        let mut answered = 0;
        for request in pending {
            match request.provide(answer(&request)) {
                Ok(()) => answered += 1,
                Err(err) => tracing::warn!(request = request.id(), "cannot answer request: {err}"),
            }
        }
        answered
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let captured = self.lock();
        f.debug_struct("CaptureHandle")
            .field("refs", &captured.refs.len())
            .field("pending", &captured.pending.len())
            .finish()
    }
}

/// Allocates capture sinks.
#[derive(Debug, Clone, Default)]
pub struct CaptureManager {
    config: CaptureConfig,
}

impl CaptureManager {
    /// Sinks answering nothing themselves.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks answering requests per `config`.
    pub fn with_config(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Allocate a sink and the handle to its captured refs.
    pub fn alloc_capture(&self, probe: Probe) -> Result<(Pipe, CaptureHandle)> {
        let handle = CaptureHandle::default();
        let pipe = PipeCore::create(self, probe, |_| {
            Ok(CaptureOps {
                config: self.config.clone(),
                handle: handle.clone(),
            })
        })?;
        pipe.throw_ready();
        Ok((pipe, handle))
    }
}

impl PipeManager for CaptureManager {
    fn signature(&self) -> u32 {
        CAPTURE_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "capture"
    }

    fn alloc(&self, probe: Probe) -> Result<Pipe> {
        self.alloc_capture(probe).map(|(pipe, _)| pipe)
    }
}

struct CaptureOps {
    config: CaptureConfig,
    handle: CaptureHandle,
}

impl CaptureOps {
    fn register(&self, pipe: &PipeCore, request: &Request) -> Result<()> {
        if self.config.defer_requests {
            let mut captured = self.handle.lock();
            if captured
                .pending
                .iter()
                .any(|pending| pending.kind() == request.kind())
            {
                return Err(Error::busy(format!(
                    "a {:?} request is already pending",
                    request.kind()
                )));
            }
            captured.pending.push(request.clone());
            return Ok(());
        }

        match (request.kind(), &self.config.latency, &self.config.ubuf_mgr) {
            (RequestKind::SinkLatency, Some(latency), _) => {
                request.provide(Provision::SinkLatency(*latency))
            }
            (RequestKind::UbufMgr, _, Some(mgr)) => provide_ubuf_mgr(pipe, request, mgr),
            _ => provide_or_degrade(pipe, request),
        }
    }
}

impl PipeOps for CaptureOps {
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, _pump: Option<&Pump>) {
        tracing::trace!(pipe = pipe.id(), "captured ref");
        self.handle.lock().refs.push(uref);
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.handle.lock().flow_def = Some(flow_def.duplicate());
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = self.handle.flow_def();
                Ok(())
            }
            Command::RegisterRequest(request) => self.register(pipe, request),
            Command::UnregisterRequest(request) => {
                self.handle
                    .lock()
                    .pending
                    .retain(|pending| !pending.same(request));
                Ok(())
            }
            Command::Flush => {
                let mut captured = self.handle.lock();
                captured.flushed += captured.refs.len();
                captured.refs.clear();
                Ok(())
            }
            _ => Err(Error::Unhandled),
        }
    }

    fn no_ref(&self, _pipe: &PipeCore) -> Teardown {
        let pending = std::mem::take(&mut self.handle.lock().pending);
        for request in pending {
            let _ = request.provide(Provision::Unavailable);
        }
        Teardown::Done
    }
}
