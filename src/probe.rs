//! Probe chains: the upward event channel of pipes.
//!
//! Every pipe holds a [`Probe`], a singly linked chain of [`ProbeHandler`]s.
//! Events thrown by a pipe walk the chain from its head; each handler either
//! consumes the event, forwards it to the next node, or both. An event that
//! falls off the end of the chain is logged (for `Log`, `Fatal` and `Error`)
//! and reported as [`Error::Unhandled`].
//!
//! Chains are immutable and cheap to clone: nodes are shared behind `Arc`,
//! so several pipes can share a common tail.
//!
//! ```rust
//! use sluice::observability::LogLevel;
//! use sluice::probe::{LogProbe, PrefixProbe, Probe};
//!
//! let root = Probe::end().push(LogProbe::new(LogLevel::Debug));
//! let for_pipe = root.clone().push(PrefixProbe::new("src"));
//! assert_eq!(for_pipe.len(), 2);
//! ```

use crate::attr::{AttributeRef, AttributeRefManager};
use crate::buffer::{self, BufferManager};
use crate::clock::Clock;
use crate::error::{Error, ErrorCode, Result};
use crate::memory::MemoryPool;
use crate::observability::{self, LogLevel};
use crate::pipe::{PipeCore, PipeWeak};
use crate::pump::PumpManager;
use crate::request::{Provision, Request, RequestKind};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// ============================================================================
// Events
// ============================================================================

/// A log message travelling up a probe chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Prefixes added by [`PrefixProbe`]s, outermost first.
    pub prefixes: SmallVec<[String; 4]>,
}

impl LogRecord {
    /// Create a record without prefixes.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            prefixes: SmallVec::new(),
        }
    }

    /// Prefix chain rendered as `[a] [b] `.
    pub fn render_prefix(&self) -> String {
        let mut out = String::new();
        for prefix in &self.prefixes {
            out.push('[');
            out.push_str(prefix);
            out.push_str("] ");
        }
        out
    }
}

/// An event thrown by a pipe.
///
/// Arguments are borrowed from the thrower for the duration of the throw.
pub enum Event<'a> {
    /// Log message.
    Log(&'a mut LogRecord),
    /// Unrecoverable failure; the pipe cannot continue.
    Fatal(ErrorCode),
    /// Recoverable failure.
    Error(ErrorCode),
    /// The pipe finished initialising.
    Ready,
    /// The pipe is about to be freed.
    Dead,
    /// The pipe cannot make progress (queue full).
    Stalled,
    /// A source ran out of data.
    SourceEnd,
    /// A sink stopped accepting data.
    SinkEnd,
    /// The pipe has data for this flow definition but no output.
    NeedOutput(&'a AttributeRef),
    /// A request reached the end of the pipeline.
    ProvideRequest(&'a Request),
    /// The pipe needs an event loop; a handler fills the slot.
    NeedUpumpMgr(&'a mut Option<PumpManager>),
    /// Stop handing out the event loop.
    FreezeUpumpMgr,
    /// Resume handing out the event loop.
    ThawUpumpMgr,
    /// The output flow definition changed.
    NewFlowDef(&'a AttributeRef),
    /// A random access point was found.
    NewRap(&'a AttributeRef),
    /// The output list of a split pipe changed.
    SplitUpdate,
    /// Synchronisation acquired.
    SyncAcquired,
    /// Synchronisation lost.
    SyncLost,
    /// A clock reference was read.
    ClockRef {
        /// Ref carrying the reference.
        uref: &'a AttributeRef,
        /// Clock reference value in ticks.
        clock_ref: u64,
        /// Whether a discontinuity was detected.
        discontinuity: bool,
    },
    /// A timestamp was read.
    ClockTs(&'a AttributeRef),
    /// A wall-clock date was read.
    ClockUtc {
        /// Ref carrying the date.
        uref: &'a AttributeRef,
        /// UTC date in ticks since the epoch.
        utc: u64,
    },
    /// Event private to a pipe type, guarded by its signature.
    Local {
        /// Signature of the pipe manager that defines the event.
        signature: u32,
        /// Event number within that signature.
        event: u32,
        /// Event arguments.
        payload: &'a mut (dyn Any + Send),
    },
}

impl Event<'_> {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Log(_) => "log",
            Event::Fatal(_) => "fatal",
            Event::Error(_) => "error",
            Event::Ready => "ready",
            Event::Dead => "dead",
            Event::Stalled => "stalled",
            Event::SourceEnd => "source_end",
            Event::SinkEnd => "sink_end",
            Event::NeedOutput(_) => "need_output",
            Event::ProvideRequest(_) => "provide_request",
            Event::NeedUpumpMgr(_) => "need_upump_mgr",
            Event::FreezeUpumpMgr => "freeze_upump_mgr",
            Event::ThawUpumpMgr => "thaw_upump_mgr",
            Event::NewFlowDef(_) => "new_flow_def",
            Event::NewRap(_) => "new_rap",
            Event::SplitUpdate => "split_update",
            Event::SyncAcquired => "sync_acquired",
            Event::SyncLost => "sync_lost",
            Event::ClockRef { .. } => "clock_ref",
            Event::ClockTs(_) => "clock_ts",
            Event::ClockUtc { .. } => "clock_utc",
            Event::Local { .. } => "local",
        }
    }
}

impl fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Log(record) => f.debug_tuple("Log").field(record).finish(),
            Event::Fatal(code) => f.debug_tuple("Fatal").field(code).finish(),
            Event::Error(code) => f.debug_tuple("Error").field(code).finish(),
            Event::Local {
                signature, event, ..
            } => f
                .debug_struct("Local")
                .field("signature", signature)
                .field("event", event)
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Chain
// ============================================================================

/// A node of a probe chain.
pub trait ProbeHandler: Send + Sync + 'static {
    /// Handle `event` thrown by `pipe`.
    ///
    /// Return `next.throw(pipe, event)` to pass the event on.
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()>;
}

struct ProbeNode {
    handler: Box<dyn ProbeHandler>,
    next: Probe,
}

/// A chain of probe handlers.
#[derive(Clone, Default)]
pub struct Probe {
    head: Option<Arc<ProbeNode>>,
}

impl Probe {
    /// The empty chain.
    pub fn end() -> Self {
        Self::default()
    }

    /// Put `handler` in front of this chain.
    pub fn push(self, handler: impl ProbeHandler) -> Self {
        Self {
            head: Some(Arc::new(ProbeNode {
                handler: Box::new(handler),
                next: self,
            })),
        }
    }

    /// Whether the chain has no handler.
    pub fn is_end(&self) -> bool {
        self.head.is_none()
    }

    /// Number of handlers in the chain.
    pub fn len(&self) -> usize {
        let mut len = 0;
        let mut cursor = &self.head;
        while let Some(node) = cursor {
            len += 1;
            cursor = &node.next.head;
        }
        len
    }

    /// Whether the chain has no handler.
    pub fn is_empty(&self) -> bool {
        self.is_end()
    }

    /// Throw `event` from `pipe` along the chain.
    pub fn throw(&self, pipe: &PipeCore, event: &mut Event<'_>) -> Result<()> {
        match &self.head {
            Some(node) => node.handler.handle(pipe, event, &node.next),
            None => chain_end(pipe, event),
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe").field("len", &self.len()).finish()
    }
}

fn chain_end(pipe: &PipeCore, event: &mut Event<'_>) -> Result<()> {
    match event {
        Event::Log(record) => {
            observability::emit(record.level, &record.render_prefix(), &record.message);
            Ok(())
        }
        Event::Fatal(code) => {
            tracing::error!(target: "sluice", pipe = pipe.id(), manager = pipe.manager_name(), "fatal error ({code})");
            Err(Error::Unhandled)
        }
        Event::Error(code) => {
            tracing::error!(target: "sluice", pipe = pipe.id(), manager = pipe.manager_name(), "error ({code})");
            Err(Error::Unhandled)
        }
        other => {
            tracing::trace!(target: "sluice", pipe = pipe.id(), event = other.name(), "unhandled event");
            Err(Error::Unhandled)
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Prints log records at or above a level and drops the rest.
///
/// With [`LogProbe::with_events`], every other event is also logged at debug
/// level before being passed on.
#[derive(Debug)]
pub struct LogProbe {
    min_level: LogLevel,
    events: bool,
}

impl LogProbe {
    /// Print records at `min_level` or above.
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            min_level,
            events: false,
        }
    }

    /// Also trace every non-log event.
    pub fn with_events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }
}

impl ProbeHandler for LogProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        match event {
            Event::Log(record) => {
                if record.level >= self.min_level {
                    observability::emit(record.level, &record.render_prefix(), &record.message);
                }
                Ok(())
            }
            other => {
                if self.events {
                    tracing::debug!(
                        target: "sluice",
                        pipe = pipe.id(),
                        manager = pipe.manager_name(),
                        "probe caught {} event",
                        other.name()
                    );
                }
                next.throw(pipe, other)
            }
        }
    }
}

/// Prepends a name to the prefix list of log records.
#[derive(Debug)]
pub struct PrefixProbe {
    name: String,
}

impl PrefixProbe {
    /// Tag records with `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProbeHandler for PrefixProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        if let Event::Log(record) = event {
            record.prefixes.insert(0, self.name.clone());
        }
        next.throw(pipe, event)
    }
}

/// Answers `NeedUpumpMgr` with a given event loop.
///
/// While frozen, the request is passed on instead.
#[derive(Debug)]
pub struct PumpManagerProbe {
    mgr: Mutex<Option<PumpManager>>,
    frozen: AtomicBool,
}

impl PumpManagerProbe {
    /// Hand out `mgr`.
    pub fn new(mgr: PumpManager) -> Self {
        Self {
            mgr: Mutex::new(Some(mgr)),
            frozen: AtomicBool::new(false),
        }
    }

    /// Replace (or clear) the event loop handed out.
    pub fn set(&self, mgr: Option<PumpManager>) {
        *self.mgr.lock().unwrap_or_else(PoisonError::into_inner) = mgr;
    }

    /// Whether the probe is frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl ProbeHandler for PumpManagerProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        match event {
            Event::NeedUpumpMgr(slot) if slot.is_none() && !self.is_frozen() => {
                let mgr = self
                    .mgr
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match mgr {
                    Some(mgr) => {
                        **slot = Some(mgr);
                        Ok(())
                    }
                    None => next.throw(pipe, event),
                }
            }
            Event::FreezeUpumpMgr => {
                self.frozen.store(true, Ordering::Release);
                Ok(())
            }
            Event::ThawUpumpMgr => {
                self.frozen.store(false, Ordering::Release);
                Ok(())
            }
            _ => next.throw(pipe, event),
        }
    }
}

/// Answers `UrefMgr` requests.
#[derive(Debug)]
pub struct AttributeManagerProbe {
    mgr: Arc<AttributeRefManager>,
}

impl AttributeManagerProbe {
    /// Provide `mgr` to pipes that ask for an attribute ref manager.
    pub fn new(mgr: Arc<AttributeRefManager>) -> Self {
        Self { mgr }
    }
}

impl ProbeHandler for AttributeManagerProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        match event {
            Event::ProvideRequest(request) if request.kind() == RequestKind::UrefMgr => {
                request.provide(Provision::UrefMgr(Arc::clone(&self.mgr)))
            }
            _ => next.throw(pipe, event),
        }
    }
}

/// Answers `UbufMgr` requests with a manager matching the queried flow.
///
/// Flow definitions no manager supports are passed on.
#[derive(Debug)]
pub struct BufferManagerProbe {
    pool: MemoryPool,
}

impl BufferManagerProbe {
    /// Allocate buffers from `pool`.
    pub fn new(pool: MemoryPool) -> Self {
        Self { pool }
    }
}

impl ProbeHandler for BufferManagerProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        if let Event::ProvideRequest(request) = event {
            if request.kind() == RequestKind::UbufMgr {
                if let Some(flow_def) = request.query() {
                    match buffer::manager_for_flow_def(&self.pool, flow_def) {
                        Ok(manager) => {
                            let manager: Arc<dyn BufferManager> = manager;
                            return request.provide(Provision::UbufMgr {
                                manager,
                                flow_def: flow_def.duplicate(),
                            });
                        }
                        Err(err) => {
                            tracing::debug!(pipe = pipe.id(), "no buffer manager for flow: {err}");
                        }
                    }
                }
            }
        }
        next.throw(pipe, event)
    }
}

type AmendFn = dyn Fn(&AttributeRef) -> Option<AttributeRef> + Send + Sync;

/// Answers `FlowFormat` requests with the flow `amend` makes of the query.
///
/// Queries `amend` returns `None` for are passed on.
pub struct FlowFormatProbe {
    amend: Box<AmendFn>,
}

impl FlowFormatProbe {
    /// Amend queried flows with `amend`.
    pub fn new<F>(amend: F) -> Self
    where
        F: Fn(&AttributeRef) -> Option<AttributeRef> + Send + Sync + 'static,
    {
        Self {
            amend: Box::new(amend),
        }
    }
}

impl fmt::Debug for FlowFormatProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowFormatProbe").finish_non_exhaustive()
    }
}

impl ProbeHandler for FlowFormatProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        if let Event::ProvideRequest(request) = event {
            if request.kind() == RequestKind::FlowFormat {
                if let Some(amended) = request.query().and_then(|query| (self.amend)(query)) {
                    tracing::debug!(pipe = pipe.id(), "flow format agreed");
                    return request.provide(Provision::FlowFormat(amended));
                }
            }
        }
        next.throw(pipe, event)
    }
}

/// Answers `Uclock` requests.
#[derive(Debug)]
pub struct ClockProbe {
    clock: Arc<dyn Clock>,
}

impl ClockProbe {
    /// Provide `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl ProbeHandler for ClockProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        match event {
            Event::ProvideRequest(request) if request.kind() == RequestKind::Uclock => {
                request.provide(Provision::Uclock(Arc::clone(&self.clock)))
            }
            _ => next.throw(pipe, event),
        }
    }
}

type ProbeFn = dyn Fn(&PipeCore, &mut Event<'_>) -> Result<()> + Send + Sync;

/// A handler built from a closure.
///
/// Returning [`Error::Unhandled`] passes the event on.
pub struct FnProbe {
    f: Box<ProbeFn>,
}

impl FnProbe {
    /// Wrap `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&PipeCore, &mut Event<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

impl ProbeHandler for FnProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        match (self.f)(pipe, event) {
            Err(Error::Unhandled) => next.throw(pipe, event),
            other => other,
        }
    }
}

impl fmt::Debug for FnProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProbe")
    }
}

/// Re-throws events of an inner pipe on the bin that owns it.
///
/// `Ready` and `Dead` of inner pipes stay local; the bin has its own.
/// Once the bin is dead, events go to the next handler.
#[derive(Debug)]
pub struct ProxyProbe {
    outer: PipeWeak,
}

impl ProxyProbe {
    /// Proxy to the pipe behind `outer`.
    pub fn new(outer: PipeWeak) -> Self {
        Self { outer }
    }
}

impl ProbeHandler for ProxyProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        if matches!(event, Event::Ready | Event::Dead) {
            return next.throw(pipe, event);
        }
        match self.outer.upgrade() {
            Some(outer) if !outer.is_dead() => outer.throw(event),
            _ => next.throw(pipe, event),
        }
    }
}
