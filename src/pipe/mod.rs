//! Pipes: the processing stages of a pipeline.
//!
//! A pipe is allocated by a [`PipeManager`] and driven through three entry
//! points:
//!
//! - `input`: the data plane. Refs are passed by value; a pipe that cannot
//!   process a ref drops it and throws an event. `input` never returns an
//!   error.
//! - `control`: the control plane. Every [`Command`] returns `Ok(())` when
//!   handled, [`Error::Unhandled`] when the pipe does not know it, or
//!   another error.
//! - events, thrown upward through the pipe's [`Probe`] chain.
//!
//! Pipe behaviour is supplied as a [`PipeOps`] implementation wrapped in a
//! [`PipeCore`], which carries the state shared by all pipes: the two-phase
//! reference count, the probe chain and the `Uninit → Ready → Dead` state
//! machine.
//!
//! [`Pipe`] is the counted usage handle held by users and upstream pipes.
//! [`PipeRef`] is a real reference that keeps the allocation alive without
//! keeping the pipe in use, and [`PipeWeak`] is a back-reference that keeps
//! nothing alive. When the last [`Pipe`] is dropped, [`PipeOps::no_ref`]
//! runs and `Dead` is thrown (immediately, or later when the pipe deferred
//! its teardown).

pub mod bin;
mod command;
mod helpers;

pub use command::{Command, ManagerCommand, fourcc};
pub use helpers::{
    InputHelper, OutputHelper, PumpManagerHelper, RequestHelper, provide_or_degrade,
    provide_ubuf_mgr,
};

use crate::attr::AttributeRef;
use crate::error::{Error, ErrorCode, Result};
use crate::observability::{self, LogLevel};
use crate::probe::{Event, LogRecord, Probe, ProbeHandler};
use crate::pump::{Pump, PumpManager};
use crate::refcount::{Handle, Lifecycle, RefCount};
use crate::request::Request;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

// ============================================================================
// Traits
// ============================================================================

/// A factory of pipes of one type.
pub trait PipeManager: Send + Sync {
    /// Four-character code identifying the pipe type.
    fn signature(&self) -> u32;

    /// Pipe type name, for logs.
    fn name(&self) -> &'static str;

    /// Allocate a pipe that throws its events to `probe`.
    fn alloc(&self, probe: Probe) -> Result<Pipe>;

    /// Manager-level control.
    fn control(&self, command: &mut ManagerCommand) -> Result<()> {
        let _ = command;
        Err(Error::Unhandled)
    }
}

/// What happens after [`PipeOps::no_ref`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Throw `Dead` now.
    Done,
    /// The pipe will call [`PipeCore::throw_dead`] itself, once its
    /// pending work is flushed.
    Deferred,
}

/// Behaviour of a pipe type.
pub trait PipeOps: Send + Sync + 'static {
    /// Process a ref. `pump` is the watcher that produced it, if any, so
    /// that a pipe that must hold the ref can block it.
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, pump: Option<&Pump>) {
        let _ = (uref, pump);
        pipe.warn("pipe has no input, dropping ref");
        observability::record_ref_dropped(pipe.manager_name(), "no_input");
    }

    /// Handle a control command.
    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()>;

    /// The last usage reference went away.
    fn no_ref(&self, pipe: &PipeCore) -> Teardown {
        let _ = pipe;
        Teardown::Done
    }
}

// ============================================================================
// Pipe core
// ============================================================================

/// Lifecycle state of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Allocated, `Ready` not thrown yet.
    Uninit,
    /// Accepting input and commands.
    Ready,
    /// `Dead` thrown.
    Dead,
}

const STATE_UNINIT: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DEAD: u8 = 2;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every pipe, plus its [`PipeOps`].
pub struct PipeCore {
    refcount: RefCount,
    id: u64,
    signature: u32,
    manager_name: &'static str,
    probe: Mutex<Probe>,
    state: AtomicU8,
    this: Weak<PipeCore>,
    ops: OnceLock<Box<dyn PipeOps>>,
}

/// Counted usage handle on a pipe.
pub type Pipe = Handle<PipeCore>;

/// Real reference on a pipe: keeps it allocated, not in use.
pub type PipeRef = Arc<PipeCore>;

/// Non-owning back-reference to a pipe.
#[derive(Clone, Default)]
pub struct PipeWeak(Weak<PipeCore>);

impl PipeWeak {
    /// Real reference, if the pipe is still allocated.
    pub fn upgrade(&self) -> Option<PipeRef> {
        self.0.upgrade()
    }

    /// Usage handle, if the pipe is still in use.
    pub fn upgrade_handle(&self) -> Option<Pipe> {
        self.0.upgrade().and_then(|real| Handle::upgrade(&real))
    }

    /// Whether this points at `pipe`.
    pub fn is(&self, pipe: &PipeCore) -> bool {
        std::ptr::eq(self.0.as_ptr(), pipe)
    }
}

impl fmt::Debug for PipeWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(pipe) => write!(f, "PipeWeak({} {})", pipe.manager_name, pipe.id),
            None => f.write_str("PipeWeak(gone)"),
        }
    }
}

impl PipeCore {
    /// Allocate a pipe for `manager`.
    ///
    /// `build` receives the new pipe (to take back-references or throw
    /// early log events) and returns its behaviour. The caller throws
    /// `Ready` once its own setup is complete.
    pub fn create<O, F>(manager: &dyn PipeManager, probe: Probe, build: F) -> Result<Pipe>
    where
        O: PipeOps,
        F: FnOnce(&PipeCore) -> Result<O>,
    {
        let core = Arc::new_cyclic(|this| PipeCore {
            refcount: RefCount::new(),
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
            signature: manager.signature(),
            manager_name: manager.name(),
            probe: Mutex::new(probe),
            state: AtomicU8::new(STATE_UNINIT),
            this: this.clone(),
            ops: OnceLock::new(),
        });
        let ops = build(&core)?;
        if core.ops.set(Box::new(ops)).is_err() {
            return Err(Error::invalid("pipe operations installed twice"));
        }
        tracing::trace!(pipe = core.id, manager = core.manager_name, "pipe allocated");
        Ok(Handle::new(core))
    }

    /// Unique pipe id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signature of the pipe type.
    pub fn signature(&self) -> u32 {
        self.signature
    }

    /// Name of the pipe type.
    pub fn manager_name(&self) -> &'static str {
        self.manager_name
    }

    /// Lifecycle state.
    pub fn state(&self) -> PipeState {
        match self.state.load(Ordering::Acquire) {
            STATE_UNINIT => PipeState::Uninit,
            STATE_READY => PipeState::Ready,
            _ => PipeState::Dead,
        }
    }

    /// Whether the pipe stopped accepting calls: its usage count reached
    /// zero or `Dead` was thrown.
    pub fn is_dead(&self) -> bool {
        self.refcount.is_dead() || self.state.load(Ordering::Acquire) == STATE_DEAD
    }

    /// Current usage count.
    pub fn use_count(&self) -> usize {
        self.refcount.count()
    }

    /// Non-owning back-reference.
    pub fn weak(&self) -> PipeWeak {
        PipeWeak(self.this.clone())
    }

    /// Real reference to this pipe.
    pub fn real(&self) -> Option<PipeRef> {
        self.this.upgrade()
    }

    /// New usage handle, unless the pipe is already logically dead.
    pub fn handle(&self) -> Option<Pipe> {
        self.real().and_then(|real| Handle::upgrade(&real))
    }

    /// Whether `self` and `other` are the same pipe.
    pub fn same(&self, other: &PipeCore) -> bool {
        std::ptr::eq(self, other)
    }

    /// Put `handler` in front of the probe chain.
    pub fn push_probe(&self, handler: impl ProbeHandler) {
        let mut probe = self.probe.lock().unwrap_or_else(PoisonError::into_inner);
        let chain = std::mem::take(&mut *probe);
        *probe = chain.push(handler);
    }

    /// The current probe chain.
    pub fn probe(&self) -> Probe {
        self.probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Send a ref to the pipe.
    ///
    /// Refs sent to a dead pipe are dropped with a warning.
    pub fn input(&self, uref: AttributeRef, pump: Option<&Pump>) {
        if self.is_dead() {
            tracing::warn!(pipe = self.id, manager = self.manager_name, "input on dead pipe, dropping ref");
            observability::record_ref_dropped(self.manager_name, "dead");
            return;
        }
        match self.ops.get() {
            Some(ops) => ops.input(self, uref, pump),
            None => observability::record_ref_dropped(self.manager_name, "uninit"),
        }
    }

    /// Send a control command.
    pub fn control(&self, command: &mut Command) -> Result<()> {
        if self.is_dead() {
            return Err(Error::invalid(format!(
                "{} on dead {} pipe",
                command.name(),
                self.manager_name
            )));
        }
        match self.ops.get() {
            Some(ops) => ops.control(self, command),
            None => Err(Error::invalid("pipe not initialised")),
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Throw `event` along the probe chain.
    ///
    /// Nothing is thrown after `Dead`.
    pub fn throw(&self, event: &mut Event<'_>) -> Result<()> {
        if self.state.load(Ordering::Acquire) == STATE_DEAD {
            tracing::trace!(pipe = self.id, event = event.name(), "event after dead ignored");
            return Err(Error::Unhandled);
        }
        self.probe().throw(self, event)
    }

    /// Throw a log event.
    pub fn throw_log(&self, level: LogLevel, message: impl Into<String>) {
        let mut record = LogRecord::new(level, message);
        let _ = self.throw(&mut Event::Log(&mut record));
    }

    /// Log at verbose level.
    pub fn verbose(&self, message: impl Into<String>) {
        self.throw_log(LogLevel::Verbose, message);
    }

    /// Log at debug level.
    pub fn debug(&self, message: impl Into<String>) {
        self.throw_log(LogLevel::Debug, message);
    }

    /// Log at notice level.
    pub fn notice(&self, message: impl Into<String>) {
        self.throw_log(LogLevel::Notice, message);
    }

    /// Log at warning level.
    pub fn warn(&self, message: impl Into<String>) {
        self.throw_log(LogLevel::Warning, message);
    }

    /// Log at error level.
    pub fn err(&self, message: impl Into<String>) {
        self.throw_log(LogLevel::Error, message);
    }

    /// Throw a fatal error.
    pub fn throw_fatal(&self, code: ErrorCode) {
        let _ = self.throw(&mut Event::Fatal(code));
    }

    /// Throw a recoverable error.
    pub fn throw_error(&self, code: ErrorCode) {
        let _ = self.throw(&mut Event::Error(code));
    }

    /// Throw `Ready`. Only the first call has an effect.
    pub fn throw_ready(&self) {
        if self
            .state
            .compare_exchange(STATE_UNINIT, STATE_READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.throw(&mut Event::Ready);
        }
    }

    /// Throw `Dead` and release the probe chain. Only the first call has
    /// an effect.
    pub fn throw_dead(&self) {
        if self.state.load(Ordering::Acquire) == STATE_DEAD {
            return;
        }
        let probe = self.probe();
        let _ = probe.throw(self, &mut Event::Dead);
        if self.state.swap(STATE_DEAD, Ordering::AcqRel) == STATE_DEAD {
            return;
        }
        tracing::trace!(pipe = self.id, manager = self.manager_name, "pipe dead");
        let released = std::mem::take(&mut *self.probe.lock().unwrap_or_else(PoisonError::into_inner));
        drop(released);
    }

    /// Throw `Stalled`.
    pub fn throw_stalled(&self) {
        let _ = self.throw(&mut Event::Stalled);
    }

    /// Throw `SourceEnd`.
    pub fn throw_source_end(&self) {
        let _ = self.throw(&mut Event::SourceEnd);
    }

    /// Throw `SinkEnd`.
    pub fn throw_sink_end(&self) {
        let _ = self.throw(&mut Event::SinkEnd);
    }

    /// Throw `NeedOutput` for `flow_def`.
    pub fn throw_need_output(&self, flow_def: &AttributeRef) -> Result<()> {
        self.throw(&mut Event::NeedOutput(flow_def))
    }

    /// Throw `NewFlowDef`.
    pub fn throw_new_flow_def(&self, flow_def: &AttributeRef) {
        let _ = self.throw(&mut Event::NewFlowDef(flow_def));
    }

    /// Throw `NewRap`.
    pub fn throw_new_rap(&self, uref: &AttributeRef) {
        let _ = self.throw(&mut Event::NewRap(uref));
    }

    /// Throw `ProvideRequest`.
    pub fn throw_provide_request(&self, request: &Request) -> Result<()> {
        self.throw(&mut Event::ProvideRequest(request))
    }

    /// Ask the probes for an event loop.
    pub fn throw_need_upump_mgr(&self) -> Option<PumpManager> {
        let mut slot = None;
        let _ = self.throw(&mut Event::NeedUpumpMgr(&mut slot));
        slot
    }

    /// Throw `FreezeUpumpMgr`.
    pub fn throw_freeze_upump_mgr(&self) {
        let _ = self.throw(&mut Event::FreezeUpumpMgr);
    }

    /// Throw `ThawUpumpMgr`.
    pub fn throw_thaw_upump_mgr(&self) {
        let _ = self.throw(&mut Event::ThawUpumpMgr);
    }

    /// Throw `ClockRef`.
    pub fn throw_clock_ref(&self, uref: &AttributeRef, clock_ref: u64, discontinuity: bool) {
        let _ = self.throw(&mut Event::ClockRef {
            uref,
            clock_ref,
            discontinuity,
        });
    }

    /// Throw `ClockTs`.
    pub fn throw_clock_ts(&self, uref: &AttributeRef) {
        let _ = self.throw(&mut Event::ClockTs(uref));
    }

    // ------------------------------------------------------------------
    // Typed commands
    // ------------------------------------------------------------------

    /// Set the output.
    pub fn set_output(&self, output: &Pipe) -> Result<()> {
        self.control(&mut Command::SetOutput(Some(output.clone())))
    }

    /// Clear the output.
    pub fn clear_output(&self) -> Result<()> {
        self.control(&mut Command::SetOutput(None))
    }

    /// Current output.
    pub fn get_output(&self) -> Result<Option<Pipe>> {
        let mut command = Command::GetOutput(None);
        self.control(&mut command)?;
        match command {
            Command::GetOutput(output) => Ok(output),
            _ => Err(Error::Unhandled),
        }
    }

    /// Set the input flow definition.
    pub fn set_flow_def(&self, flow_def: &AttributeRef) -> Result<()> {
        self.control(&mut Command::SetFlowDef(flow_def.duplicate()))
    }

    /// Output flow definition.
    pub fn get_flow_def(&self) -> Result<Option<AttributeRef>> {
        let mut command = Command::GetFlowDef(None);
        self.control(&mut command)?;
        match command {
            Command::GetFlowDef(flow_def) => Ok(flow_def),
            _ => Err(Error::Unhandled),
        }
    }

    /// Drop the event loop and ask for a new one.
    pub fn attach_upump_mgr(&self) -> Result<()> {
        self.control(&mut Command::AttachUpumpMgr)
    }

    /// Re-request a clock.
    pub fn attach_uclock(&self) -> Result<()> {
        self.control(&mut Command::AttachUclock)
    }

    /// Re-request a buffer manager.
    pub fn attach_ubuf_mgr(&self) -> Result<()> {
        self.control(&mut Command::AttachUbufMgr)
    }

    /// Re-request an attribute ref manager.
    pub fn attach_uref_mgr(&self) -> Result<()> {
        self.control(&mut Command::AttachUrefMgr)
    }

    /// Register `request`.
    pub fn register_request(&self, request: &Request) -> Result<()> {
        self.control(&mut Command::RegisterRequest(request.clone()))
    }

    /// Withdraw `request`.
    pub fn unregister_request(&self, request: &Request) -> Result<()> {
        self.control(&mut Command::UnregisterRequest(request.clone()))
    }

    /// Set (or clear) the URI.
    pub fn set_uri(&self, uri: Option<&str>) -> Result<()> {
        self.control(&mut Command::SetUri(uri.map(str::to_owned)))
    }

    /// Current URI.
    pub fn get_uri(&self) -> Result<Option<String>> {
        let mut command = Command::GetUri(None);
        self.control(&mut command)?;
        match command {
            Command::GetUri(uri) => Ok(uri),
            _ => Err(Error::Unhandled),
        }
    }

    /// Set (or clear) a string option.
    pub fn set_option(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.control(&mut Command::SetOption {
            key: key.to_owned(),
            value: value.map(str::to_owned),
        })
    }

    /// Read a string option.
    pub fn get_option(&self, key: &str) -> Result<Option<String>> {
        let mut command = Command::GetOption {
            key: key.to_owned(),
            value: None,
        };
        self.control(&mut command)?;
        match command {
            Command::GetOption { value, .. } => Ok(value),
            _ => Err(Error::Unhandled),
        }
    }

    /// Maximum number of held or queued refs.
    pub fn get_max_length(&self) -> Result<usize> {
        let mut command = Command::GetMaxLength(None);
        self.control(&mut command)?;
        match command {
            Command::GetMaxLength(Some(length)) => Ok(length),
            _ => Err(Error::Unhandled),
        }
    }

    /// Set the maximum number of held or queued refs.
    pub fn set_max_length(&self, length: usize) -> Result<()> {
        self.control(&mut Command::SetMaxLength(length))
    }

    /// Drop held refs.
    pub fn flush(&self) -> Result<()> {
        self.control(&mut Command::Flush)
    }

    /// Leave the preroll state.
    pub fn end_preroll(&self) -> Result<()> {
        self.control(&mut Command::EndPreroll)
    }

    /// Output chunk size.
    pub fn get_output_size(&self) -> Result<u64> {
        let mut command = Command::GetOutputSize(None);
        self.control(&mut command)?;
        match command {
            Command::GetOutputSize(Some(size)) => Ok(size),
            _ => Err(Error::Unhandled),
        }
    }

    /// Set the output chunk size.
    pub fn set_output_size(&self, size: u64) -> Result<()> {
        self.control(&mut Command::SetOutputSize(size))
    }

    /// First inner pipe of a bin.
    pub fn bin_first_inner(&self) -> Result<Option<Pipe>> {
        let mut command = Command::BinGetFirstInner(None);
        self.control(&mut command)?;
        match command {
            Command::BinGetFirstInner(inner) => Ok(inner),
            _ => Err(Error::Unhandled),
        }
    }

    /// Last inner pipe of a bin.
    pub fn bin_last_inner(&self) -> Result<Option<Pipe>> {
        let mut command = Command::BinGetLastInner(None);
        self.control(&mut command)?;
        match command {
            Command::BinGetLastInner(inner) => Ok(inner),
            _ => Err(Error::Unhandled),
        }
    }

    /// Read position of a source.
    pub fn src_get_position(&self) -> Result<u64> {
        let mut command = Command::SrcGetPosition(None);
        self.control(&mut command)?;
        match command {
            Command::SrcGetPosition(Some(position)) => Ok(position),
            _ => Err(Error::Unhandled),
        }
    }

    /// Seek a source.
    pub fn src_set_position(&self, position: u64) -> Result<()> {
        self.control(&mut Command::SrcSetPosition(position))
    }

    /// Size of a source.
    pub fn src_get_size(&self) -> Result<u64> {
        let mut command = Command::SrcGetSize(None);
        self.control(&mut command)?;
        match command {
            Command::SrcGetSize(Some(size)) => Ok(size),
            _ => Err(Error::Unhandled),
        }
    }
}

impl Lifecycle for PipeCore {
    fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    fn no_ref(self: Arc<Self>) {
        let span = observability::span_pipe(self.manager_name, self.id);
        let _guard = span.enter();
        let teardown = match self.ops.get() {
            Some(ops) => ops.no_ref(&self),
            None => Teardown::Done,
        };
        if teardown == Teardown::Done {
            self.throw_dead();
        }
    }
}

impl fmt::Debug for PipeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeCore")
            .field("id", &self.id)
            .field("manager", &self.manager_name)
            .field("state", &self.state())
            .field("use_count", &self.refcount.count())
            .finish()
    }
}

impl fmt::Debug for Handle<PipeCore> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipe({} {})", self.manager_name, self.id)
    }
}
