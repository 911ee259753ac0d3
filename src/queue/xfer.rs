//! Transfer of a pipe to another event loop.
//!
//! An [`XferManager`] is bound to a remote event loop with
//! [`XferManager::attach`]. [`XferManager::alloc_xfer`] then wraps an
//! already-allocated pipe in a local proxy. Commands on the proxy are
//! queued and executed on the remote loop, and releasing the proxy releases
//! the remote pipe there too.
//!
//! The remote pipe gets an extra probe that carries its end-of-stream and
//! error events back to the proxy. They travel on a second queue watched on
//! the proxy's own loop, so the proxy's probes always run there. `Dead` is
//! thrown on the proxy only once the remote pipe is dead.
//!
//! ```rust,ignore
//! let xfer = XferManager::new(XferConfig::default())?;
//! xfer.attach(&worker_loop)?;
//! let proxy = xfer.alloc_xfer(probe, remote)?;
//! proxy.attach_upump_mgr()?; // runs on the worker loop
//! ```

use super::ControlQueue;
use super::source::{custom_result, fill};
use crate::error::{Error, ErrorCode, Result};
use crate::pipe::{
    Command, ManagerCommand, Pipe, PipeCore, PipeManager, PipeOps, PipeRef, PipeWeak,
    PumpManagerHelper, Teardown, fourcc,
};
use crate::probe::{Event, Probe, ProbeHandler};
use crate::pump::{Blocker, Pump, PumpManager};
use crate::refcount::{Handle, Lifecycle, RefCount};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Signature of xfer proxies.
pub const XFER_SIGNATURE: u32 = fourcc(b"xfer");

const GET_REMOTE: u32 = 1;

/// The pipe an xfer proxy stands for.
///
/// The remote pipe belongs to the remote loop: only its identity may be
/// used from elsewhere.
pub fn xfer_remote(proxy: &PipeCore) -> Result<PipeWeak> {
    let mut command = Command::Custom {
        signature: XFER_SIGNATURE,
        command: GET_REMOTE,
        payload: Box::new(None::<PipeWeak>),
    };
    proxy.control(&mut command)?;
    custom_result::<PipeWeak>(command)
}

/// Configuration of an [`XferManager`].
#[derive(Debug, Clone)]
pub struct XferConfig {
    /// Name of the message queue, for logs.
    pub name: String,
}

impl Default for XferConfig {
    fn default() -> Self {
        Self {
            name: String::from("xfer"),
        }
    }
}

impl XferConfig {
    /// A config with the given queue name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// ============================================================================
// Messages
// ============================================================================

enum XferMessage {
    AttachUpumpMgr(Pipe),
    SetUri(Pipe, Option<String>),
    SetOutput(Pipe, Option<Pipe>),
    /// Drop the proxy's handle on the remote pipe.
    Release(Pipe),
    /// The manager lost its last user: stop watching the queue.
    Detach,
}

impl XferMessage {
    fn name(&self) -> &'static str {
        match self {
            XferMessage::AttachUpumpMgr(_) => "attach_upump_mgr",
            XferMessage::SetUri(..) => "set_uri",
            XferMessage::SetOutput(..) => "set_output",
            XferMessage::Release(_) => "release",
            XferMessage::Detach => "detach",
        }
    }
}

/// Remote events replayed on the proxy.
#[derive(Debug, Clone, Copy)]
enum RemoteEvent {
    SourceEnd,
    SinkEnd,
    Fatal(ErrorCode),
    Error(ErrorCode),
}

impl RemoteEvent {
    fn from_event(event: &Event<'_>) -> Option<Self> {
        match event {
            Event::SourceEnd => Some(RemoteEvent::SourceEnd),
            Event::SinkEnd => Some(RemoteEvent::SinkEnd),
            Event::Fatal(code) => Some(RemoteEvent::Fatal(*code)),
            Event::Error(code) => Some(RemoteEvent::Error(*code)),
            _ => None,
        }
    }

    fn throw(self, proxy: &PipeCore) {
        match self {
            RemoteEvent::SourceEnd => proxy.throw_source_end(),
            RemoteEvent::SinkEnd => proxy.throw_sink_end(),
            RemoteEvent::Fatal(code) => proxy.throw_fatal(code),
            RemoteEvent::Error(code) => proxy.throw_error(code),
        }
    }
}

/// Travels from the remote loop back to the proxy's loop.
#[derive(Debug, Clone, Copy)]
enum Notice {
    Forward(RemoteEvent),
    RemoteDead,
}

// ============================================================================
// Manager
// ============================================================================

struct XferCore {
    refcount: RefCount,
    config: XferConfig,
    messages: ControlQueue<XferMessage>,
    pump: Mutex<Option<Pump>>,
    // held while frozen
    frozen: Mutex<Option<Blocker>>,
}

impl XferCore {
    fn pump(&self) -> MutexGuard<'_, Option<Pump>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frozen(&self) -> MutexGuard<'_, Option<Blocker>> {
        self.frozen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: XferMessage) -> Result<()> {
        tracing::trace!(xfer = %self.config.name, message = message.name(), "queued");
        self.messages.push(message)
    }

    /// Run queued messages on the remote loop.
    fn process(&self) {
        while let Some(message) = self.messages.try_pop() {
            let name = message.name();
            let result = match message {
                XferMessage::AttachUpumpMgr(remote) => remote.attach_upump_mgr(),
                XferMessage::SetUri(remote, uri) => remote.set_uri(uri.as_deref()),
                XferMessage::SetOutput(remote, output) => {
                    remote.control(&mut Command::SetOutput(output))
                }
                XferMessage::Release(remote) => {
                    drop(remote);
                    Ok(())
                }
                XferMessage::Detach => {
                    tracing::debug!(xfer = %self.config.name, "detached from remote loop");
                    let pump = self.pump().take();
                    drop(pump);
                    return;
                }
            };
            if let Err(err) = result {
                tracing::warn!(xfer = %self.config.name, message = name, "remote command failed: {err}");
            }
        }
    }
}

impl Lifecycle for XferCore {
    fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    fn no_ref(self: Arc<Self>) {
        if self.pump().is_none() {
            return;
        }
        let blocker = self.frozen().take();
        drop(blocker);
        if let Err(err) = self.send(XferMessage::Detach) {
            tracing::warn!(xfer = %self.config.name, "cannot detach: {err}");
        }
    }
}

/// Moves pipes to a remote event loop.
///
/// Cloning shares the manager. Once every clone and every proxy is gone,
/// the manager detaches from the remote loop.
#[derive(Clone)]
pub struct XferManager {
    core: Handle<XferCore>,
}

impl XferManager {
    /// A manager not bound to any loop yet.
    pub fn new(config: XferConfig) -> Result<Self> {
        let messages = ControlQueue::new(config.name.clone())?;
        Ok(Self {
            core: Handle::new(Arc::new(XferCore {
                refcount: RefCount::new(),
                config,
                messages,
                pump: Mutex::new(None),
                frozen: Mutex::new(None),
            })),
        })
    }

    /// Bind to the loop the transferred pipes will run on. May be called
    /// from any thread.
    pub fn attach(&self, remote: &PumpManager) -> Result<()> {
        let mut slot = self.core.pump();
        if slot.is_some() {
            return Err(Error::busy("xfer manager already attached"));
        }
        // the watcher holds the core until the detach message is processed
        let core = Arc::clone(self.core.real());
        let pump = self.core.messages.watch(remote, move |_| core.process());
        pump.start();
        tracing::debug!(xfer = %self.core.config.name, event_loop = remote.name(), "attached");
        *slot = Some(pump);
        Ok(())
    }

    /// Stop running messages on the remote loop. They queue up until
    /// [`XferManager::thaw`].
    pub fn freeze(&self) -> Result<()> {
        let slot = self.core.pump();
        let Some(pump) = slot.as_ref() else {
            return Err(Error::invalid("xfer manager is not attached"));
        };
        let mut frozen = self.core.frozen();
        if frozen.is_none() {
            tracing::debug!(xfer = %self.core.config.name, "frozen");
            *frozen = Some(pump.block());
        }
        Ok(())
    }

    /// Resume running messages on the remote loop.
    pub fn thaw(&self) {
        let blocker = self.core.frozen().take();
        if blocker.is_some() {
            tracing::debug!(xfer = %self.core.config.name, "thawed");
        }
        drop(blocker);
    }

    /// Whether the manager is frozen.
    pub fn is_frozen(&self) -> bool {
        self.core.frozen().is_some()
    }

    /// Wrap `remote` in a local proxy.
    ///
    /// `remote` must not be used directly after this call: the proxy owns
    /// it, and all its commands run on the remote loop. The proxy asks its
    /// probes for the local loop; without one, remote events are thrown on
    /// the proxy from the remote thread.
    pub fn alloc_xfer(&self, probe: Probe, remote: Pipe) -> Result<Pipe> {
        let mgr = self.clone();
        let pipe = PipeCore::create(self, probe, move |core| {
            let notices = ControlQueue::new(format!("{}.events", mgr.core.config.name))?;
            let state = Arc::new(XferState {
                mgr,
                remote: Mutex::new(Some(remote.clone())),
                teardown: Mutex::new(TeardownState::default()),
                notices,
                local: PumpManagerHelper::new(),
                notice_pump: Mutex::new(None),
            });
            check_local(&state, core);
            remote.push_probe(XferProbe {
                proxy: core.weak(),
                state: Arc::downgrade(&state),
            });
            core.debug(format!("transferring {remote:?}"));
            Ok(XferOps { state })
        })?;
        pipe.throw_ready();
        Ok(pipe)
    }

    /// Number of messages waiting for the remote loop.
    pub fn pending(&self) -> usize {
        self.core.messages.len()
    }
}

impl std::fmt::Debug for XferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XferManager")
            .field("name", &self.core.config.name)
            .field("attached", &self.core.pump().is_some())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl PipeManager for XferManager {
    fn signature(&self) -> u32 {
        XFER_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "xfer"
    }

    fn alloc(&self, _probe: Probe) -> Result<Pipe> {
        Err(Error::invalid("an xfer proxy is allocated with alloc_xfer"))
    }

    fn control(&self, command: &mut ManagerCommand) -> Result<()> {
        match command {
            ManagerCommand::AttachUpumpMgr(remote) => self.attach(remote),
            ManagerCommand::FreezeUpumpMgr => self.freeze(),
            ManagerCommand::ThawUpumpMgr => {
                self.thaw();
                Ok(())
            }
            _ => Err(Error::Unhandled),
        }
    }
}

// ============================================================================
// Proxy
// ============================================================================

#[derive(Default)]
struct TeardownState {
    remote_dead: bool,
    // the proxy, kept allocated until the remote pipe is dead
    keep_alive: Option<PipeRef>,
}

struct XferState {
    mgr: XferManager,
    remote: Mutex<Option<Pipe>>,
    teardown: Mutex<TeardownState>,
    notices: ControlQueue<Notice>,
    local: PumpManagerHelper,
    notice_pump: Mutex<Option<Pump>>,
}

impl XferState {
    fn remote(&self) -> Option<Pipe> {
        self.remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn teardown(&self) -> MutexGuard<'_, TeardownState> {
        self.teardown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notice_pump(&self) -> MutexGuard<'_, Option<Pump>> {
        self.notice_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Called on the remote thread.
    fn notify(&self, proxy: &PipeWeak, notice: Notice) {
        if self.notice_pump().is_none() {
            self.apply(proxy, notice);
            return;
        }
        if let Err(err) = self.notices.push(notice) {
            tracing::warn!(?notice, "cannot pass remote event to the proxy: {err}");
        }
    }

    /// Called on the proxy's loop.
    fn deliver(&self, proxy: &PipeWeak) {
        while let Some(notice) = self.notices.try_pop() {
            self.apply(proxy, notice);
        }
    }

    fn apply(&self, proxy: &PipeWeak, notice: Notice) {
        match notice {
            Notice::Forward(event) => match proxy.upgrade() {
                Some(proxy) => event.throw(&proxy),
                None => tracing::trace!(?event, "proxy gone, remote event dropped"),
            },
            Notice::RemoteDead => self.remote_dead(),
        }
    }

    /// The remote pipe is dead.
    fn remote_dead(&self) {
        let keep_alive = {
            let mut teardown = self.teardown();
            teardown.remote_dead = true;
            teardown.keep_alive.take()
        };
        // nothing is sent back after this
        let pump = self.notice_pump().take();
        if let Some(proxy) = keep_alive {
            proxy.throw_dead();
        }
        drop(pump);
    }
}

/// Watch the notice queue on the proxy's loop, once one is known.
fn check_local(state: &Arc<XferState>, proxy: &PipeCore) {
    if state.notice_pump().is_some() || state.teardown().remote_dead {
        return;
    }
    let Some(mgr) = state.local.check(proxy) else {
        proxy.verbose("no local loop, remote events arrive on the remote thread");
        return;
    };
    let pump = {
        let (weak, proxy) = (Arc::downgrade(state), proxy.weak());
        state.notices.watch(&mgr, move |_| {
            if let Some(state) = weak.upgrade() {
                state.deliver(&proxy);
            }
        })
    };
    pump.start();
    let mut slot = state.notice_pump();
    if slot.is_none() {
        *slot = Some(pump);
    }
}

struct XferOps {
    state: Arc<XferState>,
}

impl PipeOps for XferOps {
    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        if let Command::Custom {
            signature,
            command: id,
            payload,
        } = command
        {
            if *signature != XFER_SIGNATURE || *id != GET_REMOTE {
                return Err(Error::Unhandled);
            }
            let Some(remote) = self.state.remote() else {
                return Err(Error::invalid("xfer proxy has no remote pipe"));
            };
            return fill(payload, remote.weak());
        }
        if !matches!(
            command,
            Command::AttachUpumpMgr | Command::SetUri(_) | Command::SetOutput(_)
        ) {
            return Err(Error::Unhandled);
        }
        check_local(&self.state, pipe);
        let Some(remote) = self.state.remote() else {
            return Err(Error::invalid("xfer proxy has no remote pipe"));
        };
        pipe.verbose(format!("forwarding {} to remote loop", command.name()));
        let message = match command {
            Command::SetUri(uri) => XferMessage::SetUri(remote, uri.take()),
            Command::SetOutput(output) => XferMessage::SetOutput(remote, output.take()),
            _ => XferMessage::AttachUpumpMgr(remote),
        };
        self.state.mgr.core.send(message)
    }

    fn no_ref(&self, pipe: &PipeCore) -> Teardown {
        let remote = self
            .state
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(remote) = remote else {
            drop(self.state.notice_pump().take());
            return Teardown::Done;
        };
        {
            let mut teardown = self.state.teardown();
            if teardown.remote_dead {
                drop(teardown);
                drop(self.state.notice_pump().take());
                return Teardown::Done;
            }
            teardown.keep_alive = pipe.real();
        }
        if let Err(err) = self.state.mgr.core.send(XferMessage::Release(remote)) {
            pipe.warn(format!("cannot release remote pipe: {err}"));
            self.state.teardown().keep_alive.take();
            drop(self.state.notice_pump().take());
            return Teardown::Done;
        }
        Teardown::Deferred
    }
}

/// Installed on the remote pipe: sends end and error events to the proxy,
/// and reports its death.
struct XferProbe {
    proxy: PipeWeak,
    state: Weak<XferState>,
}

impl ProbeHandler for XferProbe {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        if let Event::Dead = event {
            let result = next.throw(pipe, event);
            if let Some(state) = self.state.upgrade() {
                state.notify(&self.proxy, Notice::RemoteDead);
            }
            return result;
        }
        match (RemoteEvent::from_event(event), self.state.upgrade()) {
            (Some(forward), Some(state)) => {
                state.notify(&self.proxy, Notice::Forward(forward));
                Ok(())
            }
            _ => next.throw(pipe, event),
        }
    }
}
