//! Queue sink: the writer side of the bridge.
//!
//! Refs that do not fit in the queue are held and the pumps feeding the
//! sink are blocked; a watcher on the sink's event loop flushes them as soon
//! as the source makes room. While refs are held the sink keeps itself in
//! use, so releasing it never loses data.
//!
//! Requests registered on the sink are proxied to the source thread. Their
//! answers come back on the upstream ring and are delivered on the sink's
//! loop; answers to requests withdrawn in the meantime are dropped.

use super::source::attach_sink;
use super::{Downstream, Provided, QSRC_SIGNATURE, QueueItem, QueueShared};
use crate::attr::AttributeRef;
use crate::error::{Error, ErrorCode, Result};
use crate::observability;
use crate::pipe::{
    Command, InputHelper, Pipe, PipeCore, PipeManager, PipeOps, PumpManagerHelper, Teardown,
    fourcc,
};
use crate::probe::Probe;
use crate::pump::Pump;
use crate::request::Request;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Signature of queue sinks.
pub const QSINK_SIGNATURE: u32 = fourcc(b"qsnk");

/// Allocates queue sinks bound to a queue source.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSinkManager;

impl QueueSinkManager {
    /// A sink manager.
    pub fn new() -> Self {
        Self
    }

    /// Allocate a sink writing into `qsrc`'s queue.
    ///
    /// The sink keeps `qsrc` in use until it is released itself.
    pub fn alloc_sink(&self, probe: Probe, qsrc: &Pipe) -> Result<Pipe> {
        if qsrc.signature() != QSRC_SIGNATURE {
            return Err(Error::invalid(format!(
                "queue sink needs a queue source, got {}",
                qsrc.manager_name()
            )));
        }
        let shared = attach_sink(qsrc)?;
        let pipe = PipeCore::create(self, probe, |_| {
            Ok(QueueSinkOps {
                state: Arc::new(SinkState {
                    shared,
                    qsrc: Mutex::new(Some(qsrc.clone())),
                    fields: Mutex::new(SinkFields::default()),
                    input: InputHelper::new(0),
                    upump_mgr: PumpManagerHelper::new(),
                }),
            })
        })?;
        pipe.debug(format!("using queue source {}", qsrc.id()));
        pipe.throw_ready();
        Ok(pipe)
    }
}

impl PipeManager for QueueSinkManager {
    fn signature(&self) -> u32 {
        QSINK_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "qsink"
    }

    fn alloc(&self, _probe: Probe) -> Result<Pipe> {
        Err(Error::invalid("a queue sink is allocated with alloc_sink"))
    }
}

// ============================================================================
// Pipe
// ============================================================================

/// A request registered through the sink and its proxy on the source side.
struct Proxied {
    upstream: Request,
    proxy: Request,
}

#[derive(Default)]
struct SinkFields {
    flow_def: Option<AttributeRef>,
    flow_def_sent: bool,
    // not used for output, only reported back
    pseudo_output: Option<Pipe>,
    requests: Vec<Proxied>,
    watcher: Option<Pump>,
    oob: Option<Pump>,
    // self-reference taken while refs are held
    holding: Option<Pipe>,
}

struct SinkState {
    shared: Arc<QueueShared>,
    qsrc: Mutex<Option<Pipe>>,
    fields: Mutex<SinkFields>,
    input: InputHelper<QueueItem>,
    upump_mgr: PumpManagerHelper,
}

impl SinkState {
    fn fields(&self) -> MutexGuard<'_, SinkFields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_unsent_flow_def(&self) -> Option<AttributeRef> {
        let mut fields = self.fields();
        if fields.flow_def_sent {
            return None;
        }
        let flow_def = fields.flow_def.as_ref()?.duplicate();
        fields.flow_def_sent = true;
        Some(flow_def)
    }

    /// Stop the watcher and drop the self-reference once nothing is held.
    fn release_hold(&self) {
        let holding = {
            let mut fields = self.fields();
            if let Some(watcher) = &fields.watcher {
                watcher.stop();
            }
            fields.holding.take()
        };
        drop(holding);
    }

    fn provided(&self, pipe: &PipeCore, message: Provided) {
        let known = self
            .fields()
            .requests
            .iter()
            .any(|r| r.upstream.same(&message.upstream));
        if !known {
            pipe.verbose(format!(
                "answer to withdrawn request {} dropped",
                message.upstream.id()
            ));
            return;
        }
        if let Err(err) = message.upstream.provide(message.provision) {
            pipe.warn(format!("request {} refused answer: {err}", message.upstream.id()));
        }
    }
}

fn enqueue(state: &Arc<SinkState>, pipe: &PipeCore, item: QueueItem, pump: Option<&Pump>) {
    if !state.input.is_empty() {
        state.input.hold(item);
        state.input.block(pump);
        return;
    }
    let item = match state.shared.data.try_push(item) {
        Ok(()) => return,
        Err(item) => item,
    };
    if !check_watcher(state, pipe) {
        pipe.warn("unable to spool ref");
        observability::record_ref_dropped(pipe.manager_name(), "no_event_loop");
        return;
    }
    state.input.hold(item);
    state.input.block(pump);
    {
        let mut fields = state.fields();
        if fields.holding.is_none() {
            fields.holding = pipe.handle();
        }
        if let Some(watcher) = &fields.watcher {
            watcher.start();
        }
    }
    pipe.throw_stalled();
}

/// Create the watcher flushing held refs, if there is none yet.
fn check_watcher(state: &Arc<SinkState>, pipe: &PipeCore) -> bool {
    if state.fields().watcher.is_some() {
        return true;
    }
    let Some(mgr) = state.upump_mgr.check(pipe) else {
        return false;
    };
    let (weak_pipe, weak_state) = (pipe.weak(), Arc::downgrade(state));
    let watcher = state.shared.data.watch_push(&mgr, move |pump| {
        let (Some(pipe), Some(state)) = (weak_pipe.upgrade(), weak_state.upgrade()) else {
            pump.stop();
            return;
        };
        let drained = state
            .input
            .drain_with(|item| state.shared.data.try_push(item));
        state.input.unblock();
        if drained {
            tracing::trace!(pipe = pipe.id(), "queue sink flushed");
            state.release_hold();
        }
    });
    state.fields().watcher = Some(watcher);
    true
}

/// The watcher delivering answers from the source side.
fn check_oob(state: &Arc<SinkState>, pipe: &PipeCore) {
    if state.fields().oob.is_some() {
        return;
    }
    let Some(mgr) = state.upump_mgr.check(pipe) else {
        pipe.warn("unable to create upstream watcher");
        return;
    };
    let (weak_pipe, weak_state) = (pipe.weak(), Arc::downgrade(state));
    let oob = state.shared.upstream.watch(&mgr, move |_| {
        let (Some(pipe), Some(state)) = (weak_pipe.upgrade(), weak_state.upgrade()) else {
            return;
        };
        while let Some(message) = state.shared.upstream.try_pop() {
            state.provided(&pipe, message);
        }
    });
    oob.start();
    state.fields().oob = Some(oob);
}

struct QueueSinkOps {
    state: Arc<SinkState>,
}

impl QueueSinkOps {
    fn register(&self, pipe: &PipeCore, upstream: Request) -> Result<()> {
        let answers = Arc::clone(&self.state.shared.upstream);
        let origin = upstream.clone();
        let proxy = Request::proxy(&upstream, move |provision| {
            answers.push(Provided {
                upstream: origin,
                provision,
            })
        });
        self.state.fields().requests.push(Proxied {
            upstream,
            proxy: proxy.clone(),
        });
        if let Err(err) = self.state.shared.downstream.push(Downstream::Register(proxy.clone())) {
            self.state
                .fields()
                .requests
                .retain(|r| !r.proxy.same(&proxy));
            return Err(err);
        }
        check_oob(&self.state, pipe);
        pipe.verbose(format!("registered request {}", proxy.id()));
        Ok(())
    }

    fn unregister(&self, pipe: &PipeCore, upstream: &Request) -> Result<()> {
        let proxied = {
            let mut fields = self.state.fields();
            let index = fields
                .requests
                .iter()
                .position(|r| r.upstream.same(upstream))
                .ok_or_else(|| {
                    Error::invalid(format!("request {} is not registered", upstream.id()))
                })?;
            fields.requests.remove(index)
        };
        pipe.verbose(format!("unregistered request {}", proxied.proxy.id()));
        self.state
            .shared
            .downstream
            .push(Downstream::Unregister(proxied.proxy))
    }

    fn flush(&self) {
        let dropped = self.state.input.flush();
        if dropped > 0 {
            self.state.release_hold();
        }
    }

    fn handle(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::RegisterRequest(request) => self.register(pipe, request.clone()),
            Command::UnregisterRequest(request) => self.unregister(pipe, request),
            Command::AttachUpumpMgr => {
                let (watcher, oob) = {
                    let mut fields = self.state.fields();
                    (fields.watcher.take(), fields.oob.take())
                };
                drop((watcher, oob));
                self.state.upump_mgr.detach();
                Ok(())
            }
            Command::GetOutput(slot) => {
                *slot = self.state.fields().pseudo_output.clone();
                Ok(())
            }
            Command::SetOutput(output) => {
                let old = std::mem::replace(&mut self.state.fields().pseudo_output, output.take());
                drop(old);
                Ok(())
            }
            Command::SetFlowDef(flow_def) => {
                let mut fields = self.state.fields();
                let old = fields.flow_def.replace(flow_def.duplicate());
                fields.flow_def_sent = false;
                drop(fields);
                drop(old);
                Ok(())
            }
            Command::GetMaxLength(slot) => {
                *slot = Some(self.state.input.max_length());
                Ok(())
            }
            Command::SetMaxLength(length) => {
                self.state.input.set_max_length(*length);
                Ok(())
            }
            Command::Flush => {
                self.flush();
                Ok(())
            }
            _ => Err(Error::Unhandled),
        }
    }
}

impl PipeOps for QueueSinkOps {
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, pump: Option<&Pump>) {
        if let Some(flow_def) = self.state.take_unsent_flow_def() {
            enqueue(&self.state, pipe, QueueItem::FlowDef(flow_def), pump);
        }
        enqueue(&self.state, pipe, QueueItem::Data(uref), pump);
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        self.handle(pipe, command)?;
        if !self.state.input.is_empty() {
            if !check_watcher(&self.state, pipe) {
                pipe.throw_fatal(ErrorCode::Upump);
            } else if let Some(watcher) = &self.state.fields().watcher {
                watcher.start();
            }
        }
        Ok(())
    }

    fn no_ref(&self, pipe: &PipeCore) -> Teardown {
        let qsrc = self.state.qsrc.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(qsrc) = &qsrc {
            pipe.debug(format!("ending queue source {}", qsrc.id()));
        }
        if let Err(err) = self.state.shared.downstream.push(Downstream::SourceEnd) {
            pipe.warn(format!("unable to send source end: {err}"));
        }
        drop(qsrc);

        pipe.throw_dead();
        let fields = std::mem::take(&mut *self.state.fields());
        drop(fields);
        self.state.input.flush();
        self.state.upump_mgr.detach();
        Teardown::Done
    }
}
