//! Reusable pieces of pipe state, embedded in [`PipeOps`] implementations.
//!
//! Helpers lock their own state only for short sections and never while
//! calling into another pipe or a probe, so pipes can call back into
//! themselves from events thrown during a helper operation.
//!
//! [`PipeOps`]: super::PipeOps

use super::{Command, Pipe, PipeCore};
use crate::attr::{AttributeRef, RefFlags, flow};
use crate::buffer::BufferManager;
use crate::error::{Error, ErrorCode, Result};
use crate::observability;
use crate::pump::{Blocker, Pump, PumpManager};
use crate::request::{Provision, Request};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Throw `ProvideRequest` for `request`; if nothing answers, resolve it as
/// [`Provision::Unavailable`].
///
/// Sinks and other pipes with nowhere else to forward a request use this.
pub fn provide_or_degrade(pipe: &PipeCore, request: &Request) -> Result<()> {
    match pipe.throw_provide_request(request) {
        Err(err) if err.is_unhandled() => {
            if request.is_provided() {
                Ok(())
            } else {
                pipe.debug(format!("no provider for {:?} request", request.kind()));
                request.provide(Provision::Unavailable)
            }
        }
        other => other,
    }
}

/// Answer a `UbufMgr` request with `manager`, agreeing on a format first if
/// `manager` refuses the queried flow.
///
/// The refused flow goes to the probes as a `FlowFormat` request. If the
/// amended flow it comes back with suits `manager`, the request is answered
/// with it; the requester applies that flow before allocating. Otherwise
/// the request itself goes to the probes, and resolves as unavailable when
/// nobody answers it there either.
pub fn provide_ubuf_mgr(
    pipe: &PipeCore,
    request: &Request,
    manager: &Arc<dyn BufferManager>,
) -> Result<()> {
    let Some(flow_def) = request.query() else {
        return request.provide(Provision::Unavailable);
    };
    match manager.check(flow_def) {
        Ok(()) => {
            return request.provide(Provision::UbufMgr {
                manager: Arc::clone(manager),
                flow_def: flow_def.duplicate(),
            });
        }
        Err(err) => pipe.debug(format!("buffer manager refused flow: {err}")),
    }

    let (weak, original, manager) = (pipe.weak(), request.clone(), Arc::clone(manager));
    let flow_format = Request::flow_format(flow_def.duplicate(), move |provision| {
        let agreed = match provision {
            Provision::FlowFormat(amended) => match manager.check(&amended) {
                Ok(()) => Some(amended),
                Err(err) => {
                    tracing::debug!(request = original.id(), "amended flow refused: {err}");
                    None
                }
            },
            _ => None,
        };
        match (agreed, weak.upgrade()) {
            (Some(flow_def), _) => original.provide(Provision::UbufMgr { manager, flow_def }),
            (None, Some(pipe)) => provide_or_degrade(&pipe, &original),
            (None, None) => original.provide(Provision::Unavailable),
        }
    });
    provide_or_degrade(pipe, &flow_format)
}

// ============================================================================
// Requests
// ============================================================================

/// The requests registered with a pipe.
///
/// At most one unanswered request of a given kind is accepted.
#[derive(Debug, Default)]
pub struct RequestHelper {
    requests: Mutex<SmallVec<[Request; 4]>>,
}

impl RequestHelper {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SmallVec<[Request; 4]>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `request`.
    ///
    /// Fails with [`Error::Busy`] if it is already registered, or if an
    /// unanswered request of the same kind is pending.
    pub fn add(&self, request: &Request) -> Result<()> {
        let mut requests = self.lock();
        if let Some(pending) = requests
            .iter()
            .find(|r| r.same(request) || (r.kind() == request.kind() && !r.is_provided()))
        {
            return Err(Error::busy(format!(
                "{:?} request {} already pending",
                pending.kind(),
                pending.id()
            )));
        }
        requests.push(request.clone());
        Ok(())
    }

    /// Forget `request`. Returns whether it was registered.
    pub fn remove(&self, request: &Request) -> bool {
        let mut requests = self.lock();
        match requests.iter().position(|r| r.same(request)) {
            Some(index) => {
                requests.remove(index);
                true
            }
            None => false,
        }
    }

    /// Registered requests that were not answered yet.
    pub fn pending(&self) -> SmallVec<[Request; 4]> {
        self.lock().iter().filter(|r| !r.is_provided()).cloned().collect()
    }

    /// Number of registered requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no request is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every request and return them.
    pub fn clear(&self) -> SmallVec<[Request; 4]> {
        std::mem::take(&mut *self.lock())
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowDefState {
    /// The flow definition must be sent before the next ref.
    Unsent,
    Sent,
    /// The output refused the flow definition; refs are dropped.
    Invalid,
}

#[derive(Debug)]
struct OutputState {
    output: Option<Pipe>,
    flow_def: Option<AttributeRef>,
    flow_def_state: FlowDefState,
    // a malformed ref was dropped since the last ref went out
    discontinuity: bool,
}

enum Route {
    Ready(Pipe),
    Setup(Option<Pipe>, AttributeRef),
    NoFlowDef,
    Invalid,
    Malformed(String),
}

/// Output pipe, output flow definition and registered requests.
///
/// The first ref after the output or the flow definition changed is
/// preceded by a `SetFlowDef` on the output. Refs are dropped while no
/// flow definition is known, or after the output refused it.
///
/// A ref whose buffer does not fit the flow definition is dropped with an
/// `Error` event, and the next ref that goes out is marked
/// [`RefFlags::FLOW_DISC`] and flagged with [`flow::set_error`].
#[derive(Debug)]
pub struct OutputHelper {
    state: Mutex<OutputState>,
    requests: RequestHelper,
}

impl Default for OutputHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputHelper {
    /// No output, no flow definition.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutputState {
                output: None,
                flow_def: None,
                flow_def_state: FlowDefState::Unsent,
                discontinuity: false,
            }),
            requests: RequestHelper::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `uref` to the output.
    pub fn output(&self, pipe: &PipeCore, mut uref: AttributeRef, pump: Option<&Pump>) {
        let route = {
            let mut state = self.lock();
            let malformed = match (&state.flow_def, uref.buffer()) {
                (Some(flow_def), Some(buffer)) => buffer.manager().check(flow_def).err(),
                _ => None,
            };
            if let Some(err) = malformed {
                state.discontinuity = true;
                Route::Malformed(err.to_string())
            } else {
                match (state.flow_def_state, &state.output, &state.flow_def) {
                    (FlowDefState::Invalid, _, _) => Route::Invalid,
                    (FlowDefState::Sent, Some(output), _) => Route::Ready(output.clone()),
                    (_, _, None) => Route::NoFlowDef,
                    (_, output, Some(flow_def)) => {
                        Route::Setup(output.clone(), flow_def.duplicate())
                    }
                }
            }
        };

        let output = match route {
            Route::Ready(output) => output,
            Route::Invalid => {
                observability::record_ref_dropped(pipe.manager_name(), "invalid_flow_def");
                return;
            }
            Route::Malformed(reason) => {
                pipe.warn(format!("ref does not match the flow definition, dropping it: {reason}"));
                observability::record_ref_dropped(pipe.manager_name(), "malformed");
                pipe.throw_error(ErrorCode::Invalid);
                return;
            }
            Route::NoFlowDef => {
                pipe.warn("no flow definition, dropping ref");
                observability::record_ref_dropped(pipe.manager_name(), "no_flow_def");
                return;
            }
            Route::Setup(output, flow_def) => match self.setup(pipe, output, flow_def) {
                Some(output) => output,
                None => return,
            },
        };
        if std::mem::take(&mut self.lock().discontinuity) {
            uref.set_flags(RefFlags::FLOW_DISC);
            flow::set_error(&mut uref);
        }
        output.input(uref, pump);
    }

    fn setup(&self, pipe: &PipeCore, output: Option<Pipe>, flow_def: AttributeRef) -> Option<Pipe> {
        let output = match output {
            Some(output) => output,
            None => {
                let _ = pipe.throw_need_output(&flow_def);
                let output = self.lock().output.clone();
                match output {
                    Some(output) => output,
                    None => {
                        pipe.warn("no output, dropping ref");
                        observability::record_ref_dropped(pipe.manager_name(), "no_output");
                        return None;
                    }
                }
            }
        };

        match output.control(&mut Command::SetFlowDef(flow_def)) {
            Ok(()) => {
                let mut state = self.lock();
                if state
                    .output
                    .as_ref()
                    .is_some_and(|current| Pipe::ptr_eq(current, &output))
                {
                    state.flow_def_state = FlowDefState::Sent;
                }
                drop(state);
                Some(output)
            }
            Err(err) => {
                self.lock().flow_def_state = FlowDefState::Invalid;
                pipe.warn(format!("output refused flow definition: {err}"));
                pipe.throw_error(ErrorCode::Invalid);
                observability::record_ref_dropped(pipe.manager_name(), "invalid_flow_def");
                None
            }
        }
    }

    /// Replace the output flow definition.
    ///
    /// An identical definition is ignored; a new one is announced with
    /// `NewFlowDef` and sent to the output before the next ref.
    pub fn store_flow_def(&self, pipe: &PipeCore, flow_def: AttributeRef) {
        let announce = {
            let mut state = self.lock();
            if state
                .flow_def
                .as_ref()
                .is_some_and(|old| old.same_attributes(&flow_def))
            {
                return;
            }
            let announce = flow_def.duplicate();
            let old = state.flow_def.replace(flow_def);
            state.flow_def_state = FlowDefState::Unsent;
            drop(state);
            drop(old);
            announce
        };
        pipe.throw_new_flow_def(&announce);
    }

    /// Output flow definition.
    pub fn flow_def(&self) -> Option<AttributeRef> {
        self.lock().flow_def.as_ref().map(AttributeRef::duplicate)
    }

    /// Current output.
    pub fn get_output(&self) -> Option<Pipe> {
        self.lock().output.clone()
    }

    /// Replace the output, moving the pending requests over.
    pub fn set_output(&self, pipe: &PipeCore, output: Option<Pipe>) -> Result<()> {
        let (old, pending) = {
            let mut state = self.lock();
            let old = std::mem::replace(&mut state.output, output.clone());
            state.flow_def_state = FlowDefState::Unsent;
            (old, self.requests.pending())
        };
        if let Some(old) = &old {
            for request in &pending {
                let _ = old.unregister_request(request);
            }
        }
        if let Some(output) = &output {
            for request in &pending {
                match output.register_request(request) {
                    Err(err) if err.is_unhandled() => provide_or_degrade(pipe, request)?,
                    Err(err) => pipe.warn(format!("output refused request: {err}")),
                    Ok(()) => {}
                }
            }
        }
        Ok(())
    }

    /// Register `request` and forward it to the output.
    ///
    /// Without an output the request is thrown to the probes, and stays
    /// pending until an output is set if nobody answers.
    pub fn register_request(&self, pipe: &PipeCore, request: Request) -> Result<()> {
        self.requests.add(&request)?;
        match self.get_output() {
            Some(output) => match output.register_request(&request) {
                Err(err) if err.is_unhandled() => provide_or_degrade(pipe, &request),
                Err(err) => {
                    self.requests.remove(&request);
                    Err(err)
                }
                Ok(()) => Ok(()),
            },
            None => match pipe.throw_provide_request(&request) {
                Err(err) if err.is_unhandled() => Ok(()),
                other => other,
            },
        }
    }

    /// Withdraw `request` here and downstream.
    pub fn unregister_request(&self, pipe: &PipeCore, request: &Request) -> Result<()> {
        if !self.requests.remove(request) {
            return Err(Error::invalid(format!(
                "request {} is not registered",
                request.id()
            )));
        }
        if let Some(output) = self.get_output() {
            if let Err(err) = output.unregister_request(request) {
                if !err.is_unhandled() {
                    tracing::debug!(pipe = pipe.id(), "output kept request: {err}");
                }
            }
        }
        Ok(())
    }

    /// Handle the output-related commands: `RegisterRequest`,
    /// `UnregisterRequest`, `GetFlowDef`, `GetOutput` and `SetOutput`.
    pub fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::RegisterRequest(request) => self.register_request(pipe, request.clone()),
            Command::UnregisterRequest(request) => self.unregister_request(pipe, request),
            Command::GetFlowDef(slot) => {
                *slot = self.flow_def();
                Ok(())
            }
            Command::GetOutput(slot) => {
                *slot = self.get_output();
                Ok(())
            }
            Command::SetOutput(output) => self.set_output(pipe, output.take()),
            _ => Err(Error::Unhandled),
        }
    }

    /// Release the output, withdrawing the registered requests from it.
    pub fn clean(&self) {
        let (output, flow_def) = {
            let mut state = self.lock();
            (state.output.take(), state.flow_def.take())
        };
        let requests = self.requests.clear();
        if let Some(output) = &output {
            for request in &requests {
                let _ = output.unregister_request(request);
            }
        }
        drop(flow_def);
        drop(output);
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// The event loop a pipe runs its watchers on.
#[derive(Debug, Default)]
pub struct PumpManagerHelper {
    mgr: Mutex<Option<PumpManager>>,
}

impl PumpManagerHelper {
    /// No event loop yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The event loop, asking the probes for one if none is attached.
    pub fn check(&self, pipe: &PipeCore) -> Option<PumpManager> {
        if let Some(mgr) = self.get() {
            return Some(mgr);
        }
        let mgr = pipe.throw_need_upump_mgr()?;
        *self.mgr.lock().unwrap_or_else(PoisonError::into_inner) = Some(mgr.clone());
        Some(mgr)
    }

    /// The attached event loop.
    pub fn get(&self) -> Option<PumpManager> {
        self.mgr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the attached event loop. The pipe must free its pumps.
    pub fn detach(&self) -> Option<PumpManager> {
        self.mgr.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

// ============================================================================
// Held input
// ============================================================================

#[derive(Debug)]
struct InputState<T> {
    held: VecDeque<T>,
    blockers: SmallVec<[Blocker; 2]>,
    max_length: usize,
}

/// Items held back by a pipe that cannot process them yet, and the blockers
/// on the pumps that produced them.
///
/// Up to `max_length` items are held without pushing back; past that, the
/// pumps feeding the pipe are blocked until the count drops again.
#[derive(Debug)]
pub struct InputHelper<T = AttributeRef> {
    state: Mutex<InputState<T>>,
}

impl<T> InputHelper<T> {
    /// Block upstream once more than `max_length` items are held.
    pub fn new(max_length: usize) -> Self {
        Self {
            state: Mutex::new(InputState {
                held: VecDeque::new(),
                blockers: SmallVec::new(),
                max_length,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InputState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` to the held items.
    pub fn hold(&self, item: T) {
        self.lock().held.push_back(item);
    }

    /// Put `item` back at the head of the held items.
    pub fn unpop(&self, item: T) {
        self.lock().held.push_front(item);
    }

    /// Take the oldest held item.
    pub fn pop(&self) -> Option<T> {
        self.lock().held.pop_front()
    }

    /// Block `pump` if more than `max_length` items are held.
    pub fn block(&self, pump: Option<&Pump>) {
        let Some(pump) = pump else {
            return;
        };
        let mut state = self.lock();
        if state.held.len() > state.max_length {
            state.blockers.push(pump.block());
        }
    }

    /// Release every blocker, unless more than `max_length` items are still
    /// held.
    pub fn unblock(&self) {
        let blockers = {
            let mut state = self.lock();
            if state.held.len() > state.max_length {
                return;
            }
            std::mem::take(&mut state.blockers)
        };
        drop(blockers);
    }

    /// Whether pumps are blocked.
    pub fn is_blocked(&self) -> bool {
        !self.lock().blockers.is_empty()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.lock().held.is_empty()
    }

    /// Number of held items.
    pub fn len(&self) -> usize {
        self.lock().held.len()
    }

    /// Whether more than `max_length` items are held.
    pub fn is_full(&self) -> bool {
        let state = self.lock();
        state.held.len() > state.max_length
    }

    /// Maximum number of held items.
    pub fn max_length(&self) -> usize {
        self.lock().max_length
    }

    /// Set the maximum number of held items.
    pub fn set_max_length(&self, max_length: usize) {
        self.lock().max_length = max_length;
    }

    /// Feed held items to `f` in order until it gives one back.
    ///
    /// Returns `true` when every held item was consumed.
    pub fn drain_with<F>(&self, mut f: F) -> bool
    where
        F: FnMut(T) -> std::result::Result<(), T>,
    {
        loop {
            let Some(item) = self.pop() else {
                return true;
            };
            if let Err(item) = f(item) {
                self.unpop(item);
                return false;
            }
        }
    }

    /// Drop every held item and release the blockers. Returns the number of
    /// items dropped.
    pub fn flush(&self) -> usize {
        let (held, blockers) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.held),
                std::mem::take(&mut state.blockers),
            )
        };
        let dropped = held.len();
        drop(held);
        drop(blockers);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttributeRefManager;

    #[test]
    fn test_request_helper_busy() {
        let helper = RequestHelper::new();
        let first = Request::uclock(|_| Ok(()));
        helper.add(&first).unwrap();
        assert!(matches!(helper.add(&first), Err(Error::Busy(_))));
        let second = Request::uclock(|_| Ok(()));
        assert!(matches!(helper.add(&second), Err(Error::Busy(_))));
        first.provide(Provision::Unavailable).unwrap();
        helper.add(&second).unwrap();
        assert_eq!(helper.len(), 2);
        assert_eq!(helper.pending().len(), 1);
        assert!(helper.remove(&first));
        assert!(!helper.remove(&first));
        second.provide(Provision::Unavailable).unwrap();
        assert_eq!(helper.clear().len(), 1);
        assert!(helper.is_empty());
    }

    #[test]
    fn test_input_helper_drain() {
        let mgr = AttributeRefManager::new();
        let helper = InputHelper::new(2);
        for i in 0..3 {
            let mut uref = mgr.alloc();
            uref.set_unsigned("seq", i);
            helper.hold(uref);
        }
        assert!(helper.is_full());
        let mut seen = Vec::new();
        let drained = helper.drain_with(|uref| {
            let seq = uref.get_unsigned("seq").unwrap();
            if seq == 1 {
                return Err(uref);
            }
            seen.push(seq);
            Ok(())
        });
        assert!(!drained);
        assert_eq!(seen, vec![0]);
        assert_eq!(helper.len(), 2);
        assert_eq!(helper.pop().and_then(|u| u.get_unsigned("seq")), Some(1));
        assert_eq!(helper.flush(), 1);
        assert!(helper.is_empty());
    }

    #[test]
    fn test_input_helper_blocks_pump_past_max_length() {
        let event_loop = crate::pump::PumpManager::new(crate::pump::LoopConfig::default()).unwrap();
        let pump = event_loop.idler(|_| {});
        pump.start();
        let helper = InputHelper::new(1);

        helper.hold(1u32);
        helper.block(Some(&pump));
        assert!(!helper.is_blocked());

        helper.hold(2);
        helper.block(Some(&pump));
        assert!(helper.is_blocked());
        assert!(pump.is_blocked());

        // still over the limit
        helper.unblock();
        assert!(pump.is_blocked());

        assert_eq!(helper.pop(), Some(1));
        helper.unblock();
        assert!(!helper.is_blocked());
        assert!(!pump.is_blocked());
    }
}
