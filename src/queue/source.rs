//! Queue source: the reader side of the bridge.
//!
//! The source pops refs on its own event loop and outputs them like any
//! source pipe. Its watchers are created on the first command once both an
//! output and an event loop are known, so the source is usually allocated
//! on one thread and then given `AttachUpumpMgr` (directly or through an
//! xfer proxy) on the thread that will run it.
//!
//! Releasing the last handle does not free the source at once: teardown is
//! queued behind the refs already in flight, which are still output.

use super::{Downstream, QueueConfig, QueueItem, QueueShared};
use crate::error::{Error, Result};
use crate::pipe::{
    Command, OutputHelper, Pipe, PipeCore, PipeManager, PipeOps, PipeRef, PumpManagerHelper,
    Teardown, fourcc,
};
use crate::probe::Probe;
use crate::pump::Pump;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Signature of queue sources.
pub const QSRC_SIGNATURE: u32 = fourcc(b"qsrc");

const GET_LENGTH: u32 = 1;
const ATTACH_SINK: u32 = 2;

/// Number of refs currently queued in front of a queue source.
pub fn source_length(qsrc: &PipeCore) -> Result<usize> {
    let mut command = Command::Custom {
        signature: QSRC_SIGNATURE,
        command: GET_LENGTH,
        payload: Box::new(None::<usize>),
    };
    qsrc.control(&mut command)?;
    custom_result::<usize>(command)
}

/// Bind a sink to `qsrc`. A source accepts a single sink.
pub(crate) fn attach_sink(qsrc: &PipeCore) -> Result<Arc<QueueShared>> {
    let mut command = Command::Custom {
        signature: QSRC_SIGNATURE,
        command: ATTACH_SINK,
        payload: Box::new(None::<Arc<QueueShared>>),
    };
    qsrc.control(&mut command)?;
    custom_result::<Arc<QueueShared>>(command)
}

pub(super) fn custom_result<T: 'static>(command: Command) -> Result<T> {
    match command {
        Command::Custom { payload, .. } => payload
            .downcast::<Option<T>>()
            .ok()
            .and_then(|slot| *slot)
            .ok_or(Error::Unhandled),
        _ => Err(Error::Unhandled),
    }
}

pub(super) fn fill<T: 'static>(payload: &mut Box<dyn Any + Send>, value: T) -> Result<()> {
    match payload.downcast_mut::<Option<T>>() {
        Some(slot) => {
            *slot = Some(value);
            Ok(())
        }
        None => Err(Error::invalid("queue source command with a bad payload")),
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Allocates queue sources.
#[derive(Debug, Clone, Default)]
pub struct QueueSourceManager {
    config: QueueConfig,
}

impl QueueSourceManager {
    /// Sources with queues built from `config`.
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    /// Data ring length of the allocated sources.
    pub fn length(&self) -> usize {
        self.config.length
    }
}

impl PipeManager for QueueSourceManager {
    fn signature(&self) -> u32 {
        QSRC_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "qsrc"
    }

    fn alloc(&self, probe: Probe) -> Result<Pipe> {
        let shared = Arc::new(QueueShared::new(&self.config)?);
        let pipe = PipeCore::create(self, probe, |_| {
            Ok(QueueSourceOps {
                state: Arc::new(SourceState {
                    shared,
                    output: OutputHelper::new(),
                    upump_mgr: PumpManagerHelper::new(),
                    pumps: Mutex::new(None),
                    sink_attached: AtomicBool::new(false),
                    keep_alive: Mutex::new(None),
                }),
            })
        })?;
        pipe.debug(format!(
            "queue {} of {} refs",
            self.config.name, self.config.length
        ));
        pipe.throw_ready();
        Ok(pipe)
    }
}

// ============================================================================
// Pipe
// ============================================================================

struct SourcePumps {
    _data: Pump,
    _oob: Pump,
}

struct SourceState {
    shared: Arc<QueueShared>,
    output: OutputHelper,
    upump_mgr: PumpManagerHelper,
    pumps: Mutex<Option<SourcePumps>>,
    sink_attached: AtomicBool,
    // set while teardown waits behind queued refs
    keep_alive: Mutex<Option<PipeRef>>,
}

impl SourceState {
    fn has_pumps(&self) -> bool {
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn release_pumps(&self) {
        let pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(pumps);
    }

    fn process(&self, pipe: &PipeCore, item: QueueItem, pump: Option<&Pump>) {
        match item {
            QueueItem::FlowDef(flow_def) => self.output.store_flow_def(pipe, flow_def),
            QueueItem::Data(uref) => self.output.output(pipe, uref, pump),
        }
    }

    /// Output every queued ref.
    fn drain(&self, pipe: &PipeCore) {
        while let Some(item) = self.shared.data.try_pop() {
            self.process(pipe, item, None);
        }
    }

    fn oob(&self, pipe: &PipeCore) {
        while let Some(message) = self.shared.downstream.try_pop() {
            match message {
                Downstream::Register(request) => {
                    if let Err(err) = self.output.register_request(pipe, request) {
                        pipe.warn(format!("cannot register request from queue: {err}"));
                    }
                }
                Downstream::Unregister(request) => {
                    let _ = self.output.unregister_request(pipe, &request);
                }
                Downstream::SourceEnd => {
                    self.drain(pipe);
                    pipe.debug("queue sink gone");
                    pipe.throw_source_end();
                }
                Downstream::RefEnd => {
                    self.ref_end(pipe);
                    return;
                }
            }
        }
    }

    fn ref_end(&self, pipe: &PipeCore) {
        self.drain(pipe);
        pipe.throw_dead();
        self.clean();
        let keep_alive = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(keep_alive);
    }

    fn clean(&self) {
        self.release_pumps();
        self.upump_mgr.detach();
        drop(self.shared.downstream.drain());
        self.output.clean();
    }
}

/// Create the watchers once an event loop is known.
fn check_pumps(state: &Arc<SourceState>, pipe: &PipeCore) {
    // nothing is popped before there is somewhere to send it
    if state.output.get_output().is_none() {
        return;
    }
    let Some(mgr) = state.upump_mgr.check(pipe) else {
        return;
    };
    let mut pumps = state.pumps.lock().unwrap_or_else(PoisonError::into_inner);
    if pumps.is_some() {
        return;
    }

    let (weak_pipe, weak_state) = (pipe.weak(), Arc::downgrade(state));
    let data = state.shared.data.watch_pop(&mgr, move |pump| {
        let (Some(pipe), Some(state)) = (weak_pipe.upgrade(), weak_state.upgrade()) else {
            return;
        };
        if let Some(item) = state.shared.data.try_pop() {
            state.process(&pipe, item, Some(pump));
        }
    });

    let (weak_pipe, weak_state) = (pipe.weak(), Arc::downgrade(state));
    let oob = state.shared.downstream.watch(&mgr, move |_| {
        let (Some(pipe), Some(state)) = (weak_pipe.upgrade(), weak_state.upgrade()) else {
            return;
        };
        state.oob(&pipe);
    });

    data.start();
    oob.start();
    tracing::debug!(pipe = pipe.id(), event_loop = mgr.name(), "queue source watching");
    *pumps = Some(SourcePumps {
        _data: data,
        _oob: oob,
    });
}

struct QueueSourceOps {
    state: Arc<SourceState>,
}

impl QueueSourceOps {
    fn handle(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::AttachUpumpMgr => {
                self.state.release_pumps();
                self.state.upump_mgr.detach();
                Ok(())
            }
            Command::GetMaxLength(slot) => {
                *slot = Some(self.state.shared.data.length());
                Ok(())
            }
            Command::Custom {
                signature,
                command,
                payload,
            } if *signature == QSRC_SIGNATURE => match *command {
                GET_LENGTH => fill(payload, self.state.shared.data.len()),
                ATTACH_SINK => {
                    if self.state.sink_attached.swap(true, Ordering::AcqRel) {
                        return Err(Error::busy("queue source already has a sink"));
                    }
                    fill(payload, Arc::clone(&self.state.shared))
                }
                _ => Err(Error::Unhandled),
            },
            _ => self.state.output.control(pipe, command),
        }
    }
}

impl PipeOps for QueueSourceOps {
    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        self.handle(pipe, command)?;
        check_pumps(&self.state, pipe);
        Ok(())
    }

    fn no_ref(&self, pipe: &PipeCore) -> Teardown {
        if !self.state.has_pumps() {
            self.state.drain(pipe);
            self.state.clean();
            return Teardown::Done;
        }
        *self
            .state
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = pipe.real();
        if let Err(err) = self.state.shared.downstream.push(Downstream::RefEnd) {
            tracing::warn!(pipe = pipe.id(), "cannot queue teardown: {err}");
            self.state.keep_alive.lock().unwrap_or_else(PoisonError::into_inner).take();
            self.state.clean();
            return Teardown::Done;
        }
        Teardown::Deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{AttributeRefManager, flow};
    use crate::pipes::CaptureManager;
    use crate::probe::{FnProbe, PumpManagerProbe};
    use crate::pump::{LoopConfig, PumpManager};
    use std::time::Duration;

    #[test]
    fn test_length_commands() {
        let mgr = QueueSourceManager::new(QueueConfig::with_length(4));
        let qsrc = mgr.alloc(Probe::end()).unwrap();
        assert_eq!(qsrc.get_max_length().unwrap(), 4);
        assert_eq!(source_length(&qsrc).unwrap(), 0);
        let _shared = attach_sink(&qsrc).unwrap();
        assert!(matches!(attach_sink(&qsrc), Err(Error::Busy(_))));
    }

    #[test]
    fn test_bad_length() {
        let mgr = QueueSourceManager::new(QueueConfig::with_length(0));
        assert!(mgr.alloc(Probe::end()).is_err());
    }

    #[test]
    fn test_outputs_queued_refs_on_its_loop() {
        let urefs = AttributeRefManager::new();
        let event_loop = PumpManager::new(LoopConfig::default()).unwrap();
        let probe = Probe::end().push(PumpManagerProbe::new(event_loop.clone()));
        let qsrc = QueueSourceManager::new(QueueConfig::with_length(2))
            .alloc(probe)
            .unwrap();
        let (capture, handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
        qsrc.set_output(&capture).unwrap();

        let shared = attach_sink(&qsrc).unwrap();
        let flow_def = flow::alloc_def(&urefs, "void.");
        shared.data.try_push(QueueItem::FlowDef(flow_def)).unwrap();
        let mut uref = urefs.alloc();
        uref.set_unsigned("seq", 7);
        shared.data.try_push(QueueItem::Data(uref)).unwrap();

        event_loop.run_once(Some(Duration::from_millis(50))).unwrap();
        event_loop.run_once(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(handle.len(), 1);
        assert_eq!(handle.refs()[0].get_unsigned("seq"), Some(7));
    }

    #[test]
    fn test_teardown_waits_for_queue() {
        let urefs = AttributeRefManager::new();
        let event_loop = PumpManager::new(LoopConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let probe = Probe::end()
            .push(FnProbe::new(move |_, event| {
                seen.lock().unwrap().push(event.name());
                Err(Error::Unhandled)
            }))
            .push(PumpManagerProbe::new(event_loop.clone()));
        let qsrc = QueueSourceManager::new(QueueConfig::default())
            .alloc(probe)
            .unwrap();
        let (capture, handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
        qsrc.set_output(&capture).unwrap();
        let shared = attach_sink(&qsrc).unwrap();
        shared
            .data
            .try_push(QueueItem::FlowDef(flow::alloc_def(&urefs, "void.")))
            .unwrap();
        shared.data.try_push(QueueItem::Data(urefs.alloc())).unwrap();

        drop(qsrc);
        assert!(!events.lock().unwrap().contains(&"dead"));
        while !events.lock().unwrap().contains(&"dead") {
            event_loop.run_once(Some(Duration::from_millis(50))).unwrap();
        }
        assert_eq!(handle.len(), 1);
        assert!(!event_loop.has_active());
    }
}
