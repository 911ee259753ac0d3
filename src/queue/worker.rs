//! Worker bins: a pipe (or a linear chain of pipes) running on another
//! event loop, seen locally as a single pipe.
//!
//! ```text
//!            local loop                 |            remote loop
//!  input -> in_qsink ==================> in_qsrc -> remote ... last_remote
//!                                       |                           |
//!  output <- out_qsrc <================== out_qsink <----------------'
//! ```
//!
//! The remote pipes are moved to the remote loop with an [`XferManager`];
//! the two queue bridges carry refs across. Events of the remote pipes come
//! back through the xfer proxies and are re-thrown on the worker.

use super::{MAX_QUEUE_LENGTH, QueueConfig, QueueSinkManager, QueueSourceManager, XferManager};
use crate::attr::AttributeRef;
use crate::error::{Error, Result};
use crate::pipe::bin::BinOps;
use crate::pipe::{Command, Pipe, PipeCore, PipeManager, PipeOps, Teardown, fourcc};
use crate::probe::{Event, PrefixProbe, Probe, ProbeHandler, ProxyProbe};
use crate::pump::Pump;
use std::sync::{Mutex, PoisonError};

/// Signature of worker bins.
pub const WORKER_SIGNATURE: u32 = fourcc(b"wrkr");

/// Longest chain followed when looking for the last remote pipe.
const MAX_REMOTE_CHAIN: usize = 64;

/// Queue lengths of a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Refs queued towards the remote pipe. Above 255, the extra refs are
    /// held by the input queue sink.
    pub input_length: usize,
    /// Refs queued back from the remote pipe.
    pub output_length: usize,
    /// Name prefix of the queues.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            input_length: 16,
            output_length: 16,
            name: String::from("worker"),
        }
    }
}

impl WorkerConfig {
    /// Set the input queue length.
    pub fn with_input_length(mut self, length: usize) -> Self {
        self.input_length = length;
        self
    }

    /// Set the output queue length.
    pub fn with_output_length(mut self, length: usize) -> Self {
        self.output_length = length;
        self
    }

    /// Set the queue name prefix.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Which sides of the remote pipe are bridged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sides {
    Both,
    OutputOnly,
    InputOnly,
}

impl Sides {
    fn input(self) -> bool {
        self != Sides::OutputOnly
    }

    fn output(self) -> bool {
        self != Sides::InputOnly
    }
}

/// Swallows `SourceEnd`: a queue source reports it when its sink goes away,
/// which the worker learns through its remote pipes anyway.
struct IgnoreSourceEnd;

impl ProbeHandler for IgnoreSourceEnd {
    fn handle(&self, pipe: &PipeCore, event: &mut Event<'_>, next: &Probe) -> Result<()> {
        match event {
            Event::SourceEnd => Ok(()),
            _ => next.throw(pipe, event),
        }
    }
}

/// Allocates worker bins.
#[derive(Debug, Clone)]
pub struct WorkerManager {
    xfer: XferManager,
    config: WorkerConfig,
    qsink: QueueSinkManager,
}

impl WorkerManager {
    /// A manager moving remote pipes with `xfer`, which must be attached to
    /// the remote loop.
    pub fn new(xfer: XferManager, config: WorkerConfig) -> Self {
        Self {
            xfer,
            config,
            qsink: QueueSinkManager::new(),
        }
    }

    /// Run `remote` and the pipes downstream of it on the remote loop.
    ///
    /// `remote_probe` is given to the queue pipes created on the remote
    /// side; it must answer `NeedUpumpMgr` with the remote loop. The worker
    /// input feeds `remote`, and the output of the last remote pipe comes
    /// out of the worker.
    pub fn alloc_worker(&self, probe: Probe, remote: Pipe, remote_probe: Probe) -> Result<Pipe> {
        self.compose(probe, remote, remote_probe, Sides::Both)
    }

    /// Like [`WorkerManager::alloc_worker`] for a remote pipe that takes no
    /// input.
    pub fn alloc_source(&self, probe: Probe, remote: Pipe, remote_probe: Probe) -> Result<Pipe> {
        self.compose(probe, remote, remote_probe, Sides::OutputOnly)
    }

    /// Like [`WorkerManager::alloc_worker`] for a remote pipe with no
    /// output.
    pub fn alloc_sink(&self, probe: Probe, remote: Pipe, remote_probe: Probe) -> Result<Pipe> {
        self.compose(probe, remote, remote_probe, Sides::InputOnly)
    }

    fn queue_config(&self, side: &str, length: usize) -> QueueConfig {
        QueueConfig::with_length(length.clamp(1, MAX_QUEUE_LENGTH))
            .with_name(format!("{}.{side}", self.config.name))
    }

    fn compose(&self, probe: Probe, remote: Pipe, remote_probe: Probe, sides: Sides) -> Result<Pipe> {
        let pipe = PipeCore::create(self, probe, |core| {
            let inner_probe = |name: &str| {
                Probe::end()
                    .push(ProxyProbe::new(core.weak()))
                    .push(PrefixProbe::new(name))
            };

            // Walking the outputs is a control on each remote pipe; no
            // watcher may be created on the local loop meanwhile.
            core.throw_freeze_upump_mgr();
            let last_remote = find_last_remote(&remote);
            core.throw_thaw_upump_mgr();
            let last_remote = last_remote?;
            let single = Pipe::ptr_eq(&last_remote, &remote);

            let mut out_qsrc = None;
            let mut out_qsink = None;
            if sides.output() {
                let config = self.queue_config("out", self.config.output_length);
                let qsrc = QueueSourceManager::new(config).alloc(
                    inner_probe("out_qsrc").push(IgnoreSourceEnd),
                )?;
                let qsink = self.qsink.alloc_sink(
                    remote_probe.clone().push(PrefixProbe::new("out_qsink")),
                    &qsrc,
                )?;
                if self.config.output_length > MAX_QUEUE_LENGTH {
                    qsink.set_max_length(self.config.output_length - MAX_QUEUE_LENGTH)?;
                }
                out_qsrc = Some(qsrc);
                out_qsink = Some(qsink);
            }

            let ops = WorkerOps {
                bin: BinOps::new(),
                first_remote: Mutex::new(None),
            };

            let input_remote = sides.input().then(|| remote.clone());
            let last_xfer = self
                .xfer
                .alloc_xfer(inner_probe("last_xfer"), last_remote)?;
            last_xfer.attach_upump_mgr()?;
            if let Some(qsink) = &out_qsink {
                last_xfer.set_output(qsink)?;
            }
            let first_xfer = if single {
                drop(remote);
                last_xfer.clone()
            } else {
                let first = self.xfer.alloc_xfer(inner_probe("first_xfer"), remote)?;
                first.attach_upump_mgr()?;
                first
            };
            ops.bin.keep(last_xfer);
            *ops.first_remote
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(first_xfer);

            let mut in_qsink = None;
            if let Some(input_remote) = input_remote {
                let config = self.queue_config("in", self.config.input_length);
                let qsrc = QueueSourceManager::new(config).alloc(
                    remote_probe
                        .clone()
                        .push(IgnoreSourceEnd)
                        .push(PrefixProbe::new("in_qsrc")),
                )?;
                let qsink = self.qsink.alloc_sink(inner_probe("in_qsink"), &qsrc)?;
                if self.config.input_length > MAX_QUEUE_LENGTH {
                    qsink.set_max_length(self.config.input_length - MAX_QUEUE_LENGTH)?;
                }
                let in_xfer = self.xfer.alloc_xfer(inner_probe("in_qsrc_xfer"), qsrc)?;
                in_xfer.set_output(&input_remote)?;
                in_xfer.attach_upump_mgr()?;
                ops.bin.keep(in_xfer);
                in_qsink = Some(qsink);
            }
            drop(out_qsink);

            let (first, last) = match (in_qsink, out_qsrc) {
                (Some(input), Some(output)) => (input, output),
                (Some(input), None) => (input.clone(), input),
                (None, Some(output)) => (output.clone(), output),
                (None, None) => return Err(Error::invalid("worker bridges neither side")),
            };
            last.attach_upump_mgr()?;
            ops.bin.helper().set_inner(first, last)?;
            core.debug(format!("worker built ({sides:?})"));
            Ok(ops)
        })?;
        pipe.throw_ready();
        Ok(pipe)
    }
}

/// Follow the outputs of `remote` to the end of the chain.
fn find_last_remote(remote: &Pipe) -> Result<Pipe> {
    let mut last = remote.clone();
    for _ in 0..MAX_REMOTE_CHAIN {
        match last.get_output() {
            Ok(Some(next)) => last = next,
            Ok(None) => return Ok(last),
            Err(err) if err.is_unhandled() => return Ok(last),
            Err(err) => return Err(err),
        }
    }
    Err(Error::invalid("remote pipes form a loop"))
}

impl PipeManager for WorkerManager {
    fn signature(&self) -> u32 {
        WORKER_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "worker"
    }

    fn alloc(&self, _probe: Probe) -> Result<Pipe> {
        Err(Error::invalid("a worker is allocated with alloc_worker"))
    }
}

struct WorkerOps {
    bin: BinOps,
    /// Proxy of the first remote pipe.
    first_remote: Mutex<Option<Pipe>>,
}

impl WorkerOps {
    fn first_remote(&self) -> Option<Pipe> {
        self.first_remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PipeOps for WorkerOps {
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, pump: Option<&Pump>) {
        self.bin.input(pipe, uref, pump);
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::AttachUpumpMgr => {
                for inner in [self.bin.helper().first(), self.bin.helper().last()]
                    .into_iter()
                    .flatten()
                {
                    inner.attach_upump_mgr()?;
                }
                match self.first_remote() {
                    Some(remote) => remote.attach_upump_mgr(),
                    None => Ok(()),
                }
            }
            Command::SetUri(_) => match self.first_remote() {
                Some(remote) => remote.control(command),
                None => Err(Error::Unhandled),
            },
            _ => self.bin.control(pipe, command),
        }
    }

    fn no_ref(&self, pipe: &PipeCore) -> Teardown {
        let remote = self
            .first_remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(remote);
        self.bin.no_ref(pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{AttributeRefManager, flow};
    use crate::pipes::{CaptureManager, IdentityManager, NullManager};
    use crate::probe::PumpManagerProbe;
    use crate::pump::{LoopConfig, PumpManager};
    use crate::queue::XferConfig;
    use std::time::Duration;

    struct Loops {
        local: PumpManager,
        remote: PumpManager,
        xfer: XferManager,
    }

    impl Loops {
        fn new() -> Self {
            let local = PumpManager::new(LoopConfig::with_name("local")).unwrap();
            let remote = PumpManager::new(LoopConfig::with_name("remote")).unwrap();
            let xfer = XferManager::new(XferConfig::default()).unwrap();
            xfer.attach(&remote).unwrap();
            Self { local, remote, xfer }
        }

        fn local_probe(&self) -> Probe {
            Probe::end().push(PumpManagerProbe::new(self.local.clone()))
        }

        fn remote_probe(&self) -> Probe {
            Probe::end().push(PumpManagerProbe::new(self.remote.clone()))
        }

        fn spin_until(&self, mut done: impl FnMut() -> bool) {
            for _ in 0..500 {
                if done() {
                    return;
                }
                self.remote.run_once(Some(Duration::from_millis(2))).unwrap();
                self.local.run_once(Some(Duration::from_millis(2))).unwrap();
            }
            assert!(done(), "condition not reached");
        }
    }

    #[test]
    fn test_alloc_is_invalid() {
        let loops = Loops::new();
        let mgr = WorkerManager::new(loops.xfer.clone(), WorkerConfig::default());
        assert!(mgr.alloc(Probe::end()).is_err());
    }

    #[test]
    fn test_refs_cross_the_remote_pipe() {
        let loops = Loops::new();
        let urefs = AttributeRefManager::new();
        let mgr = WorkerManager::new(loops.xfer.clone(), WorkerConfig::default());
        let remote = IdentityManager::new().alloc(loops.remote_probe()).unwrap();
        let worker = mgr
            .alloc_worker(loops.local_probe(), remote, loops.remote_probe())
            .unwrap();
        let (capture, handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
        worker.set_output(&capture).unwrap();

        worker.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();
        for seq in 0..10 {
            let mut uref = urefs.alloc();
            uref.set_unsigned("seq", seq);
            worker.input(uref, None);
        }
        loops.spin_until(|| handle.len() == 10);
        let seqs: Vec<_> = handle
            .refs()
            .iter()
            .map(|uref| uref.get_unsigned("seq"))
            .collect();
        assert_eq!(seqs, (0..10).map(Some).collect::<Vec<_>>());
        assert_eq!(flow::def(&handle.flow_def().unwrap()), Some("void."));
    }

    #[test]
    fn test_sink_worker_releases_remote() {
        let loops = Loops::new();
        let urefs = AttributeRefManager::new();
        let mgr = WorkerManager::new(loops.xfer.clone(), WorkerConfig::default());
        let null = NullManager::new();
        let remote = null.alloc(loops.remote_probe()).unwrap();
        let remote_weak = remote.weak();
        let worker = mgr
            .alloc_sink(loops.local_probe(), remote, loops.remote_probe())
            .unwrap();
        worker.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();
        worker.input(urefs.alloc(), None);
        worker.input(urefs.alloc(), None);
        loops.spin_until(|| null.count() == 2);

        drop(worker);
        loops.spin_until(|| remote_weak.upgrade_handle().is_none());
    }
}
