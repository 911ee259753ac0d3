//! Bins: pipes built from inner pipes.
//!
//! A bin looks like a single pipe from outside. Input goes to its first
//! inner pipe; its output is the output of the last inner pipe. Events of
//! inner pipes are re-thrown on the bin through [`ProxyProbe`]s, and
//! commands the bin does not handle itself are forwarded to the first
//! inner pipe.
//!
//! ```rust,ignore
//! let mgr = LinearBinManager::new()
//!     .stage("tag", Arc::new(SetAttrManager::new(template)))
//!     .stage("identity", Arc::new(IdentityManager::new()));
//! let bin = mgr.alloc(probe)?;
//! bin.set_output(&sink)?;
//! ```
//!
//! [`ProxyProbe`]: crate::probe::ProxyProbe

use super::{Command, Pipe, PipeCore, PipeManager, PipeOps, Teardown, fourcc};
use crate::attr::AttributeRef;
use crate::error::{Error, Result};
use crate::observability;
use crate::probe::{PrefixProbe, Probe, ProxyProbe};
use crate::pump::Pump;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct BinState {
    first: Option<Pipe>,
    last: Option<Pipe>,
    output: Option<Pipe>,
    frozen: bool,
}

/// First and last inner pipes of a bin, and the bin's output.
#[derive(Debug, Default)]
pub struct BinHelper {
    state: Mutex<BinState>,
}

impl BinHelper {
    /// No inner pipes yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the inner pipes. The bin output, if set, moves to `last`.
    pub fn set_inner(&self, first: Pipe, last: Pipe) -> Result<()> {
        let (output, old) = {
            let mut state = self.lock();
            let old = (state.first.replace(first), state.last.replace(last.clone()));
            (state.output.clone(), old)
        };
        drop(old);
        match output {
            Some(output) => last.set_output(&output),
            None => Ok(()),
        }
    }

    /// First inner pipe.
    pub fn first(&self) -> Option<Pipe> {
        self.lock().first.clone()
    }

    /// Last inner pipe.
    pub fn last(&self) -> Option<Pipe> {
        self.lock().last.clone()
    }

    /// Send `uref` to the first inner pipe.
    pub fn input(&self, pipe: &PipeCore, uref: AttributeRef, pump: Option<&Pump>) {
        match self.first() {
            Some(first) => first.input(uref, pump),
            None => {
                pipe.warn("bin has no inner pipe, dropping ref");
                observability::record_ref_dropped(pipe.manager_name(), "no_inner");
            }
        }
    }

    /// Handle bin commands and forward the rest.
    ///
    /// `SetOutput`, `GetOutput` and `GetFlowDef` concern the last inner
    /// pipe; everything else goes to the first one. While frozen, forwarded
    /// commands fail with [`Error::Busy`].
    pub fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::BinFreeze => {
                self.lock().frozen = true;
                Ok(())
            }
            Command::BinThaw => {
                self.lock().frozen = false;
                Ok(())
            }
            Command::BinGetFirstInner(slot) => {
                *slot = self.first();
                Ok(())
            }
            Command::BinGetLastInner(slot) => {
                *slot = self.last();
                Ok(())
            }
            Command::GetOutput(slot) => {
                *slot = self.lock().output.clone();
                Ok(())
            }
            Command::SetOutput(output) => {
                let output = output.take();
                let (last, old) = {
                    let mut state = self.lock();
                    let old = std::mem::replace(&mut state.output, output.clone());
                    (state.last.clone(), old)
                };
                drop(old);
                match last {
                    Some(last) => last.control(&mut Command::SetOutput(output)),
                    None => Ok(()),
                }
            }
            Command::GetFlowDef(_) => self.forward(pipe, Target::Last, command),
            _ => self.forward(pipe, Target::First, command),
        }
    }

    fn forward(&self, pipe: &PipeCore, target: Target, command: &mut Command) -> Result<()> {
        let inner = {
            let state = self.lock();
            if state.frozen {
                return Err(Error::busy(format!(
                    "bin frozen, cannot forward {}",
                    command.name()
                )));
            }
            match target {
                Target::First => state.first.clone(),
                Target::Last => state.last.clone(),
            }
        };
        match inner {
            Some(inner) => inner.control(command),
            None => {
                tracing::trace!(pipe = pipe.id(), command = command.name(), "bin has no inner pipe");
                Err(Error::Unhandled)
            }
        }
    }

    /// Release the inner pipes and the output.
    pub fn clean(&self) {
        let state = std::mem::take(&mut *self.lock());
        drop(state);
    }
}

#[derive(Clone, Copy)]
enum Target {
    First,
    Last,
}

/// Operations of a plain bin: everything goes through a [`BinHelper`].
///
/// Other objects the bin must keep alive (side pipes, helper pipes on other
/// threads) can be attached with [`BinOps::keep`]; they are released with
/// the inner pipes.
#[derive(Debug, Default)]
pub struct BinOps {
    helper: BinHelper,
    kept: Mutex<Vec<Pipe>>,
}

impl BinOps {
    /// A bin without inner pipes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The embedded helper.
    pub fn helper(&self) -> &BinHelper {
        &self.helper
    }

    /// Keep `pipe` alive as long as the bin is in use.
    pub fn keep(&self, pipe: Pipe) {
        self.kept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pipe);
    }
}

impl PipeOps for BinOps {
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, pump: Option<&Pump>) {
        self.helper.input(pipe, uref, pump);
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        self.helper.control(pipe, command)
    }

    fn no_ref(&self, _pipe: &PipeCore) -> Teardown {
        self.helper.clean();
        let kept = std::mem::take(&mut *self.kept.lock().unwrap_or_else(PoisonError::into_inner));
        drop(kept);
        Teardown::Done
    }
}

/// Signature of linear bins.
pub const LINEAR_BIN_SIGNATURE: u32 = fourcc(b"lbin");

/// Allocates bins made of a chain of inner pipes.
pub struct LinearBinManager {
    stages: Vec<(String, Arc<dyn PipeManager>)>,
}

impl Default for LinearBinManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearBinManager {
    /// A manager with no stage.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage, named `name` in log prefixes.
    pub fn stage(mut self, name: impl Into<String>, mgr: Arc<dyn PipeManager>) -> Self {
        self.stages.push((name.into(), mgr));
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage was added.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl PipeManager for LinearBinManager {
    fn signature(&self) -> u32 {
        LINEAR_BIN_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "linear_bin"
    }

    fn alloc(&self, probe: Probe) -> Result<Pipe> {
        if self.stages.is_empty() {
            return Err(Error::invalid("linear bin needs at least one stage"));
        }
        let pipe = PipeCore::create(self, probe, |core| {
            let ops = BinOps::new();
            let mut inner: Vec<Pipe> = Vec::with_capacity(self.stages.len());
            for (name, mgr) in &self.stages {
                let probe = Probe::end()
                    .push(ProxyProbe::new(core.weak()))
                    .push(PrefixProbe::new(name.clone()));
                let stage = mgr.alloc(probe)?;
                if let Some(previous) = inner.last() {
                    previous.set_output(&stage)?;
                }
                inner.push(stage);
            }
            let last = inner.pop().ok_or_else(|| Error::invalid("no inner pipe"))?;
            let first = inner.first().cloned().unwrap_or_else(|| last.clone());
            drop(inner);
            ops.helper().set_inner(first, last)?;
            Ok(ops)
        })?;
        pipe.throw_ready();
        Ok(pipe)
    }
}
