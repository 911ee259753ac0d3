//! Identity pipe: forwards refs unchanged.
//!
//! An optional callback sees every ref on its way through, which makes the
//! identity pipe a convenient inspection point.

use crate::attr::AttributeRef;
use crate::error::Result;
use crate::pipe::{Command, OutputHelper, Pipe, PipeCore, PipeManager, PipeOps, Teardown, fourcc};
use crate::probe::Probe;
use crate::pump::Pump;
use std::sync::Arc;

/// Signature of identity pipes.
pub const IDENTITY_SIGNATURE: u32 = fourcc(b"idty");

type RefCallback = dyn Fn(&AttributeRef) + Send + Sync;

/// Allocates identity pipes.
///
/// ```rust
/// use sluice::pipe::PipeManager;
/// use sluice::pipes::IdentityManager;
/// use sluice::probe::Probe;
///
/// let mgr = IdentityManager::new().on_ref(|uref| {
///     tracing::trace!(seq = ?uref.get_unsigned("seq"), "ref seen");
/// });
/// let identity = mgr.alloc(Probe::end()).unwrap();
/// assert!(identity.get_output().unwrap().is_none());
/// ```
#[derive(Clone, Default)]
pub struct IdentityManager {
    callback: Option<Arc<RefCallback>>,
}

impl IdentityManager {
    /// Pipes without callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` for every ref passing through pipes allocated
    /// afterwards.
    pub fn on_ref<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AttributeRef) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl PipeManager for IdentityManager {
    fn signature(&self) -> u32 {
        IDENTITY_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "identity"
    }

    fn alloc(&self, probe: Probe) -> Result<Pipe> {
        let pipe = PipeCore::create(self, probe, |_| {
            Ok(IdentityOps {
                output: OutputHelper::new(),
                callback: self.callback.clone(),
            })
        })?;
        pipe.throw_ready();
        Ok(pipe)
    }
}

struct IdentityOps {
    output: OutputHelper,
    callback: Option<Arc<RefCallback>>,
}

impl PipeOps for IdentityOps {
    fn input(&self, pipe: &PipeCore, uref: AttributeRef, pump: Option<&Pump>) {
        if let Some(callback) = &self.callback {
            callback(&uref);
        }
        self.output.output(pipe, uref, pump);
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.output.store_flow_def(pipe, flow_def.duplicate());
                Ok(())
            }
            _ => self.output.control(pipe, command),
        }
    }

    fn no_ref(&self, _pipe: &PipeCore) -> Teardown {
        self.output.clean();
        Teardown::Done
    }
}
