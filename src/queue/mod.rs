//! Cross-thread queue bridge.
//!
//! A queue sink (writer side) and a queue source (reader side) share one
//! bounded data [`Queue`] plus two unbounded [`ControlQueue`]s:
//!
//! - downstream, sink to source: request registration, end of stream and
//!   teardown of the source;
//! - upstream, source to sink: answers to requests registered through the
//!   sink, so that request callbacks run on the thread that made them.
//!
//! The sink lives on the upstream event loop and the source on the
//! downstream one. [`XferManager`] moves an already-allocated pipe onto
//! another loop, and [`WorkerManager`] combines both to run a pipe (or a
//! linear sub-pipeline) on a worker thread behind a local handle.

mod control;
mod eventfd;
mod ring;
mod sink;
mod source;
mod worker;
mod xfer;

pub use control::ControlQueue;
pub use eventfd::EventFd;
pub use ring::{MAX_QUEUE_LENGTH, Queue};
pub use sink::{QSINK_SIGNATURE, QueueSinkManager};
pub use source::{QSRC_SIGNATURE, QueueSourceManager, source_length};
pub use worker::{WORKER_SIGNATURE, WorkerConfig, WorkerManager};
pub use xfer::{XFER_SIGNATURE, XferConfig, XferManager, xfer_remote};

use crate::attr::AttributeRef;
use crate::error::Result;
use crate::request::{Provision, Request};
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of a queue source.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Data ring length, `1..=255`.
    pub length: usize,
    /// Name used in metrics and logs.
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            length: 16,
            name: String::from("queue"),
        }
    }
}

impl QueueConfig {
    /// A queue of `length` refs.
    pub fn with_length(length: usize) -> Self {
        Self {
            length,
            ..Default::default()
        }
    }

    /// Set the queue name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// What travels on the data ring.
#[derive(Debug)]
pub(crate) enum QueueItem {
    FlowDef(AttributeRef),
    Data(AttributeRef),
}

/// Sink to source messages.
pub(crate) enum Downstream {
    /// Register a proxy request with the source output.
    Register(Request),
    Unregister(Request),
    /// The sink is gone; drain and throw `SourceEnd`.
    SourceEnd,
    /// The source lost its last user; drain and die.
    RefEnd,
}

/// Source to sink message: a request registered through the sink was
/// answered downstream.
pub(crate) struct Provided {
    pub upstream: Request,
    pub provision: Provision,
}

/// The rings shared by a sink and its source.
#[derive(Debug)]
pub(crate) struct QueueShared {
    pub data: Queue<QueueItem>,
    pub downstream: ControlQueue<Downstream>,
    pub upstream: Arc<ControlQueue<Provided>>,
}

impl QueueShared {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        Ok(Self {
            data: Queue::new(config.length, config.name.clone())?,
            downstream: ControlQueue::new(format!("{}.downstream", config.name))?,
            upstream: Arc::new(ControlQueue::new(format!("{}.upstream", config.name))?),
        })
    }
}
