//! # Sluice
//!
//! A modular media pipe runtime.
//!
//! Processing units ("pipes") are small state machines chained into
//! pipelines. Data travels between them as attribute refs: a dictionary of
//! typed attributes, optionally carrying a buffer. Pipes report everything
//! upward through probe chains, negotiate resources (buffer managers,
//! clocks, latency) with requests, and run on single-threaded event loops.
//! Queue bridges move refs between loops, which is how parts of a pipeline
//! end up on worker threads.
//!
//! ## Layers
//!
//! - [`memory`]: size-bucketed memory pools.
//! - [`buffer`]: block, picture and sound buffers with copy-on-write.
//! - [`attr`]: attribute refs and flow definitions.
//! - [`refcount`]: the two-level (usage and allocation) lifetime of pipes.
//! - [`probe`]: event chains.
//! - [`pipe`]: the pipe and manager contracts, helpers and bins.
//! - [`request`]: resource negotiation.
//! - [`pump`]: the poll(2) event loop.
//! - [`queue`]: cross-loop queues, xfer proxies and worker bins.
//! - [`pipes`]: generic utility pipes.
//!
//! ## Quick Start
//!
//! ```rust
//! use sluice::prelude::*;
//! use sluice::attr::flow;
//! use sluice::pipes::{CaptureManager, IdentityManager};
//!
//! let urefs = AttributeRefManager::new();
//! let identity = IdentityManager::new().alloc(Probe::end())?;
//! let (sink, captured) = CaptureManager::new().alloc_capture(Probe::end())?;
//! identity.set_output(&sink)?;
//! identity.set_flow_def(&flow::alloc_def(&urefs, "void."))?;
//! identity.input(urefs.alloc(), None);
//! assert_eq!(captured.len(), 1);
//! # Ok::<(), sluice::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod attr;
pub mod buffer;
pub mod clock;
pub mod error;
pub mod memory;
pub mod observability;
pub mod pipe;
pub mod pipes;
pub mod probe;
pub mod pump;
pub mod queue;
pub mod refcount;
pub mod request;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::attr::{AttributeRef, AttributeRefManager};
    pub use crate::buffer::{Buffer, BufferManager};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::memory::{MemoryPool, PoolConfig};
    pub use crate::pipe::{Command, Pipe, PipeCore, PipeManager, PipeOps, Teardown};
    pub use crate::probe::{Event, Probe, ProbeHandler};
    pub use crate::pump::{LoopConfig, Pump, PumpManager};
    pub use crate::request::{Provision, Request};
}

pub use error::{Error, Result};
