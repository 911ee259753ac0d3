//! Raw memory management for Sluice.
//!
//! Buffers draw their storage from a [`MemoryPool`]. The pool keeps freed
//! regions in power-of-two buckets so that steady-state streaming does not
//! hit the allocator.
//!
//! # Architecture
//!
//! - [`MemoryPool`]: Bucketed pool, cloneable and shareable across threads
//! - [`Memory`]: RAII region that returns to its bucket on drop
//! - [`PoolConfig`]: Bucket sizes and recycle depth
//!
//! # Example
//!
//! ```rust
//! use sluice::memory::{MemoryPool, PoolConfig};
//!
//! let pool = MemoryPool::new(PoolConfig::with_depth(8));
//! let mut mem = pool.alloc(1316)?;
//! mem[..4].copy_from_slice(b"sync");
//! # Ok::<(), sluice::Error>(())
//! ```

mod pool;

pub use pool::{Memory, MemoryPool, PoolConfig, PoolStats};
