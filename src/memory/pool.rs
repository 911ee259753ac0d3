//! Bucketed memory pool with recycle-on-drop semantics.

use crate::error::{Error, Result};
use crate::observability;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a [`MemoryPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of the smallest bucket in bytes. Rounded up to a power of 2.
    pub min_size: usize,

    /// Number of buckets. Bucket `i` holds regions of `min_size << i` bytes.
    pub buckets: usize,

    /// Maximum number of free regions kept per bucket.
    ///
    /// Regions released beyond this depth go back to the allocator.
    pub depth: usize,

    /// Name for debugging/metrics purposes.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 64,
            buckets: 16,
            depth: 32,
            name: String::from("umem"),
        }
    }
}

impl PoolConfig {
    /// Create a config with the given per-bucket depth.
    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth,
            ..Default::default()
        }
    }

    /// Set the smallest bucket size.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Set the number of buckets.
    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    /// Set the pool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// ============================================================================
// Pool
// ============================================================================

struct Bucket {
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

struct PoolInner {
    config: PoolConfig,
    buckets: Box<[Bucket]>,
    hits: AtomicU64,
    misses: AtomicU64,
    direct: AtomicU64,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations served from a recycled region.
    pub hits: u64,
    /// Allocations that had to go to the allocator for a bucket region.
    pub misses: u64,
    /// Allocations larger than the biggest bucket.
    pub direct: u64,
    /// Regions currently held for reuse.
    pub recycled: usize,
}

/// A pool of raw memory regions.
///
/// Regions are grouped in power-of-two buckets. A freed [`Memory`] goes back
/// to its bucket until the bucket holds `depth` regions, after which it is
/// released to the allocator. An empty bucket, or a request above the largest
/// bucket, falls back to direct allocation: pool exhaustion is never an error.
///
/// The pool is cheap to clone and may be shared between threads.
///
/// # Example
///
/// ```rust
/// use sluice::memory::{MemoryPool, PoolConfig};
///
/// let pool = MemoryPool::new(PoolConfig::default());
/// let mut mem = pool.alloc(100).unwrap();
/// mem[..5].copy_from_slice(b"hello");
/// assert_eq!(mem.len(), 100);
/// drop(mem); // back to the 128-byte bucket
/// assert_eq!(pool.stats().recycled, 1);
/// ```
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Create a new pool.
    pub fn new(config: PoolConfig) -> Self {
        let min = config.min_size.max(1).next_power_of_two();
        let buckets = (0..config.buckets)
            .map(|i| Bucket {
                size: min << i,
                free: Mutex::new(Vec::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(PoolInner {
                config,
                buckets,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                direct: AtomicU64::new(0),
            }),
        }
    }

    /// A pool that never recycles: every allocation goes to the allocator.
    pub fn unpooled() -> Self {
        Self::new(PoolConfig {
            buckets: 0,
            depth: 0,
            name: String::from("umem-alloc"),
            ..Default::default()
        })
    }

    /// Allocate `size` bytes.
    ///
    /// The returned region has length `size` and is not zeroed when recycled.
    pub fn alloc(&self, size: usize) -> Result<Memory> {
        let Some(index) = self.bucket_index(size) else {
            self.inner.direct.fetch_add(1, Ordering::Relaxed);
            let data = allocate(size)?;
            return Ok(Memory {
                data,
                len: size,
                home: None,
            });
        };

        let bucket = &self.inner.buckets[index];
        let recycled = bucket
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let data = match recycled {
            Some(data) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                observability::record_pool_hit(&self.inner.config.name);
                data
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                observability::record_pool_miss(&self.inner.config.name);
                allocate(bucket.size)?
            }
        };

        Ok(Memory {
            data,
            len: size,
            home: Some((Arc::clone(&self.inner), index)),
        })
    }

    /// Release all recycled regions to the allocator.
    pub fn vacuum(&self) {
        let mut freed = 0usize;
        for bucket in self.inner.buckets.iter() {
            let mut free = bucket.free.lock().unwrap_or_else(PoisonError::into_inner);
            freed += free.len();
            free.clear();
        }
        tracing::debug!(pool = %self.inner.config.name, freed, "vacuumed memory pool");
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            direct: self.inner.direct.load(Ordering::Relaxed),
            recycled: self
                .inner
                .buckets
                .iter()
                .map(|b| b.free.lock().unwrap_or_else(PoisonError::into_inner).len())
                .sum(),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn bucket_index(&self, size: usize) -> Option<usize> {
        self.inner.buckets.iter().position(|b| b.size >= size)
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.inner.config.name)
            .field("buckets", &self.inner.buckets.len())
            .field("depth", &self.inner.config.depth)
            .finish()
    }
}

fn allocate(size: usize) -> Result<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|e| Error::Alloc(format!("{size} bytes: {e}")))?;
    data.resize(size, 0);
    Ok(data.into_boxed_slice())
}

// ============================================================================
// Memory region
// ============================================================================

/// A memory region loaned from a [`MemoryPool`].
///
/// Dereferences to `len()` bytes. The region goes back to its pool bucket
/// when dropped.
pub struct Memory {
    data: Box<[u8]>,
    len: usize,
    home: Option<(Arc<PoolInner>, usize)>,
}

impl Memory {
    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying allocation (the bucket size).
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Memory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for Memory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let Some((pool, index)) = self.home.take() else {
            return;
        };
        let bucket = &pool.buckets[index];
        let mut free = bucket.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < pool.config.depth {
            free.push(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pool_bucket_rounding() {
        let pool = MemoryPool::new(PoolConfig::default());
        let mem = pool.alloc(100).unwrap();
        assert_eq!(mem.len(), 100);
        assert_eq!(mem.capacity(), 128);

        let small = pool.alloc(1).unwrap();
        assert_eq!(small.capacity(), 64);
    }

    #[test]
    fn test_pool_recycles() {
        let pool = MemoryPool::new(PoolConfig::default());
        drop(pool.alloc(1000).unwrap());
        assert_eq!(pool.stats().recycled, 1);

        let _mem = pool.alloc(900).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recycled, 0);
    }

    #[test]
    fn test_pool_depth_limit() {
        let pool = MemoryPool::new(PoolConfig::with_depth(2));
        let regions: Vec<_> = (0..5).map(|_| pool.alloc(64).unwrap()).collect();
        drop(regions);
        assert_eq!(pool.stats().recycled, 2);
    }

    #[test]
    fn test_pool_oversized_falls_back() {
        let pool = MemoryPool::new(PoolConfig::default().with_buckets(2));
        let mem = pool.alloc(4096).unwrap();
        assert_eq!(mem.len(), 4096);
        drop(mem);
        let stats = pool.stats();
        assert_eq!(stats.direct, 1);
        assert_eq!(stats.recycled, 0);
    }

    #[test]
    fn test_unpooled() {
        let pool = MemoryPool::unpooled();
        drop(pool.alloc(10).unwrap());
        assert_eq!(pool.stats().recycled, 0);
        assert_eq!(pool.stats().direct, 1);
    }

    #[test]
    fn test_vacuum() {
        let pool = MemoryPool::default();
        drop(pool.alloc(10).unwrap());
        drop(pool.alloc(10_000).unwrap());
        assert_eq!(pool.stats().recycled, 2);
        pool.vacuum();
        assert_eq!(pool.stats().recycled, 0);
    }

    #[test]
    fn test_pool_concurrent_access() {
        let pool = MemoryPool::new(PoolConfig::with_depth(64));
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut mem = pool.alloc(256).unwrap();
                        mem.fill(i);
                        assert!(mem.iter().all(|&b| b == i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 400);
        assert!(stats.recycled <= 64);
    }
}
