//! Two-phase reference counting.
//!
//! Long-lived objects (pipes, in-flight requests) have two lifetimes:
//!
//! - **Usage**: external holders. When the last usage handle goes away the
//!   object is *logically dead*: [`Lifecycle::no_ref`] runs, releasing inner
//!   sub-objects, and no further calls are accepted.
//! - **Real**: the memory itself, kept alive by internal sub-objects (inner
//!   pipes' probes, pending requests, queued messages). This is a plain
//!   [`Arc`]; dropping the last one frees the object.
//!
//! A [`Handle`] is a counted usage reference on top of an `Arc`. Internal
//! holders keep the `Arc` (or a [`Weak`](std::sync::Weak)) and must check
//! [`RefCount::is_dead`] before acting on the object; [`Handle::upgrade`]
//! refuses to resurrect a dead object.
//!
//! # Example
//!
//! ```rust
//! use sluice::refcount::{Handle, Lifecycle, RefCount};
//! use std::sync::Arc;
//!
//! struct Stage {
//!     refcount: RefCount,
//! }
//!
//! impl Lifecycle for Stage {
//!     fn refcount(&self) -> &RefCount {
//!         &self.refcount
//!     }
//!     fn no_ref(self: Arc<Self>) {
//!         // release inner objects here
//!     }
//! }
//!
//! let stage = Handle::new(Arc::new(Stage { refcount: RefCount::new() }));
//! let real = Arc::clone(stage.real());
//! drop(stage);
//! assert!(real.refcount().is_dead());
//! assert!(Handle::upgrade(&real).is_none());
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic usage counter. Starts at one.
pub struct RefCount {
    usage: AtomicUsize,
}

impl RefCount {
    /// Create a counter holding one reference.
    pub const fn new() -> Self {
        Self {
            usage: AtomicUsize::new(1),
        }
    }

    /// Increment the usage count.
    pub fn use_ref(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the usage count unless it already reached zero.
    pub fn try_use(&self) -> bool {
        let mut current = self.usage.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.usage.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement the usage count. Returns `true` when it reached zero.
    pub fn release(&self) -> bool {
        self.usage.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether the usage count reached zero.
    pub fn is_dead(&self) -> bool {
        self.usage.load(Ordering::Acquire) == 0
    }

    /// Current usage count.
    pub fn count(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.count()).finish()
    }
}

/// An object with a usage count and a `no_ref` hook.
pub trait Lifecycle: Send + Sync + 'static {
    /// The usage counter.
    fn refcount(&self) -> &RefCount;

    /// Called once, when the usage count reaches zero.
    ///
    /// The object is still allocated; it is freed when the last `Arc`
    /// (including `self`) is dropped.
    fn no_ref(self: Arc<Self>);
}

/// A counted usage reference.
pub struct Handle<T: Lifecycle + ?Sized> {
    inner: Arc<T>,
}

impl<T: Lifecycle + ?Sized> Handle<T> {
    /// Wrap a freshly created object, taking over its initial usage count.
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    /// Take a new usage reference from a real one.
    ///
    /// Returns `None` once the object is logically dead.
    pub fn upgrade(real: &Arc<T>) -> Option<Self> {
        real.refcount().try_use().then(|| Self {
            inner: Arc::clone(real),
        })
    }

    /// The real (allocation) reference.
    pub fn real(&self) -> &Arc<T> {
        &self.inner
    }

    /// Whether two handles point at the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T: Lifecycle + ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.inner.refcount().use_ref();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Lifecycle + ?Sized> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.inner.refcount().release() {
            Arc::clone(&self.inner).no_ref();
        }
    }
}

impl<T: Lifecycle + ?Sized> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}
