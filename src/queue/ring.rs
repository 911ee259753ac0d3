//! Bounded queue with pollable wake-ups, over a lock-free single-producer
//! single-consumer ring.
//!
//! The ring itself takes no lock: the producer publishes `head`, the
//! consumer publishes `tail`. [`Queue`] puts a mutex in front of each end,
//! uncontended when one thread pushes and one pops, so that extra producers
//! or consumers queue up behind it instead of breaking the ring.
//!
//! The queue owns two [`EventFd`]s. `data` is readable while items may be
//! waiting; `space` becomes readable after a producer found the queue full
//! and the consumer has since made room. Both are meant to be watched with
//! [`PumpManager::fd_read`](crate::pump::PumpManager::fd_read), so each side
//! is woken on its own event loop.
//!
//! Wake-ups can be spurious: a watcher woken on `data` may find nothing to
//! pop. They are never lost.

use super::EventFd;
use crate::error::{Error, Result};
use crate::observability;
use crate::pump::{PollSource, Pump, PumpManager};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Mutex, PoisonError};

/// Largest number of items a queue can hold.
pub const MAX_QUEUE_LENGTH: usize = 255;

// ============================================================================
// Ring buffer
// ============================================================================

struct Slot<T> {
    item: UnsafeCell<Option<T>>,
}

// SAFETY: a slot is written only by the producer before `head` is published
// and read only by the consumer before `tail` is published.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

const CACHE_LINE: usize = 64;

#[repr(C)]
struct PaddedAtomicUsize {
    value: AtomicUsize,
    _padding: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
}

impl PaddedAtomicUsize {
    fn new(val: usize) -> Self {
        Self {
            value: AtomicUsize::new(val),
            _padding: [0; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
        }
    }

    fn load(&self, order: Ordering) -> usize {
        self.value.load(order)
    }

    fn store(&self, val: usize, order: Ordering) {
        self.value.store(val, order)
    }
}

/// Lock-free SPSC ring. Slots are rounded up to a power of two, the usable
/// length is exactly `limit`.
struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    limit: usize,
    head: PaddedAtomicUsize,
    tail: PaddedAtomicUsize,
}

impl<T> RingBuffer<T> {
    fn new(limit: usize) -> Self {
        let capacity = limit.next_power_of_two();
        let slots: Vec<Slot<T>> = (0..capacity)
            .map(|_| Slot {
                item: UnsafeCell::new(None),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            limit,
            head: PaddedAtomicUsize::new(0),
            tail: PaddedAtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Producer side. Caller guarantees a single producer at a time.
    fn try_push(&self, item: T) -> std::result::Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.limit {
            return Err(item);
        }
        // SAFETY: single producer, and the slot was emptied by the consumer
        // before it published `tail`.
        unsafe {
            *self.slots[head & self.mask].item.get() = Some(item);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side. Caller guarantees a single consumer at a time.
    fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: single consumer, and the producer filled the slot before
        // it published `head`.
        let item = unsafe { (*self.slots[tail & self.mask].item.get()).take() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        item
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Bounded queue between two event loops.
///
/// Any thread may push or pop. Pushes take `push_lock` and pops take
/// `pop_lock`, so the lock-free ring underneath always sees one producer
/// and one consumer. A push never waits on a pop, nor a pop on a push.
pub struct Queue<T> {
    ring: RingBuffer<T>,
    data: Arc<EventFd>,
    space: Arc<EventFd>,
    producer_waiting: AtomicBool,
    push_lock: Mutex<()>,
    pop_lock: Mutex<()>,
    name: String,
}

impl<T: Send> Queue<T> {
    /// A queue holding at most `length` items, `1..=255`.
    pub fn new(length: usize, name: impl Into<String>) -> Result<Self> {
        if length == 0 || length > MAX_QUEUE_LENGTH {
            return Err(Error::invalid(format!(
                "queue length {length} out of range 1..={MAX_QUEUE_LENGTH}"
            )));
        }
        Ok(Self {
            ring: RingBuffer::new(length),
            data: Arc::new(EventFd::new()?),
            space: Arc::new(EventFd::new()?),
            producer_waiting: AtomicBool::new(false),
            push_lock: Mutex::new(()),
            pop_lock: Mutex::new(()),
            name: name.into(),
        })
    }

    /// Maximum number of items.
    pub fn length(&self) -> usize {
        self.ring.limit
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue name, for logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `item`, or give it back if the queue is full.
    ///
    /// After a failed push, [`Queue::push_fd`] becomes readable once the
    /// consumer has popped something.
    pub fn try_push(&self, item: T) -> std::result::Result<(), T> {
        let _guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let item = match self.ring.try_push(item) {
            Ok(()) => return self.pushed(),
            Err(item) => item,
        };

        // Clear a stale wake-up first, then announce ourselves and retry: the
        // consumer either sees the flag or we see its pop.
        let _ = self.space.try_wait();
        self.producer_waiting.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        match self.ring.try_push(item) {
            Ok(()) => self.pushed(),
            Err(item) => {
                observability::record_queue_blocked(&self.name);
                Err(item)
            }
        }
    }

    fn pushed(&self) -> std::result::Result<(), T> {
        observability::record_queue_depth(&self.name, self.ring.len());
        if let Err(err) = self.data.notify() {
            tracing::error!(queue = %self.name, "cannot signal queue: {err}");
        }
        Ok(())
    }

    /// Take the oldest item.
    pub fn try_pop(&self) -> Option<T> {
        let _guard = self.pop_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let item = match self.ring.try_pop() {
            Some(item) => Some(item),
            None => {
                // Re-arm only when really empty: an item pushed between the
                // two pops keeps the data fd signalled.
                let _ = self.data.try_wait();
                let item = self.ring.try_pop();
                if item.is_some() && self.ring.len() > 0 {
                    let _ = self.data.notify();
                }
                item
            }
        };
        if item.is_some() {
            fence(Ordering::SeqCst);
            if self.producer_waiting.swap(false, Ordering::SeqCst) {
                if let Err(err) = self.space.notify() {
                    tracing::error!(queue = %self.name, "cannot signal queue space: {err}");
                }
            }
        }
        item
    }

    /// Readable while items may be waiting. Watch it on the consumer loop.
    pub fn pop_fd(&self) -> PollSource {
        Arc::clone(&self.data) as PollSource
    }

    /// Readable once room was made after a failed push. Watch it on the
    /// producer loop.
    pub fn push_fd(&self) -> PollSource {
        Arc::clone(&self.space) as PollSource
    }

    /// Stopped watcher on `mgr` fired while items may be popped.
    pub fn watch_pop<F>(&self, mgr: &PumpManager, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        mgr.fd_read(self.pop_fd(), callback)
    }

    /// Stopped watcher on `mgr` fired when room was made after a failed
    /// push.
    pub fn watch_push<F>(&self, mgr: &PumpManager, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        mgr.fd_read(self.push_fd(), callback)
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("length", &self.ring.limit)
            .field("len", &self.ring.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_bounds() {
        assert!(Queue::<u32>::new(0, "q").is_err());
        assert!(Queue::<u32>::new(256, "q").is_err());
        assert_eq!(Queue::<u32>::new(255, "q").unwrap().length(), 255);
    }

    #[test]
    fn test_fifo_and_full() {
        let queue = Queue::new(3, "q").unwrap();
        for i in 0..3 {
            queue.try_push(i).unwrap();
        }
        assert_eq!(queue.try_push(3), Err(3));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(0));
        queue.try_push(3).unwrap();
        let rest: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(rest, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_data_fd_cleared_when_drained() {
        let queue = Queue::new(4, "q").unwrap();
        queue.try_push(1).unwrap();
        assert_eq!(queue.try_pop(), Some(1));
        // spurious wake-up: nothing left, the fd gets cleared
        assert_eq!(queue.try_pop(), None);
        assert!(!queue.data.try_wait().unwrap());
        queue.try_push(2).unwrap();
        assert!(queue.data.try_wait().unwrap());
        // cleared by hand above, the pop still finds the item
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn test_space_signalled_after_failed_push() {
        let queue = Queue::new(1, "q").unwrap();
        queue.try_push(1).unwrap();
        assert!(queue.try_push(2).is_err());
        assert!(!queue.space.try_wait().unwrap());
        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.space.try_wait().unwrap());
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_pop(), Some(2));
        assert!(!queue.space.try_wait().unwrap());
    }

    #[test]
    fn test_cross_thread_order() {
        let queue = Arc::new(Queue::new(8, "q").unwrap());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            for mut i in 0..1000u32 {
                loop {
                    match producer.try_push(i) {
                        Ok(()) => break,
                        Err(back) => {
                            i = back;
                            std::thread::yield_now();
                        }
                    }
                }
            }
        });
        let mut expected = 0;
        while expected < 1000 {
            match queue.try_pop() {
                Some(i) => {
                    assert_eq!(i, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_two_producers_lose_nothing() {
        let queue = Arc::new(Queue::new(4, "q").unwrap());
        let producers: Vec<_> = (0..2u32)
            .map(|id| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for seq in 0..500u32 {
                        let mut item = (id, seq);
                        while let Err(back) = queue.try_push(item) {
                            item = back;
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut next = [0u32; 2];
        while next.iter().sum::<u32>() < 1000 {
            match queue.try_pop() {
                Some((id, seq)) => {
                    // each producer's items stay in order
                    assert_eq!(seq, next[id as usize]);
                    next[id as usize] += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_releases_items() {
        let item = Arc::new(());
        let queue = Queue::new(2, "q").unwrap();
        queue.try_push(Arc::clone(&item)).unwrap();
        assert_eq!(Arc::strong_count(&item), 2);
        drop(queue);
        assert_eq!(Arc::strong_count(&item), 1);
    }
}
