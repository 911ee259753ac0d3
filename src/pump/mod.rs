//! Event loops and their watchers.
//!
//! A [`PumpManager`] is a single-threaded reactor built on `poll(2)`. It
//! owns a set of watchers, each created stopped and wrapped in a [`Pump`]:
//!
//! - **idler**: runs whenever no other watcher is ready
//! - **timer**: fires after a delay, optionally repeating
//! - **fd_read / fd_write**: fires when a descriptor is readable/writable
//! - **signal**: fires when [`PumpManager::raise_signal`] delivers its number
//!
//! Callbacks receive the [`Pump`] that fired. Dropping the last handle on a
//! pump frees its watcher, even from inside its own callback.
//!
//! A [`Blocker`] taken on a pump pauses its dispatch until dropped; pipes
//! use it to apply backpressure to the watcher that produced their input.
//!
//! Watchers may be started, stopped and blocked from any thread; the loop
//! is woken up when that happens outside its own thread.
//!
//! ```rust
//! use sluice::pump::{LoopConfig, PumpManager};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let mgr = PumpManager::new(LoopConfig::default()).unwrap();
//! let count = Arc::new(AtomicUsize::new(0));
//! let seen = Arc::clone(&count);
//! let idler = mgr.idler(move |pump| {
//!     if seen.fetch_add(1, Ordering::SeqCst) == 2 {
//!         pump.stop();
//!     }
//! });
//! idler.start();
//! mgr.run().unwrap();
//! assert_eq!(count.load(Ordering::SeqCst), 3);
//! ```

use crate::error::Result;
use crate::observability;
use crate::queue::EventFd;
use rustix::event::{PollFd, PollFlags, poll};
use rustix::fd::AsFd;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a [`PumpManager`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Loop name, for logs and metrics.
    pub name: String,

    /// Upper bound on a single `poll` wait. `None` waits indefinitely.
    pub max_timeout: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: String::from("main"),
            max_timeout: Some(Duration::from_millis(250)),
        }
    }
}

impl LoopConfig {
    /// Create a config with the given loop name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the maximum poll wait.
    pub fn with_max_timeout(mut self, max_timeout: Option<Duration>) -> Self {
        self.max_timeout = max_timeout;
        self
    }
}

// ============================================================================
// Watchers
// ============================================================================

/// A descriptor a watcher can poll.
pub type PollSource = Arc<dyn AsFd + Send + Sync>;

type Callback = Box<dyn FnMut(&Pump) + Send>;

enum WatchKind {
    Idle,
    Timer {
        after: Duration,
        repeat: Option<Duration>,
    },
    Read(PollSource),
    Write(PollSource),
    Signal(i32),
}

impl WatchKind {
    fn name(&self) -> &'static str {
        match self {
            WatchKind::Idle => "idler",
            WatchKind::Timer { .. } => "timer",
            WatchKind::Read(_) => "fd_read",
            WatchKind::Write(_) => "fd_write",
            WatchKind::Signal(_) => "signal",
        }
    }
}

struct Watcher {
    kind: WatchKind,
    started: bool,
    blockers: usize,
    deadline: Option<Instant>,
    callback: Option<Callback>,
    pump: Weak<PumpInner>,
}

impl Watcher {
    fn active(&self) -> bool {
        self.started && self.blockers == 0
    }
}

#[derive(Default)]
struct LoopState {
    watchers: BTreeMap<u64, Watcher>,
    next_id: u64,
    signals: SmallVec<[i32; 4]>,
}

struct LoopInner {
    config: LoopConfig,
    state: Mutex<LoopState>,
    wakeup: EventFd,
    stop: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
}

impl LoopInner {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake the loop if the caller is not the loop thread.
    fn changed(&self) {
        let owner = *self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owner != Some(thread::current().id()) {
            if let Err(err) = self.wakeup.notify() {
                tracing::warn!(event_loop = %self.config.name, "cannot wake event loop: {err}");
            }
        }
    }

    fn with_watcher<R>(&self, id: u64, f: impl FnOnce(&mut Watcher) -> R) -> Option<R> {
        let result = self.lock().watchers.get_mut(&id).map(f);
        if result.is_some() {
            self.changed();
        }
        result
    }
}

// ============================================================================
// Pump
// ============================================================================

struct PumpInner {
    mgr: Weak<LoopInner>,
    id: u64,
}

impl Drop for PumpInner {
    fn drop(&mut self) {
        if let Some(mgr) = self.mgr.upgrade() {
            let removed = mgr.lock().watchers.remove(&self.id);
            drop(removed);
        }
    }
}

/// A watcher registered with an event loop.
///
/// Created stopped. Dropping the handle frees the watcher.
pub struct Pump {
    inner: Arc<PumpInner>,
}

impl Pump {
    /// Watcher id, unique within its loop.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Start watching. A timer is armed from now.
    pub fn start(&self) {
        if let Some(mgr) = self.inner.mgr.upgrade() {
            mgr.with_watcher(self.inner.id, |w| {
                w.started = true;
                if let WatchKind::Timer { after, .. } = w.kind {
                    w.deadline = Some(Instant::now() + after);
                }
            });
        }
    }

    /// Stop watching.
    pub fn stop(&self) {
        if let Some(mgr) = self.inner.mgr.upgrade() {
            mgr.with_watcher(self.inner.id, |w| {
                w.started = false;
                w.deadline = None;
            });
        }
    }

    fn inspect<R>(&self, f: impl FnOnce(&Watcher) -> R) -> Option<R> {
        let mgr = self.inner.mgr.upgrade()?;
        let state = mgr.lock();
        state.watchers.get(&self.inner.id).map(f)
    }

    /// Whether the watcher is started.
    pub fn is_started(&self) -> bool {
        self.inspect(|w| w.started).unwrap_or(false)
    }

    /// Whether a [`Blocker`] is held on the watcher.
    pub fn is_blocked(&self) -> bool {
        self.inspect(|w| w.blockers > 0).unwrap_or(false)
    }

    /// Pause dispatch of this watcher until the returned blocker is dropped.
    pub fn block(&self) -> Blocker {
        if let Some(mgr) = self.inner.mgr.upgrade() {
            mgr.with_watcher(self.inner.id, |w| w.blockers += 1);
        }
        Blocker {
            mgr: self.inner.mgr.clone(),
            id: self.inner.id,
        }
    }

    /// The loop this watcher belongs to.
    pub fn manager(&self) -> Option<PumpManager> {
        self.inner.mgr.upgrade().map(|inner| PumpManager { inner })
    }
}

impl fmt::Debug for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("id", &self.inner.id)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Keeps a watcher paused while alive.
#[derive(Debug)]
pub struct Blocker {
    mgr: Weak<LoopInner>,
    id: u64,
}

impl Drop for Blocker {
    fn drop(&mut self) {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.with_watcher(self.id, |w| w.blockers = w.blockers.saturating_sub(1));
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// Handle on an event loop.
///
/// Cloning shares the loop. The loop must be run from a single thread at a
/// time.
#[derive(Clone)]
pub struct PumpManager {
    inner: Arc<LoopInner>,
}

/// Thread-safe handle that interrupts a running loop.
#[derive(Clone)]
pub struct LoopWaker {
    inner: Weak<LoopInner>,
}

impl LoopWaker {
    /// Make the loop return from its current wait.
    pub fn wake(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Err(err) = inner.wakeup.notify() {
                tracing::warn!(event_loop = %inner.config.name, "cannot wake event loop: {err}");
            }
        }
    }

    /// Make [`PumpManager::run`] return after the current iteration.
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop.store(true, Ordering::Release);
        }
        self.wake();
    }
}

impl fmt::Debug for LoopWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoopWaker")
    }
}

impl PumpManager {
    /// Create an event loop.
    pub fn new(config: LoopConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(LoopInner {
                config,
                state: Mutex::new(LoopState::default()),
                wakeup: EventFd::new()?,
                stop: AtomicBool::new(false),
                owner: Mutex::new(None),
            }),
        })
    }

    /// Loop name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Whether two handles designate the same loop.
    pub fn same(&self, other: &PumpManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn add(&self, kind: WatchKind, callback: Callback) -> Pump {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        let inner = Arc::new(PumpInner {
            mgr: Arc::downgrade(&self.inner),
            id,
        });
        state.watchers.insert(
            id,
            Watcher {
                kind,
                started: false,
                blockers: 0,
                deadline: None,
                callback: Some(callback),
                pump: Arc::downgrade(&inner),
            },
        );
        Pump { inner }
    }

    /// Watcher run when nothing else is ready.
    pub fn idler<F>(&self, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        self.add(WatchKind::Idle, Box::new(callback))
    }

    /// Watcher fired `after` its start, then every `repeat` if set.
    ///
    /// A one-shot timer stops itself after firing.
    pub fn timer<F>(&self, after: Duration, repeat: Option<Duration>, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        self.add(WatchKind::Timer { after, repeat }, Box::new(callback))
    }

    /// Watcher fired while `fd` is readable.
    pub fn fd_read<F>(&self, fd: PollSource, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        self.add(WatchKind::Read(fd), Box::new(callback))
    }

    /// Watcher fired while `fd` is writable.
    pub fn fd_write<F>(&self, fd: PollSource, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        self.add(WatchKind::Write(fd), Box::new(callback))
    }

    /// Watcher fired when `signum` is raised.
    pub fn signal<F>(&self, signum: i32, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        self.add(WatchKind::Signal(signum), Box::new(callback))
    }

    /// Deliver `signum` to the signal watchers on the next iteration.
    ///
    /// Safe to call from any thread.
    pub fn raise_signal(&self, signum: i32) {
        self.inner.lock().signals.push(signum);
        if let Err(err) = self.inner.wakeup.notify() {
            tracing::warn!(event_loop = %self.name(), "cannot wake event loop: {err}");
        }
    }

    /// A handle that can interrupt the loop from another thread.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Make [`PumpManager::run`] return after the current iteration.
    pub fn stop_loop(&self) {
        self.waker().stop();
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    /// Whether some watcher is started and not blocked.
    pub fn has_active(&self) -> bool {
        self.inner.lock().watchers.values().any(Watcher::active)
    }

    /// Drop watchers whose pump handle is gone and release spare memory.
    ///
    /// Returns the number of watchers removed.
    pub fn vacuum(&self) -> usize {
        let removed: Vec<Watcher> = {
            let mut state = self.inner.lock();
            let orphans: Vec<u64> = state
                .watchers
                .iter()
                .filter(|(_, w)| w.pump.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            orphans
                .into_iter()
                .filter_map(|id| state.watchers.remove(&id))
                .collect()
        };
        let count = removed.len();
        drop(removed);
        count
    }

    /// Run until no watcher is active or [`PumpManager::stop_loop`] is
    /// called.
    pub fn run(&self) -> Result<()> {
        let span = observability::span_loop(self.name());
        let _guard = span.enter();
        tracing::debug!(event_loop = %self.name(), "event loop started");
        loop {
            if self.inner.stop.swap(false, Ordering::AcqRel) {
                break;
            }
            if !self.has_active() {
                break;
            }
            self.run_once(None)?;
        }
        tracing::debug!(event_loop = %self.name(), "event loop stopped");
        Ok(())
    }

    /// Wait at most `timeout` (bounded by the configured maximum) for
    /// watchers to become ready, and dispatch them.
    ///
    /// Returns the number of callbacks run.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        *self.inner.owner.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(thread::current().id());

        let now = Instant::now();
        let mut ready: SmallVec<[u64; 16]> = SmallVec::new();
        let mut idle: SmallVec<[u64; 4]> = SmallVec::new();
        let mut timers: SmallVec<[(u64, Instant); 8]> = SmallVec::new();
        let mut fds: Vec<(u64, PollSource, PollFlags)> = Vec::new();
        {
            let mut state = self.inner.lock();
            let signals = std::mem::take(&mut state.signals);
            for (id, watcher) in state.watchers.iter().filter(|(_, w)| w.active()) {
                match &watcher.kind {
                    WatchKind::Idle => idle.push(*id),
                    WatchKind::Timer { .. } => {
                        if let Some(deadline) = watcher.deadline {
                            if deadline <= now {
                                ready.push(*id);
                            } else {
                                timers.push((*id, deadline));
                            }
                        }
                    }
                    WatchKind::Read(fd) => fds.push((*id, Arc::clone(fd), PollFlags::IN)),
                    WatchKind::Write(fd) => fds.push((*id, Arc::clone(fd), PollFlags::OUT)),
                    WatchKind::Signal(signum) => {
                        if signals.contains(signum) {
                            ready.push(*id);
                        }
                    }
                }
            }
        }

        let wait = if !ready.is_empty() || !idle.is_empty() {
            Some(Duration::ZERO)
        } else {
            let next_timer = timers
                .iter()
                .map(|(_, deadline)| deadline.saturating_duration_since(now))
                .min();
            [timeout, next_timer, self.inner.config.max_timeout]
                .into_iter()
                .flatten()
                .min()
        };

        {
            let mut pollfds: Vec<PollFd<'_>> = Vec::with_capacity(fds.len() + 1);
            pollfds.push(PollFd::new(&self.inner.wakeup, PollFlags::IN));
            for (_, fd, flags) in &fds {
                pollfds.push(PollFd::from_borrowed_fd(fd.as_fd(), *flags));
            }
            match poll(&mut pollfds, poll_timeout_ms(wait)) {
                Ok(_) | Err(rustix::io::Errno::INTR) => {}
                Err(err) => return Err(err.into()),
            }
            if !pollfds[0].revents().is_empty() {
                self.inner.wakeup.try_wait()?;
            }
            for (pollfd, (id, _, flags)) in pollfds[1..].iter().zip(&fds) {
                if pollfd
                    .revents()
                    .intersects(*flags | PollFlags::ERR | PollFlags::HUP)
                {
                    ready.push(*id);
                }
            }
        }

        let now = Instant::now();
        ready.extend(
            timers
                .iter()
                .filter(|(_, deadline)| *deadline <= now)
                .map(|(id, _)| *id),
        );
        if ready.is_empty() {
            ready = idle.into_iter().collect();
        }
        ready.sort_unstable();
        ready.dedup();
        drop(fds);

        let mut dispatched = 0;
        for id in ready {
            if self.dispatch(id) {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            observability::record_pump_dispatch(self.name(), dispatched);
        }
        Ok(dispatched)
    }

    fn dispatch(&self, id: u64) -> bool {
        let taken = {
            let mut state = self.inner.lock();
            match state.watchers.get_mut(&id) {
                Some(watcher) if watcher.active() && watcher.callback.is_some() => {
                    if let WatchKind::Timer { repeat, .. } = watcher.kind {
                        match repeat {
                            Some(repeat) => watcher.deadline = Some(Instant::now() + repeat),
                            None => {
                                watcher.started = false;
                                watcher.deadline = None;
                            }
                        }
                    }
                    tracing::trace!(event_loop = %self.inner.config.name, watcher = id, kind = watcher.kind.name(), "dispatch");
                    watcher
                        .callback
                        .take()
                        .map(|callback| (callback, watcher.pump.clone()))
                }
                _ => None,
            }
        };
        let Some((mut callback, pump)) = taken else {
            return false;
        };
        let Some(inner) = pump.upgrade() else {
            self.restore(id, callback);
            return false;
        };
        let pump = Pump { inner };
        callback(&pump);
        self.restore(id, callback);
        drop(pump);
        true
    }

    fn restore(&self, id: u64, callback: Callback) {
        let leftover = {
            let mut state = self.inner.lock();
            match state.watchers.get_mut(&id) {
                Some(watcher) => {
                    watcher.callback = Some(callback);
                    None
                }
                None => Some(callback),
            }
        };
        drop(leftover);
    }
}

impl fmt::Debug for PumpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpManager")
            .field("name", &self.inner.config.name)
            .finish()
    }
}

fn poll_timeout_ms(wait: Option<Duration>) -> i32 {
    match wait {
        None => -1,
        Some(wait) => i32::try_from(wait.as_nanos().div_ceil(1_000_000)).unwrap_or(i32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> PumpManager {
        PumpManager::new(LoopConfig::with_name("test")).unwrap()
    }

    #[test]
    fn test_timer_one_shot() {
        let mgr = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let timer = mgr.timer(Duration::from_millis(5), None, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let started = Instant::now();
        timer.start();
        mgr.run().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_started());
    }

    #[test]
    fn test_timer_repeat() {
        let mgr = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let timer = mgr.timer(Duration::ZERO, Some(Duration::from_millis(1)), move |pump| {
            if count.fetch_add(1, Ordering::SeqCst) == 3 {
                pump.stop();
            }
        });
        timer.start();
        mgr.run().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_blocker_pauses_dispatch() {
        let mgr = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let idler = mgr.idler(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        idler.start();
        let blocker = idler.block();
        assert!(idler.is_blocked());
        assert!(!mgr.has_active());
        assert_eq!(mgr.run_once(Some(Duration::ZERO)).unwrap(), 0);
        drop(blocker);
        assert!(!idler.is_blocked());
        assert_eq!(mgr.run_once(Some(Duration::ZERO)).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fd_read() {
        let mgr = manager();
        let efd = Arc::new(EventFd::new().unwrap());
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let source = Arc::clone(&efd);
        let watcher = mgr.fd_read(efd.clone(), move |pump| {
            source.try_wait().unwrap();
            count.fetch_add(1, Ordering::SeqCst);
            pump.stop();
        });
        watcher.start();
        assert_eq!(mgr.run_once(Some(Duration::ZERO)).unwrap(), 0);
        efd.notify().unwrap();
        mgr.run().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_delivery() {
        let mgr = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let watcher = mgr.signal(10, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        watcher.start();
        mgr.raise_signal(12);
        assert_eq!(mgr.run_once(Some(Duration::ZERO)).unwrap(), 0);
        mgr.raise_signal(10);
        assert_eq!(mgr.run_once(Some(Duration::from_millis(10))).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_from_other_thread() {
        let mgr = manager();
        let keepalive = mgr.timer(Duration::from_secs(3600), None, |_| {});
        keepalive.start();
        let waker = mgr.waker();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.stop();
        });
        mgr.run().unwrap();
        stopper.join().unwrap();
        assert!(keepalive.is_started());
    }

    #[test]
    fn test_drop_in_callback() {
        let mgr = manager();
        let slot: Arc<Mutex<Option<Pump>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let idler = mgr.idler(move |_| {
            inner_slot.lock().unwrap().take();
        });
        idler.start();
        *slot.lock().unwrap() = Some(idler);
        mgr.run().unwrap();
        assert_eq!(mgr.watcher_count(), 0);
    }
}
