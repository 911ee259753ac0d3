//! Unbounded out-of-band message queue with a pollable wake-up.
//!
//! Control messages (request registration, end of stream, teardown) must
//! never be refused, so they travel on an unbounded `kanal` channel beside
//! the bounded data ring.

use super::EventFd;
use crate::error::{Error, Result};
use crate::pump::{PollSource, Pump, PumpManager};
use std::sync::Arc;

/// Multi-producer message queue, drained on the consumer's event loop.
pub struct ControlQueue<T> {
    tx: kanal::Sender<T>,
    rx: kanal::Receiver<T>,
    event: Arc<EventFd>,
    name: String,
}

impl<T: Send + 'static> ControlQueue<T> {
    /// An empty queue.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let (tx, rx) = kanal::unbounded();
        Ok(Self {
            tx,
            rx,
            event: Arc::new(EventFd::new()?),
            name: name.into(),
        })
    }

    /// Queue `message` and wake the consumer.
    pub fn push(&self, message: T) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::invalid(format!("control queue {} closed", self.name)))?;
        self.event.notify()
    }

    /// Take the oldest message.
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(Some(message)) => return Some(message),
            Ok(None) => {}
            Err(_) => return None,
        }
        let _ = self.event.try_wait();
        match self.rx.try_recv() {
            Ok(Some(message)) => {
                if !self.rx.is_empty() {
                    let _ = self.event.notify();
                }
                Some(message)
            }
            _ => None,
        }
    }

    /// Take every queued message.
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no message is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Readable while messages may be waiting.
    pub fn fd(&self) -> PollSource {
        Arc::clone(&self.event) as PollSource
    }

    /// Stopped watcher on `mgr` fired while messages may be waiting.
    pub fn watch<F>(&self, mgr: &PumpManager, callback: F) -> Pump
    where
        F: FnMut(&Pump) + Send + 'static,
    {
        mgr.fd_read(self.fd(), callback)
    }
}

impl<T> std::fmt::Debug for ControlQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlQueue")
            .field("name", &self.name)
            .field("len", &self.rx.len())
            .finish()
    }
}
