//! Pollable wake-up counter.
//!
//! On Linux this is an `eventfd`. Elsewhere it falls back to a
//! non-blocking pipe whose read end is polled.

use crate::error::Result;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};

#[cfg(target_os = "linux")]
use rustix::event::{EventfdFlags, eventfd};

/// A file descriptor that becomes readable when notified.
///
/// Notifications coalesce: any number of [`EventFd::notify`] calls are
/// cleared by one [`EventFd::try_wait`].
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
    #[cfg(not(target_os = "linux"))]
    writer: OwnedFd,
}

#[cfg(target_os = "linux")]
impl EventFd {
    /// Create a non-signalled eventfd.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Signal the eventfd. Safe to call from any thread.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        match rustix::io::write(&self.fd, &val.to_ne_bytes()) {
            Ok(_) | Err(rustix::io::Errno::AGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the eventfd without blocking.
    ///
    /// Returns `true` if it was signalled.
    pub fn try_wait(&self) -> Result<bool> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => Ok(true),
            Ok(_) => Ok(false),
            Err(rustix::io::Errno::AGAIN) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl EventFd {
    /// Create a non-signalled wake-up pipe.
    pub fn new() -> Result<Self> {
        use rustix::fs::{OFlags, fcntl_setfl};
        use rustix::io::{FdFlags, fcntl_setfd};

        let (fd, writer) = rustix::pipe::pipe()?;
        for end in [&fd, &writer] {
            fcntl_setfl(end, OFlags::NONBLOCK)?;
            fcntl_setfd(end, FdFlags::CLOEXEC)?;
        }
        Ok(Self { fd, writer })
    }

    /// Signal the pipe. Safe to call from any thread.
    pub fn notify(&self) -> Result<()> {
        match rustix::io::write(&self.writer, &[1u8]) {
            // a full pipe is already signalled
            Ok(_) | Err(rustix::io::Errno::AGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain the pipe without blocking.
    ///
    /// Returns `true` if it was signalled.
    pub fn try_wait(&self) -> Result<bool> {
        let mut buf = [0u8; 64];
        let mut signalled = false;
        loop {
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(0) => return Ok(signalled),
                Ok(_) => signalled = true,
                Err(rustix::io::Errno::AGAIN) => return Ok(signalled),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let efd = EventFd::new().unwrap();
        assert!(!efd.try_wait().unwrap());
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert!(efd.try_wait().unwrap());
        assert!(!efd.try_wait().unwrap());
    }

    #[test]
    fn test_notify_across_threads() {
        let efd = std::sync::Arc::new(EventFd::new().unwrap());
        let remote = std::sync::Arc::clone(&efd);
        std::thread::spawn(move || remote.notify().unwrap())
            .join()
            .unwrap();
        assert!(efd.try_wait().unwrap());
    }
}
