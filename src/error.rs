//! Error types for Sluice.
//!
//! Control-plane operations return [`Result`]. The data plane (`input`)
//! never returns errors; failures there are thrown as probe events instead.

use thiserror::Error;

/// Result type alias using Sluice's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The command or event was not recognized by this handler.
    ///
    /// Callers try the next handler in line (next probe, inner pipe).
    #[error("unhandled")]
    Unhandled,

    /// Invalid argument or state.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Memory allocation failed.
    #[error("allocation failed: {0}")]
    Alloc(String),

    /// Resource temporarily unavailable (shared buffer, pending request).
    #[error("busy: {0}")]
    Busy(String),

    /// Not enough space in a buffer or queue.
    #[error("no space: {0}")]
    NoSpace(String),

    /// Event loop failure (watcher allocation, missing pump manager).
    #[error("event loop error: {0}")]
    Upump(String),

    /// Failure of an external component.
    #[error("external error: {0}")]
    External(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Flat error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Unhandled => ErrorCode::Unhandled,
            Error::Invalid(_) => ErrorCode::Invalid,
            Error::Alloc(_) => ErrorCode::Alloc,
            Error::Busy(_) => ErrorCode::Busy,
            Error::NoSpace(_) => ErrorCode::NoSpace,
            Error::Upump(_) => ErrorCode::Upump,
            Error::External(_) | Error::Io(_) | Error::System(_) => ErrorCode::External,
        }
    }

    /// Whether this is [`Error::Unhandled`].
    pub fn is_unhandled(&self) -> bool {
        matches!(self, Error::Unhandled)
    }

    /// Shorthand for [`Error::Invalid`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    /// Shorthand for [`Error::Busy`].
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }
}

/// Flat error codes, as carried by `Fatal` and `Error` probe events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    None,
    /// Unknown error.
    Unknown,
    /// Allocation failure.
    Alloc,
    /// Out of space.
    NoSpace,
    /// Event loop failure.
    Upump,
    /// Command not handled.
    Unhandled,
    /// Invalid argument or state.
    Invalid,
    /// External component failure.
    External,
    /// Resource busy.
    Busy,
}

impl ErrorCode {
    /// Human-readable description, as printed in fatal/error logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::None => "no error",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::Alloc => "allocation error",
            ErrorCode::NoSpace => "out of space",
            ErrorCode::Upump => "event loop error",
            ErrorCode::Unhandled => "unhandled",
            ErrorCode::Invalid => "invalid argument",
            ErrorCode::External => "external error",
            ErrorCode::Busy => "resource busy",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Unhandled.code(), ErrorCode::Unhandled);
        assert_eq!(Error::busy("x").code(), ErrorCode::Busy);
        assert_eq!(
            Error::System(rustix::io::Errno::AGAIN).code(),
            ErrorCode::External
        );
        assert!(Error::Unhandled.is_unhandled());
        assert!(!Error::invalid("x").is_unhandled());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Alloc("64 bytes".into());
        assert_eq!(err.to_string(), "allocation failed: 64 bytes");
        assert_eq!(ErrorCode::Busy.to_string(), "resource busy");
    }
}
