//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Log levels carried by probe `Log` events.
///
/// Finer than [`tracing::Level`]: `Notice` sits between info and warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Very verbose debugging.
    Verbose,
    /// Debugging.
    Debug,
    /// Normal but significant condition.
    Notice,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

impl LogLevel {
    /// The tracing level a record of this level is emitted at.
    pub fn tracing_level(self) -> Level {
        match self {
            LogLevel::Verbose => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Notice => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Short lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Emit a message through `tracing` at the level matching `level`.
///
/// `prefix` is the rendered probe prefix chain (`[a] [b]`), possibly empty.
pub fn emit(level: LogLevel, prefix: &str, message: &str) {
    match level {
        LogLevel::Verbose => tracing::trace!(target: "sluice", "{prefix}{message}"),
        LogLevel::Debug => tracing::debug!(target: "sluice", "{prefix}{message}"),
        LogLevel::Notice => tracing::info!(target: "sluice", "{prefix}{message}"),
        LogLevel::Warning => tracing::warn!(target: "sluice", "{prefix}{message}"),
        LogLevel::Error => tracing::error!(target: "sluice", "{prefix}{message}"),
    }
}

/// Create a span for an event loop run.
///
/// # Example
///
/// ```rust,ignore
/// let span = span_loop("worker-0");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_loop(name: &str) -> Span {
    span!(Level::DEBUG, "upump_loop", name = %name)
}

/// Create a span for a pipe control call.
#[inline]
pub fn span_pipe(manager: &'static str, id: u64) -> Span {
    span!(Level::TRACE, "upipe", manager, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::Notice.tracing_level(), Level::INFO);
        assert_eq!(LogLevel::Verbose.tracing_level(), Level::TRACE);
        assert!(LogLevel::Warning > LogLevel::Notice);
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn test_span_creation() {
        let span = span_loop("main");
        let _guard = span.enter();
        let pipe_span = span_pipe("qsrc", 3);
        let _g = pipe_span.enter();
    }
}
