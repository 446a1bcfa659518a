//! Severity levels for the dynamic log-level API.

use crate::proto;

/// Severity level returned by the log-level lookup API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// The most verbose level, for very detailed debugging.
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Fatal errors that may cause the application to exit.
    Fatal,
}

impl LogLevel {
    /// Upper-case name, matching the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<proto::LogLevel> for LogLevel {
    fn from(level: proto::LogLevel) -> LogLevel {
        match level {
            proto::LogLevel::Trace => LogLevel::Trace,
            proto::LogLevel::Debug => LogLevel::Debug,
            proto::LogLevel::Info => LogLevel::Info,
            proto::LogLevel::Warn => LogLevel::Warn,
            proto::LogLevel::Error => LogLevel::Error,
            proto::LogLevel::Fatal => LogLevel::Fatal,
            // Unknown or unset levels default to Debug.
            proto::LogLevel::NotSet => LogLevel::Debug,
        }
    }
}
