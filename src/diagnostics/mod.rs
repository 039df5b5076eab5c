//! Internal diagnostics
//!
//! The [`DiagnosticLogger`] is the user-facing half of the core's logging:
//! console output goes through a [`ConsoleSink`] (by default into `tracing`)
//! and retained messages are later tracked as telemetry by the core's
//! internal log poller.

mod logger;
mod message;

pub use logger::{
    ConsoleSink, DEFAULT_CONSOLE_LEVEL, DEFAULT_MAX_MESSAGE_LIMIT, DEFAULT_TELEMETRY_LEVEL,
    DiagnosticLogger, LoggerSettings, TracingConsole,
};
pub use message::{
    INTERNAL_PREFIX, InternalLogMessage, LoggingSeverity, MessageId, THROTTLE_LIMIT_MESSAGE,
    USER_ACTIONABLE_PREFIX,
};
