//! Throttled, deduplicated internal logging
//!
//! ```text
//!   throw_internal(severity, id, msg, user_act)
//!          |
//!          +--> console gate:  console_level >= severity
//!          |                   (user-actionable ids reach the console once
//!          |                    per logger lifetime)
//!          |
//!          +--> queue gate:    not throttled, id not yet queued this cycle,
//!                              severity <= telemetry_level
//!                              count == max  =>  one throttle marker
//! ```
//!
//! The queue is drained by the core's internal log poller, and
//! `reset_internal_message_count` opens a new cycle.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::message::{InternalLogMessage, LoggingSeverity, MessageId, THROTTLE_LIMIT_MESSAGE};

pub const DEFAULT_CONSOLE_LEVEL: u8 = 0;
pub const DEFAULT_TELEMETRY_LEVEL: u8 = 1;
pub const DEFAULT_MAX_MESSAGE_LIMIT: u32 = 25;

/// Destination for console-visible diagnostics
pub trait ConsoleSink: Send + Sync {
    fn warn(&self, message: &str);

    fn error(&self, message: &str);

    fn debug(&self, _message: &str) {}
}

/// Default sink, forwarding console output into `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn warn(&self, message: &str) {
        tracing::warn!(target: "telemetry_core::console", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "telemetry_core::console", "{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "telemetry_core::console", "{message}");
    }
}

/// Logger thresholds, refreshed from configuration on every update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerSettings {
    pub console_level: u8,
    pub telemetry_level: u8,
    pub max_message_limit: u32,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            console_level: DEFAULT_CONSOLE_LEVEL,
            telemetry_level: DEFAULT_TELEMETRY_LEVEL,
            max_message_limit: DEFAULT_MAX_MESSAGE_LIMIT,
        }
    }
}

#[derive(Default)]
struct LoggerState {
    queue: Vec<InternalLogMessage>,
    message_count: u32,
    queued_ids: HashSet<MessageId>,
    console_ids: HashSet<MessageId>,
}

pub struct DiagnosticLogger {
    settings: RwLock<LoggerSettings>,
    state: Mutex<LoggerState>,
    sink: Arc<dyn ConsoleSink>,
}

impl std::fmt::Debug for DiagnosticLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticLogger")
            .field("settings", &*self.settings.read())
            .field("queued", &self.state.lock().queue.len())
            .finish()
    }
}

impl Default for DiagnosticLogger {
    fn default() -> Self {
        Self::new(LoggerSettings::default())
    }
}

impl DiagnosticLogger {
    pub fn new(settings: LoggerSettings) -> Self {
        Self::with_sink(settings, Arc::new(TracingConsole))
    }

    pub fn with_sink(settings: LoggerSettings, sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            settings: RwLock::new(settings),
            state: Mutex::new(LoggerState::default()),
            sink,
        }
    }

    pub fn settings(&self) -> LoggerSettings {
        *self.settings.read()
    }

    pub fn configure(&self, settings: LoggerSettings) {
        *self.settings.write() = settings;
    }

    /// Record an internal message, writing it to the console and/or the
    /// internal queue depending on the configured levels.
    pub fn throw_internal(
        &self,
        severity: LoggingSeverity,
        id: impl Into<MessageId>,
        text: &str,
        properties: Option<Value>,
        is_user_actionable: bool,
    ) {
        let message = InternalLogMessage::new(id.into(), text, is_user_actionable, properties);
        let settings = self.settings();
        let console_visible = settings.console_level >= severity.level();

        if is_user_actionable {
            // only ids that actually reached the console count as seen
            let first_time =
                console_visible && self.state.lock().console_ids.insert(message.message_id);
            if first_time {
                self.to_console(severity, &message.message);
            }
        } else if console_visible {
            self.to_console(severity, &message.message);
        }

        self.log_internal_message(severity, message);
    }

    pub fn warn_to_console(&self, message: &str) {
        self.sink.warn(message);
    }

    pub fn error_to_console(&self, message: &str) {
        self.sink.error(message);
    }

    pub fn debug_to_console(&self, message: &str) {
        self.sink.debug(message);
    }

    /// Queue a message without the console gate
    pub fn log_internal_message(&self, severity: LoggingSeverity, message: InternalLogMessage) {
        let settings = self.settings();
        let throttled = {
            let mut state = self.state.lock();
            if state.message_count >= settings.max_message_limit {
                return;
            }
            if !state.queued_ids.insert(message.message_id) {
                return;
            }

            if severity.level() <= settings.telemetry_level {
                state.queue.push(message);
                state.message_count += 1;
            }

            if state.message_count == settings.max_message_limit {
                state.queue.push(InternalLogMessage::new(
                    MessageId::MESSAGE_LIMIT_PER_PV_EXCEEDED,
                    THROTTLE_LIMIT_MESSAGE,
                    false,
                    None,
                ));
                true
            } else {
                false
            }
        };

        if throttled {
            self.to_console(severity, THROTTLE_LIMIT_MESSAGE);
        }
    }

    /// Open a new throttling cycle. Console dedupe of user-actionable ids is kept.
    pub fn reset_internal_message_count(&self) {
        let mut state = self.state.lock();
        state.message_count = 0;
        state.queued_ids.clear();
    }

    pub fn is_throttled(&self) -> bool {
        self.state.lock().message_count >= self.settings().max_message_limit
    }

    /// Snapshot of the queued messages
    pub fn queue(&self) -> Vec<InternalLogMessage> {
        self.state.lock().queue.clone()
    }

    pub fn take_queue(&self) -> Vec<InternalLogMessage> {
        std::mem::take(&mut self.state.lock().queue)
    }

    fn to_console(&self, severity: LoggingSeverity, message: &str) {
        match severity {
            LoggingSeverity::Critical => self.sink.error(message),
            LoggingSeverity::Warning => self.sink.warn(message),
            LoggingSeverity::Debug => self.sink.debug(message),
        }
    }
}
