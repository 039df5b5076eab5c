use serde::Serialize;
use serde_json::Value;

/// Prefix for messages the application owner can act on
pub const USER_ACTIONABLE_PREFIX: &str = "Telemetry: ";

/// Prefix for messages that describe core or plugin internals
pub const INTERNAL_PREFIX: &str = "Telemetry (Internal): ";

pub const THROTTLE_LIMIT_MESSAGE: &str =
    "Internal events throttle limit per PageView reached for this app.";

/// Severity of an internal message; lower is more severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum LoggingSeverity {
    Critical = 1,
    Warning = 2,
    Debug = 3,
}

impl LoggingSeverity {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for LoggingSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingSeverity::Critical => write!(f, "critical"),
            LoggingSeverity::Warning => write!(f, "warning"),
            LoggingSeverity::Debug => write!(f, "debug"),
        }
    }
}

/// Numeric identifier of an internal message
///
/// Plugins may use their own ids; the constants below are the ones the core
/// itself raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub u32);

impl MessageId {
    pub const FLUSH_FAILED: MessageId = MessageId(22);
    pub const MESSAGE_LIMIT_PER_PV_EXCEEDED: MessageId = MessageId(23);
    pub const TELEMETRY_INITIALIZER_FAILED: MessageId = MessageId(64);
    pub const INVALID_EVENT: MessageId = MessageId(70);
    pub const PLUGIN_EXCEPTION: MessageId = MessageId(73);
    pub const INVALID_INSTRUMENTATION_KEY: MessageId = MessageId(100);
    pub const IN_MEMORY_STORAGE_BUFFER_FULL: MessageId = MessageId(105);
    pub const CONFIG_WATCHER_EXCEPTION: MessageId = MessageId(107);
    pub const INIT_PROMISE_EXCEPTION: MessageId = MessageId(112);
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MessageId {
    fn from(id: u32) -> Self {
        MessageId(id)
    }
}

/// A formatted internal message as retained in the logger queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InternalLogMessage {
    pub message_id: MessageId,
    pub message: String,
    pub is_user_actionable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl InternalLogMessage {
    pub fn new(
        message_id: MessageId,
        text: &str,
        is_user_actionable: bool,
        properties: Option<Value>,
    ) -> Self {
        let prefix = if is_user_actionable {
            USER_ACTIONABLE_PREFIX
        } else {
            INTERNAL_PREFIX
        };

        let mut message = format!("{prefix}{message_id}");
        if !text.is_empty() {
            message.push_str(" message:");
            message.push_str(&sanitize(text));
        }
        if let Some(props) = &properties {
            message.push_str(" props:");
            message.push_str(&sanitize(&props.to_string()));
        }

        Self {
            message_id,
            message,
            is_user_actionable,
            properties,
        }
    }
}

fn sanitize(text: &str) -> String {
    format!("\"{}\"", text.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_format() {
        let msg = InternalLogMessage::new(MessageId(73), "Plugin \"a\" failed", false, None);
        assert_eq!(msg.message, "Telemetry (Internal): 73 message:\"Plugin a failed\"");

        let msg = InternalLogMessage::new(
            MessageId(100),
            "bad key",
            true,
            Some(serde_json::json!({"k": 1})),
        );
        assert_eq!(msg.message, "Telemetry: 100 message:\"bad key\" props:\"{k:1}\"");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(LoggingSeverity::Critical < LoggingSeverity::Warning);
        assert_eq!(LoggingSeverity::Warning.level(), 2);
    }
}
