//! Core configuration
//!
//! [`CoreConfig`] is the typed root record. The core publishes it as an
//! immutable, versioned [`ConfigSnapshot`]; every `update_cfg` produces a
//! new snapshot from a [`ConfigDelta`] and only then notifies plugins.
//!
//! `instrumentation_key` and `endpoint_url` are [`Deferred`] values: either
//! ready literals or shared futures the activation state machine awaits.
//!
//! Serializable settings (YAML/JSON files plus environment overrides) live
//! in [`settings`].

mod delta;
pub mod settings;

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::{Map, Value};

use crate::diagnostics::{
    DEFAULT_CONSOLE_LEVEL, DEFAULT_MAX_MESSAGE_LIMIT, DEFAULT_TELEMETRY_LEVEL, LoggerSettings,
};
use crate::plugin::{TelemetryPlugin, plugin_ids};

pub use delta::{ConfigDelta, merge_json_map};
pub use settings::CoreSettings;

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_DIAGNOSTIC_LOG_INTERVAL: Duration = Duration::from_millis(10_000);

pub type DeferredFuture<T> = Shared<BoxFuture<'static, Result<T, String>>>;

/// A configuration value that is either known now or will be
#[derive(Clone)]
pub enum Deferred<T: Clone> {
    Ready(T),
    Pending(DeferredFuture<T>),
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn ready(value: T) -> Self {
        Deferred::Ready(value)
    }

    /// Wrap a future; its error is kept as text for diagnostics
    pub fn pending<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Deferred::Pending(future.map(|r| r.map_err(|e| e.to_string())).boxed().shared())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Deferred::Pending(_))
    }

    /// The literal value, if ready
    pub fn value(&self) -> Option<&T> {
        match self {
            Deferred::Ready(value) => Some(value),
            Deferred::Pending(_) => None,
        }
    }

    pub async fn resolve(&self) -> Result<T, String> {
        match self {
            Deferred::Ready(value) => Ok(value.clone()),
            Deferred::Pending(future) => future.clone().await,
        }
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Deferred::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Deferred::Pending(_) => write!(f, "Pending(..)"),
        }
    }
}

impl From<&str> for Deferred<String> {
    fn from(value: &str) -> Self {
        Deferred::Ready(value.to_string())
    }
}

impl From<String> for Deferred<String> {
    fn from(value: String) -> Self {
        Deferred::Ready(value)
    }
}

#[derive(Clone)]
pub struct CoreConfig {
    /// Required; must be non-empty once resolved
    pub instrumentation_key: Option<Deferred<String>>,

    pub endpoint_url: Option<Deferred<String>>,

    /// Explicit channel queues, each an independent delivery lane
    pub channels: Vec<Vec<Arc<dyn TelemetryPlugin>>>,

    /// Extensions embedded in configuration, added to those passed to `initialize`
    pub extensions: Vec<Arc<dyn TelemetryPlugin>>,

    /// Per-plugin overlays: `identifier -> object`
    pub extension_config: Map<String, Value>,

    /// Upper bound on the PENDING state
    pub init_timeout: Duration,

    /// Cap on items queued while PENDING; `None` is unbounded
    pub init_in_memo_max_size: Option<usize>,

    pub diagnostic_log_interval: Duration,

    pub logging_level_console: u8,

    pub logging_level_telemetry: u8,

    pub max_message_limit: u32,

    /// Any other root value, visible through `ProcessContext::get_config`
    pub values: Map<String, Value>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            instrumentation_key: None,
            endpoint_url: None,
            channels: Vec::new(),
            extensions: Vec::new(),
            extension_config: Map::new(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            init_in_memo_max_size: None,
            diagnostic_log_interval: DEFAULT_DIAGNOSTIC_LOG_INTERVAL,
            logging_level_console: DEFAULT_CONSOLE_LEVEL,
            logging_level_telemetry: DEFAULT_TELEMETRY_LEVEL,
            max_message_limit: DEFAULT_MAX_MESSAGE_LIMIT,
            values: Map::new(),
        }
    }
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues: Vec<Vec<&str>> = self.channels.iter().map(|q| plugin_ids(q)).collect();
        f.debug_struct("CoreConfig")
            .field("instrumentation_key", &self.instrumentation_key)
            .field("endpoint_url", &self.endpoint_url)
            .field("channels", &queues)
            .field("extensions", &plugin_ids(&self.extensions))
            .field("extension_config", &self.extension_config)
            .field("init_timeout", &self.init_timeout)
            .field("init_in_memo_max_size", &self.init_in_memo_max_size)
            .field("diagnostic_log_interval", &self.diagnostic_log_interval)
            .field("logging_level_console", &self.logging_level_console)
            .field("logging_level_telemetry", &self.logging_level_telemetry)
            .field("max_message_limit", &self.max_message_limit)
            .field("values", &self.values)
            .finish()
    }
}

impl CoreConfig {
    pub fn new(instrumentation_key: impl Into<Deferred<String>>) -> Self {
        Self {
            instrumentation_key: Some(instrumentation_key.into()),
            ..Default::default()
        }
    }

    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<Deferred<String>>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_channel_queue(mut self, queue: Vec<Arc<dyn TelemetryPlugin>>) -> Self {
        self.channels.push(queue);
        self
    }

    pub fn with_extension(mut self, plugin: Arc<dyn TelemetryPlugin>) -> Self {
        self.extensions.push(plugin);
        self
    }

    pub fn with_extension_config(mut self, identifier: impl Into<String>, config: Value) -> Self {
        self.extension_config.insert(identifier.into(), config);
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_init_in_memo_max_size(mut self, max: usize) -> Self {
        self.init_in_memo_max_size = Some(max);
        self
    }

    pub fn with_diagnostic_log_interval(mut self, interval: Duration) -> Self {
        self.diagnostic_log_interval = interval;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn logger_settings(&self) -> LoggerSettings {
        LoggerSettings {
            console_level: self.logging_level_console,
            telemetry_level: self.logging_level_telemetry,
            max_message_limit: self.max_message_limit,
        }
    }

    /// The instrumentation key when it is a ready literal
    pub fn instrumentation_key_value(&self) -> Option<&str> {
        self.instrumentation_key
            .as_ref()
            .and_then(Deferred::value)
            .map(String::as_str)
    }

    /// The endpoint when it is a ready literal
    pub fn endpoint_url_value(&self) -> Option<&str> {
        self.endpoint_url
            .as_ref()
            .and_then(Deferred::value)
            .map(String::as_str)
    }

    /// Root value lookup by its camelCase configuration name. Typed fields
    /// are exposed under their names; anything else comes from `values`.
    pub fn get_value(&self, field: &str) -> Option<Value> {
        match field {
            "instrumentationKey" => self.instrumentation_key_value().map(Value::from),
            "endpointUrl" => self.endpoint_url_value().map(Value::from),
            "extensionConfig" => Some(Value::Object(self.extension_config.clone())),
            "initTimeOut" => Some(Value::from(duration_millis(self.init_timeout))),
            "initInMemoMaxSize" => self.init_in_memo_max_size.map(Value::from),
            "diagnosticLogInterval" => {
                Some(Value::from(duration_millis(self.diagnostic_log_interval)))
            }
            "loggingLevelConsole" => Some(Value::from(self.logging_level_console)),
            "loggingLevelTelemetry" => Some(Value::from(self.logging_level_telemetry)),
            "maxMessageLimit" => Some(Value::from(self.max_message_limit)),
            other => self.values.get(other).cloned(),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// An immutable, versioned view of the configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    version: u64,
    config: CoreConfig,
}

impl ConfigSnapshot {
    pub fn new(version: u64, config: CoreConfig) -> Self {
        Self { version, config }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The next version of this snapshot holding `config`
    pub fn successor(&self, config: CoreConfig) -> Self {
        Self::new(self.version + 1, config)
    }
}

impl Deref for ConfigSnapshot {
    type Target = CoreConfig;

    fn deref(&self) -> &CoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_deferred_ready_and_pending() {
        let ready: Deferred<String> = "key".into();
        assert_eq!(ready.value().map(String::as_str), Some("key"));
        assert_eq!(ready.resolve().await.unwrap(), "key");

        let pending = Deferred::pending(async { Ok::<_, String>("later".to_string()) });
        assert!(pending.is_pending());
        assert!(pending.value().is_none());
        assert_eq!(pending.resolve().await.unwrap(), "later");
        // shared futures can be awaited again
        assert_eq!(pending.resolve().await.unwrap(), "later");
    }

    #[tokio::test]
    async fn test_deferred_rejection_keeps_message() {
        let rejected: Deferred<String> = Deferred::pending(async { Err::<String, _>("denied") });
        assert_eq!(rejected.resolve().await.unwrap_err(), "denied");
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.init_timeout, Duration::from_secs(60));
        assert_eq!(config.diagnostic_log_interval, Duration::from_secs(10));
        assert_eq!(config.logging_level_console, 0);
        assert_eq!(config.logging_level_telemetry, 1);
        assert_eq!(config.max_message_limit, 25);
        assert!(config.init_in_memo_max_size.is_none());
    }

    #[test]
    fn test_get_value_maps_typed_fields() {
        let config = CoreConfig::new("ikey")
            .with_endpoint_url("https://collector")
            .with_init_timeout(Duration::from_millis(250))
            .with_value("custom", json!({"a": 1}));

        assert_eq!(config.get_value("instrumentationKey"), Some(json!("ikey")));
        assert_eq!(config.get_value("endpointUrl"), Some(json!("https://collector")));
        assert_eq!(config.get_value("initTimeOut"), Some(json!(250)));
        assert_eq!(config.get_value("custom"), Some(json!({"a": 1})));
        assert_eq!(config.get_value("nothing"), None);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let config = CoreConfig::new("ikey")
            .with_init_timeout(Duration::MAX)
            .with_diagnostic_log_interval(Duration::MAX);

        assert_eq!(config.get_value("initTimeOut"), Some(json!(u64::MAX)));
        assert_eq!(config.get_value("diagnosticLogInterval"), Some(json!(u64::MAX)));
    }

    #[test]
    fn test_pending_key_has_no_literal_value() {
        let config = CoreConfig::new(Deferred::pending(futures::future::pending::<
            Result<String, String>,
        >()));
        assert!(config.instrumentation_key_value().is_none());
        assert_eq!(config.get_value("instrumentationKey"), None);
    }

    #[test]
    fn test_snapshot_successor_bumps_version() {
        let first = ConfigSnapshot::new(1, CoreConfig::new("a"));
        let second = first.successor(CoreConfig::new("b"));
        assert_eq!(second.version(), 2);
        assert_eq!(second.instrumentation_key_value(), Some("b"));
    }
}
