use std::time::Duration;

use serde_json::{Map, Value};

use super::{CoreConfig, Deferred};

/// A set of configuration changes applied by `update_cfg`
///
/// With `merge = true` only the named fields change and JSON objects are
/// deep-merged. With `merge = false` every root field not named here returns
/// to its default; the plugin lists are structural and always retained.
#[derive(Debug, Clone, Default)]
pub struct ConfigDelta {
    pub instrumentation_key: Option<Deferred<String>>,
    pub endpoint_url: Option<Deferred<String>>,
    pub extension_config: Option<Map<String, Value>>,
    pub init_timeout: Option<Duration>,
    pub init_in_memo_max_size: Option<usize>,
    pub diagnostic_log_interval: Option<Duration>,
    pub logging_level_console: Option<u8>,
    pub logging_level_telemetry: Option<u8>,
    pub max_message_limit: Option<u32>,
    pub values: Map<String, Value>,
}

impl ConfigDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instrumentation_key(mut self, key: impl Into<Deferred<String>>) -> Self {
        self.instrumentation_key = Some(key.into());
        self
    }

    pub fn endpoint_url(mut self, url: impl Into<Deferred<String>>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn extension_config(mut self, identifier: impl Into<String>, config: Value) -> Self {
        self.extension_config
            .get_or_insert_with(Map::new)
            .insert(identifier.into(), config);
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    pub fn logging_level_console(mut self, level: u8) -> Self {
        self.logging_level_console = Some(level);
        self
    }

    pub fn logging_level_telemetry(mut self, level: u8) -> Self {
        self.logging_level_telemetry = Some(level);
        self
    }

    pub fn max_message_limit(mut self, limit: u32) -> Self {
        self.max_message_limit = Some(limit);
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Whether applying this delta can change the activation status
    pub fn touches_activation(&self, merge: bool) -> bool {
        !merge || self.instrumentation_key.is_some() || self.endpoint_url.is_some()
    }

    pub fn apply(&self, base: &CoreConfig, merge: bool) -> CoreConfig {
        let mut next = if merge {
            base.clone()
        } else {
            CoreConfig {
                channels: base.channels.clone(),
                extensions: base.extensions.clone(),
                ..Default::default()
            }
        };

        if let Some(key) = &self.instrumentation_key {
            next.instrumentation_key = Some(key.clone());
        }
        if let Some(url) = &self.endpoint_url {
            next.endpoint_url = Some(url.clone());
        }
        if let Some(timeout) = self.init_timeout {
            next.init_timeout = timeout;
        }
        if let Some(max) = self.init_in_memo_max_size {
            next.init_in_memo_max_size = Some(max);
        }
        if let Some(interval) = self.diagnostic_log_interval {
            next.diagnostic_log_interval = interval;
        }
        if let Some(level) = self.logging_level_console {
            next.logging_level_console = level;
        }
        if let Some(level) = self.logging_level_telemetry {
            next.logging_level_telemetry = level;
        }
        if let Some(limit) = self.max_message_limit {
            next.max_message_limit = limit;
        }

        if let Some(ext) = &self.extension_config {
            if merge {
                merge_json_map(&mut next.extension_config, ext);
            } else {
                next.extension_config = ext.clone();
            }
        }
        if merge {
            merge_json_map(&mut next.values, &self.values);
        } else {
            next.values = self.values.clone();
        }

        next
    }
}

/// Deep-merge `patch` into `target`: nested objects merge, anything else replaces
pub fn merge_json_map(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) =
            (target.get_mut(key), value)
        {
            merge_json_map(existing, incoming);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}
