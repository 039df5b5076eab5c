//! Serializable core settings
//!
//! The subset of [`CoreConfig`](super::CoreConfig) that can be written down:
//! literal key and endpoint, numeric knobs, extension overlays and free-form
//! root values. Plugins and deferred values are attached in code.
//!
//! Priority: file > environment variables > defaults.
//!
//! # Example YAML structure
//! ```yaml
//! instrumentationKey: "00000000-0000-0000-0000-000000000000"
//! endpointUrl: "https://collector.example.com/v2/track"
//! initTimeOut: 30000
//! diagnosticLogInterval: 10000
//! loggingLevelConsole: 1
//! loggingLevelTelemetry: 1
//! maxMessageLimit: 25
//! extensionConfig:
//!   Sender:
//!     maxBatchSize: 100
//! sampleRate: 50
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ConfigDelta, CoreConfig, Deferred};
use crate::errors::{CoreError, CoreResult};

pub const ENV_INSTRUMENTATION_KEY: &str = "TELEMETRY_INSTRUMENTATION_KEY";
pub const ENV_ENDPOINT_URL: &str = "TELEMETRY_ENDPOINT_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreSettings {
    pub instrumentation_key: Option<String>,
    pub endpoint_url: Option<String>,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extension_config: Map<String, Value>,

    /// Milliseconds
    #[serde(rename = "initTimeOut")]
    pub init_timeout: Option<u64>,

    pub init_in_memo_max_size: Option<usize>,

    /// Milliseconds
    pub diagnostic_log_interval: Option<u64>,

    pub logging_level_console: Option<u8>,
    pub logging_level_telemetry: Option<u8>,
    pub max_message_limit: Option<u32>,

    /// Every other root key
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl CoreSettings {
    pub fn from_yaml_str(contents: &str) -> CoreResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CoreError::Settings(format!("Failed to parse YAML settings: {e}")))
    }

    pub fn from_json_str(contents: &str) -> CoreResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| CoreError::Settings(format!("Failed to parse JSON settings: {e}")))
    }

    /// Load a `.json` file as JSON and anything else as YAML, then fill
    /// unset key/endpoint from the environment.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Settings(format!("Failed to read settings file {}: {e}", path.display()))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let settings = if is_json {
            Self::from_json_str(&contents)?
        } else {
            Self::from_yaml_str(&contents)?
        };

        Ok(settings.with_env_fallback())
    }

    /// Settings built from environment variables only
    pub fn from_env() -> Self {
        Self::default().with_env_fallback()
    }

    fn with_env_fallback(mut self) -> Self {
        if self.instrumentation_key.is_none() {
            self.instrumentation_key = read_env(ENV_INSTRUMENTATION_KEY);
        }
        if self.endpoint_url.is_none() {
            self.endpoint_url = read_env(ENV_ENDPOINT_URL);
        }
        self
    }

    /// A full configuration with these settings over the defaults
    pub fn into_config(self) -> CoreConfig {
        self.into_delta().apply(&CoreConfig::default(), true)
    }

    /// A delta naming exactly the fields these settings set, for `update_cfg`
    pub fn into_delta(self) -> ConfigDelta {
        ConfigDelta {
            instrumentation_key: self.instrumentation_key.map(Deferred::Ready),
            endpoint_url: self.endpoint_url.map(Deferred::Ready),
            extension_config: (!self.extension_config.is_empty()).then_some(self.extension_config),
            init_timeout: self.init_timeout.map(Duration::from_millis),
            init_in_memo_max_size: self.init_in_memo_max_size,
            diagnostic_log_interval: self.diagnostic_log_interval.map(Duration::from_millis),
            logging_level_console: self.logging_level_console,
            logging_level_telemetry: self.logging_level_telemetry,
            max_message_limit: self.max_message_limit,
            values: self.values,
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const YAML: &str = r#"
instrumentationKey: "ikey-yaml"
endpointUrl: "https://collector.example.com"
initTimeOut: 1500
maxMessageLimit: 10
extensionConfig:
  Sender:
    maxBatchSize: 100
sampleRate: 50
"#;

    #[test]
    fn test_yaml_settings() {
        let settings = CoreSettings::from_yaml_str(YAML).unwrap();

        assert_eq!(settings.instrumentation_key.as_deref(), Some("ikey-yaml"));
        assert_eq!(settings.init_timeout, Some(1500));
        assert_eq!(settings.max_message_limit, Some(10));
        assert_eq!(settings.extension_config["Sender"], json!({"maxBatchSize": 100}));
        assert_eq!(settings.values["sampleRate"], json!(50));
        assert!(!settings.values.contains_key("initTimeOut"));
    }

    #[test]
    fn test_into_config_applies_over_defaults() {
        let config = CoreSettings::from_yaml_str(YAML).unwrap().into_config();

        assert_eq!(config.instrumentation_key_value(), Some("ikey-yaml"));
        assert_eq!(config.init_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_message_limit, 10);
        assert_eq!(config.logging_level_telemetry, 1);
        assert_eq!(config.get_value("sampleRate"), Some(json!(50)));
    }

    #[test]
    fn test_json_settings() {
        let settings =
            CoreSettings::from_json_str(r#"{"instrumentationKey": "k", "loggingLevelConsole": 2}"#)
                .unwrap();
        assert_eq!(settings.logging_level_console, Some(2));
    }

    #[test]
    fn test_invalid_yaml_is_settings_error() {
        let err = CoreSettings::from_yaml_str("initTimeOut: [not, a, number]").unwrap_err();
        assert!(matches!(err, CoreError::Settings(_)));
    }

    #[test]
    #[serial]
    fn test_file_overrides_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("telemetry.yaml");
        fs::write(&path, "instrumentationKey: from-file\n").unwrap();

        unsafe {
            std::env::set_var(ENV_INSTRUMENTATION_KEY, "from-env");
            std::env::set_var(ENV_ENDPOINT_URL, "https://env.example.com");
        }
        let settings = CoreSettings::from_file(&path).unwrap();
        unsafe {
            std::env::remove_var(ENV_INSTRUMENTATION_KEY);
            std::env::remove_var(ENV_ENDPOINT_URL);
        }

        assert_eq!(settings.instrumentation_key.as_deref(), Some("from-file"));
        assert_eq!(settings.endpoint_url.as_deref(), Some("https://env.example.com"));
    }

    #[test]
    #[serial]
    fn test_json_file_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("telemetry.json");
        fs::write(&path, r#"{"endpointUrl": "https://json.example.com"}"#).unwrap();

        let settings = CoreSettings::from_file(&path).unwrap();
        assert_eq!(settings.endpoint_url.as_deref(), Some("https://json.example.com"));

        let missing = CoreSettings::from_file(dir.path().join("absent.yaml"));
        assert!(matches!(missing, Err(CoreError::Settings(_))));
    }
}
