//! Telemetry item envelope
//!
//! The unit of data that flows through the plugin chain. The core only
//! defaults `iKey`, `time` and `ver`; everything else belongs to the
//! plugins that produce and consume the item.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Envelope version stamped on items that do not carry one
pub const DEFAULT_ITEM_VERSION: &str = "4.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryItem {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(rename = "iKey", default, skip_serializing_if = "Option::is_none")]
    pub ikey: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ext: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tags: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_data: Option<Value>,
}

impl TelemetryItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_base(mut self, base_type: impl Into<String>, base_data: Value) -> Self {
        self.base_type = Some(base_type.into());
        self.base_data = Some(base_data);
        self
    }

    pub fn with_ikey(mut self, ikey: impl Into<String>) -> Self {
        self.ikey = Some(ikey.into());
        self
    }

    /// Fill the fields the core owns when the producer left them unset
    pub(crate) fn apply_defaults(&mut self, ikey: Option<&str>) {
        if self.ikey.as_deref().is_none_or(str::is_empty) {
            if let Some(key) = ikey {
                self.ikey = Some(key.to_string());
            }
        }
        if self.time.is_none() {
            self.time = Some(now_rfc3339());
        }
        if self.ver.is_none() {
            self.ver = Some(DEFAULT_ITEM_VERSION.to_string());
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
