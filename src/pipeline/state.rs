use std::sync::Arc;

use crate::config::ConfigSnapshot;
use crate::plugin::{TelemetryPlugin, plugin_ids};

/// Why plugins are being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadReason {
    /// Teardown requested directly by the host
    ManualTeardown,
    /// The whole core is unloading
    SdkUnload,
    /// A single plugin is being removed
    PluginUnload,
    /// A plugin is being replaced by one with the same identifier
    PluginReplace,
}

/// Progress of an unload, handed to every teardown and unload handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnloadState {
    pub reason: UnloadReason,
    pub is_async: bool,
    /// Every channel flush finished within the timeout
    pub flush_complete: bool,
    /// Every teardown finished within the timeout
    pub teardown_complete: bool,
}

impl UnloadState {
    pub fn new(reason: UnloadReason, is_async: bool) -> Self {
        Self {
            reason,
            is_async,
            flush_complete: false,
            teardown_complete: false,
        }
    }
}

/// Flags describing why `update` is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateReason(u32);

impl UpdateReason {
    pub const UNKNOWN: UpdateReason = UpdateReason(0);
    pub const PLUGIN_ADDED: UpdateReason = UpdateReason(0x01);
    pub const PLUGIN_REMOVED: UpdateReason = UpdateReason(0x02);
    pub const CONFIG_CHANGED: UpdateReason = UpdateReason(0x10);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: UpdateReason) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for UpdateReason {
    type Output = UpdateReason;

    fn bitor(self, rhs: UpdateReason) -> UpdateReason {
        UpdateReason(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UpdateReason {
    fn bitor_assign(&mut self, rhs: UpdateReason) {
        self.0 |= rhs.0;
    }
}

/// Payload of an `update` notification
#[derive(Clone)]
pub struct UpdateState {
    pub reason: UpdateReason,
    /// Configuration now in effect
    pub config: Arc<ConfigSnapshot>,
    /// Configuration before a `CONFIG_CHANGED` update
    pub old_config: Option<Arc<ConfigSnapshot>>,
    pub merge: bool,
    pub added: Vec<Arc<dyn TelemetryPlugin>>,
    pub removed: Vec<Arc<dyn TelemetryPlugin>>,
}

impl UpdateState {
    pub fn new(reason: UpdateReason, config: Arc<ConfigSnapshot>) -> Self {
        Self {
            reason,
            config,
            old_config: None,
            merge: true,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl std::fmt::Debug for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateState")
            .field("reason", &self.reason)
            .field("version", &self.config.version())
            .field("old_version", &self.old_config.as_ref().map(|c| c.version()))
            .field("merge", &self.merge)
            .field("added", &plugin_ids(&self.added))
            .field("removed", &plugin_ids(&self.removed))
            .finish()
    }
}

/// Why a channel is being asked to send what it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendRequestReason {
    #[default]
    Undefined,
    NormalSchedule,
    ManualFlush,
    Unload,
    SdkUnload,
}
