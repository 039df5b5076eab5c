//! Plugin Lifecycle Management
//!
//! Each core keeps one [`PluginStatus`] per plugin identifier. Chain nodes
//! share it, so disabling or tearing down a plugin is immediately visible to
//! every chain that contains it.
//!
//! # Lifecycle State Machine
//!
//! ```text
//!     +-------------+
//!     | Registered  |  (added to a core)
//!     +------+------+
//!            |
//!            v  initialize()  (exactly once per core)
//!     +------+------+
//!     | Initialized |<----+ update() (any number of times)
//!     +------+------+-----+
//!            |
//!            v  teardown()    (at most once; owner must match)
//!     +------+------+
//!     |  TornDown   |  (forwards items, never processes)
//!     +-------------+
//! ```
//!
//! `disabled` is orthogonal to the state: a disabled plugin keeps its state
//! but forwards items like a torn-down one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{TelemetryPlugin, call_plugin_preserving_error};
use crate::config::ConfigSnapshot;
use crate::core::{CoreHandle, CoreId};
use crate::errors::{CoreError, CoreResult};
use crate::pipeline::ChainNode;

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Known to the core but not yet initialized
    Registered,

    /// `initialize` completed
    Initialized,

    /// `teardown` was called; the plugin only forwards from now on
    TornDown,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Registered => write!(f, "registered"),
            PluginState::Initialized => write!(f, "initialized"),
            PluginState::TornDown => write!(f, "torn_down"),
        }
    }
}

impl PluginState {
    pub fn can_initialize(&self) -> bool {
        matches!(self, PluginState::Registered)
    }

    pub fn can_teardown(&self) -> bool {
        !matches!(self, PluginState::TornDown)
    }
}

/// Mutable lifecycle record for one plugin
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub state: PluginState,

    /// Core that initialized the plugin, if any
    pub owner: Option<CoreId>,

    pub disabled: bool,

    pub loaded_at: Instant,

    pub last_active: Instant,

    /// Number of successful chain calls
    pub call_count: u64,

    /// Number of failed chain calls
    pub error_count: u64,

    pub last_error: Option<String>,
}

impl PluginEntry {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: PluginState::Registered,
            owner: None,
            disabled: false,
            loaded_at: now,
            last_active: now,
            call_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn record_success(&mut self) {
        self.last_active = Instant::now();
        self.call_count += 1;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_active = Instant::now();
        self.error_count += 1;
        self.last_error = Some(error.into());
    }

    pub fn transition(&mut self, new_state: PluginState) {
        tracing::debug!(
            from = %self.state,
            to = %new_state,
            "Plugin state transition"
        );
        self.state = new_state;
    }

    fn owned_by(&self, core: CoreId) -> bool {
        self.owner.is_none_or(|owner| owner == core)
    }
}

impl Default for PluginEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, lock-protected lifecycle record for one plugin in one core
#[derive(Debug)]
pub struct PluginStatus {
    identifier: String,
    entry: Mutex<PluginEntry>,
}

impl PluginStatus {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            entry: Mutex::new(PluginEntry::new()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn snapshot(&self) -> PluginEntry {
        self.entry.lock().clone()
    }

    pub fn state(&self) -> PluginState {
        self.entry.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == PluginState::Initialized
    }

    pub fn is_torn_down(&self) -> bool {
        self.state() == PluginState::TornDown
    }

    pub fn is_disabled(&self) -> bool {
        self.entry.lock().disabled
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.entry.lock().disabled = disabled;
    }

    /// Enabled means neither disabled nor torn down
    pub fn is_enabled(&self) -> bool {
        let entry = self.entry.lock();
        !entry.disabled && entry.state != PluginState::TornDown
    }

    pub fn can_process(&self) -> bool {
        self.is_enabled()
    }

    /// Move from `Registered` to `Initialized`; returns false when the
    /// plugin was already initialized or torn down.
    pub fn mark_initialized(&self, owner: CoreId) -> bool {
        let mut entry = self.entry.lock();
        if !entry.state.can_initialize() {
            return false;
        }
        entry.owner = Some(owner);
        entry.transition(PluginState::Initialized);
        true
    }

    /// Record a plugin that reports itself initialized by someone else.
    /// No owner is recorded, so any core may later attempt its teardown.
    pub fn adopt(&self) -> bool {
        let mut entry = self.entry.lock();
        if !entry.state.can_initialize() {
            return false;
        }
        entry.transition(PluginState::Initialized);
        true
    }

    /// Claim the single teardown of this plugin for `core`.
    ///
    /// Fails when already torn down or when another core owns the plugin.
    pub fn begin_teardown(&self, core: CoreId) -> bool {
        let mut entry = self.entry.lock();
        if !entry.state.can_teardown() || !entry.owned_by(core) {
            return false;
        }
        entry.owner = None;
        entry.transition(PluginState::TornDown);
        true
    }

    pub fn can_update(&self, core: CoreId) -> bool {
        let entry = self.entry.lock();
        entry.state != PluginState::TornDown && entry.owned_by(core)
    }

    pub fn record_success(&self) {
        self.entry.lock().record_success();
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.entry.lock().record_error(error);
    }
}

/// Per-core table of plugin statuses keyed by identifier
#[derive(Debug, Default)]
pub struct PluginStatusTable {
    statuses: DashMap<String, Arc<PluginStatus>>,
}

impl PluginStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_register(&self, identifier: &str) -> Arc<PluginStatus> {
        self.statuses
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(PluginStatus::new(identifier)))
            .clone()
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<PluginStatus>> {
        self.statuses.get(identifier).map(|s| s.clone())
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<PluginStatus>> {
        self.statuses.remove(identifier).map(|(_, status)| status)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn clear(&self) {
        self.statuses.clear();
    }
}

/// Initialize `plugin` for `core` unless its status says it already was.
///
/// A plugin reporting `is_initialized() == Some(true)` was set up elsewhere
/// and is adopted without another `initialize` call.
pub(crate) fn initialize_plugin(
    plugin: &Arc<dyn TelemetryPlugin>,
    status: &PluginStatus,
    config: &Arc<ConfigSnapshot>,
    core: &CoreHandle,
    extensions: &[Arc<dyn TelemetryPlugin>],
    chain: Option<&Arc<ChainNode>>,
) -> CoreResult<()> {
    if !status.state().can_initialize() {
        return Ok(());
    }
    if plugin.is_initialized() == Some(true) {
        status.adopt();
        return Ok(());
    }

    tracing::debug!(plugin_id = %plugin.identifier(), core = %core.id(), "Initializing plugin");
    call_plugin_preserving_error(AssertUnwindSafe(|| {
        plugin.initialize(config, core, extensions, chain)
    }))
    .map_err(|source| {
        status.record_error(source.to_string());
        CoreError::Plugin {
            identifier: plugin.identifier().to_string(),
            source,
        }
    })?;

    status.mark_initialized(core.id());
    Ok(())
}
