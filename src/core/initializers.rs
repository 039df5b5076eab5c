//! Built-in processor running caller-registered telemetry initializers
//!
//! Sits at priority 199, ahead of every channel, so initializers see each
//! item before delivery. An initializer returning `false` drops the item.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::config::ConfigSnapshot;
use crate::core::CoreHandle;
use crate::diagnostics::{LoggingSeverity, MessageId};
use crate::item::TelemetryItem;
use crate::pipeline::{ChainNode, ProcessContext, UnloadContext, UnloadState, UpdateContext, UpdateState};
use crate::plugin::{
    PluginBase, PluginCompletion, PluginError, TelemetryPlugin, call_plugin_safely_value,
};

pub const TELEMETRY_INITIALIZER_IDENTIFIER: &str = "TelemetryInitializerPlugin";
pub const TELEMETRY_INITIALIZER_PRIORITY: i32 = 199;

pub type TelemetryInitializer = Arc<dyn Fn(&mut TelemetryItem) -> bool + Send + Sync>;

#[derive(Default)]
pub struct TelemetryInitializerPlugin {
    base: PluginBase,
    initializers: RwLock<Vec<(u64, TelemetryInitializer)>>,
    next_id: AtomicU64,
}

impl TelemetryInitializerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(self: &Arc<Self>, initializer: F) -> TelemetryInitializerHandle
    where
        F: Fn(&mut TelemetryItem) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.initializers.write().push((id, Arc::new(initializer)));
        TelemetryInitializerHandle {
            id,
            plugin: Arc::downgrade(self),
        }
    }

    pub fn len(&self) -> usize {
        self.initializers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.read().is_empty()
    }

    fn remove(&self, id: u64) {
        self.initializers.write().retain(|(existing, _)| *existing != id);
    }
}

impl TelemetryPlugin for TelemetryInitializerPlugin {
    fn identifier(&self) -> &str {
        TELEMETRY_INITIALIZER_IDENTIFIER
    }

    fn priority(&self) -> Option<i32> {
        Some(TELEMETRY_INITIALIZER_PRIORITY)
    }

    fn initialize(
        &self,
        config: &Arc<ConfigSnapshot>,
        core: &CoreHandle,
        _extensions: &[Arc<dyn TelemetryPlugin>],
        _chain: Option<&Arc<ChainNode>>,
    ) -> Result<(), PluginError> {
        self.base.initialize(config, core);
        Ok(())
    }

    fn is_initialized(&self) -> Option<bool> {
        Some(self.base.is_initialized())
    }

    fn process_telemetry(
        &self,
        item: &mut TelemetryItem,
        ctx: &mut ProcessContext,
    ) -> Result<(), PluginError> {
        // snapshot so an initializer may add or remove initializers
        let initializers = self.initializers.read().clone();

        for (_, initializer) in initializers {
            match call_plugin_safely_value(AssertUnwindSafe(|| initializer(item))) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) => ctx.diag_log().throw_internal(
                    LoggingSeverity::Critical,
                    MessageId::TELEMETRY_INITIALIZER_FAILED,
                    &format!("One of telemetry initializers failed, telemetry item will not be sent: {err}"),
                    None,
                    true,
                ),
            }
        }

        self.base.process_next(item, ctx);
        Ok(())
    }

    fn teardown(&self, ctx: &UnloadContext, state: &UnloadState) -> PluginCompletion {
        self.base.teardown(ctx, state, |_, _| {
            self.initializers.write().clear();
            PluginCompletion::Done
        })
    }

    fn update(&self, ctx: &UpdateContext, state: &UpdateState) -> PluginCompletion {
        self.base.update(ctx, state, |_, _| PluginCompletion::Done)
    }
}

/// Returned by `add_telemetry_initializer`; removes the initializer
pub struct TelemetryInitializerHandle {
    id: u64,
    plugin: Weak<TelemetryInitializerPlugin>,
}

impl TelemetryInitializerHandle {
    pub fn remove(self) {
        if let Some(plugin) = self.plugin.upgrade() {
            plugin.remove(self.id);
        }
    }
}
