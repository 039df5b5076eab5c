//! Plugin registry operations: lookup, runtime add, removal

use std::sync::{Arc, Weak};

use super::{CoreInner, Lifecycle, TelemetryCore, is_builtin, validate_plugin};
use crate::errors::{CoreError, CoreResult};
use crate::pipeline::{
    LifecycleContext, UnloadReason, UnloadState, UpdateReason, UpdateState, build_chain,
};
use crate::plugin::{PluginCompletion, PluginEntry, PluginStatus, TelemetryPlugin, plugin_ids};

/// A loaded plugin together with its per-core status
pub struct LoadedPlugin {
    plugin: Arc<dyn TelemetryPlugin>,
    status: Arc<PluginStatus>,
    core: Weak<CoreInner>,
}

impl LoadedPlugin {
    pub fn plugin(&self) -> &Arc<dyn TelemetryPlugin> {
        &self.plugin
    }

    pub fn identifier(&self) -> &str {
        self.plugin.identifier()
    }

    /// Lifecycle state and call statistics
    pub fn status(&self) -> PluginEntry {
        self.status.snapshot()
    }

    pub fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    /// A disabled plugin is skipped during processing; the chain forwards
    /// around it
    pub fn set_enabled(&self, enabled: bool) {
        self.status.set_disabled(!enabled);
    }

    /// Tear the plugin down and take it out of the core. False when the core
    /// is gone or the plugin was no longer loaded.
    pub async fn remove(self, is_async: bool) -> bool {
        let Some(inner) = self.core.upgrade() else {
            return false;
        };
        let core = TelemetryCore { inner };
        let state = UnloadState::new(UnloadReason::PluginUnload, is_async);
        if !core.remove_plugins(vec![self.plugin], &state).await {
            return false;
        }

        let update = UpdateState::new(UpdateReason::PLUGIN_REMOVED, core.config());
        let completion = core.do_update(&update);
        if is_async {
            completion.wait().await;
        } else {
            completion.detach();
        }
        true
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("identifier", &self.plugin.identifier())
            .field("state", &self.status.state())
            .field("enabled", &self.status.is_enabled())
            .finish()
    }
}

impl TelemetryCore {
    fn find_plugin(&self, identifier: &str) -> Option<Arc<dyn TelemetryPlugin>> {
        if identifier == self.inner.controller.identifier() {
            return Some(self.inner.controller.clone());
        }
        if identifier == self.inner.initializers.identifier() {
            return Some(self.inner.initializers.clone());
        }

        let plugins = self.inner.plugins.read();
        plugins
            .extensions
            .iter()
            .chain(plugins.channel_queues.iter().flatten())
            .find(|plugin| plugin.identifier() == identifier)
            .cloned()
    }

    /// Look a plugin up by identifier, across extensions and channel queues
    pub fn get_plugin(&self, identifier: &str) -> Option<LoadedPlugin> {
        let plugin = self.find_plugin(identifier)?;
        let status = self.inner.statuses.get_or_register(identifier);
        Some(LoadedPlugin {
            plugin,
            status,
            core: Arc::downgrade(&self.inner),
        })
    }

    /// Add a plugin to a core, initialized or not.
    ///
    /// With `replace_existing` a plugin already loaded under the same
    /// identifier is torn down first; without it the add fails. On an
    /// initialized core the chain is rebuilt, the new plugin initialized and
    /// every plugin notified with `PLUGIN_ADDED`. A failed add leaves the
    /// chain as it was.
    pub async fn add_plugin(
        &self,
        plugin: Arc<dyn TelemetryPlugin>,
        replace_existing: bool,
        is_async: bool,
    ) -> CoreResult<()> {
        validate_plugin(&plugin)?;
        if self.lifecycle() == Lifecycle::Unloading {
            return Err(CoreError::Unloading);
        }

        let identifier = plugin.identifier().to_string();
        let mut reason = UpdateReason::PLUGIN_ADDED;
        let mut removed = Vec::new();

        if let Some(existing) = self.find_plugin(&identifier) {
            if Arc::ptr_eq(&existing, &plugin) {
                return Ok(());
            }
            if !replace_existing {
                return Err(CoreError::DuplicatePlugin(identifier));
            }

            let state = UnloadState::new(UnloadReason::PluginReplace, is_async);
            self.remove_plugins(vec![existing.clone()], &state).await;
            removed.push(existing);
            reason |= UpdateReason::PLUGIN_REMOVED;
        }

        self.inner.plugins.write().extensions.push(plugin.clone());
        if !self.is_initialized() {
            return Ok(());
        }

        let snapshot = self.config();
        if let Err(err) = self.init_plugin_chain(&snapshot, false) {
            tracing::warn!(plugin_id = %identifier, error = %err, "Failed to add plugin");
            self.inner
                .plugins
                .write()
                .extensions
                .retain(|p| !Arc::ptr_eq(p, &plugin));
            self.inner.statuses.remove(&identifier);
            if let Err(rebuild) = self.init_plugin_chain(&snapshot, false) {
                tracing::warn!(error = %rebuild, "Failed to restore plugin chain");
            }
            return Err(err);
        }

        let mut update = UpdateState::new(reason, snapshot);
        update.added = vec![plugin];
        update.removed = removed;
        let completion = self.do_update(&update);
        if is_async {
            completion.wait().await;
        } else {
            completion.detach();
        }
        Ok(())
    }

    /// Tear `plugins` down and drop them from extensions and channel queues,
    /// then rebuild the chain. Built-in plugins are never removed. Returns
    /// false when none of `plugins` was loaded.
    pub(super) async fn remove_plugins(
        &self,
        plugins: Vec<Arc<dyn TelemetryPlugin>>,
        state: &UnloadState,
    ) -> bool {
        let plugins: Vec<_> = plugins
            .into_iter()
            .filter(|plugin| !is_builtin(plugin.identifier()))
            .collect();
        if plugins.is_empty() {
            return false;
        }

        let loaded = {
            let current = self.inner.plugins.read();
            plugins.iter().any(|plugin| {
                current
                    .extensions
                    .iter()
                    .chain(current.channel_queues.iter().flatten())
                    .any(|p| Arc::ptr_eq(p, plugin))
            })
        };
        if !loaded {
            return false;
        }

        tracing::debug!(plugins = ?plugin_ids(&plugins), reason = ?state.reason, "Removing plugins");

        if self.is_initialized() {
            let ctx = LifecycleContext::new(self.handle(), self.config());
            let completion = build_chain(&plugins, &self.inner.statuses, None)
                .map(|head| {
                    PluginCompletion::join(
                        head.iter()
                            .map(|node| node.unload(&ctx, state))
                            .collect::<Vec<_>>(),
                    )
                })
                .unwrap_or(PluginCompletion::Done);
            if state.is_async {
                completion.wait().await;
            } else {
                completion.detach();
            }
        }

        {
            let mut current = self.inner.plugins.write();
            current
                .extensions
                .retain(|p| !plugins.iter().any(|removed| Arc::ptr_eq(p, removed)));
            for queue in current.channel_queues.iter_mut() {
                queue.retain(|p| !plugins.iter().any(|removed| Arc::ptr_eq(p, removed)));
            }
            current.channel_queues.retain(|queue| !queue.is_empty());
        }
        for plugin in &plugins {
            self.inner.statuses.remove(plugin.identifier());
        }

        if self.is_initialized() {
            let snapshot = self.config();
            if let Err(err) = self.init_plugin_chain(&snapshot, false) {
                tracing::warn!(error = %err, "Failed to rebuild plugin chain after removal");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSnapshot, CoreConfig};
    use crate::core::CoreHandle;
    use crate::item::TelemetryItem;
    use crate::pipeline::{ChainNode, ProcessContext};
    use crate::plugin::{PluginError, PluginState};
    use parking_lot::Mutex;

    struct Recorder {
        id: &'static str,
        priority: i32,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl TelemetryPlugin for Recorder {
        fn identifier(&self) -> &str {
            self.id
        }

        fn priority(&self) -> Option<i32> {
            Some(self.priority)
        }

        fn initialize(
            &self,
            _config: &Arc<ConfigSnapshot>,
            _core: &CoreHandle,
            _extensions: &[Arc<dyn TelemetryPlugin>],
            _chain: Option<&Arc<ChainNode>>,
        ) -> Result<(), PluginError> {
            Ok(())
        }

        fn process_telemetry(
            &self,
            item: &mut TelemetryItem,
            ctx: &mut ProcessContext,
        ) -> Result<(), PluginError> {
            self.seen.lock().push(format!("{}:{}", self.id, item.name));
            ctx.process_next(item);
            Ok(())
        }
    }

    fn recorder(
        id: &'static str,
        priority: i32,
        seen: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn TelemetryPlugin> {
        Arc::new(Recorder {
            id,
            priority,
            seen: seen.clone(),
        })
    }

    fn started(seen: &Arc<Mutex<Vec<String>>>) -> TelemetryCore {
        let core = TelemetryCore::new();
        core.initialize(CoreConfig::new("ikey"), vec![recorder("channel", 600, seen)])
            .unwrap();
        core
    }

    #[tokio::test]
    async fn test_add_plugin_joins_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let core = started(&seen);

        core.add_plugin(recorder("proc", 10, &seen), false, true)
            .await
            .unwrap();
        core.track(TelemetryItem::new("evt"));

        assert_eq!(*seen.lock(), vec!["proc:evt", "channel:evt"]);
        assert_eq!(
            core.get_plugin("proc").unwrap().status().state,
            PluginState::Initialized
        );
    }

    #[tokio::test]
    async fn test_add_duplicate_requires_replace() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let core = started(&seen);
        let first = recorder("proc", 10, &seen);
        core.add_plugin(first.clone(), false, true).await.unwrap();

        // same instance is a no-op
        core.add_plugin(first, false, true).await.unwrap();

        let err = core
            .add_plugin(recorder("proc", 20, &seen), false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicatePlugin(_)));

        core.add_plugin(recorder("proc", 20, &seen), true, true)
            .await
            .unwrap();
        assert_eq!(core.get_plugin("proc").unwrap().plugin().priority(), Some(20));
    }

    #[tokio::test]
    async fn test_remove_and_disable() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let core = started(&seen);
        core.add_plugin(recorder("proc", 10, &seen), false, true)
            .await
            .unwrap();

        let loaded = core.get_plugin("proc").unwrap();
        loaded.set_enabled(false);
        core.track(TelemetryItem::new("a"));
        assert_eq!(*seen.lock(), vec!["channel:a"]);

        assert!(loaded.remove(true).await);
        assert!(core.get_plugin("proc").is_none());
        core.track(TelemetryItem::new("b"));
        assert_eq!(seen.lock().last().map(String::as_str), Some("channel:b"));
    }

    #[tokio::test]
    async fn test_builtins_are_visible_but_protected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let core = started(&seen);
        assert!(core.get_plugin("ChannelControllerPlugin").is_some());
        assert!(core.get_plugin("TelemetryInitializerPlugin").is_some());
        assert!(core.get_plugin("channel").is_some());

        let controller = core.get_plugin("ChannelControllerPlugin").unwrap();
        assert!(!controller.remove(true).await);
        assert!(core.get_plugin("ChannelControllerPlugin").is_some());
    }

    #[tokio::test]
    async fn test_add_before_initialize_is_deferred() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let core = TelemetryCore::new();
        core.add_plugin(recorder("channel", 600, &seen), false, false)
            .await
            .unwrap();

        core.initialize(CoreConfig::new("ikey"), Vec::new()).unwrap();
        core.track(TelemetryItem::new("evt"));
        assert_eq!(*seen.lock(), vec!["channel:evt"]);
    }
}
