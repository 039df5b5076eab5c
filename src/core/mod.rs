//! Core orchestrator
//!
//! ```text
//!   track(item)
//!       |
//!       v
//!   activation status --- NONE / PENDING ---> in-memory queue (released in order on ACTIVE)
//!       |             \-- INACTIVE ---------> dropped
//!       | ACTIVE
//!       v
//!   ProcessContext --> processors --> initializers (199) --> ChannelController (500) --> queues
//!                                                                    |
//!                                                                    v
//!                                                               extensions (forward only)
//! ```
//!
//! The core owns the configuration snapshot, the sorted plugin chain and the
//! activation state machine. Plugins receive a [`CoreHandle`], a weak
//! reference, so a plugin holding on to it never keeps the core alive.
//!
//! Locks guard bookkeeping only; no lock is held while a plugin runs.

mod activation;
mod initializers;
mod internal_logs;
mod plugins;
mod teardown;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::channel::{CHANNEL_CONTROLLER_IDENTIFIER, ChannelController};
use crate::config::{ConfigDelta, ConfigSnapshot, CoreConfig, Deferred};
use crate::diagnostics::{DiagnosticLogger, LoggingSeverity, MessageId};
use crate::errors::{CoreError, CoreResult};
use crate::item::TelemetryItem;
use crate::pipeline::{
    ChainNode, LifecycleContext, ProcessContext, UnloadContext, UnloadState, UpdateReason,
    UpdateState, build_chain, sort_plugins, warn_duplicate_priorities,
};
use crate::plugin::{
    PluginCompletion, PluginStatusTable, TelemetryPlugin, initialize_plugin, is_channel_priority,
    plugin_ids,
};
use crate::unload::{UnloadHandlerContainer, UnloadHook, UnloadHookContainer};

use activation::{ActivationState, Evaluation, InactiveReason, Outcome};

pub use activation::ActiveStatus;
pub use initializers::{
    TELEMETRY_INITIALIZER_IDENTIFIER, TELEMETRY_INITIALIZER_PRIORITY, TelemetryInitializer,
    TelemetryInitializerHandle, TelemetryInitializerPlugin,
};
pub use plugins::LoadedPlugin;

/// Default bound on channel flushes and asynchronous teardown during unload
pub const DEFAULT_CB_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Identity of one core instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(pub u64);

impl CoreId {
    /// Id carried by contexts that belong to no core
    pub const DETACHED: CoreId = CoreId(0);

    fn next() -> Self {
        static NEXT_CORE_ID: AtomicU64 = AtomicU64::new(1);
        CoreId(NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core-{}", self.0)
    }
}

/// The reference plugins hold to their core
#[derive(Clone)]
pub struct CoreHandle {
    id: CoreId,
    inner: Weak<CoreInner>,
    logger: Arc<DiagnosticLogger>,
}

impl CoreHandle {
    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn logger(&self) -> Arc<DiagnosticLogger> {
        self.logger.clone()
    }

    /// The core, while it is still alive
    pub fn upgrade(&self) -> Option<TelemetryCore> {
        self.inner.upgrade().map(|inner| TelemetryCore { inner })
    }

    /// Track through the owning core; false when the core is gone
    pub fn track(&self, item: TelemetryItem) -> bool {
        match self.upgrade() {
            Some(core) => {
                core.track(item);
                true
            }
            None => false,
        }
    }

    pub fn config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.upgrade().map(|core| core.config())
    }

    pub fn active_status(&self) -> ActiveStatus {
        self.upgrade()
            .map(|core| core.active_status())
            .unwrap_or_default()
    }
}

impl fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreHandle")
            .field("id", &self.id)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Lifecycle {
    #[default]
    Created,
    Initialized,
    Unloading,
}

#[derive(Default)]
struct CoreState {
    lifecycle: Lifecycle,
    activation: ActivationState,
}

#[derive(Default)]
struct PluginSet {
    /// Extensions as configured: embedded in config, then passed in, then added
    extensions: Vec<Arc<dyn TelemetryPlugin>>,
    /// Explicit channel queues
    channel_queues: Vec<Vec<Arc<dyn TelemetryPlugin>>>,
    /// Main chain members in chain order
    sorted: Vec<Arc<dyn TelemetryPlugin>>,
    chain: Option<Arc<ChainNode>>,
}

struct CoreInner {
    id: CoreId,
    logger: Arc<DiagnosticLogger>,
    config: ArcSwap<ConfigSnapshot>,
    state: Mutex<CoreState>,
    plugins: RwLock<PluginSet>,
    statuses: Arc<PluginStatusTable>,
    controller: Arc<ChannelController>,
    initializers: Arc<TelemetryInitializerPlugin>,
    unload_handlers: UnloadHandlerContainer,
    unload_hooks: UnloadHookContainer,
    poller: Mutex<Option<CancellationToken>>,
    internal_log_event: RwLock<Option<String>>,
}

/// The telemetry core: owns configuration, the plugin chain and activation
#[derive(Clone)]
pub struct TelemetryCore {
    inner: Arc<CoreInner>,
}

impl Default for TelemetryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TelemetryCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TelemetryCore")
            .field("id", &self.inner.id)
            .field("lifecycle", &state.lifecycle)
            .field("status", &state.activation.status)
            .field("config_version", &self.inner.config.load().version())
            .finish()
    }
}

impl TelemetryCore {
    pub fn new() -> Self {
        Self::with_logger(Arc::new(DiagnosticLogger::default()))
    }

    /// A core reporting through `logger`, e.g. one with a custom console sink
    pub fn with_logger(logger: Arc<DiagnosticLogger>) -> Self {
        let statuses = Arc::new(PluginStatusTable::new());
        let inner = CoreInner {
            id: CoreId::next(),
            logger,
            config: ArcSwap::from_pointee(ConfigSnapshot::default()),
            state: Mutex::new(CoreState::default()),
            plugins: RwLock::new(PluginSet::default()),
            controller: Arc::new(ChannelController::new(statuses.clone())),
            statuses,
            initializers: Arc::new(TelemetryInitializerPlugin::new()),
            unload_handlers: UnloadHandlerContainer::new(),
            unload_hooks: UnloadHookContainer::new(),
            poller: Mutex::new(None),
            internal_log_event: RwLock::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> CoreId {
        self.inner.id
    }

    pub fn handle(&self) -> CoreHandle {
        CoreHandle {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
            logger: self.inner.logger.clone(),
        }
    }

    pub fn logger(&self) -> Arc<DiagnosticLogger> {
        self.inner.logger.clone()
    }

    /// The configuration snapshot currently in effect
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.inner.config.load_full()
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle() == Lifecycle::Initialized
    }

    pub fn active_status(&self) -> ActiveStatus {
        self.inner.state.lock().activation.status
    }

    fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Initialize the core with `config` and `extensions`.
    ///
    /// Configuration errors are returned here and leave the core
    /// uninitialized. A missing or empty literal key additionally leaves the
    /// status at INACTIVE. Deferred key or endpoint values require a running
    /// tokio runtime.
    pub fn initialize(
        &self,
        config: CoreConfig,
        extensions: Vec<Arc<dyn TelemetryPlugin>>,
    ) -> CoreResult<()> {
        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Initialized => return Err(CoreError::AlreadyInitialized),
            Lifecycle::Unloading => return Err(CoreError::Unloading),
        }

        let snapshot = Arc::new(self.inner.config.load().successor(config));
        self.inner.logger.configure(snapshot.logger_settings());
        self.inner.config.store(snapshot.clone());

        let key_missing = match &snapshot.instrumentation_key {
            None => true,
            Some(key) => key.value().is_some_and(|key| key.trim().is_empty()),
        };
        if key_missing {
            self.inner
                .state
                .lock()
                .activation
                .transition(ActiveStatus::Inactive);
            self.inner.logger.throw_internal(
                LoggingSeverity::Critical,
                MessageId::INVALID_INSTRUMENTATION_KEY,
                "Please provide instrumentation key",
                None,
                true,
            );
            return Err(CoreError::MissingInstrumentationKey);
        }

        if has_pending_values(&snapshot) && tokio::runtime::Handle::try_current().is_err() {
            return Err(CoreError::RuntimeUnavailable);
        }

        // plugins added before initialize follow the configured ones
        let added = self.inner.plugins.read().extensions.clone();
        let all = extensions.into_iter().chain(added.iter().cloned()).collect();
        let extensions = collect_extensions(&snapshot, all)?;
        {
            let mut plugins = self.inner.plugins.write();
            plugins.extensions = extensions;
            plugins.channel_queues = snapshot.channels.clone();
        }

        if let Err(err) = self.init_plugin_chain(&snapshot, true) {
            *self.inner.plugins.write() = PluginSet {
                extensions: added,
                ..PluginSet::default()
            };
            self.inner.statuses.clear();
            return Err(err);
        }

        self.inner.state.lock().lifecycle = Lifecycle::Initialized;
        tracing::info!(
            core = %self.inner.id,
            plugins = self.inner.plugins.read().sorted.len(),
            channels = self.inner.controller.channels().len(),
            "Telemetry core initialized"
        );

        self.evaluate_activation();
        self.poll_internal_logs(None);
        Ok(())
    }

    /// Partition, sort, link and initialize the plugins
    fn init_plugin_chain(
        &self,
        snapshot: &Arc<ConfigSnapshot>,
        require_channels: bool,
    ) -> CoreResult<()> {
        let (extensions, explicit) = {
            let plugins = self.inner.plugins.read();
            (plugins.extensions.clone(), plugins.channel_queues.clone())
        };

        let queued: HashSet<String> = explicit
            .iter()
            .flatten()
            .map(|plugin| plugin.identifier().to_string())
            .collect();

        let mut implicit = Vec::new();
        let mut sorted: Vec<Arc<dyn TelemetryPlugin>> = Vec::new();
        for plugin in extensions {
            if !is_channel_priority(plugin.priority()) {
                sorted.push(plugin);
            } else if !queued.contains(plugin.identifier()) {
                implicit.push(plugin);
            }
        }

        self.inner.controller.configure(explicit, implicit)?;
        if require_channels && self.inner.controller.channels().is_empty() {
            return Err(CoreError::NoChannels);
        }

        sorted.push(self.inner.initializers.clone());
        sorted.push(self.inner.controller.clone());
        sort_plugins(&mut sorted);
        warn_duplicate_priorities(&sorted, &self.inner.logger);

        let chain = build_chain(&sorted, &self.inner.statuses, None);
        let all: Vec<Arc<dyn TelemetryPlugin>> = sorted
            .iter()
            .cloned()
            .chain(self.inner.controller.channels())
            .collect();

        let handle = self.handle();
        for node in chain.iter().flat_map(|head| head.iter()) {
            initialize_plugin(
                node.plugin(),
                node.status(),
                snapshot,
                &handle,
                &all,
                chain.as_ref(),
            )?;
        }
        self.inner
            .controller
            .initialize_queues(snapshot, &handle, &all)?;

        tracing::debug!(core = %self.inner.id, chain = ?plugin_ids(&sorted), "Plugin chain built");

        let mut plugins = self.inner.plugins.write();
        plugins.sorted = sorted;
        plugins.chain = chain;
        Ok(())
    }

    fn chain_nodes(&self) -> Vec<Arc<ChainNode>> {
        self.inner
            .plugins
            .read()
            .chain
            .as_ref()
            .map(|head| head.iter().collect())
            .unwrap_or_default()
    }

    /// Submit an item.
    ///
    /// ACTIVE processes it now, NONE and PENDING queue it, INACTIVE and an
    /// unloading core drop it. An item without a name is rejected.
    pub fn track(&self, mut item: TelemetryItem) {
        if item.name.trim().is_empty() {
            self.inner.logger.throw_internal(
                LoggingSeverity::Warning,
                MessageId::INVALID_EVENT,
                "Telemetry item must have a name",
                None,
                true,
            );
            return;
        }

        let ikey = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Unloading {
                return;
            }

            match state.activation.status {
                ActiveStatus::Active => state.activation.ikey.clone(),
                ActiveStatus::Inactive => return,
                ActiveStatus::None | ActiveStatus::Pending => {
                    item.apply_defaults(None);
                    let max = self.inner.config.load().init_in_memo_max_size;
                    if !state.activation.enqueue(item, max) {
                        drop(state);
                        self.inner.logger.throw_internal(
                            LoggingSeverity::Warning,
                            MessageId::IN_MEMORY_STORAGE_BUFFER_FULL,
                            "Maximum in-memory buffer size reached, dropping telemetry",
                            None,
                            true,
                        );
                    }
                    return;
                }
            }
        };

        item.apply_defaults(ikey.as_deref());
        self.process_item(item);
    }

    fn process_item(&self, mut item: TelemetryItem) {
        let mut ctx = self.get_process_context();
        ctx.process_next(&mut item);
    }

    /// A processing context over the current chain
    pub fn get_process_context(&self) -> ProcessContext {
        let chain = self.inner.plugins.read().chain.clone();
        ProcessContext::build(
            Some(self.handle()),
            self.inner.config.load_full(),
            self.inner.logger.clone(),
            self.inner.statuses.clone(),
            chain,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Activation
    // ─────────────────────────────────────────────────────────────────────────────

    /// Open a new epoch and evaluate the key and endpoint of the current
    /// configuration
    fn evaluate_activation(&self) {
        let snapshot = self.inner.config.load_full();
        let evaluation = activation::evaluate(
            snapshot.instrumentation_key.as_ref(),
            snapshot.endpoint_url.as_ref(),
        );
        let epoch = self.inner.state.lock().activation.begin_epoch();

        match evaluation {
            Evaluation::Settled(outcome) => self.apply_activation(epoch, outcome),
            Evaluation::Pending { ikey, endpoint } => {
                self.await_activation(epoch, ikey, endpoint, snapshot.init_timeout)
            }
        }
    }

    fn await_activation(
        &self,
        epoch: u64,
        ikey: Deferred<String>,
        endpoint: Option<Deferred<String>>,
        timeout: Duration,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.apply_activation(epoch, Outcome::Inactive(InactiveReason::RuntimeUnavailable));
            return;
        };

        {
            let mut state = self.inner.state.lock();
            if state.activation.epoch != epoch {
                return;
            }
            state.activation.transition(ActiveStatus::Pending);
        }

        let id = self.inner.id;
        let core = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let resolve = async {
                let ikey = ikey.resolve().await;
                let endpoint = match &endpoint {
                    Some(url) => Some(url.resolve().await),
                    None => None,
                };
                if let Some(Err(err)) = &endpoint {
                    tracing::warn!(core = %id, error = %err, "Endpoint URL rejected; continuing without one");
                }
                activation::settle(ikey, endpoint)
            };
            let outcome = tokio::time::timeout(timeout, resolve)
                .await
                .unwrap_or(Outcome::Inactive(InactiveReason::TimedOut));

            if let Some(inner) = core.upgrade() {
                TelemetryCore { inner }.apply_activation(epoch, outcome);
            }
        });

        let mut state = self.inner.state.lock();
        if state.activation.epoch == epoch {
            state.activation.waiter = Some(task.abort_handle());
        }
    }

    /// Apply an outcome unless a newer evaluation superseded it
    fn apply_activation(&self, epoch: u64, outcome: Outcome) {
        let mut state = self.inner.state.lock();
        if state.activation.epoch != epoch || state.lifecycle == Lifecycle::Unloading {
            tracing::debug!(core = %self.inner.id, epoch, "Ignoring stale activation outcome");
            return;
        }
        state.activation.waiter = None;

        match outcome {
            Outcome::Active { ikey, endpoint } => {
                let resolved = self.write_back_resolved(&ikey, endpoint.as_deref());
                state.activation.ikey = Some(ikey.clone());
                state.activation.endpoint = endpoint;
                state.activation.transition(ActiveStatus::Active);
                let released = state.activation.drain();
                drop(state);

                // plugins see the resolved values before any released item
                if let Some((old_config, new_config)) = resolved {
                    let mut update = UpdateState::new(UpdateReason::CONFIG_CHANGED, new_config);
                    update.old_config = Some(old_config);
                    update.merge = true;
                    self.do_update(&update).detach();
                }

                if !released.is_empty() {
                    tracing::debug!(core = %self.inner.id, count = released.len(), "Releasing queued telemetry");
                }
                for mut item in released {
                    item.apply_defaults(Some(&ikey));
                    self.process_item(item);
                }
            }
            Outcome::Inactive(reason) => {
                let dropped = state.activation.queue.len();
                state.activation.queue.clear();
                state.activation.ikey = None;
                state.activation.endpoint = None;
                state.activation.transition(ActiveStatus::Inactive);
                drop(state);

                tracing::warn!(core = %self.inner.id, %reason, dropped, "Telemetry core is inactive");
                let (id, user_actionable) = match reason {
                    InactiveReason::MissingKey | InactiveReason::EmptyKey => {
                        (MessageId::INVALID_INSTRUMENTATION_KEY, true)
                    }
                    _ => (MessageId::INIT_PROMISE_EXCEPTION, false),
                };
                self.inner.logger.throw_internal(
                    LoggingSeverity::Critical,
                    id,
                    &format!("Telemetry core is inactive: {reason}"),
                    None,
                    user_actionable,
                );
            }
        }
    }

    /// Replace settled deferred values in the configuration with their
    /// literals. Called with the state lock held. Returns the replaced and
    /// published snapshots when anything changed.
    fn write_back_resolved(
        &self,
        ikey: &str,
        endpoint: Option<&str>,
    ) -> Option<(Arc<ConfigSnapshot>, Arc<ConfigSnapshot>)> {
        let current = self.inner.config.load_full();
        let key_pending = current
            .instrumentation_key
            .as_ref()
            .is_some_and(Deferred::is_pending);
        let url_pending = current.endpoint_url.as_ref().is_some_and(Deferred::is_pending);
        if !key_pending && !url_pending {
            return None;
        }

        let mut config = current.config().clone();
        if key_pending {
            config.instrumentation_key = Some(Deferred::Ready(ikey.to_string()));
        }
        if url_pending {
            config.endpoint_url = endpoint.map(|url| Deferred::Ready(url.to_string()));
        }
        let resolved = Arc::new(current.successor(config));
        self.inner.config.store(resolved.clone());
        Some((current, resolved))
    }

    /// Re-evaluate after the key or endpoint changed. A new literal applies
    /// immediately; a new future on a settled core is picked up on the next
    /// scheduling tick.
    fn reevaluate_activation(&self, snapshot: &ConfigSnapshot) {
        let status = self.active_status();
        if !has_pending_values(snapshot) || status == ActiveStatus::Pending {
            self.evaluate_activation();
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.evaluate_activation();
            return;
        };

        let epoch = self.inner.state.lock().activation.begin_epoch();
        let core = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            let Some(inner) = core.upgrade() else {
                return;
            };
            let current = inner.state.lock().activation.epoch;
            if current == epoch {
                TelemetryCore { inner }.evaluate_activation();
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────────

    /// Apply `delta`, publish the new snapshot, then notify every plugin.
    ///
    /// Synchronous `update` implementations have observed the new snapshot
    /// when this returns; the completion covers asynchronous ones.
    pub fn update_cfg(&self, delta: ConfigDelta, merge: bool) -> PluginCompletion {
        let (old_config, new_config) = {
            let state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Initialized {
                tracing::debug!(core = %self.inner.id, "Ignoring configuration update before initialize");
                return PluginCompletion::Done;
            }
            let old_config = self.inner.config.load_full();
            let new_config = Arc::new(old_config.successor(delta.apply(&old_config, merge)));
            self.inner.config.store(new_config.clone());
            (old_config, new_config)
        };

        self.inner.logger.configure(new_config.logger_settings());
        tracing::debug!(core = %self.inner.id, version = new_config.version(), merge, "Configuration updated");

        if delta.touches_activation(merge) {
            self.reevaluate_activation(&new_config);
        }

        let mut update = UpdateState::new(UpdateReason::CONFIG_CHANGED, new_config);
        update.old_config = Some(old_config);
        update.merge = merge;
        self.do_update(&update)
    }

    /// Notify every chain node; the controller forwards to its queues
    fn do_update(&self, update: &UpdateState) -> PluginCompletion {
        let ctx = LifecycleContext::new(self.handle(), update.config.clone());
        PluginCompletion::join(
            self.chain_nodes()
                .iter()
                .map(|node| node.update(&ctx, update))
                .collect::<Vec<_>>(),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Registries
    // ─────────────────────────────────────────────────────────────────────────────

    /// Every channel plugin across all queues
    pub fn get_channels(&self) -> Vec<Arc<dyn TelemetryPlugin>> {
        self.inner.controller.channels()
    }

    pub fn channel_controller(&self) -> Arc<ChannelController> {
        self.inner.controller.clone()
    }

    /// Register a handler run once when the core unloads
    pub fn add_unload_cb<F>(&self, handler: F)
    where
        F: FnOnce(&UnloadContext, &UnloadState) + Send + 'static,
    {
        self.inner.unload_handlers.add(handler);
    }

    /// Register a hook released once when the core unloads
    pub fn add_unload_hook(&self, hook: UnloadHook) {
        self.inner.unload_hooks.add(hook);
    }

    /// Run `initializer` on every item before any channel sees it
    pub fn add_telemetry_initializer<F>(&self, initializer: F) -> TelemetryInitializerHandle
    where
        F: Fn(&mut TelemetryItem) -> bool + Send + Sync + 'static,
    {
        self.inner.initializers.add(initializer)
    }
}

fn has_pending_values(config: &CoreConfig) -> bool {
    config
        .instrumentation_key
        .as_ref()
        .is_some_and(Deferred::is_pending)
        || config.endpoint_url.as_ref().is_some_and(Deferred::is_pending)
}

fn is_builtin(identifier: &str) -> bool {
    identifier == CHANNEL_CONTROLLER_IDENTIFIER || identifier == TELEMETRY_INITIALIZER_IDENTIFIER
}

fn validate_plugin(plugin: &Arc<dyn TelemetryPlugin>) -> CoreResult<()> {
    let identifier = plugin.identifier();
    if identifier.trim().is_empty() {
        return Err(CoreError::InvalidPlugin("plugin identifier is empty".to_string()));
    }
    if is_builtin(identifier) {
        return Err(CoreError::DuplicatePlugin(identifier.to_string()));
    }
    Ok(())
}

/// Extensions embedded in configuration followed by those passed in. The
/// same instance listed twice is kept once; two instances sharing an
/// identifier are rejected.
fn collect_extensions(
    config: &CoreConfig,
    passed: Vec<Arc<dyn TelemetryPlugin>>,
) -> CoreResult<Vec<Arc<dyn TelemetryPlugin>>> {
    let mut all: Vec<Arc<dyn TelemetryPlugin>> = Vec::new();

    for plugin in config.extensions.iter().cloned().chain(passed) {
        validate_plugin(&plugin)?;
        match all.iter().find(|p| p.identifier() == plugin.identifier()) {
            Some(existing) if Arc::ptr_eq(existing, &plugin) => {}
            Some(_) => return Err(CoreError::DuplicatePlugin(plugin.identifier().to_string())),
            None => all.push(plugin),
        }
    }

    for plugin in config.channels.iter().flatten() {
        validate_plugin(plugin)?;
    }

    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProcessContext;
    use crate::plugin::PluginError;
    use parking_lot::Mutex as PlMutex;

    struct Sink {
        seen: Arc<PlMutex<Vec<TelemetryItem>>>,
    }

    impl TelemetryPlugin for Sink {
        fn identifier(&self) -> &str {
            "sink"
        }

        fn priority(&self) -> Option<i32> {
            Some(600)
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
            self.seen.lock().push(item.clone());
            ctx.process_next(item);
            Ok(())
        }
    }

    fn sink() -> (Arc<dyn TelemetryPlugin>, Arc<PlMutex<Vec<TelemetryItem>>>) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        (Arc::new(Sink { seen: seen.clone() }), seen)
    }

    #[test]
    fn test_core_ids_are_unique() {
        let a = TelemetryCore::new();
        let b = TelemetryCore::new();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), CoreId::DETACHED);
        assert_eq!(CoreId(3).to_string(), "core-3");
    }

    #[test]
    fn test_literal_key_activates_and_delivers() {
        let (channel, seen) = sink();
        let core = TelemetryCore::new();
        core.initialize(CoreConfig::new("ikey"), vec![channel]).unwrap();

        assert_eq!(core.active_status(), ActiveStatus::Active);
        core.track(TelemetryItem::new("evt"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].ikey.as_deref(), Some("ikey"));
        assert_eq!(seen[0].ver.as_deref(), Some("4.0"));
        assert!(seen[0].time.is_some());
    }

    #[test]
    fn test_items_tracked_before_initialize_are_released() {
        let (channel, seen) = sink();
        let core = TelemetryCore::new();
        core.track(TelemetryItem::new("early"));
        assert_eq!(core.active_status(), ActiveStatus::None);

        core.initialize(CoreConfig::new("ikey"), vec![channel]).unwrap();
        assert_eq!(seen.lock()[0].name, "early");
    }

    #[test]
    fn test_missing_key_fails_and_is_inactive() {
        let (channel, _) = sink();
        let core = TelemetryCore::new();
        let err = core
            .initialize(CoreConfig::default(), vec![channel.clone()])
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingInstrumentationKey));
        assert_eq!(core.active_status(), ActiveStatus::Inactive);
        assert!(!core.is_initialized());

        let err = core.initialize(CoreConfig::new(" "), vec![channel]).unwrap_err();
        assert!(matches!(err, CoreError::MissingInstrumentationKey));
    }

    #[test]
    fn test_second_initialize_fails() {
        let (channel, _) = sink();
        let core = TelemetryCore::new();
        core.initialize(CoreConfig::new("ikey"), vec![channel.clone()])
            .unwrap();
        assert!(matches!(
            core.initialize(CoreConfig::new("ikey"), vec![channel]),
            Err(CoreError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_no_channels_is_rejected() {
        let core = TelemetryCore::new();
        assert!(matches!(
            core.initialize(CoreConfig::new("ikey"), Vec::new()),
            Err(CoreError::NoChannels)
        ));
        assert!(!core.is_initialized());
    }

    #[test]
    fn test_duplicate_identifiers_rejected_but_same_instance_deduped() {
        let (channel, seen) = sink();
        let core = TelemetryCore::new();
        let config = CoreConfig::new("ikey").with_extension(channel.clone());
        core.initialize(config, vec![channel]).unwrap();
        core.track(TelemetryItem::new("once"));
        assert_eq!(seen.lock().len(), 1);

        let (first, _) = sink();
        let (second, _) = sink();
        let other = TelemetryCore::new();
        assert!(matches!(
            other.initialize(CoreConfig::new("ikey"), vec![first, second]),
            Err(CoreError::DuplicatePlugin(_))
        ));
    }

    #[test]
    fn test_nameless_item_is_rejected() {
        let (channel, seen) = sink();
        let core = TelemetryCore::new();
        let config = CoreConfig {
            logging_level_telemetry: 2,
            ..CoreConfig::new("ikey")
        };
        core.initialize(config, vec![channel]).unwrap();

        core.track(TelemetryItem::new(""));
        assert!(seen.lock().is_empty());
        assert!(
            core.logger()
                .queue()
                .iter()
                .any(|m| m.message_id == MessageId::INVALID_EVENT)
        );
    }

    #[test]
    fn test_queue_cap_drops_overflow() {
        let core = TelemetryCore::new();
        {
            let mut state = core.inner.state.lock();
            assert!(state.activation.enqueue(TelemetryItem::new("a"), Some(1)));
        }
        core.inner.config.store(Arc::new(ConfigSnapshot::new(
            1,
            CoreConfig::default().with_init_in_memo_max_size(1),
        )));
        core.track(TelemetryItem::new("b"));
        assert_eq!(core.inner.state.lock().activation.queue.len(), 1);
    }

    #[test]
    fn test_handle_does_not_keep_core_alive() {
        let core = TelemetryCore::new();
        let handle = core.handle();
        assert!(handle.upgrade().is_some());
        drop(core);
        assert!(handle.upgrade().is_none());
        assert!(!handle.track(TelemetryItem::new("late")));
        assert_eq!(handle.active_status(), ActiveStatus::None);
    }
}
