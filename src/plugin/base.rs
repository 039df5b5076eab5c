//! Shared initialize / teardown / update scaffolding for plugins
//!
//! Embed a [`PluginBase`] in a plugin and delegate to it from the
//! [`TelemetryPlugin`](super::TelemetryPlugin) methods:
//!
//! ```ignore
//! fn teardown(&self, ctx: &UnloadContext, state: &UnloadState) -> PluginCompletion {
//!     self.base.teardown(ctx, state, |_, _| {
//!         self.close_connections();
//!         PluginCompletion::Done
//!     })
//! }
//! ```
//!
//! The base remembers the core that initialized the plugin. Teardown and
//! update requests coming from any other core are ignored, which makes a
//! plugin instance safe to share between cores.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{PluginCompletion, TelemetryPlugin};
use crate::config::ConfigSnapshot;
use crate::core::{CoreHandle, CoreId};
use crate::diagnostics::DiagnosticLogger;
use crate::item::TelemetryItem;
use crate::pipeline::{ProcessContext, UnloadContext, UnloadState, UpdateContext, UpdateState};
use crate::unload::{UnloadHandlerContainer, UnloadHook, UnloadHookContainer};

#[derive(Default)]
struct BaseState {
    core: Option<CoreHandle>,
    config: Option<Arc<ConfigSnapshot>>,
    next: Option<Arc<dyn TelemetryPlugin>>,
    initialized: bool,
    /// Bumped by every initialize; survives resets
    generation: u64,
}

#[derive(Default)]
struct BaseInner {
    state: Mutex<BaseState>,
    unload_handlers: UnloadHandlerContainer,
    unload_hooks: UnloadHookContainer,
}

impl BaseInner {
    /// Reset to uninitialized unless a later initialize already took over
    fn reset_if_current(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            *state = BaseState {
                generation,
                ..BaseState::default()
            };
        }
    }
}

#[derive(Default)]
pub struct PluginBase {
    inner: Arc<BaseInner>,
}

impl PluginBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the owning core and configuration. Call from the plugin's
    /// `initialize` before its own setup.
    pub fn initialize(&self, config: &Arc<ConfigSnapshot>, core: &CoreHandle) {
        let mut state = self.inner.state.lock();
        state.core = Some(core.clone());
        state.config = Some(config.clone());
        state.initialized = true;
        state.generation += 1;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    pub fn core(&self) -> Option<CoreHandle> {
        self.inner.state.lock().core.clone()
    }

    fn core_id(&self) -> Option<CoreId> {
        self.inner.state.lock().core.as_ref().map(CoreHandle::id)
    }

    /// Configuration as of the last initialize or update
    pub fn config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.inner.state.lock().config.clone()
    }

    pub fn diag_log(&self) -> Option<Arc<DiagnosticLogger>> {
        self.core().map(|core| core.logger())
    }

    pub fn set_next_plugin(&self, next: Option<Arc<dyn TelemetryPlugin>>) {
        self.inner.state.lock().next = next;
    }

    pub fn next_plugin(&self) -> Option<Arc<dyn TelemetryPlugin>> {
        self.inner.state.lock().next.clone()
    }

    pub fn process_next(&self, item: &mut TelemetryItem, ctx: &mut ProcessContext) -> bool {
        ctx.process_next(item)
    }

    /// Register a handler run once when this plugin is torn down
    pub fn add_unload_cb<F>(&self, handler: F)
    where
        F: FnOnce(&UnloadContext, &UnloadState) + Send + 'static,
    {
        self.inner.unload_handlers.add(handler);
    }

    /// Register a hook released once when this plugin is torn down
    pub fn add_hook(&self, hook: UnloadHook) {
        self.inner.unload_hooks.add(hook);
    }

    /// Run `do_teardown` when `ctx` belongs to the owning core, then release
    /// this plugin's handlers and hooks and reset to the uninitialized state.
    ///
    /// Handlers and hooks registered so far belong to this teardown even when
    /// it completes later. A completion that finishes after the plugin was
    /// initialized again leaves the new state alone.
    ///
    /// A request from any other core is a no-op.
    pub fn teardown<F>(&self, ctx: &UnloadContext, state: &UnloadState, do_teardown: F) -> PluginCompletion
    where
        F: FnOnce(&UnloadContext, &UnloadState) -> PluginCompletion,
    {
        if self.core_id() != Some(ctx.core_id()) {
            tracing::debug!(core = ?ctx.core_id(), "Ignoring teardown from a core that does not own the plugin");
            return PluginCompletion::Done;
        }

        let generation = self.inner.state.lock().generation;
        let completion = do_teardown(ctx, state);

        let handlers = self.inner.unload_handlers.take();
        let hooks = self.inner.unload_hooks.take();
        let inner = self.inner.clone();
        let ctx = ctx.clone();
        let state = state.clone();
        completion.and_then(move || {
            handlers.run(&ctx, &state);
            hooks.run(ctx.diag_log());
            inner.reset_if_current(generation);
        })
    }

    /// Refresh the stored configuration and run `do_update`, unless `ctx`
    /// belongs to a core that does not own this plugin.
    pub fn update<F>(&self, ctx: &UpdateContext, state: &UpdateState, do_update: F) -> PluginCompletion
    where
        F: FnOnce(&UpdateContext, &UpdateState) -> PluginCompletion,
    {
        if self.core_id() != Some(ctx.core_id()) {
            return PluginCompletion::Done;
        }
        self.inner.state.lock().config = Some(state.config.clone());
        do_update(ctx, state)
    }
}
