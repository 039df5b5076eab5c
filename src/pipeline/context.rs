//! Per-traversal contexts
//!
//! A [`ProcessContext`] is created for every item the core processes. It
//! holds the configuration snapshot the traversal started with, the chain
//! cursor and the run flags the nodes use for failure attribution.
//! [`LifecycleContext`] is the lighter context handed to `teardown` and
//! `update`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::chain::{ChainNode, NodeId, build_chain};
use crate::config::{ConfigSnapshot, CoreConfig};
use crate::core::{CoreHandle, CoreId};
use crate::diagnostics::{DiagnosticLogger, LoggingSeverity, MessageId};
use crate::item::TelemetryItem;
use crate::plugin::{PluginStatusTable, TelemetryPlugin, call_plugin_safely_value};

type CompleteCallback = Box<dyn FnOnce() + Send>;

pub struct ProcessContext {
    core: Option<CoreHandle>,
    config: Arc<ConfigSnapshot>,
    logger: Arc<DiagnosticLogger>,
    statuses: Arc<PluginStatusTable>,
    next: Option<Arc<ChainNode>>,
    run_flags: HashMap<NodeId, bool>,
    on_complete: Vec<CompleteCallback>,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("core", &self.core.as_ref().map(CoreHandle::id))
            .field("config_version", &self.config.version())
            .field("next", &self.next.as_ref().map(|n| n.identifier()))
            .field("run_flags", &self.run_flags)
            .finish()
    }
}

impl ProcessContext {
    /// A context not attached to any core
    pub fn new(
        chain: Option<Arc<ChainNode>>,
        config: Arc<ConfigSnapshot>,
        logger: Arc<DiagnosticLogger>,
    ) -> Self {
        Self::build(None, config, logger, Arc::new(PluginStatusTable::new()), chain)
    }

    pub(crate) fn build(
        core: Option<CoreHandle>,
        config: Arc<ConfigSnapshot>,
        logger: Arc<DiagnosticLogger>,
        statuses: Arc<PluginStatusTable>,
        chain: Option<Arc<ChainNode>>,
    ) -> Self {
        Self {
            core,
            config,
            logger,
            statuses,
            next: chain,
            run_flags: HashMap::new(),
            on_complete: Vec::new(),
        }
    }

    pub fn core(&self) -> Option<&CoreHandle> {
        self.core.as_ref()
    }

    pub fn config(&self) -> &CoreConfig {
        self.config.config()
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.config
    }

    pub fn diag_log(&self) -> &Arc<DiagnosticLogger> {
        &self.logger
    }

    /// The `extension_config` object for `identifier`, if any
    pub fn get_extension_config(&self, identifier: &str) -> Option<&Map<String, Value>> {
        self.config()
            .extension_config
            .get(identifier)
            .and_then(Value::as_object)
    }

    /// Look `field` up in the plugin's extension config, falling back to the
    /// root configuration. Null values count as absent.
    pub fn get_config(&self, identifier: &str, field: &str) -> Option<Value> {
        self.get_extension_config(identifier)
            .and_then(|ext| ext.get(field))
            .filter(|value| !value.is_null())
            .cloned()
            .or_else(|| self.config().get_value(field).filter(|value| !value.is_null()))
    }

    pub fn get_config_or(&self, identifier: &str, field: &str, default: Value) -> Value {
        self.get_config(identifier, field).unwrap_or(default)
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn get_next(&self) -> Option<&Arc<ChainNode>> {
        self.next.as_ref()
    }

    pub fn set_next(&mut self, next: Option<Arc<ChainNode>>) {
        self.next = next;
    }

    /// Hand `item` to the next node. Returns false when the chain is
    /// exhausted, after running the completion callbacks.
    pub fn process_next(&mut self, item: &mut TelemetryItem) -> bool {
        match self.move_next() {
            Some(node) => {
                node.process_telemetry(item, self);
                true
            }
            None => false,
        }
    }

    /// Visit every remaining plugin without processing, consuming the cursor
    pub fn iterate<F>(&mut self, mut visit: F)
    where
        F: FnMut(&Arc<dyn TelemetryPlugin>),
    {
        while let Some(node) = self.move_next() {
            visit(node.plugin());
        }
    }

    /// Run `callback` once the cursor moves past the last node
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete.push(Box::new(callback));
    }

    /// Derive a fresh context sharing this one's core and configuration.
    ///
    /// - no arguments: continue from the current cursor
    /// - `plugins`: a new chain built from the given (ordered) plugins
    /// - `start_at`: splice from the named plugin onward; an unknown name
    ///   yields an empty chain
    pub fn create_new(
        &self,
        plugins: Option<&[Arc<dyn TelemetryPlugin>]>,
        start_at: Option<&str>,
    ) -> ProcessContext {
        let chain = match (plugins, start_at) {
            (Some(plugins), start_at) => build_chain(plugins, &self.statuses, start_at),
            (None, None) => self.next.clone(),
            (None, Some(identifier)) => self
                .next
                .as_ref()
                .and_then(|head| head.iter().find(|node| node.identifier() == identifier)),
        };
        self.with_chain(chain)
    }

    /// A fresh context over an existing chain
    pub fn with_chain(&self, chain: Option<Arc<ChainNode>>) -> ProcessContext {
        Self::build(
            self.core.clone(),
            self.config.clone(),
            self.logger.clone(),
            self.statuses.clone(),
            chain,
        )
    }

    pub(crate) fn set_run_flag(&mut self, node: NodeId, ran: bool) {
        self.run_flags.insert(node, ran);
    }

    pub(crate) fn has_run(&self, node: NodeId) -> bool {
        self.run_flags.get(&node).copied().unwrap_or(false)
    }

    pub(crate) fn run_flags(&self) -> &HashMap<NodeId, bool> {
        &self.run_flags
    }

    fn move_next(&mut self) -> Option<Arc<ChainNode>> {
        match self.next.take() {
            Some(node) => {
                self.next = node.next().cloned();
                Some(node)
            }
            None => {
                self.run_on_complete();
                None
            }
        }
    }

    fn run_on_complete(&mut self) {
        for callback in std::mem::take(&mut self.on_complete) {
            if let Err(err) = call_plugin_safely_value(AssertUnwindSafe(callback)) {
                self.logger.throw_internal(
                    LoggingSeverity::Critical,
                    MessageId::PLUGIN_EXCEPTION,
                    &format!("Unexpected Exception during onComplete - {err}"),
                    None,
                    false,
                );
            }
        }
    }
}

/// Context for `teardown` and `update` calls
#[derive(Clone)]
pub struct LifecycleContext {
    core: Option<CoreHandle>,
    core_id: CoreId,
    config: Arc<ConfigSnapshot>,
    logger: Arc<DiagnosticLogger>,
}

pub type UnloadContext = LifecycleContext;
pub type UpdateContext = LifecycleContext;

impl std::fmt::Debug for LifecycleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleContext")
            .field("core_id", &self.core_id)
            .field("config_version", &self.config.version())
            .finish()
    }
}

impl LifecycleContext {
    pub fn new(core: CoreHandle, config: Arc<ConfigSnapshot>) -> Self {
        Self {
            core_id: core.id(),
            logger: core.logger(),
            core: Some(core),
            config,
        }
    }

    /// A context belonging to no core; owned plugins ignore it
    pub fn detached(logger: Arc<DiagnosticLogger>) -> Self {
        Self {
            core: None,
            core_id: CoreId::DETACHED,
            config: Arc::new(ConfigSnapshot::default()),
            logger,
        }
    }

    pub fn core(&self) -> Option<&CoreHandle> {
        self.core.as_ref()
    }

    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    pub fn config(&self) -> &CoreConfig {
        self.config.config()
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.config
    }

    pub fn diag_log(&self) -> &Arc<DiagnosticLogger> {
        &self.logger
    }
}
