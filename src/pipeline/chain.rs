//! Chain construction and per-node failure isolation
//!
//! ```text
//!   [processor p=10] --> [processor p=20] --> [controller p=500] --> [extension] --> None
//!          |                    |
//!          |  run flags:        |
//!          |  self=true,        |
//!          |  next=false  ----> set true when the successor starts
//! ```
//!
//! A node that fails while its successor never started is blamed (critical
//! diagnostic) and the item is forced on to the successor. A failure after
//! the successor started is attributed downstream and the item is not
//! forwarded twice.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::context::{LifecycleContext, ProcessContext};
use super::state::{UnloadState, UpdateState};
use crate::config::ConfigSnapshot;
use crate::core::CoreHandle;
use crate::diagnostics::{DiagnosticLogger, LoggingSeverity, MessageId};
use crate::item::TelemetryItem;
use crate::plugin::{
    ChainCapabilities, PluginCapabilities, PluginCompletion, PluginError, PluginStatus,
    PluginStatusTable, TelemetryPlugin, call_plugin_preserving_error, call_plugin_safely_value,
    guard_plugin_future,
};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one node instance, used as the key of run flags
pub type NodeId = u64;

pub struct ChainNode {
    id: NodeId,
    plugin: Arc<dyn TelemetryPlugin>,
    status: Arc<PluginStatus>,
    caps: ChainCapabilities,
    next: Option<Arc<ChainNode>>,
}

impl std::fmt::Debug for ChainNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainNode")
            .field("id", &self.id)
            .field("plugin", &self.plugin.identifier())
            .field("caps", &self.caps)
            .field("next", &self.next.as_ref().map(|n| n.identifier()))
            .finish()
    }
}

impl ChainNode {
    pub fn new(
        plugin: Arc<dyn TelemetryPlugin>,
        status: Arc<PluginStatus>,
        next: Option<Arc<ChainNode>>,
    ) -> Self {
        let caps = ChainCapabilities::compute(plugin.capabilities(), plugin.priority());
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            plugin,
            status,
            caps,
            next,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn plugin(&self) -> &Arc<dyn TelemetryPlugin> {
        &self.plugin
    }

    pub fn identifier(&self) -> &str {
        self.plugin.identifier()
    }

    pub fn status(&self) -> &Arc<PluginStatus> {
        &self.status
    }

    pub fn capabilities(&self) -> ChainCapabilities {
        self.caps
    }

    pub fn next(&self) -> Option<&Arc<ChainNode>> {
        self.next.as_ref()
    }

    /// Iterate from this node to the end of the chain
    pub fn iter(self: &Arc<Self>) -> ChainIter {
        ChainIter {
            current: Some(self.clone()),
        }
    }

    /// Run the plugin for `item`, forwarding to the successor when the plugin
    /// cannot process or fails before the successor started.
    pub fn process_telemetry(&self, item: &mut TelemetryItem, ctx: &mut ProcessContext) {
        let next = self.next.clone();
        ctx.set_next(next.clone());

        let ran = self.run_isolated(ctx, "processTelemetry", |ctx| {
            if !self.caps.has_process || !self.status.can_process() {
                return Ok(false);
            }
            if self.caps.has_legacy_next {
                self.plugin.set_next_plugin(next.as_ref().map(|n| {
                    Arc::new(NextNodeProxy::new(n.clone())) as Arc<dyn TelemetryPlugin>
                }));
            }
            self.plugin.process_telemetry(item, ctx)?;
            Ok(true)
        });

        if !ran {
            ctx.process_next(item);
        }
    }

    fn run_isolated<F>(&self, ctx: &mut ProcessContext, stage: &str, call: F) -> bool
    where
        F: FnOnce(&mut ProcessContext) -> Result<bool, PluginError>,
    {
        ctx.set_run_flag(self.id, true);
        if let Some(next) = &self.next {
            ctx.set_run_flag(next.id, false);
        }

        match call_plugin_preserving_error(AssertUnwindSafe(|| call(ctx))) {
            Ok(ran) => {
                if ran {
                    self.status.record_success();
                }
                ran
            }
            Err(err) => {
                self.status.record_error(err.to_string());
                let next_ran = self.next.as_ref().is_none_or(|n| ctx.has_run(n.id));
                if self.next.is_none() || !next_ran {
                    let message = format!(
                        "Plugin [{}] failed during {stage} - {err}, run flags: {}",
                        self.identifier(),
                        format_run_flags(ctx.run_flags())
                    );
                    ctx.diag_log().throw_internal(
                        LoggingSeverity::Critical,
                        MessageId::PLUGIN_EXCEPTION,
                        &message,
                        None,
                        false,
                    );
                }
                next_ran
            }
        }
    }

    /// Tear the plugin down once for the core in `ctx`. Torn-down plugins
    /// and plugins owned by another core are skipped.
    pub fn unload(&self, ctx: &LifecycleContext, state: &UnloadState) -> PluginCompletion {
        if !self.status.begin_teardown(ctx.core_id()) {
            return PluginCompletion::Done;
        }
        tracing::debug!(plugin_id = %self.identifier(), reason = ?state.reason, "Tearing down plugin");

        match call_plugin_safely_value(AssertUnwindSafe(|| self.plugin.teardown(ctx, state))) {
            Ok(completion) => self.guard(completion, ctx.diag_log(), "teardown"),
            Err(err) => {
                self.report_failure(ctx.diag_log(), "teardown", &err);
                PluginCompletion::Done
            }
        }
    }

    /// Deliver an update notification unless the plugin is torn down or
    /// owned by another core
    pub fn update(&self, ctx: &LifecycleContext, state: &UpdateState) -> PluginCompletion {
        if !self.status.can_update(ctx.core_id()) {
            return PluginCompletion::Done;
        }

        match call_plugin_safely_value(AssertUnwindSafe(|| self.plugin.update(ctx, state))) {
            Ok(completion) => self.guard(completion, ctx.diag_log(), "update"),
            Err(err) => {
                self.report_failure(ctx.diag_log(), "update", &err);
                PluginCompletion::Done
            }
        }
    }

    fn guard(
        &self,
        completion: PluginCompletion,
        logger: &Arc<DiagnosticLogger>,
        stage: &'static str,
    ) -> PluginCompletion {
        match completion {
            PluginCompletion::Done => PluginCompletion::Done,
            PluginCompletion::Pending(future) => {
                let logger = logger.clone();
                let identifier = self.identifier().to_string();
                PluginCompletion::pending(async move {
                    if let Err(err) = guard_plugin_future(future).await {
                        logger.throw_internal(
                            LoggingSeverity::Critical,
                            MessageId::PLUGIN_EXCEPTION,
                            &format!("Plugin [{identifier}] failed during {stage} - {err}"),
                            None,
                            false,
                        );
                    }
                })
            }
        }
    }

    fn report_failure(&self, logger: &DiagnosticLogger, stage: &str, err: &PluginError) {
        self.status.record_error(err.to_string());
        logger.throw_internal(
            LoggingSeverity::Critical,
            MessageId::PLUGIN_EXCEPTION,
            &format!("Plugin [{}] failed during {stage} - {err}", self.identifier()),
            None,
            false,
        );
    }
}

/// Successor handed to legacy plugins through `set_next_plugin`.
///
/// Processing goes through the successor's node, so the cursor ends up past
/// the successor and the item is not seen twice.
pub struct NextNodeProxy {
    node: Arc<ChainNode>,
}

impl NextNodeProxy {
    pub fn new(node: Arc<ChainNode>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<ChainNode> {
        &self.node
    }
}

impl TelemetryPlugin for NextNodeProxy {
    fn identifier(&self) -> &str {
        self.node.identifier()
    }

    fn priority(&self) -> Option<i32> {
        self.node.plugin.priority()
    }

    fn capabilities(&self) -> PluginCapabilities {
        self.node.plugin.capabilities()
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
        self.node.process_telemetry(item, ctx);
        Ok(())
    }
}

pub struct ChainIter {
    current: Option<Arc<ChainNode>>,
}

impl Iterator for ChainIter {
    type Item = Arc<ChainNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current.take()?;
        self.current = node.next.clone();
        Some(node)
    }
}

fn format_run_flags(flags: &HashMap<NodeId, bool>) -> String {
    let mut entries: Vec<_> = flags.iter().collect();
    entries.sort();
    let body: Vec<String> = entries
        .into_iter()
        .map(|(id, ran)| format!("{id}:{ran}"))
        .collect();
    format!("{{{}}}", body.join(","))
}

/// Stable-sort plugins: processors first in ascending priority (missing
/// priority counts as 0), then extensions in their original order.
pub fn sort_plugins(plugins: &mut [Arc<dyn TelemetryPlugin>]) {
    plugins.sort_by_key(|plugin| {
        if plugin.capabilities().process {
            (0u8, plugin.priority().unwrap_or(0))
        } else {
            (1u8, 0)
        }
    });
}

/// Warn (never fail) about plugins sharing a priority
pub fn warn_duplicate_priorities(plugins: &[Arc<dyn TelemetryPlugin>], logger: &DiagnosticLogger) {
    let mut seen: HashMap<i32, &str> = HashMap::new();
    for plugin in plugins {
        let Some(priority) = plugin.priority() else {
            continue;
        };
        match seen.get(&priority) {
            Some(other) => logger.warn_to_console(&format!(
                "Two extensions have same priority #{priority} - {other}, {}",
                plugin.identifier()
            )),
            None => {
                seen.insert(priority, plugin.identifier());
            }
        }
    }
}

/// Link `plugins` (already ordered) into a chain, optionally starting at the
/// plugin named `start_at`. Returns `None` for an empty result or when
/// `start_at` is not present.
pub fn build_chain(
    plugins: &[Arc<dyn TelemetryPlugin>],
    statuses: &PluginStatusTable,
    start_at: Option<&str>,
) -> Option<Arc<ChainNode>> {
    let start = match start_at {
        Some(identifier) => plugins.iter().position(|p| p.identifier() == identifier)?,
        None => 0,
    };

    plugins[start..].iter().rev().fold(None, |next, plugin| {
        let status = statuses.get_or_register(plugin.identifier());
        Some(Arc::new(ChainNode::new(plugin.clone(), status, next)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        id: &'static str,
        priority: Option<i32>,
        caps: PluginCapabilities,
    }

    impl TelemetryPlugin for Stub {
        fn identifier(&self) -> &str {
            self.id
        }

        fn priority(&self) -> Option<i32> {
            self.priority
        }

        fn capabilities(&self) -> PluginCapabilities {
            self.caps
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
    }

    fn processor(id: &'static str, priority: i32) -> Arc<dyn TelemetryPlugin> {
        Arc::new(Stub {
            id,
            priority: Some(priority),
            caps: PluginCapabilities::PROCESSOR,
        })
    }

    fn extension(id: &'static str, priority: Option<i32>) -> Arc<dyn TelemetryPlugin> {
        Arc::new(Stub {
            id,
            priority,
            caps: PluginCapabilities::EXTENSION,
        })
    }

    fn ids(plugins: &[Arc<dyn TelemetryPlugin>]) -> Vec<&str> {
        plugins.iter().map(|p| p.identifier()).collect()
    }

    #[test]
    fn test_sort_processors_before_extensions() {
        let mut plugins = vec![
            extension("ext-a", Some(1)),
            processor("p30", 30),
            extension("ext-b", None),
            processor("p10", 10),
            processor("p20", 20),
        ];
        sort_plugins(&mut plugins);
        assert_eq!(ids(&plugins), vec!["p10", "p20", "p30", "ext-a", "ext-b"]);
    }

    #[test]
    fn test_sort_is_stable_for_ties() {
        let mut plugins = vec![
            processor("first", 500),
            processor("second", 500),
            processor("early", 100),
        ];
        sort_plugins(&mut plugins);
        assert_eq!(ids(&plugins), vec!["early", "first", "second"]);
    }

    #[test]
    fn test_build_chain_links_in_order() {
        let plugins = vec![processor("a", 1), processor("b", 2), processor("c", 3)];
        let table = PluginStatusTable::new();

        let head = build_chain(&plugins, &table, None).unwrap();
        let order: Vec<String> = head.iter().map(|n| n.identifier().to_string()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_build_chain_from_named_plugin() {
        let plugins = vec![processor("a", 1), processor("b", 2), processor("c", 3)];
        let table = PluginStatusTable::new();

        let head = build_chain(&plugins, &table, Some("b")).unwrap();
        let order: Vec<String> = head.iter().map(|n| n.identifier().to_string()).collect();
        assert_eq!(order, vec!["b", "c"]);

        assert!(build_chain(&plugins, &table, Some("missing")).is_none());
        assert!(build_chain(&[], &table, None).is_none());
    }

    #[derive(Default)]
    struct Warnings(parking_lot::Mutex<Vec<String>>);

    impl crate::diagnostics::ConsoleSink for Warnings {
        fn warn(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }

        fn error(&self, _message: &str) {}
    }

    #[test]
    fn test_duplicate_priorities_warn_for_extensions_too() {
        let sink = Arc::new(Warnings::default());
        let logger = DiagnosticLogger::with_sink(Default::default(), sink.clone());

        let plugins = vec![
            processor("p", 5),
            extension("ext-a", Some(7)),
            extension("ext-b", Some(7)),
            extension("ext-c", None),
            extension("ext-d", None),
        ];
        warn_duplicate_priorities(&plugins, &logger);

        let warnings = sink.0.lock();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ext-a, ext-b"));
    }

    #[test]
    fn test_chain_capabilities_computed_once() {
        let table = PluginStatusTable::new();
        let node = ChainNode::new(extension("ext", Some(600)), table.get_or_register("ext"), None);
        let caps = node.capabilities();
        assert!(!caps.has_process);
        assert!(caps.is_channel);
    }
}
