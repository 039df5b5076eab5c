//! Channel Controller
//!
//! ```text
//!   main chain ... --> [ChannelController p=500] --> extensions
//!                              |
//!            +-----------------+-----------------+
//!            v                 v                 v
//!        queue 0           queue 1           implicit queue
//!     [ch p=500] ->     [ch p=600] ->     [ch p=510] -> ...
//!     [ch p=700]        ...
//! ```
//!
//! Every queue is its own chain. An item is handed to the head of every
//! queue; a failure inside one queue never reaches the others.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::ConfigSnapshot;
use crate::core::CoreHandle;
use crate::diagnostics::{DiagnosticLogger, LoggingSeverity, MessageId};
use crate::errors::{CoreError, CoreResult};
use crate::item::TelemetryItem;
use crate::pipeline::{
    ChainNode, ProcessContext, SendRequestReason, UnloadContext, UnloadState, UpdateContext,
    UpdateState, build_chain, sort_plugins,
};
use crate::plugin::{
    CHANNEL_PRIORITY_THRESHOLD, PluginBase, PluginCompletion, PluginError, PluginStatusTable,
    TelemetryPlugin, call_plugin_safely_value, guard_plugin_future, initialize_plugin,
    is_channel_priority,
};

pub const CHANNEL_CONTROLLER_IDENTIFIER: &str = "ChannelControllerPlugin";

/// One delivery lane: channel plugins sorted by priority and linked
pub struct ChannelQueue {
    plugins: Vec<Arc<dyn TelemetryPlugin>>,
    chain: Option<Arc<ChainNode>>,
}

impl ChannelQueue {
    pub fn plugins(&self) -> &[Arc<dyn TelemetryPlugin>] {
        &self.plugins
    }

    pub fn chain(&self) -> Option<&Arc<ChainNode>> {
        self.chain.as_ref()
    }

    fn nodes(&self) -> impl Iterator<Item = Arc<ChainNode>> + use<> {
        self.chain.clone().into_iter().flat_map(|head| head.iter())
    }
}

impl std::fmt::Debug for ChannelQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.plugins.iter().map(|p| p.identifier()).collect();
        f.debug_tuple("ChannelQueue").field(&ids).finish()
    }
}

pub struct ChannelController {
    base: PluginBase,
    statuses: Arc<PluginStatusTable>,
    queues: RwLock<Vec<Arc<ChannelQueue>>>,
}

impl ChannelController {
    /// A controller whose queue nodes share `statuses` with the owning core
    pub fn new(statuses: Arc<PluginStatusTable>) -> Self {
        Self {
            base: PluginBase::new(),
            statuses,
            queues: RwLock::new(Vec::new()),
        }
    }

    /// Replace the queues: every explicit queue plus one implicit queue for
    /// channel-priority extensions not named by an explicit queue.
    ///
    /// Fails, leaving the previous queues in place, when a member sits
    /// below the channel threshold or cannot process telemetry.
    pub fn configure(
        &self,
        explicit: Vec<Vec<Arc<dyn TelemetryPlugin>>>,
        implicit: Vec<Arc<dyn TelemetryPlugin>>,
    ) -> CoreResult<()> {
        let mut queues = Vec::with_capacity(explicit.len() + 1);
        for plugins in explicit.into_iter().chain(std::iter::once(implicit)) {
            if plugins.is_empty() {
                continue;
            }
            queues.push(Arc::new(self.build_queue(plugins)?));
        }

        tracing::debug!(queues = queues.len(), "Channel queues configured");
        *self.queues.write() = queues;
        Ok(())
    }

    fn build_queue(&self, mut plugins: Vec<Arc<dyn TelemetryPlugin>>) -> CoreResult<ChannelQueue> {
        for plugin in &plugins {
            if !is_channel_priority(plugin.priority()) {
                return Err(CoreError::InvalidChannelPriority {
                    identifier: plugin.identifier().to_string(),
                    priority: plugin.priority(),
                });
            }
            if !plugin.capabilities().process {
                return Err(CoreError::ChannelMissingProcessor(plugin.identifier().to_string()));
            }
        }

        sort_plugins(&mut plugins);
        let chain = build_chain(&plugins, &self.statuses, None);
        Ok(ChannelQueue { plugins, chain })
    }

    /// Initialize every queue member not yet initialized, each with its
    /// own queue as the chain
    pub fn initialize_queues(
        &self,
        config: &Arc<ConfigSnapshot>,
        core: &CoreHandle,
        extensions: &[Arc<dyn TelemetryPlugin>],
    ) -> CoreResult<()> {
        for queue in self.queues() {
            for node in queue.nodes() {
                initialize_plugin(
                    node.plugin(),
                    node.status(),
                    config,
                    core,
                    extensions,
                    queue.chain(),
                )?;
            }
        }
        Ok(())
    }

    pub fn queues(&self) -> Vec<Arc<ChannelQueue>> {
        self.queues.read().clone()
    }

    /// Every channel plugin, queue by queue
    pub fn channels(&self) -> Vec<Arc<dyn TelemetryPlugin>> {
        self.queues
            .read()
            .iter()
            .flat_map(|queue| queue.plugins.iter().cloned())
            .collect()
    }

    pub fn find(&self, identifier: &str) -> Option<Arc<dyn TelemetryPlugin>> {
        self.queues
            .read()
            .iter()
            .flat_map(|queue| queue.plugins.iter())
            .find(|plugin| plugin.identifier() == identifier)
            .cloned()
    }

    /// Flush every channel. With `is_async` the result says whether all of
    /// them finished within `timeout`; otherwise pending flushes continue in
    /// the background and only synchronous completion counts.
    pub async fn flush_channels(
        &self,
        is_async: bool,
        reason: SendRequestReason,
        timeout: Duration,
    ) -> bool {
        let completion = self.flush(is_async, reason);
        if is_async {
            completion
                .wait_until(tokio::time::Instant::now() + timeout)
                .await
        } else {
            completion.detach()
        }
    }

    fn logger(&self) -> Arc<DiagnosticLogger> {
        self.base.diag_log().unwrap_or_default()
    }
}

impl TelemetryPlugin for ChannelController {
    fn identifier(&self) -> &str {
        CHANNEL_CONTROLLER_IDENTIFIER
    }

    fn priority(&self) -> Option<i32> {
        Some(CHANNEL_PRIORITY_THRESHOLD)
    }

    /// Records the owning core. Queue members are initialized separately
    /// through [`ChannelController::initialize_queues`].
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
        for queue in self.queues() {
            // each lane gets its own copy so one lane's mutations stay local
            let mut lane_item = item.clone();
            let mut lane = ctx.with_chain(queue.chain.clone());
            if let Err(err) =
                call_plugin_safely_value(AssertUnwindSafe(|| lane.process_next(&mut lane_item)))
            {
                ctx.diag_log().throw_internal(
                    LoggingSeverity::Critical,
                    MessageId::PLUGIN_EXCEPTION,
                    &format!("Channel queue {queue:?} failed - {err}"),
                    None,
                    false,
                );
            }
        }

        ctx.process_next(item);
        Ok(())
    }

    fn teardown(&self, ctx: &UnloadContext, state: &UnloadState) -> PluginCompletion {
        self.base.teardown(ctx, state, |ctx, state| {
            let queues = std::mem::take(&mut *self.queues.write());
            PluginCompletion::join(
                queues
                    .iter()
                    .flat_map(|queue| queue.nodes())
                    .map(|node| node.unload(ctx, state))
                    .collect::<Vec<_>>(),
            )
        })
    }

    fn update(&self, ctx: &UpdateContext, state: &UpdateState) -> PluginCompletion {
        self.base.update(ctx, state, |ctx, state| {
            PluginCompletion::join(
                self.queues()
                    .iter()
                    .flat_map(|queue| queue.nodes())
                    .map(|node| node.update(ctx, state))
                    .collect::<Vec<_>>(),
            )
        })
    }

    fn flush(&self, is_async: bool, reason: SendRequestReason) -> PluginCompletion {
        let logger = self.logger();
        let mut completions = Vec::new();

        for channel in self.channels() {
            let identifier = channel.identifier().to_string();
            match call_plugin_safely_value(AssertUnwindSafe(|| channel.flush(is_async, reason))) {
                Ok(PluginCompletion::Done) => {}
                Ok(PluginCompletion::Pending(future)) => {
                    let logger = logger.clone();
                    completions.push(PluginCompletion::pending(async move {
                        if let Err(err) = guard_plugin_future(future).await {
                            logger.throw_internal(
                                LoggingSeverity::Critical,
                                MessageId::FLUSH_FAILED,
                                &format!("Channel [{identifier}] failed to flush - {err}"),
                                None,
                                false,
                            );
                        }
                    }));
                }
                Err(err) => logger.throw_internal(
                    LoggingSeverity::Critical,
                    MessageId::FLUSH_FAILED,
                    &format!("Channel [{identifier}] failed to flush - {err}"),
                    None,
                    false,
                ),
            }
        }

        PluginCompletion::join(completions)
    }

    fn pause(&self) {
        for channel in self.channels() {
            if let Err(err) = call_plugin_safely_value(AssertUnwindSafe(|| channel.pause())) {
                tracing::warn!(plugin_id = %channel.identifier(), error = %err, "Channel failed to pause");
            }
        }
    }

    fn resume(&self) {
        for channel in self.channels() {
            if let Err(err) = call_plugin_safely_value(AssertUnwindSafe(|| channel.resume())) {
                tracing::warn!(plugin_id = %channel.identifier(), error = %err, "Channel failed to resume");
            }
        }
    }
}
