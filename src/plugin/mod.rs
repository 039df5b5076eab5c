//! Plugin contract
//!
//! A plugin is any `Send + Sync` type implementing [`TelemetryPlugin`]. The
//! core threads an explicit [`CoreHandle`] through every call; there is no
//! process-wide state.
//!
//! ```text
//!   processors   (capabilities().process == true, priority < 500)
//!        |         take part in the event chain, ascending priority
//!        v
//!   ChannelController (priority 500)
//!        |         fans each item out to every channel queue
//!        v
//!   extensions   (capabilities().process == false)
//!                  initialize / update / teardown only
//! ```
//!
//! Lifecycle calls that may finish later return a [`PluginCompletion`]
//! instead of a boolean "I will call you back" flag.

mod base;
mod capabilities;
mod isolation;
mod lifecycle;

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::time::Instant;

use crate::config::ConfigSnapshot;
use crate::core::CoreHandle;
use crate::item::TelemetryItem;
use crate::pipeline::{
    ChainNode, ProcessContext, SendRequestReason, UnloadContext, UnloadState, UpdateContext,
    UpdateState,
};

pub use base::PluginBase;
pub use capabilities::{
    CHANNEL_PRIORITY_THRESHOLD, ChainCapabilities, PluginCapabilities, is_channel_priority,
};
pub use isolation::{
    PluginError, call_plugin_preserving_error, call_plugin_safely, call_plugin_safely_value,
    extract_panic_message, guard_plugin_future,
};
pub use lifecycle::{PluginEntry, PluginState, PluginStatus, PluginStatusTable};
pub(crate) use lifecycle::initialize_plugin;

/// Outcome of a lifecycle call that may complete asynchronously
pub enum PluginCompletion {
    /// Finished before returning
    Done,
    /// Finishes when the future resolves
    Pending(BoxFuture<'static, ()>),
}

impl PluginCompletion {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        PluginCompletion::Pending(future.boxed())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, PluginCompletion::Done)
    }

    pub async fn wait(self) {
        if let PluginCompletion::Pending(future) = self {
            future.await;
        }
    }

    /// Wait for the completion until `deadline`. Returns false when the
    /// deadline passed first; the completion itself keeps running.
    pub async fn wait_until(self, deadline: Instant) -> bool {
        match self {
            PluginCompletion::Done => true,
            PluginCompletion::Pending(future) => {
                let task = tokio::spawn(future);
                matches!(tokio::time::timeout_at(deadline, task).await, Ok(Ok(())))
            }
        }
    }

    /// Let a pending completion finish in the background. Returns true when
    /// there was nothing left to run.
    pub fn detach(self) -> bool {
        match self {
            PluginCompletion::Done => true,
            PluginCompletion::Pending(future) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(future);
                    }
                    Err(_) => {
                        tracing::warn!("No tokio runtime to drive a pending plugin completion; dropping it")
                    }
                }
                false
            }
        }
    }

    /// Combine several completions into one that finishes when all of them have
    pub fn join(completions: impl IntoIterator<Item = PluginCompletion>) -> PluginCompletion {
        let pending: Vec<_> = completions
            .into_iter()
            .filter_map(|c| match c {
                PluginCompletion::Done => None,
                PluginCompletion::Pending(future) => Some(future),
            })
            .collect();

        if pending.is_empty() {
            PluginCompletion::Done
        } else {
            PluginCompletion::pending(join_all(pending).map(|_| ()))
        }
    }

    /// Run `then` once this completion finishes; immediately when already done
    pub fn and_then<F>(self, then: F) -> PluginCompletion
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            PluginCompletion::Done => {
                then();
                PluginCompletion::Done
            }
            PluginCompletion::Pending(future) => PluginCompletion::pending(async move {
                future.await;
                then();
            }),
        }
    }
}

impl std::fmt::Debug for PluginCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginCompletion::Done => write!(f, "Done"),
            PluginCompletion::Pending(_) => write!(f, "Pending(..)"),
        }
    }
}

/// The contract every plugin implements
///
/// Only `identifier` and `initialize` are required. The defaults make a
/// plugin a transparent processor that forwards every item.
pub trait TelemetryPlugin: Send + Sync + 'static {
    /// Unique identifier within a core
    fn identifier(&self) -> &str;

    /// Position in the chain; values at or above
    /// [`CHANNEL_PRIORITY_THRESHOLD`] make the plugin a channel
    fn priority(&self) -> Option<i32> {
        None
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::PROCESSOR
    }

    /// Called once per core before the plugin sees any item.
    ///
    /// `chain` is the head of the chain the plugin was initialized through.
    fn initialize(
        &self,
        config: &Arc<ConfigSnapshot>,
        core: &CoreHandle,
        extensions: &[Arc<dyn TelemetryPlugin>],
        chain: Option<&Arc<ChainNode>>,
    ) -> Result<(), PluginError>;

    /// Plugin-reported initialization state. `None` defers to the core's record.
    fn is_initialized(&self) -> Option<bool> {
        None
    }

    /// Handle one item. Call `ctx.process_next(item)` to pass it on;
    /// returning without doing so drops it.
    fn process_telemetry(
        &self,
        item: &mut TelemetryItem,
        ctx: &mut ProcessContext,
    ) -> Result<(), PluginError> {
        ctx.process_next(item);
        Ok(())
    }

    fn teardown(&self, _ctx: &UnloadContext, _state: &UnloadState) -> PluginCompletion {
        PluginCompletion::Done
    }

    fn update(&self, _ctx: &UpdateContext, _state: &UpdateState) -> PluginCompletion {
        PluginCompletion::Done
    }

    /// Legacy successor pointer, set before each call when the plugin
    /// declares [`PluginCapabilities::legacy_next`]
    fn set_next_plugin(&self, _next: Option<Arc<dyn TelemetryPlugin>>) {}

    fn flush(&self, _is_async: bool, _reason: SendRequestReason) -> PluginCompletion {
        PluginCompletion::Done
    }

    fn pause(&self) {}

    fn resume(&self) {}
}

pub(crate) fn plugin_ids(plugins: &[Arc<dyn TelemetryPlugin>]) -> Vec<&str> {
    plugins.iter().map(|p| p.identifier()).collect()
}
