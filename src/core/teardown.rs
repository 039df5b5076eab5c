//! Unload and flush

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{DEFAULT_CB_TIMEOUT, Lifecycle, PluginSet, TelemetryCore};
use crate::pipeline::{LifecycleContext, SendRequestReason, UnloadReason, UnloadState};
use crate::plugin::{PluginCompletion, TelemetryPlugin};

impl TelemetryCore {
    /// Unload the core: flush channels, run unload handlers, tear every
    /// plugin down once, release hooks and reset to the uninitialized state.
    ///
    /// With `is_async` the flush and teardowns are awaited up to
    /// `cb_timeout`; the returned state says whether they finished in time.
    /// Without it pending work continues in the background. A core that is
    /// not initialized, or already unloading, returns at once.
    pub async fn unload(&self, is_async: bool, cb_timeout: Option<Duration>) -> UnloadState {
        let mut unload_state = UnloadState::new(UnloadReason::SdkUnload, is_async);
        let timeout = cb_timeout.unwrap_or(DEFAULT_CB_TIMEOUT);

        if self.lifecycle() != Lifecycle::Initialized {
            return unload_state;
        }
        self.flush_internal_logs();

        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Initialized {
                return unload_state;
            }
            state.lifecycle = Lifecycle::Unloading;
            state.activation.begin_epoch();
        }
        tracing::info!(core = %self.inner.id, is_async, "Unloading telemetry core");

        unload_state.flush_complete = self
            .inner
            .controller
            .flush_channels(is_async, SendRequestReason::SdkUnload, timeout)
            .await;

        let ctx = LifecycleContext::new(self.handle(), self.config());
        self.inner.unload_handlers.run(&ctx, &unload_state);
        self.stop_polling_internal_logs();

        let completion = PluginCompletion::join(
            self.chain_nodes()
                .iter()
                .map(|node| node.unload(&ctx, &unload_state))
                .collect::<Vec<_>>(),
        );
        unload_state.teardown_complete = if is_async {
            completion.wait_until(Instant::now() + timeout).await
        } else {
            completion.detach()
        };

        self.inner.unload_hooks.run(&self.inner.logger);
        *self.inner.plugins.write() = PluginSet::default();
        self.inner.statuses.clear();
        {
            let mut state = self.inner.state.lock();
            state.activation.reset();
            state.lifecycle = Lifecycle::Created;
        }

        tracing::info!(
            core = %self.inner.id,
            flush_complete = unload_state.flush_complete,
            teardown_complete = unload_state.teardown_complete,
            "Telemetry core unloaded"
        );
        unload_state
    }

    /// Spawn [`unload`](Self::unload) and hand the final state to `on_done`
    pub fn unload_with<F>(
        &self,
        is_async: bool,
        cb_timeout: Option<Duration>,
        on_done: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(UnloadState) + Send + 'static,
    {
        let core = self.clone();
        tokio::spawn(async move {
            let state = core.unload(is_async, cb_timeout).await;
            on_done(state);
        })
    }

    /// Flush every channel. With `is_async` waits up to `cb_timeout` and
    /// reports whether every channel finished.
    pub async fn flush(
        &self,
        is_async: bool,
        reason: SendRequestReason,
        cb_timeout: Option<Duration>,
    ) -> bool {
        if self.lifecycle() != Lifecycle::Initialized {
            return true;
        }
        self.inner
            .controller
            .flush_channels(is_async, reason, cb_timeout.unwrap_or(DEFAULT_CB_TIMEOUT))
            .await
    }

    /// Pause delivery on every channel
    pub fn pause(&self) {
        self.inner.controller.pause();
    }

    /// Resume delivery on every channel
    pub fn resume(&self) {
        self.inner.controller.resume();
    }
}
