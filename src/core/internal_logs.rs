//! Periodic forwarding of queued diagnostic messages as telemetry

use std::sync::Arc;

use serde_json::json;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use super::TelemetryCore;
use crate::item::TelemetryItem;

impl TelemetryCore {
    /// Start forwarding queued internal messages every
    /// `diagnostic_log_interval`. Items are named `event_name` when given,
    /// otherwise after the message id. Replaces a running poller.
    ///
    /// Returns false without a tokio runtime or with a zero interval.
    pub fn poll_internal_logs(&self, event_name: Option<&str>) -> bool {
        let interval = self.config().diagnostic_log_interval;
        if interval.is_zero() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(core = %self.inner.id, "No tokio runtime; internal log polling disabled");
            return false;
        };

        self.stop_polling_internal_logs();
        *self.inner.internal_log_event.write() = event_name.map(str::to_string);

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let core = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => {
                        let Some(inner) = core.upgrade() else {
                            break;
                        };
                        TelemetryCore { inner }.flush_internal_logs();
                    }
                }
            }
        });

        *self.inner.poller.lock() = Some(token);
        true
    }

    pub fn stop_polling_internal_logs(&self) {
        if let Some(token) = self.inner.poller.lock().take() {
            token.cancel();
        }
    }

    /// Drain the logger queue into tracked items; returns how many were sent
    pub fn flush_internal_logs(&self) -> usize {
        let messages = self.inner.logger.take_queue();
        if messages.is_empty() {
            return 0;
        }

        let event_name = self.inner.internal_log_event.read().clone();
        let count = messages.len();
        for message in messages {
            let name = event_name
                .clone()
                .unwrap_or_else(|| format!("InternalMessageId: {}", message.message_id));
            let item = TelemetryItem::new(name)
                .with_base("MessageData", json!({ "message": message.message }));
            self.track(item);
        }

        tracing::debug!(core = %self.inner.id, count, "Forwarded internal log messages");
        count
    }
}
