//! Activation state machine
//!
//! ```text
//!             initialize()
//!   NONE ─────────────────────┬──────────────────────────┐
//!                             │ key/endpoint pending      │ both literal
//!                             v                           v
//!                         PENDING ── settle ok ──────> ACTIVE
//!                             │                           ^  new literal: stays ACTIVE
//!                             │ rejected / empty /        │  new future: re-evaluated
//!                             │ initTimeOut               │  on the next tick
//!                             v                           │
//!                         INACTIVE <── missing/empty key ─┘
//! ```
//!
//! [`evaluate`] and [`settle`] are pure functions of the key/endpoint tags.
//! Every evaluation opens a new epoch; a waiter that settles under an old
//! epoch is ignored (last writer wins).

use std::collections::VecDeque;

use serde::Serialize;
use tokio::task::AbortHandle;

use crate::config::Deferred;
use crate::item::TelemetryItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActiveStatus {
    /// Never initialized
    #[default]
    None,
    /// Waiting on deferred key and/or endpoint
    Pending,
    /// Items are processed
    Active,
    /// Items are silently discarded
    Inactive,
}

impl std::fmt::Display for ActiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveStatus::None => write!(f, "NONE"),
            ActiveStatus::Pending => write!(f, "PENDING"),
            ActiveStatus::Active => write!(f, "ACTIVE"),
            ActiveStatus::Inactive => write!(f, "INACTIVE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InactiveReason {
    MissingKey,
    EmptyKey,
    KeyRejected(String),
    TimedOut,
    RuntimeUnavailable,
}

impl std::fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InactiveReason::MissingKey => write!(f, "missing instrumentation key"),
            InactiveReason::EmptyKey => write!(f, "empty instrumentation key"),
            InactiveReason::KeyRejected(err) => write!(f, "instrumentation key rejected: {err}"),
            InactiveReason::TimedOut => write!(f, "initialization timed out"),
            InactiveReason::RuntimeUnavailable => {
                write!(f, "no tokio runtime to resolve deferred configuration")
            }
        }
    }
}

/// Final outcome of an evaluation
#[derive(Debug)]
pub(crate) enum Outcome {
    Active {
        ikey: String,
        endpoint: Option<String>,
    },
    Inactive(InactiveReason),
}

#[derive(Debug)]
pub(crate) enum Evaluation {
    Settled(Outcome),
    Pending {
        ikey: Deferred<String>,
        endpoint: Option<Deferred<String>>,
    },
}

pub(crate) fn evaluate(
    ikey: Option<&Deferred<String>>,
    endpoint: Option<&Deferred<String>>,
) -> Evaluation {
    let Some(ikey) = ikey else {
        return Evaluation::Settled(Outcome::Inactive(InactiveReason::MissingKey));
    };

    match (ikey, endpoint) {
        (Deferred::Ready(key), None | Some(Deferred::Ready(_))) => {
            Evaluation::Settled(if key.trim().is_empty() {
                Outcome::Inactive(InactiveReason::EmptyKey)
            } else {
                Outcome::Active {
                    ikey: key.clone(),
                    endpoint: endpoint.and_then(Deferred::value).cloned(),
                }
            })
        }
        _ => Evaluation::Pending {
            ikey: ikey.clone(),
            endpoint: endpoint.cloned(),
        },
    }
}

/// Decide the outcome once every deferred value settled. A rejected
/// endpoint is not fatal; the core activates without one.
pub(crate) fn settle(
    ikey: Result<String, String>,
    endpoint: Option<Result<String, String>>,
) -> Outcome {
    match ikey {
        Err(err) => Outcome::Inactive(InactiveReason::KeyRejected(err)),
        Ok(key) if key.trim().is_empty() => Outcome::Inactive(InactiveReason::EmptyKey),
        Ok(key) => Outcome::Active {
            ikey: key,
            endpoint: endpoint.and_then(Result::ok),
        },
    }
}

#[derive(Debug, Default)]
pub(crate) struct ActivationState {
    pub status: ActiveStatus,
    pub epoch: u64,
    pub ikey: Option<String>,
    pub endpoint: Option<String>,
    pub queue: VecDeque<TelemetryItem>,
    pub waiter: Option<AbortHandle>,
}

impl ActivationState {
    /// Start a new evaluation, invalidating any in-flight waiter
    pub fn begin_epoch(&mut self) -> u64 {
        self.epoch += 1;
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
        self.epoch
    }

    pub fn transition(&mut self, status: ActiveStatus) {
        if self.status != status {
            tracing::debug!(from = %self.status, to = %status, "Activation status transition");
        }
        self.status = status;
    }

    /// Queue an item while not yet active; false when the cap was hit
    pub fn enqueue(&mut self, item: TelemetryItem, max: Option<usize>) -> bool {
        if max.is_some_and(|max| self.queue.len() >= max) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    pub fn drain(&mut self) -> Vec<TelemetryItem> {
        self.queue.drain(..).collect()
    }

    pub fn reset(&mut self) {
        self.begin_epoch();
        self.transition(ActiveStatus::None);
        self.ikey = None;
        self.endpoint = None;
        self.queue.clear();
    }
}
