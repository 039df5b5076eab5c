//! Event pipeline
//!
//! Sorting and linking plugins into chains, the per-item processing
//! context, and the state records passed through update and unload.

mod chain;
mod context;
mod state;

pub use chain::{
    ChainIter, ChainNode, NextNodeProxy, NodeId, build_chain, sort_plugins,
    warn_duplicate_priorities,
};
pub use context::{LifecycleContext, ProcessContext, UnloadContext, UpdateContext};
pub use state::{SendRequestReason, UnloadReason, UnloadState, UpdateReason, UpdateState};
