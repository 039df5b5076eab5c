pub mod channel;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod errors;
pub mod item;
pub mod pipeline;
pub mod plugin;
pub mod unload;

// Re-export commonly used items for convenience
pub use channel::{ChannelController, ChannelQueue};
pub use config::{ConfigDelta, ConfigSnapshot, CoreConfig, CoreSettings, Deferred};
pub use core::{
    ActiveStatus, CoreHandle, CoreId, LoadedPlugin, TelemetryCore, TelemetryInitializerHandle,
};
pub use diagnostics::{DiagnosticLogger, LoggingSeverity, MessageId};
pub use errors::{CoreError, CoreResult};
pub use item::TelemetryItem;
pub use pipeline::{
    ProcessContext, SendRequestReason, UnloadContext, UnloadReason, UnloadState, UpdateContext,
    UpdateReason, UpdateState,
};
pub use plugin::{PluginBase, PluginCapabilities, PluginCompletion, PluginError, TelemetryPlugin};
