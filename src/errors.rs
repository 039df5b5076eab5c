//! Core error types
//!
//! Configuration errors are fatal and returned synchronously from
//! [`TelemetryCore::initialize`](crate::TelemetryCore::initialize) and
//! [`TelemetryCore::add_plugin`](crate::TelemetryCore::add_plugin). Plugin
//! execution, activation and unload failures never surface here; they are
//! contained and reported through the diagnostic logger and the activation
//! status instead.

use thiserror::Error;

use crate::plugin::PluginError;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    // ─────────────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────────────
    /// `initialize` was called on a core that is already initialized
    #[error("Core cannot be initialized more than once")]
    AlreadyInitialized,

    /// The core is being (or has been) unloaded
    #[error("The core is unloading")]
    Unloading,

    /// Deferred configuration needs a tokio runtime to be awaited on
    #[error("Deferred configuration values require a running tokio runtime")]
    RuntimeUnavailable,

    // ─────────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────────
    /// The instrumentation key is missing or empty
    #[error("Please provide instrumentation key")]
    MissingInstrumentationKey,

    /// A plugin does not satisfy the plugin contract
    #[error("Extensions must provide an identifier and initialize: {0}")]
    InvalidPlugin(String),

    /// A channel queue member sits below the channel priority threshold
    #[error("Channel has invalid priority - {identifier} ({priority:?})")]
    InvalidChannelPriority {
        identifier: String,
        priority: Option<i32>,
    },

    /// A channel queue member cannot process telemetry
    #[error("Channel [{0}] does not process telemetry")]
    ChannelMissingProcessor(String),

    /// Two different plugin instances share an identifier
    #[error("Plugin [{0}] is already loaded!")]
    DuplicatePlugin(String),

    /// Neither explicit channel queues nor channel-priority extensions exist
    #[error("No channels available")]
    NoChannels,

    /// Settings could not be read or parsed
    #[error("Failed to load settings: {0}")]
    Settings(String),

    // ─────────────────────────────────────────────────────────────────────────────
    // Plugin Errors
    // ─────────────────────────────────────────────────────────────────────────────
    /// A plugin failed during `initialize`
    #[error("Plugin [{identifier}] failed to initialize: {source}")]
    Plugin {
        identifier: String,
        #[source]
        source: PluginError,
    },
}

impl CoreError {
    /// Whether the error describes invalid configuration (as opposed to lifecycle misuse)
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CoreError::MissingInstrumentationKey
                | CoreError::InvalidPlugin(_)
                | CoreError::InvalidChannelPriority { .. }
                | CoreError::ChannelMissingProcessor(_)
                | CoreError::DuplicatePlugin(_)
                | CoreError::NoChannels
                | CoreError::Settings(_)
        )
    }
}
