//! Plugin capability declarations
//!
//! A plugin declares what it implements once, through
//! [`TelemetryPlugin::capabilities`](super::TelemetryPlugin::capabilities).
//! The chain builder combines that declaration with the plugin's priority
//! into a [`ChainCapabilities`] record per node, so nothing is re-probed on
//! the per-item path.

/// Priority at which the channel controller sits in the main chain.
/// Plugins at or above it are channels.
pub const CHANNEL_PRIORITY_THRESHOLD: i32 = 500;

/// What a plugin implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginCapabilities {
    /// Implements `process_telemetry` and takes part in the event chain
    pub process: bool,
    /// Expects its successor through `set_next_plugin`
    pub legacy_next: bool,
}

impl PluginCapabilities {
    /// A processor: participates in the event chain
    pub const PROCESSOR: PluginCapabilities = PluginCapabilities {
        process: true,
        legacy_next: false,
    };

    /// An extension: initialize/teardown only
    pub const EXTENSION: PluginCapabilities = PluginCapabilities {
        process: false,
        legacy_next: false,
    };

    /// A processor that also wants `set_next_plugin` calls
    pub const LEGACY_PROCESSOR: PluginCapabilities = PluginCapabilities {
        process: true,
        legacy_next: true,
    };
}

impl Default for PluginCapabilities {
    fn default() -> Self {
        Self::PROCESSOR
    }
}

/// Capability set computed once when a chain node is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCapabilities {
    pub has_process: bool,
    pub has_legacy_next: bool,
    pub is_channel: bool,
}

impl ChainCapabilities {
    pub fn compute(declared: PluginCapabilities, priority: Option<i32>) -> Self {
        Self {
            has_process: declared.process,
            has_legacy_next: declared.process && declared.legacy_next,
            is_channel: is_channel_priority(priority),
        }
    }
}

pub fn is_channel_priority(priority: Option<i32>) -> bool {
    priority.is_some_and(|p| p >= CHANNEL_PRIORITY_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_threshold_is_inclusive() {
        assert!(is_channel_priority(Some(500)));
        assert!(is_channel_priority(Some(1000)));
        assert!(!is_channel_priority(Some(499)));
        assert!(!is_channel_priority(None));
    }

    #[test]
    fn test_legacy_next_requires_process() {
        let caps = ChainCapabilities::compute(
            PluginCapabilities {
                process: false,
                legacy_next: true,
            },
            Some(10),
        );
        assert!(!caps.has_legacy_next);
        assert!(!caps.is_channel);

        let caps = ChainCapabilities::compute(PluginCapabilities::LEGACY_PROCESSOR, Some(600));
        assert!(caps.has_legacy_next);
        assert!(caps.is_channel);
    }
}
