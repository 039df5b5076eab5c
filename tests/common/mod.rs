//! Shared plugins and sinks for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use telemetry_core::config::ConfigSnapshot;
use telemetry_core::diagnostics::ConsoleSink;
use telemetry_core::pipeline::ChainNode;
use telemetry_core::{
    CoreHandle, PluginBase, PluginCapabilities, PluginCompletion, PluginError, ProcessContext,
    SendRequestReason, TelemetryItem, TelemetryPlugin, UnloadContext, UnloadState, UpdateContext,
    UpdateState,
};

// =============================================================================
// Recording channel
// =============================================================================

/// A channel (or processor, depending on priority) that records every item
/// it sees and counts lifecycle calls
pub struct Recorder {
    base: PluginBase,
    id: String,
    priority: i32,
    pub items: Mutex<Vec<TelemetryItem>>,
    pub teardowns: AtomicUsize,
    pub flushes: AtomicUsize,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub updates: Mutex<Vec<UpdateState>>,
}

impl Recorder {
    pub fn new(id: &str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            base: PluginBase::new(),
            id: id.to_string(),
            priority,
            items: Mutex::new(Vec::new()),
            teardowns: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.items.lock().iter().map(|item| item.name.clone()).collect()
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

impl TelemetryPlugin for Recorder {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Option<i32> {
        Some(self.priority)
    }

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
        self.items.lock().push(item.clone());
        self.base.process_next(item, ctx);
        Ok(())
    }

    fn teardown(&self, ctx: &UnloadContext, state: &UnloadState) -> PluginCompletion {
        self.base.teardown(ctx, state, |_, _| {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            PluginCompletion::Done
        })
    }

    fn update(&self, ctx: &UpdateContext, state: &UpdateState) -> PluginCompletion {
        self.base.update(ctx, state, |_, state| {
            self.updates.lock().push(state.clone());
            PluginCompletion::Done
        })
    }

    fn flush(&self, _is_async: bool, _reason: SendRequestReason) -> PluginCompletion {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        PluginCompletion::Done
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Legacy processor
// =============================================================================

/// Forwards through the successor handed over by `set_next_plugin` instead
/// of the processing context
pub struct LegacyForwarder {
    base: PluginBase,
    id: String,
    priority: i32,
    pub forwarded: AtomicUsize,
}

impl LegacyForwarder {
    pub fn new(id: &str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            base: PluginBase::new(),
            id: id.to_string(),
            priority,
            forwarded: AtomicUsize::new(0),
        })
    }
}

impl TelemetryPlugin for LegacyForwarder {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Option<i32> {
        Some(self.priority)
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::LEGACY_PROCESSOR
    }

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

    fn set_next_plugin(&self, next: Option<Arc<dyn TelemetryPlugin>>) {
        self.base.set_next_plugin(next);
    }

    fn process_telemetry(
        &self,
        item: &mut TelemetryItem,
        ctx: &mut ProcessContext,
    ) -> Result<(), PluginError> {
        match self.base.next_plugin() {
            Some(next) => {
                self.forwarded.fetch_add(1, Ordering::SeqCst);
                next.process_telemetry(item, ctx)
            }
            None => {
                self.base.process_next(item, ctx);
                Ok(())
            }
        }
    }
}

// =============================================================================
// Failing processor
// =============================================================================

/// Fails every item, either with an error or a panic
pub struct Failing {
    id: String,
    priority: i32,
    panic: bool,
}

impl Failing {
    pub fn error(id: &str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            priority,
            panic: false,
        })
    }

    pub fn panicking(id: &str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            priority,
            panic: true,
        })
    }
}

impl TelemetryPlugin for Failing {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Option<i32> {
        Some(self.priority)
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
        _ctx: &mut ProcessContext,
    ) -> Result<(), PluginError> {
        if self.panic {
            panic!("{} cannot process {}", self.id, item.name);
        }
        Err(PluginError::ProcessingFailed(format!("{} rejected {}", self.id, item.name)))
    }
}

// =============================================================================
// Configuration observer
// =============================================================================

/// An extension recording the endpoint it saw in each update
pub struct EndpointObserver {
    base: PluginBase,
    pub seen: Mutex<Vec<Option<String>>>,
}

impl EndpointObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: PluginBase::new(),
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl TelemetryPlugin for EndpointObserver {
    fn identifier(&self) -> &str {
        "EndpointObserver"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::EXTENSION
    }

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

    fn update(&self, ctx: &UpdateContext, state: &UpdateState) -> PluginCompletion {
        self.base.update(ctx, state, |_, state| {
            self.seen
                .lock()
                .push(state.config.endpoint_url_value().map(str::to_string));
            PluginCompletion::Done
        })
    }
}

// =============================================================================
// Slow teardown
// =============================================================================

/// A channel whose teardown completes asynchronously after `delay`
pub struct SlowTeardown {
    base: PluginBase,
    delay: Duration,
    pub started: AtomicUsize,
    pub finished: Arc<AtomicUsize>,
}

impl SlowTeardown {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            base: PluginBase::new(),
            delay,
            started: AtomicUsize::new(0),
            finished: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl TelemetryPlugin for SlowTeardown {
    fn identifier(&self) -> &str {
        "SlowTeardown"
    }

    fn priority(&self) -> Option<i32> {
        Some(700)
    }

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

    fn teardown(&self, ctx: &UnloadContext, state: &UnloadState) -> PluginCompletion {
        self.base.teardown(ctx, state, |_, _| {
            self.started.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            let finished = self.finished.clone();
            PluginCompletion::pending(async move {
                tokio::time::sleep(delay).await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
        })
    }
}

// =============================================================================
// Console sink
// =============================================================================

#[derive(Default)]
pub struct RecordingConsole {
    pub warnings: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingConsole {
    pub fn total(&self) -> usize {
        self.warnings.lock().len() + self.errors.lock().len()
    }
}

impl ConsoleSink for RecordingConsole {
    fn warn(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

/// Install a test subscriber once; RUST_LOG controls the output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
