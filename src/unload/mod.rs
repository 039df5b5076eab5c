//! One-shot unload registries
//!
//! Both containers are drained when run: every entry executes at most once,
//! and a failing entry is logged as a warning without stopping the rest.

use std::panic::AssertUnwindSafe;

use parking_lot::Mutex;

use crate::diagnostics::{DiagnosticLogger, LoggingSeverity, MessageId};
use crate::pipeline::{UnloadContext, UnloadState};
use crate::plugin::call_plugin_safely_value;

pub type UnloadHandler = Box<dyn FnOnce(&UnloadContext, &UnloadState) + Send>;

/// Callbacks notified with the unload context and state
#[derive(Default)]
pub struct UnloadHandlerContainer {
    handlers: Mutex<Vec<UnloadHandler>>,
}

impl UnloadHandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, handler: F)
    where
        F: FnOnce(&UnloadContext, &UnloadState) + Send + 'static,
    {
        self.handlers.lock().push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Move every registered handler into a new container
    pub fn take(&self) -> Self {
        Self {
            handlers: Mutex::new(std::mem::take(&mut *self.handlers.lock())),
        }
    }

    /// Run and clear every handler; returns how many ran without failing
    pub fn run(&self, ctx: &UnloadContext, state: &UnloadState) -> usize {
        let handlers = std::mem::take(&mut *self.handlers.lock());
        let mut succeeded = 0;

        for handler in handlers {
            match call_plugin_safely_value(AssertUnwindSafe(|| handler(ctx, state))) {
                Ok(()) => succeeded += 1,
                Err(err) => ctx.diag_log().throw_internal(
                    LoggingSeverity::Warning,
                    MessageId::PLUGIN_EXCEPTION,
                    &format!("Unexpected error calling unload handler - {err}"),
                    None,
                    false,
                ),
            }
        }

        succeeded
    }
}

/// A registration that can be released, e.g. a config watcher or a timer
pub struct UnloadHook {
    release: Box<dyn FnOnce() + Send>,
}

impl UnloadHook {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Box::new(release),
        }
    }

    pub fn remove(self) {
        (self.release)();
    }
}

impl std::fmt::Debug for UnloadHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnloadHook").finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct UnloadHookContainer {
    hooks: Mutex<Vec<UnloadHook>>,
}

impl UnloadHookContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: UnloadHook) {
        self.hooks.lock().push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Move every registered hook into a new container
    pub fn take(&self) -> Self {
        Self {
            hooks: Mutex::new(std::mem::take(&mut *self.hooks.lock())),
        }
    }

    /// Release and clear every hook; returns how many released cleanly
    pub fn run(&self, logger: &DiagnosticLogger) -> usize {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        let mut succeeded = 0;

        for hook in hooks {
            match call_plugin_safely_value(AssertUnwindSafe(|| hook.remove())) {
                Ok(()) => succeeded += 1,
                Err(err) => logger.throw_internal(
                    LoggingSeverity::Warning,
                    MessageId::PLUGIN_EXCEPTION,
                    &format!("Unloading: {err}"),
                    None,
                    false,
                ),
            }
        }

        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pipeline::{LifecycleContext, UnloadReason};

    fn ctx() -> UnloadContext {
        LifecycleContext::detached(Arc::new(DiagnosticLogger::default()))
    }

    #[test]
    fn test_handlers_run_once_and_failures_are_contained() {
        let container = UnloadHandlerContainer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        container.add(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        container.add(|_, _| panic!("handler failure"));
        let counter = hits.clone();
        container.add(move |_, state| {
            assert_eq!(state.reason, UnloadReason::ManualTeardown);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let state = UnloadState::new(UnloadReason::ManualTeardown, false);
        assert_eq!(container.run(&ctx(), &state), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(container.is_empty());

        assert_eq!(container.run(&ctx(), &state), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hooks_release_once() {
        let container = UnloadHookContainer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = hits.clone();
            container.add(UnloadHook::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        container.add(UnloadHook::new(|| panic!("hook failure")));
        assert_eq!(container.len(), 4);

        let logger = DiagnosticLogger::default();
        assert_eq!(container.run(&logger), 3);
        assert_eq!(container.run(&logger), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
