//! Plugin Isolation and Panic Safety
//!
//! Every call into a plugin goes through one of these helpers. A plugin
//! "throws" when it returns an error or panics; both are converted to
//! [`PluginError`] so the chain can attribute the failure and keep going.
//!
//! # Safety Considerations
//!
//! - `catch_unwind` only catches panics, not aborts
//! - Plugins must not be built with `panic = "abort"`

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, UnwindSafe, catch_unwind};

use futures::FutureExt;
use futures::future::BoxFuture;

/// Plugin-specific error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// Plugin panicked during execution
    #[error("Plugin panicked: {0}")]
    Panic(String),

    /// Plugin initialization failed
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    /// Plugin rejected or failed to process an item
    #[error("Plugin processing failed: {0}")]
    ProcessingFailed(String),

    /// Plugin internal error
    #[error("Plugin internal error: {0}")]
    InternalError(String),
}

/// Safely call a plugin function with panic catching
///
/// Errors of any displayable type are flattened to
/// `PluginError::InternalError`.
pub fn call_plugin_safely<F, T, E>(plugin_fn: F) -> Result<T, PluginError>
where
    F: FnOnce() -> Result<T, E> + UnwindSafe,
    E: std::fmt::Display,
{
    match catch_unwind(plugin_fn) {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(PluginError::InternalError(e.to_string())),
        Err(panic_info) => {
            let msg = extract_panic_message(&panic_info);
            tracing::error!(message = %msg, "Plugin panicked");
            Err(PluginError::Panic(msg))
        }
    }
}

/// Safely call a plugin function that already returns `PluginError`,
/// preserving the original variant
pub fn call_plugin_preserving_error<F, T>(plugin_fn: F) -> Result<T, PluginError>
where
    F: FnOnce() -> Result<T, PluginError> + UnwindSafe,
{
    match catch_unwind(plugin_fn) {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = extract_panic_message(&panic_info);
            tracing::error!(message = %msg, "Plugin panicked");
            Err(PluginError::Panic(msg))
        }
    }
}

/// Safely call a plugin function that returns a value directly (no Result)
pub fn call_plugin_safely_value<F, T>(plugin_fn: F) -> Result<T, PluginError>
where
    F: FnOnce() -> T + UnwindSafe,
{
    match catch_unwind(plugin_fn) {
        Ok(result) => Ok(result),
        Err(panic_info) => {
            let msg = extract_panic_message(&panic_info);
            tracing::error!(message = %msg, "Plugin panicked");
            Err(PluginError::Panic(msg))
        }
    }
}

/// Wrap a plugin-provided future so a panic while polling it becomes an error
///
/// Panics inside tasks the future spawns itself are not caught.
pub fn guard_plugin_future<Fut>(future: Fut) -> BoxFuture<'static, Result<(), PluginError>>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .map(|outcome| {
            outcome.map_err(|panic_info| {
                let msg = extract_panic_message(&panic_info);
                tracing::error!(message = %msg, "Plugin panicked during async completion");
                PluginError::Panic(msg)
            })
        })
        .boxed()
}

/// Extract a message from a panic payload
pub fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_plugin_safely_success() {
        let result: Result<i32, PluginError> = call_plugin_safely(|| Ok::<_, String>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_call_plugin_safely_error() {
        let result: Result<i32, PluginError> =
            call_plugin_safely(|| Err::<i32, _>("test error".to_string()));
        assert!(matches!(result, Err(PluginError::InternalError(msg)) if msg == "test error"));
    }

    #[test]
    fn test_call_plugin_safely_panic() {
        let result: Result<i32, PluginError> =
            call_plugin_safely(|| -> Result<i32, String> { panic!("test panic") });
        assert!(matches!(result, Err(PluginError::Panic(msg)) if msg.contains("test panic")));
    }

    #[test]
    fn test_preserving_error_keeps_variant() {
        let result: Result<(), PluginError> = call_plugin_preserving_error(|| {
            Err(PluginError::ProcessingFailed("rejected".to_string()))
        });
        assert_eq!(
            result,
            Err(PluginError::ProcessingFailed("rejected".to_string()))
        );
    }

    #[test]
    fn test_call_plugin_safely_value_panic() {
        let result: Result<i32, PluginError> = call_plugin_safely_value(|| -> i32 { panic!("value panic") });
        assert!(matches!(result, Err(PluginError::Panic(_))));
    }

    #[tokio::test]
    async fn test_guard_plugin_future() {
        assert!(guard_plugin_future(async {}).await.is_ok());

        let result = guard_plugin_future(async {
            if true {
                panic!("async panic");
            }
        })
        .await;
        assert!(matches!(result, Err(PluginError::Panic(msg)) if msg.contains("async panic")));
    }
}
