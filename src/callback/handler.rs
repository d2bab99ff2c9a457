//! Uncaught callback failures
//!
//! A failing callback cannot report to its native caller, so the failure is
//! handed to one process-wide handler, or logged when none is installed.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::CallbackId;
use crate::error::CallFailure;
use crate::logging;
use crate::refs::MethodId;

/// Which callback failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackInfo {
    pub id: CallbackId,
    pub method: MethodId,
    /// Description of the managed target
    pub target: String,
}

impl fmt::Display for CallbackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback {} ({}.{})", self.id, self.target, self.method)
    }
}

/// Receiver of failures raised inside callbacks
pub trait UncaughtHandler: Send + Sync {
    fn uncaught(&self, info: &CallbackInfo, failure: &CallFailure);
}

impl<F> UncaughtHandler for F
where
    F: Fn(&CallbackInfo, &CallFailure) + Send + Sync,
{
    fn uncaught(&self, info: &CallbackInfo, failure: &CallFailure) {
        self(info, failure)
    }
}

static HANDLER: Lazy<RwLock<Option<Arc<dyn UncaughtHandler>>>> = Lazy::new(|| RwLock::new(None));

/// Install `handler`, returning the previous one
pub fn set_uncaught_handler(handler: impl UncaughtHandler + 'static) -> Option<Arc<dyn UncaughtHandler>> {
    HANDLER.write().replace(Arc::new(handler))
}

/// Remove the installed handler, returning it
pub fn clear_uncaught_handler() -> Option<Arc<dyn UncaughtHandler>> {
    HANDLER.write().take()
}

pub fn uncaught_handler() -> Option<Arc<dyn UncaughtHandler>> {
    HANDLER.read().clone()
}

/// Route a callback failure
///
/// A handler that panics is itself caught and logged.
pub(crate) fn report(info: &CallbackInfo, failure: &CallFailure) {
    // Cloned out so the handler may replace itself
    let handler = HANDLER.read().clone();
    match handler {
        Some(handler) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.uncaught(info, failure)));
            if outcome.is_err() {
                tracing::error!(
                    event = "uncaught_handler_panicked",
                    callback = info.id.raw(),
                    "Uncaught handler panicked while handling: {}",
                    failure
                );
            }
        }
        None => logging::log_uncaught(info.id.raw(), info.method.as_str(), failure.message(), failure.is_panic()),
    }
}
