//! Logging infrastructure - structured tracing throughout the bridge
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels per module
//! - Zero-cost when disabled
//! - Span events on request
//! - Console or file output, human-readable or JSON

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::interop::Pointer;

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console output when `None`
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables on this config
    pub fn apply_env(&mut self) {
        // NATIVE_BRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("NATIVE_BRIDGE_LOG_LEVEL") {
            if let Some(level) = parse_level(&level) {
                self.level = level;
            }
        }

        if let Ok(path) = std::env::var("NATIVE_BRIDGE_LOG_FILE") {
            self.log_path = Some(path);
        }

        if std::env::var("NATIVE_BRIDGE_LOG_JSON").is_ok() {
            self.json_format = true;
        }

        if std::env::var("NATIVE_BRIDGE_LOG_SPANS").is_ok() {
            self.show_spans = true;
        }
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("native_bridge.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

/// Parse a level name, case-insensitively
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber; a subscriber installed by the
/// host application wins over ours.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("native_bridge={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = match &config.log_path {
            Some(path) => {
                let path = Path::new(path);
                let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                let file_name = path.file_name().unwrap_or(path.as_os_str());
                let appender = tracing_appender::rolling::never(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                let base = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_span_events(span_events)
                    .with_target(true);
                if config.json_format {
                    base.json().boxed()
                } else {
                    base.boxed()
                }
            }
            None => {
                let base = fmt::layer()
                    .with_writer(io::stderr)
                    .with_span_events(span_events)
                    .with_target(true)
                    .with_thread_ids(cfg!(debug_assertions))
                    .with_line_number(cfg!(debug_assertions));
                if config.json_format {
                    base.json().boxed()
                } else {
                    base.boxed()
                }
            }
        };

        let _ = tracing_subscriber::registry().with(env_filter).with(layer).try_init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

/// Log a native call about to be made
#[inline]
pub fn log_ffi_call(function: &str, args: usize) {
    tracing::trace!(event = "ffi_call", function, args, "Calling native function");
}

/// Log a native call that returned
#[inline]
pub fn log_ffi_return(function: &str) {
    tracing::trace!(event = "ffi_return", function, "Native function returned");
}

/// Log an argument that could not be marshalled
pub fn log_marshal_error(index: usize, error: &crate::error::BridgeError) {
    tracing::debug!(event = "marshal_error", index, error = %error, "Argument rejected");
}

/// Log a freshly prepared call interface
pub fn log_cif_prepared(args: usize, convention: &str, stack_bytes: usize) {
    tracing::debug!(
        event = "cif_prepared",
        args,
        convention,
        stack_bytes,
        "Call interface prepared"
    );
}

/// Log a callback bound to its trampoline
pub fn log_callback_created(id: u64, trampoline: Pointer, target: &str) {
    tracing::debug!(
        event = "callback_created",
        callback = id,
        trampoline = %trampoline,
        target,
        "Callback created"
    );
}

/// Log a callback release
pub fn log_callback_released(id: u64) {
    tracing::debug!(event = "callback_released", callback = id, "Callback released");
}

/// Log a trampoline invoked after its callback was released
pub fn log_invoked_after_release(trampoline: Pointer) {
    tracing::warn!(
        event = "invoked_after_release",
        trampoline = %trampoline,
        "Released callback invoked; returning zero"
    );
}

/// Log a callback whose managed target is gone
pub fn log_target_gone(id: u64) {
    tracing::warn!(
        event = "target_gone",
        callback = id,
        "Callback target no longer available; returning zero"
    );
}

/// Log executable arena growth
pub fn log_arena_grow(chunks: usize, capacity: usize) {
    tracing::debug!(event = "arena_grow", chunks, capacity, "Trampoline arena grew");
}

/// Log a callback failure nobody handled
pub fn log_uncaught(id: u64, method: &str, message: &str, panicked: bool) {
    tracing::error!(
        event = "callback_uncaught",
        callback = id,
        method,
        panicked,
        "Uncaught callback failure: {}",
        message
    );
}
