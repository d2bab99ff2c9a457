//! native-bridge - foreign function dispatch and callback trampolines
//!
//! Managed code calls native functions through [`Bridge`]; native code calls
//! managed targets through trampolines created by the callback registry.
//!
//! Architecture:
//! - `interop` - type mapping, call interfaces, forward dispatch, libraries
//! - `callback` - executable arena, trampolines, uncaught failure routing
//! - `refs` - weak cross-language references, handles, thread attachment
//! - `bridge` - facade owning one of each
//! - `config`, `logging`, `error` - ambient stack

// Core modules
pub mod error;
pub mod interop;
pub mod callback;
pub mod refs;
pub mod bridge;

// Infrastructure
pub mod config;
pub mod logging;

// Re-export commonly used items
pub use bridge::{Bridge, BridgeStats};
pub use callback::{
    clear_uncaught_handler, set_uncaught_handler, Callback, CallbackId, CallbackInfo, CallbackRegistry,
    CallbackState, Conversion, DispatchMode, ExecutableArena, ManagedCallback, UncaughtHandler,
};
pub use config::BridgeConfig;
pub use error::{BridgeError, CallFailure, ConfigError, Position, Result};
pub use interop::{
    CallInterface, CifCache, ConventionTag, Function, GlobalVariable, Library, LogicalType, Memory, Pointer,
    Signature, StructDef, Structure, TypeConverter, TypeDescriptor, TypeMapper, TypeTag, Value,
};
pub use logging::LogConfig;
pub use refs::{
    target_fn, AttachGuard, CrossLangRef, FnTarget, HandleTable, ManagedRuntime, ManagedTarget, MethodId,
    ObjectHandle, ThreadLocalRuntime,
};

/// Initialize logging from discovered configuration and the environment
pub fn init() -> std::result::Result<&'static Bridge, ConfigError> {
    let config = BridgeConfig::from_env()?;
    logging::init_with_config(config.log_config());
    Ok(Bridge::global())
}

/// Initialize logging with an explicit configuration
///
/// The global bridge keeps its own discovered configuration; build a
/// [`Bridge`] from `config` for anything beyond logging.
pub fn init_with_config(config: &BridgeConfig) {
    logging::init_with_config(config.log_config());
}

/// Release every callback and handle held by the global bridge
pub fn cleanup() -> usize {
    Bridge::global().shutdown()
}
