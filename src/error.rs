//! Error types for the bridge
//!
//! Design:
//! - One crate-wide enum carries every setup and marshalling failure
//! - Each variant keeps the context a caller needs for a precise message
//!   (parameter position, expected vs. actual type)
//! - Errors are always produced before a native call is made; nothing here
//!   describes a failure inside native code

use std::fmt;

use thiserror::Error;

use crate::interop::abi::ConventionTag;
use crate::interop::library::{LoadError, SymbolError};

/// Crate-wide result alias
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Where in a signature a type was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// Zero-based parameter index
    Parameter(usize),
    /// The return slot
    Return,
    /// Zero-based structure field index
    Field(usize),
    /// A type described outside of any signature
    Standalone,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Parameter(index) => write!(f, "parameter {}", index),
            Position::Return => write!(f, "return value"),
            Position::Field(index) => write!(f, "field {}", index),
            Position::Standalone => write!(f, "type"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("unsupported type at {position}: {type_name}")]
    UnsupportedType {
        position: Position,
        type_name: String,
    },

    #[error("unsupported argument at parameter {index}: expected {expected}, got {actual}")]
    UnsupportedArgument {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("unsupported result: expected {expected}, got {actual}")]
    UnsupportedResult { expected: String, actual: String },

    #[error("argument count mismatch: expected {expected}, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    #[error("too many arguments: {actual} exceeds the limit of {max}")]
    TooManyArguments { max: usize, actual: usize },

    #[error("calling convention {convention} is not supported on {target}")]
    BadCallingConvention {
        convention: ConventionTag,
        target: String,
    },

    #[error("bad type layout: {reason}")]
    BadTypeLayout { reason: String },

    #[error("callback target {callback} is no longer available")]
    TargetUnavailable { callback: u64 },

    #[error("callback {callback} has been released")]
    CallbackReleased { callback: u64 },

    #[error("failed to allocate {size} bytes of {what}")]
    AllocationFailure { what: &'static str, size: usize },

    #[error("access of {len} bytes at offset {offset} is outside a {size}-byte block")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("null pointer: {what}")]
    NullPointer { what: &'static str },

    #[error("thread attach failed: {0}")]
    Attach(String),

    #[error(transparent)]
    Library(#[from] LoadError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

impl BridgeError {
    pub(crate) fn layout(reason: impl Into<String>) -> Self {
        BridgeError::BadTypeLayout {
            reason: reason.into(),
        }
    }

    pub(crate) fn argument(index: usize, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BridgeError::UnsupportedArgument {
            index,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Parameter index this error refers to, if any
    pub fn parameter_index(&self) -> Option<usize> {
        match self {
            BridgeError::UnsupportedType {
                position: Position::Parameter(index),
                ..
            } => Some(*index),
            BridgeError::UnsupportedArgument { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Failure raised by a managed callback target
///
/// This is the managed-side analogue of an exception: it never crosses into
/// native frames, it is routed to the uncaught handler instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallFailure {
    message: String,
    panicked: bool,
}

impl CallFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    /// Build a failure from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked".to_string()
        };
        Self {
            message,
            panicked: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_panic(&self) -> bool {
        self.panicked
    }
}

impl From<BridgeError> for CallFailure {
    fn from(err: BridgeError) -> Self {
        CallFailure::new(err.to_string())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
