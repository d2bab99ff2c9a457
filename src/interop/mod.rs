//! Interoperability - call native functions from managed code
//!
//! Design: every call is described once, cached, and replayed through libffi
//!
//! Architecture:
//! - `types.rs` - native type descriptors, logical types, signatures
//! - `abi.rs` - calling conventions (System V, Win64, AAPCS64, i386)
//! - `mapper.rs` - logical-to-native mapping and custom converters
//! - `cif.rs` - prepared call interfaces and their cache
//! - `marshal.rs` - managed value <-> native argument conversion
//! - `call.rs` - forward dispatch
//! - `memory.rs`, `structure.rs`, `value.rs` - native memory and managed values
//! - `pool.rs` - per-thread marshalling buffers
//! - `library.rs` - dynamic library loading (dlopen/LoadLibrary)
//! - `global.rs` - typed access to exported data symbols

pub mod abi;
pub mod types;
mod mapper;
mod cif;
mod marshal;
mod call;
mod memory;
mod structure;
mod value;
mod pool;
pub(crate) mod library;
mod global;

pub use abi::{CallingConvention, ConventionTag, RegisterAllocator, Target};
pub use types::{LogicalType, Member, RawValue, Signature, TypeDescriptor, TypeTag, MAX_NESTING};
pub use mapper::{TypeConverter, TypeMapper};
pub use cif::{CallInterface, CifCache, CifCacheStats};
pub use marshal::RawResult;
pub use call::{Dispatcher, Function};
pub use memory::{alloc, free, Memory, NativeScalar, Pointer, WChar};
pub use structure::{StructDef, StructField, Structure};
pub use value::{ArrayData, ArrayRef, ByReference, Value};
pub use library::{libraries_loaded, Library, LoadError, SymbolError};
pub use global::GlobalVariable;
pub use pool::{pool_stats, PoolStats, BUFFERS_PER_CLASS, MAX_POOLED};

pub(crate) use marshal::{compatible, function_value};

/// Interop statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteropStats {
    pub calls_made: usize,
    pub marshaling_errors: usize,
    pub libraries_loaded: usize,
}

#[cfg(test)]
mod tests;
