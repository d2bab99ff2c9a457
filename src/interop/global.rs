//! Exported data symbols with typed access
//!
//! A `GlobalVariable` borrows the library that exports it, so the symbol
//! cannot outlive the mapping. Reads and writes go straight to the symbol's
//! storage; nothing is cached on the managed side.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::library::Library;
use super::mapper::{TypeConverter, TypeMapper};
use super::marshal::compatible;
use super::memory::{NativeScalar, Pointer};
use super::structure::Structure;
use super::types::{LogicalType, TypeDescriptor};
use super::value::Value;
use crate::error::{BridgeError, Position, Result};

pub struct GlobalVariable<'lib> {
    name: String,
    address: Pointer,
    declared: LogicalType,
    /// Built-in type after custom mapping
    ty: LogicalType,
    descriptor: TypeDescriptor,
    converter: Option<Arc<dyn TypeConverter>>,
    _library: PhantomData<&'lib Library>,
}

impl<'lib> GlobalVariable<'lib> {
    pub(crate) fn resolve(
        library: &'lib Library,
        name: &str,
        declared: LogicalType,
        mapper: Option<&TypeMapper>,
    ) -> Result<Self> {
        let unsupported = || BridgeError::UnsupportedType {
            position: Position::Standalone,
            type_name: format!("global {} of type {}", name, declared),
        };

        let (ty, converter) = match (mapper, &declared) {
            (Some(mapper), _) => mapper.resolve(&declared, Position::Standalone)?,
            (None, LogicalType::Mapped(_)) => return Err(unsupported()),
            (None, other) => (other.clone(), None),
        };
        if matches!(ty, LogicalType::Void | LogicalType::Array | LogicalType::Reference) {
            return Err(unsupported());
        }
        let descriptor = ty.builtin_descriptor().ok_or_else(unsupported)?;
        let address = library.symbol(name)?;

        tracing::trace!(event = "global_resolved", symbol = name, address = %address);
        Ok(Self {
            name: name.to_string(),
            address,
            declared,
            ty,
            descriptor,
            converter,
            _library: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the variable's storage
    pub fn address(&self) -> Pointer {
        self.address
    }

    pub fn ty(&self) -> &LogicalType {
        &self.declared
    }

    /// Current value
    ///
    /// String globals are `char*` variables and are read through the
    /// pointer; by-value structures come back as a view of the storage.
    pub fn get(&self) -> Result<Value> {
        let at = self.address;
        // SAFETY: the symbol is exported data of the declared type
        let value = unsafe {
            match &self.ty {
                LogicalType::Pointer | LogicalType::Callback(_) => Value::pointer_or_null(at.read::<usize>(0)),
                LogicalType::String => match at.read::<usize>(0) {
                    0 => Value::Null,
                    address => Value::String(Pointer::new(address).read_c_string(0)),
                },
                LogicalType::WString => match at.read::<usize>(0) {
                    0 => Value::Null,
                    address => Value::WString(Pointer::new(address).read_wide_string(0)),
                },
                LogicalType::Struct(def) => match at.read::<usize>(0) {
                    0 => Value::Null,
                    address => Value::Struct(Structure::at(def.clone(), Pointer::new(address))),
                },
                LogicalType::StructByValue(def) => Value::Struct(Structure::at(def.clone(), at).by_value()),
                _ => Value::read_scalar(self.descriptor.tag(), at),
            }
        };
        match &self.converter {
            Some(converter) => converter
                .from_native(value)
                .map_err(|failure| BridgeError::UnsupportedResult {
                    expected: self.declared.name(),
                    actual: failure.message().to_string(),
                }),
            None => Ok(value),
        }
    }

    /// Overwrite the variable
    ///
    /// Strings are read-only: the variable would point at memory the bridge
    /// cannot keep alive.
    pub fn set(&self, value: Value) -> Result<()> {
        let value = match &self.converter {
            Some(converter) => converter
                .to_native(value)
                .map_err(|failure| BridgeError::argument(0, self.declared.name(), failure.message()))?,
            None => value,
        };
        let mismatch = |value: &Value| BridgeError::argument(0, self.ty.name(), value.type_name());
        if matches!(self.ty, LogicalType::String | LogicalType::WString) || !compatible(&self.ty, &value) {
            return Err(mismatch(&value));
        }

        let at = self.address;
        match (&self.ty, &value) {
            (LogicalType::StructByValue(_), Value::Struct(s)) => {
                // SAFETY: both sides span the definition's size
                unsafe { s.copy_to(at) };
            }
            (ty, value) if ty.is_pointer_like() => {
                let address = match value {
                    Value::Struct(s) => s.pointer(),
                    other => other.address().ok_or_else(|| mismatch(other))?,
                };
                // SAFETY: pointer-sized variable
                unsafe { at.write::<usize>(0, address.address()) };
            }
            (_, value) => {
                // SAFETY: the storage is as wide as the declared tag
                let written = unsafe { value.write_scalar(self.descriptor.tag(), at) };
                if !written {
                    return Err(mismatch(value));
                }
            }
        }
        Ok(())
    }

    /// Raw read of the storage as `T`
    ///
    /// # Safety
    /// The variable must be at least `size_of::<T>()` bytes.
    pub unsafe fn read<T: NativeScalar>(&self) -> T {
        self.address.read(0)
    }

    /// # Safety
    /// As [`GlobalVariable::read`], and the storage must be writable.
    pub unsafe fn write<T: NativeScalar>(&self, value: T) {
        self.address.write(0, value)
    }
}

impl fmt::Debug for GlobalVariable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalVariable")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("ty", &self.declared)
            .finish()
    }
}
