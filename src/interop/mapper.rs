//! Logical-to-native type mapping
//!
//! Built-in logical types have a fixed native representation. Custom managed
//! types are registered by name with a `TypeConverter` that names the built-in
//! type they travel as and converts values in both directions.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::types::{LogicalType, TypeDescriptor};
use super::value::Value;
use crate::error::{BridgeError, CallFailure, Position, Result};

/// Converter for one custom managed type
pub trait TypeConverter: Send + Sync {
    /// Built-in type the value travels as
    fn native_type(&self) -> LogicalType;

    /// Managed value to a value of `native_type`
    fn to_native(&self, value: Value) -> std::result::Result<Value, CallFailure>;

    /// Value of `native_type` back to the managed value
    fn from_native(&self, value: Value) -> std::result::Result<Value, CallFailure>;
}

/// Registry of custom type converters
#[derive(Default)]
pub struct TypeMapper {
    converters: DashMap<Arc<str>, Arc<dyn TypeConverter>>,
}

impl TypeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `converter` for `LogicalType::Mapped(name)`
    ///
    /// The converter's native type must itself be a built-in type.
    pub fn register(&self, name: &str, converter: Arc<dyn TypeConverter>) -> Result<()> {
        let native = converter.native_type();
        if matches!(native, LogicalType::Mapped(_) | LogicalType::Void) {
            return Err(BridgeError::UnsupportedType {
                position: Position::Standalone,
                type_name: format!("mapped {} travelling as {}", name, native),
            });
        }
        self.converters.insert(Arc::from(name), converter);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.converters.remove(name).is_some()
    }

    pub fn converter(&self, name: &str) -> Option<Arc<dyn TypeConverter>> {
        self.converters.get(name).map(|c| c.value().clone())
    }

    /// Resolve `ty` to a built-in type plus the converter that produced it
    pub fn resolve(
        &self,
        ty: &LogicalType,
        position: Position,
    ) -> Result<(LogicalType, Option<Arc<dyn TypeConverter>>)> {
        match ty {
            LogicalType::Mapped(name) => {
                let converter = self.converter(name).ok_or_else(|| BridgeError::UnsupportedType {
                    position,
                    type_name: ty.name(),
                })?;
                Ok((converter.native_type(), Some(converter)))
            }
            other => Ok((other.clone(), None)),
        }
    }

    /// Native descriptor of a logical type
    pub fn describe(&self, ty: &LogicalType) -> Result<TypeDescriptor> {
        self.describe_at(ty, Position::Standalone)
    }

    /// Native descriptor of a logical type found at `position`
    ///
    /// `Void` is only valid as a return type.
    pub fn describe_at(&self, ty: &LogicalType, position: Position) -> Result<TypeDescriptor> {
        let (native, _) = self.resolve(ty, position)?;
        if native == LogicalType::Void && !matches!(position, Position::Return | Position::Standalone) {
            return Err(BridgeError::UnsupportedType {
                position,
                type_name: ty.name(),
            });
        }
        native.builtin_descriptor().ok_or_else(|| BridgeError::UnsupportedType {
            position,
            type_name: ty.name(),
        })
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl fmt::Debug for TypeMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMapper")
            .field("converters", &self.converters.len())
            .finish()
    }
}
