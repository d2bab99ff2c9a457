//! Structures backed by native memory
//!
//! A `StructDef` is the managed declaration (named fields with logical
//! types); its descriptor is laid out once with the natural-alignment rule,
//! or with every field at offset 0 for a union.
//! A `Structure` pairs a definition with native bytes, either an owned zeroed
//! block or a view of memory owned by someone else. Fields are read and
//! written in place, so a by-reference structure never needs a separate sync
//! step around a call.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use super::memory::{Memory, Pointer};
use super::types::{LogicalType, TypeDescriptor};
use super::value::Value;
use crate::error::{BridgeError, Position, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructField {
    name: String,
    ty: LogicalType,
    offset: usize,
    descriptor: TypeDescriptor,
}

impl StructField {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &LogicalType {
        &self.ty
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StructDef {
    name: String,
    fields: Vec<StructField>,
    descriptor: TypeDescriptor,
}

impl StructDef {
    pub fn new<N: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (N, LogicalType)>,
    ) -> Result<Arc<Self>> {
        Self::build(name.into(), fields, |members| TypeDescriptor::aggregate(members))
    }

    /// Union of `fields`; writing one field overwrites the others
    pub fn union<N: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (N, LogicalType)>,
    ) -> Result<Arc<Self>> {
        Self::build(name.into(), fields, |members| TypeDescriptor::union(members))
    }

    fn build<N: Into<String>>(
        name: String,
        fields: impl IntoIterator<Item = (N, LogicalType)>,
        layout: fn(Vec<TypeDescriptor>) -> Result<TypeDescriptor>,
    ) -> Result<Arc<Self>> {
        let mut declared = Vec::new();
        let mut descriptors = Vec::new();
        for (index, (field_name, ty)) in fields.into_iter().enumerate() {
            descriptors.push(field_descriptor(index, &ty)?);
            declared.push((field_name.into(), ty));
        }

        let descriptor = layout(descriptors)?;
        let fields = declared
            .into_iter()
            .zip(descriptor.members())
            .map(|((name, ty), member)| StructField {
                name,
                ty,
                offset: member.offset,
                descriptor: member.ty.clone(),
            })
            .collect();

        Ok(Arc::new(Self {
            name,
            fields,
            descriptor,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> usize {
        self.descriptor.size()
    }

    pub fn align(&self) -> usize {
        self.descriptor.align()
    }

    pub fn is_union(&self) -> bool {
        self.descriptor.is_union()
    }
}

fn field_descriptor(index: usize, ty: &LogicalType) -> Result<TypeDescriptor> {
    let unsupported = || BridgeError::UnsupportedType {
        position: Position::Field(index),
        type_name: ty.name(),
    };
    match ty {
        LogicalType::Void | LogicalType::Array | LogicalType::Reference | LogicalType::Mapped(_) => {
            Err(unsupported())
        }
        _ => ty.builtin_descriptor().ok_or_else(unsupported),
    }
}

/// A structure instance over native bytes
#[derive(Clone)]
pub struct Structure {
    def: Arc<StructDef>,
    base: Pointer,
    backing: Option<Arc<Memory>>,
    by_value: bool,
    /// Strings written into pointer fields live as long as the structure
    keepalive: Arc<Mutex<Vec<Memory>>>,
}

impl Structure {
    /// Allocate a zeroed instance
    pub fn new(def: Arc<StructDef>) -> Result<Self> {
        let memory = Arc::new(Memory::allocate(def.size())?);
        Ok(Self {
            base: memory.pointer(),
            def,
            backing: Some(memory),
            by_value: false,
            keepalive: Arc::default(),
        })
    }

    /// View of a structure owned by native code
    ///
    /// # Safety
    /// `ptr` must stay valid for `def.size()` bytes while the view is used.
    pub unsafe fn at(def: Arc<StructDef>, ptr: Pointer) -> Self {
        Self {
            def,
            base: ptr,
            backing: None,
            by_value: false,
            keepalive: Arc::default(),
        }
    }

    /// Owned copy of the bytes at `ptr`
    ///
    /// # Safety
    /// `ptr` must be readable for `def.size()` bytes.
    pub unsafe fn copied_from(def: Arc<StructDef>, ptr: Pointer) -> Result<Self> {
        let copy = Self::new(def)?;
        std::ptr::copy_nonoverlapping(ptr.as_ptr::<u8>(), copy.base.as_ptr::<u8>(), copy.size());
        Ok(copy)
    }

    /// Mark this instance to be passed by value when the type is inferred
    pub fn by_value(mut self) -> Self {
        self.by_value = true;
        self
    }

    pub fn by_reference(mut self) -> Self {
        self.by_value = false;
        self
    }

    pub fn is_by_value(&self) -> bool {
        self.by_value
    }

    pub fn def(&self) -> &Arc<StructDef> {
        &self.def
    }

    pub fn pointer(&self) -> Pointer {
        self.base
    }

    pub fn size(&self) -> usize {
        self.def.size()
    }

    pub fn is_owned(&self) -> bool {
        self.backing.is_some()
    }

    /// Whether both handles address the same bytes
    pub fn same_memory(&self, other: &Structure) -> bool {
        self.base == other.base
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: the structure covers `size` bytes from `base`
        unsafe { self.base.read_bytes(0, self.size()) }
    }

    /// Copy this structure's bytes to `dest`
    ///
    /// # Safety
    /// `dest` must be writable for `self.size()` bytes.
    pub(crate) unsafe fn copy_to(&self, dest: Pointer) {
        std::ptr::copy_nonoverlapping(self.base.as_ptr::<u8>(), dest.as_ptr::<u8>(), self.size());
    }

    fn field_or_err(&self, name: &str) -> Result<&StructField> {
        self.def.field(name).ok_or_else(|| BridgeError::UnsupportedArgument {
            index: 0,
            expected: format!("a field of struct {}", self.def.name()),
            actual: name.to_string(),
        })
    }

    /// Read one field
    pub fn get(&self, name: &str) -> Result<Value> {
        let field = self.field_or_err(name)?;
        let at = self.base.offset(field.offset);
        // SAFETY: field offsets lie inside the structure
        let value = unsafe {
            match &field.ty {
                LogicalType::Pointer | LogicalType::Callback(_) => {
                    Value::pointer_or_null(at.read::<usize>(0))
                }
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
                LogicalType::StructByValue(def) => Value::Struct(Structure {
                    def: def.clone(),
                    base: at,
                    backing: self.backing.clone(),
                    by_value: true,
                    keepalive: self.keepalive.clone(),
                }),
                _ => Value::read_scalar(field.descriptor.tag(), at),
            }
        };
        Ok(value)
    }

    /// Write one field
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        let field = self.field_or_err(name)?;
        let at = self.base.offset(field.offset);
        let mismatch = || BridgeError::UnsupportedArgument {
            index: 0,
            expected: field.ty.name(),
            actual: value.type_name().to_string(),
        };

        match (&field.ty, &value) {
            (LogicalType::String, Value::String(s)) => {
                let memory = Memory::from_c_string(s)?;
                // SAFETY: pointer-sized field inside the structure
                unsafe { at.write::<usize>(0, memory.pointer().address()) };
                self.keepalive.lock().push(memory);
            }
            (LogicalType::WString, Value::WString(s)) => {
                let memory = Memory::from_wide_string(s)?;
                // SAFETY: pointer-sized field inside the structure
                unsafe { at.write::<usize>(0, memory.pointer().address()) };
                self.keepalive.lock().push(memory);
            }
            (LogicalType::StructByValue(def), Value::Struct(s)) => {
                if s.def != *def {
                    return Err(mismatch());
                }
                // SAFETY: both sides span `def.size()` bytes
                unsafe { s.copy_to(at) };
            }
            (LogicalType::Struct(def), Value::Struct(s)) => {
                if s.def != *def {
                    return Err(mismatch());
                }
                // SAFETY: pointer-sized field inside the structure
                unsafe { at.write::<usize>(0, s.pointer().address()) };
            }
            (ty, _) if ty.is_pointer_like() => {
                let address = value.address().ok_or_else(mismatch)?;
                // SAFETY: pointer-sized field inside the structure
                unsafe { at.write::<usize>(0, address.address()) };
            }
            _ => {
                // SAFETY: the field has room for its own tag
                let written = unsafe { value.write_scalar(field.descriptor.tag(), at) };
                if !written {
                    return Err(mismatch());
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for Structure {
    fn eq(&self, other: &Self) -> bool {
        self.def == other.def && self.base == other.base
    }
}

impl Hash for Structure {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.hash(state);
    }
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Structure")
            .field("name", &self.def.name())
            .field("at", &self.base)
            .field("owned", &self.is_owned())
            .field("by_value", &self.by_value)
            .finish()
    }
}
