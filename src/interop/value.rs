//! Managed values crossing the bridge
//!
//! `Value` is the dynamically typed argument/result of a bridged call. Its
//! runtime category decides how it is marshalled when no signature is
//! declared.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::call::Function;
use super::memory::{Memory, Pointer};
use super::pool::PooledBuffer;
use super::structure::Structure;
use super::types::{TypeDescriptor, TypeTag};
use crate::callback::ManagedCallback;
use crate::error::Result;

#[derive(Clone)]
pub enum Value {
    Void,
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(Pointer),
    Memory(Arc<Memory>),
    Array(ArrayRef),
    String(String),
    WString(String),
    Struct(Structure),
    Reference(ByReference),
    Callback(ManagedCallback),
    Function(Function),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Pointer(_) => "pointer",
            Value::Memory(_) => "memory",
            Value::Array(_) => "array",
            Value::String(_) => "string",
            Value::WString(_) => "wide string",
            Value::Struct(_) => "struct",
            Value::Reference(_) => "reference",
            Value::Callback(_) => "callback",
            Value::Function(_) => "function",
        }
    }

    /// Native tag for scalar categories
    pub fn scalar_tag(&self) -> Option<TypeTag> {
        let tag = match self {
            Value::Bool(_) => TypeTag::Bool,
            Value::I8(_) => TypeTag::SInt8,
            Value::U8(_) => TypeTag::UInt8,
            Value::I16(_) => TypeTag::SInt16,
            Value::U16(_) => TypeTag::UInt16,
            Value::I32(_) => TypeTag::SInt32,
            Value::U32(_) => TypeTag::UInt32,
            Value::I64(_) => TypeTag::SInt64,
            Value::U64(_) => TypeTag::UInt64,
            Value::F32(_) => TypeTag::Float32,
            Value::F64(_) => TypeTag::Float64,
            _ => return None,
        };
        Some(tag)
    }

    #[inline]
    pub fn pointer_or_null(address: usize) -> Value {
        if address == 0 {
            Value::Null
        } else {
            Value::Pointer(Pointer::new(address))
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Pointer(p) => p.is_null(),
            _ => false,
        }
    }

    /// Address of values that already are native addresses
    pub fn address(&self) -> Option<Pointer> {
        match self {
            Value::Null => Some(Pointer::NULL),
            Value::Pointer(p) => Some(*p),
            Value::Memory(m) => Some(m.pointer()),
            Value::Function(f) => Some(f.address()),
            Value::Struct(s) => Some(s.pointer()),
            _ => None,
        }
    }

    /// Integer payload, widened
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::I8(v) => Some(v as i128),
            Value::U8(v) => Some(v as i128),
            Value::I16(v) => Some(v as i128),
            Value::U16(v) => Some(v as i128),
            Value::I32(v) => Some(v as i128),
            Value::U32(v) => Some(v as i128),
            Value::I64(v) => Some(v as i128),
            Value::U64(v) => Some(v as i128),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::WString(s) => Some(s),
            _ => None,
        }
    }

    /// Read a scalar of `tag` at `at`
    ///
    /// # Safety
    /// `at` must be readable for `tag.size()` bytes.
    pub unsafe fn read_scalar(tag: TypeTag, at: Pointer) -> Value {
        match tag {
            TypeTag::Void | TypeTag::Aggregate => Value::Void,
            TypeTag::Bool => Value::Bool(at.read::<u8>(0) != 0),
            TypeTag::SInt8 => Value::I8(at.read(0)),
            TypeTag::UInt8 => Value::U8(at.read(0)),
            TypeTag::SInt16 => Value::I16(at.read(0)),
            TypeTag::UInt16 => Value::U16(at.read(0)),
            TypeTag::SInt32 => Value::I32(at.read(0)),
            TypeTag::UInt32 => Value::U32(at.read(0)),
            TypeTag::SInt64 => Value::I64(at.read(0)),
            TypeTag::UInt64 => Value::U64(at.read(0)),
            TypeTag::Float32 => Value::F32(at.read(0)),
            TypeTag::Float64 => Value::F64(at.read(0)),
            TypeTag::Pointer => Value::pointer_or_null(at.read::<usize>(0)),
        }
    }

    /// Write this value as a scalar of `tag` at `at`
    ///
    /// Integers convert only when the value fits; floats only widen. Returns
    /// `false` and writes nothing when the value does not fit.
    ///
    /// # Safety
    /// `at` must be writable for `tag.size()` bytes.
    pub unsafe fn write_scalar(&self, tag: TypeTag, at: Pointer) -> bool {
        macro_rules! int {
            ($t:ty) => {
                match self.as_i128().and_then(|v| <$t>::try_from(v).ok()) {
                    Some(v) => at.write::<$t>(0, v),
                    None => return false,
                }
            };
        }

        match tag {
            TypeTag::Bool => match self {
                Value::Bool(b) => at.write::<u8>(0, *b as u8),
                _ => return false,
            },
            TypeTag::SInt8 => int!(i8),
            TypeTag::UInt8 => int!(u8),
            TypeTag::SInt16 => int!(i16),
            TypeTag::UInt16 => int!(u16),
            TypeTag::SInt32 => int!(i32),
            TypeTag::UInt32 => int!(u32),
            TypeTag::SInt64 => int!(i64),
            TypeTag::UInt64 => int!(u64),
            TypeTag::Float32 => match self {
                Value::F32(v) => at.write::<f32>(0, *v),
                _ => return false,
            },
            TypeTag::Float64 => match self.as_f64() {
                Some(v) => at.write::<f64>(0, v),
                None => return false,
            },
            TypeTag::Pointer => match self.address() {
                Some(p) => at.write::<usize>(0, p.address()),
                None => return false,
            },
            TypeTag::Void | TypeTag::Aggregate => return false,
        }
        true
    }

    /// Lenient conversion used by proxy dispatch
    ///
    /// Any numeric or boolean value is cast to `tag`, addresses become
    /// pointers; anything else is `None`.
    pub fn coerce(&self, tag: TypeTag) -> Option<Value> {
        let float = self.as_f64();
        let int = self
            .as_i128()
            .or_else(|| self.as_bool().map(|b| b as i128))
            .or_else(|| float.map(|f| f as i128));
        let value = match tag {
            TypeTag::Void => Value::Void,
            TypeTag::Bool => Value::Bool(int? != 0),
            TypeTag::SInt8 => Value::I8(int? as i8),
            TypeTag::UInt8 => Value::U8(int? as u8),
            TypeTag::SInt16 => Value::I16(int? as i16),
            TypeTag::UInt16 => Value::U16(int? as u16),
            TypeTag::SInt32 => Value::I32(int? as i32),
            TypeTag::UInt32 => Value::U32(int? as u32),
            TypeTag::SInt64 => Value::I64(int? as i64),
            TypeTag::UInt64 => Value::U64(int? as u64),
            TypeTag::Float32 => Value::F32(float.or_else(|| int.map(|i| i as f64))? as f32),
            TypeTag::Float64 => Value::F64(float.or_else(|| int.map(|i| i as f64))?),
            TypeTag::Pointer => Value::Pointer(self.address()?),
            TypeTag::Aggregate => return None,
        };
        Some(value)
    }

    /// Descriptor inferred from the runtime category
    pub(crate) fn inferred_descriptor(&self) -> Option<TypeDescriptor> {
        if let Some(tag) = self.scalar_tag() {
            return Some(TypeDescriptor::primitive(tag));
        }
        match self {
            Value::Void => None,
            Value::Struct(s) if s.is_by_value() => Some(s.def().descriptor().clone()),
            _ => Some(TypeDescriptor::POINTER),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Memory(a), Value::Memory(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::WString(a), Value::WString(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a.ptr_eq(b),
            (Value::Callback(a), Value::Callback(b)) => a.same_target(b),
            (Value::Function(a), Value::Function(b)) => a.address() == b.address(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "Void"),
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::I8(v) => write!(f, "I8({})", v),
            Value::U8(v) => write!(f, "U8({})", v),
            Value::I16(v) => write!(f, "I16({})", v),
            Value::U16(v) => write!(f, "U16({})", v),
            Value::I32(v) => write!(f, "I32({})", v),
            Value::U32(v) => write!(f, "U32({})", v),
            Value::I64(v) => write!(f, "I64({})", v),
            Value::U64(v) => write!(f, "U64({})", v),
            Value::F32(v) => write!(f, "F32({})", v),
            Value::F64(v) => write!(f, "F64({})", v),
            Value::Pointer(p) => write!(f, "Pointer({:?})", p),
            Value::Memory(m) => write!(f, "{:?}", m),
            Value::Array(a) => write!(f, "Array({}, len={})", a.element_tag(), a.len()),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::WString(s) => write!(f, "WString({:?})", s),
            Value::Struct(s) => write!(f, "{:?}", s),
            Value::Reference(r) => write!(f, "Reference({:?})", r.get()),
            Value::Callback(c) => write!(f, "Callback({})", c.describe()),
            Value::Function(func) => write!(f, "{:?}", func),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl From<$t> for Value {
                #[inline]
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    bool => Bool, i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, f32 => F32, f64 => F64, Pointer => Pointer, String => String,
    Structure => Struct, ArrayRef => Array, ByReference => Reference, Function => Function
);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

// ===== Primitive arrays =====

/// Backing storage of a primitive array
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::I8(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::U16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::U32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::U64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_tag(&self) -> TypeTag {
        match self {
            ArrayData::I8(_) => TypeTag::SInt8,
            ArrayData::U8(_) => TypeTag::UInt8,
            ArrayData::I16(_) => TypeTag::SInt16,
            ArrayData::U16(_) => TypeTag::UInt16,
            ArrayData::I32(_) => TypeTag::SInt32,
            ArrayData::U32(_) => TypeTag::UInt32,
            ArrayData::I64(_) => TypeTag::SInt64,
            ArrayData::U64(_) => TypeTag::UInt64,
            ArrayData::F32(_) => TypeTag::Float32,
            ArrayData::F64(_) => TypeTag::Float64,
        }
    }

    /// Raw element bytes in native order
    fn as_bytes(&self) -> &[u8] {
        let (ptr, len) = match self {
            ArrayData::I8(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::U8(v) => (v.as_ptr(), v.len()),
            ArrayData::I16(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::U16(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::I32(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::U32(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::I64(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::U64(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::F32(v) => (v.as_ptr() as *const u8, v.len()),
            ArrayData::F64(v) => (v.as_ptr() as *const u8, v.len()),
        };
        // SAFETY: every element type is plain data with no padding
        unsafe { std::slice::from_raw_parts(ptr, len * self.element_tag().size()) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let bytes = self.len() * self.element_tag().size();
        let ptr = match self {
            ArrayData::I8(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::U8(v) => v.as_mut_ptr(),
            ArrayData::I16(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::U16(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::I32(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::U32(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::I64(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::U64(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::F32(v) => v.as_mut_ptr() as *mut u8,
            ArrayData::F64(v) => v.as_mut_ptr() as *mut u8,
        };
        // SAFETY: any bit pattern is a valid element of every variant
        unsafe { std::slice::from_raw_parts_mut(ptr, bytes) }
    }
}

/// Shared primitive array that native code may borrow for one call
#[derive(Clone)]
pub struct ArrayRef {
    data: Arc<Mutex<ArrayData>>,
    pins: Arc<AtomicUsize>,
}

impl ArrayRef {
    pub fn new(data: ArrayData) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            pins: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_tag(&self) -> TypeTag {
        self.data.lock().element_tag()
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> ArrayData {
        self.data.lock().clone()
    }

    /// Run `f` with the contents locked
    pub fn with<R>(&self, f: impl FnOnce(&mut ArrayData) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Number of live pins (calls currently borrowing the storage)
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Copy the contents into a native buffer for one call
    ///
    /// The managed side stays free to read the array while native code
    /// holds the buffer, including from callbacks on the same thread. The
    /// buffer is copied back when the pin drops, replacing whatever the
    /// managed side wrote in the meantime.
    pub(crate) fn pin(&self) -> Result<PinnedArray> {
        let buffer = PooledBuffer::copy_of(self.data.lock().as_bytes())?;
        self.pins.fetch_add(1, Ordering::AcqRel);
        Ok(PinnedArray {
            array: self.clone(),
            buffer,
        })
    }
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayRef")
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// Native copy of an array for one call; written back exactly once on drop
pub(crate) struct PinnedArray {
    array: ArrayRef,
    buffer: PooledBuffer,
}

impl PinnedArray {
    #[inline]
    pub(crate) fn pointer(&self) -> Pointer {
        self.buffer.pointer()
    }

    #[inline]
    pub(crate) fn array(&self) -> &ArrayRef {
        &self.array
    }
}

impl Drop for PinnedArray {
    fn drop(&mut self) {
        {
            let mut data = self.array.data.lock();
            let bytes = data.as_bytes_mut();
            // A resize while pinned leaves only the common prefix to copy
            let len = bytes.len().min(self.buffer.len());
            bytes[..len].copy_from_slice(&self.buffer.as_slice()[..len]);
        }
        self.array.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

// ===== In/out scalars =====

/// Scalar cell passed to native code by address and read back after the call
#[derive(Clone)]
pub struct ByReference {
    cell: Arc<Mutex<Value>>,
}

impl ByReference {
    /// `initial` must be a scalar or a pointer; its category fixes the width
    pub fn new(initial: Value) -> Self {
        Self {
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> Value {
        self.cell.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.cell.lock() = value;
    }

    pub fn ptr_eq(&self, other: &ByReference) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Native tag of the cell, fixed by the current value's category
    pub(crate) fn tag(&self) -> Option<TypeTag> {
        let value = self.cell.lock();
        match &*value {
            Value::Null | Value::Pointer(_) => Some(TypeTag::Pointer),
            other => other.scalar_tag(),
        }
    }
}
