//! Argument and result marshalling
//!
//! Design:
//! - `ArgumentFrame` owns everything a call borrows: raw argument storage,
//!   array copies, temporary native strings and in/out scratch cells, all
//!   drawn from the calling thread's buffer pool
//! - Every argument is converted before the native call; the first failure
//!   aborts with its parameter index and nothing is called
//! - Dropping the frame releases pins and temporaries exactly once, on every
//!   exit path

use std::fmt;
use std::os::raw::c_void;
use std::sync::Arc;

use smallvec::SmallVec;

use super::call::Function;
use super::mapper::TypeMapper;
use super::memory::Pointer;
use super::pool::PooledBuffer;
use super::structure::Structure;
use super::types::{LogicalType, RawValue, ReturnWord, TypeDescriptor, TypeTag};
use super::value::{ArrayRef, ByReference, PinnedArray, Value};
use crate::callback::{Callback, CallbackRegistry, ManagedCallback};
use crate::error::{BridgeError, Position, Result};

/// Raw arguments of one native call plus the resources they borrow
pub(crate) struct ArgumentFrame {
    storage: Vec<RawValue>,
    values: Vec<*mut c_void>,
    descriptors: Vec<TypeDescriptor>,
    pins: SmallVec<[PinnedArray; 2]>,
    temporaries: SmallVec<[PooledBuffer; 4]>,
    structures: Vec<Structure>,
    references: Vec<(ByReference, TypeTag, usize)>,
    callbacks: Vec<Arc<Callback>>,
}

impl ArgumentFrame {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            storage: vec![RawValue::zeroed(); count],
            values: vec![std::ptr::null_mut(); count],
            descriptors: Vec::with_capacity(count),
            pins: SmallVec::new(),
            temporaries: SmallVec::new(),
            structures: Vec::new(),
            references: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn descriptors(&self) -> &[TypeDescriptor] {
        &self.descriptors
    }

    #[inline]
    pub(crate) fn values_ptr(&mut self) -> *mut *mut c_void {
        self.values.as_mut_ptr()
    }

    /// Convert argument `index`
    ///
    /// Arguments must be pushed in order. With `declared` the value is
    /// checked against the declared type; without it the native type is
    /// inferred from the value's runtime category.
    pub(crate) fn push(
        &mut self,
        index: usize,
        declared: Option<&LogicalType>,
        value: &Value,
        mapper: &TypeMapper,
        callbacks: &CallbackRegistry,
    ) -> Result<()> {
        debug_assert_eq!(index, self.descriptors.len());

        let resolved;
        let converted;
        let (declared, value) = match declared {
            Some(ty @ LogicalType::Mapped(_)) => {
                let (native, converter) = mapper.resolve(ty, Position::Parameter(index))?;
                resolved = native;
                converted = match converter {
                    Some(converter) => converter
                        .to_native(value.clone())
                        .map_err(|failure| BridgeError::argument(index, ty.name(), failure.message()))?,
                    None => value.clone(),
                };
                (Some(&resolved), &converted)
            }
            other => (other, value),
        };

        let descriptor = match declared {
            Some(ty) => {
                let descriptor = mapper.describe_at(ty, Position::Parameter(index))?;
                if !compatible(ty, value) {
                    return Err(BridgeError::argument(index, ty.name(), value.type_name()));
                }
                descriptor
            }
            None => value
                .inferred_descriptor()
                .ok_or_else(|| BridgeError::argument(index, "a value", value.type_name()))?,
        };

        // Stable: `storage` never reallocates after `new`
        let slot: *mut RawValue = &mut self.storage[index];
        self.values[index] = slot as *mut c_void;
        let mismatch = || BridgeError::argument(index, descriptor.tag().name(), value.type_name());

        match value {
            Value::Struct(s) if descriptor.is_aggregate() => {
                self.values[index] = s.pointer().as_ptr();
                self.structures.push(s.clone());
            }
            Value::Array(array) => {
                let ptr = self.pin(array)?;
                self.storage[index] = RawValue::from_ptr(ptr.as_ptr());
            }
            Value::String(s) => {
                let memory = PooledBuffer::c_string(s)?;
                self.storage[index] = RawValue::from_ptr(memory.pointer().as_ptr());
                self.temporaries.push(memory);
            }
            Value::WString(s) => {
                let memory = PooledBuffer::wide_string(s)?;
                self.storage[index] = RawValue::from_ptr(memory.pointer().as_ptr());
                self.temporaries.push(memory);
            }
            Value::Reference(reference) => {
                let tag = reference
                    .tag()
                    .ok_or_else(|| BridgeError::argument(index, "scalar reference", "non-scalar reference"))?;
                let memory = PooledBuffer::zeroed(tag.size().max(std::mem::size_of::<u64>()))?;
                // SAFETY: the scratch cell is at least as wide as `tag`
                unsafe { reference.get().write_scalar(tag, memory.pointer()) };
                self.storage[index] = RawValue::from_ptr(memory.pointer().as_ptr());
                self.references.push((reference.clone(), tag, self.temporaries.len()));
                self.temporaries.push(memory);
            }
            Value::Callback(managed) => {
                let callback = callbacks.register(managed.target(), managed.signature())?;
                self.storage[index] = RawValue::from_ptr(callback.trampoline().as_ptr());
                self.callbacks.push(callback);
            }
            other if descriptor.tag() == TypeTag::Pointer => {
                let address = other.address().ok_or_else(mismatch)?;
                self.storage[index] = RawValue::from_ptr(address.as_ptr());
            }
            other => {
                // SAFETY: `slot` is an 8-byte cell owned by this frame
                let written = unsafe { other.write_scalar(descriptor.tag(), Pointer::from_raw(slot)) };
                if !written {
                    return Err(mismatch());
                }
            }
        }

        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Pin `array` once per frame, however often it is passed
    fn pin(&mut self, array: &ArrayRef) -> Result<Pointer> {
        if let Some(existing) = self.pins.iter().find(|p| p.array().ptr_eq(array)) {
            return Ok(existing.pointer());
        }
        let pinned = array.pin()?;
        let ptr = pinned.pointer();
        self.pins.push(pinned);
        Ok(ptr)
    }

    /// Apply C default promotions to every argument from `fixed` on
    pub(crate) fn promote_variadic(&mut self, fixed: usize) {
        for index in fixed..self.descriptors.len() {
            let from = self.descriptors[index].tag();
            let raw = &mut self.storage[index];
            // SAFETY: the active field matches `from`, written in `push`
            unsafe {
                match from {
                    TypeTag::Float32 => {
                        let v = raw.f32;
                        *raw = RawValue::zeroed();
                        raw.f64 = v as f64;
                    }
                    TypeTag::Bool | TypeTag::UInt8 => {
                        let v = raw.u8;
                        *raw = RawValue::zeroed();
                        raw.i32 = v as i32;
                    }
                    TypeTag::SInt8 => {
                        let v = raw.i8;
                        *raw = RawValue::zeroed();
                        raw.i32 = v as i32;
                    }
                    TypeTag::SInt16 => {
                        let v = raw.i16;
                        *raw = RawValue::zeroed();
                        raw.i32 = v as i32;
                    }
                    TypeTag::UInt16 => {
                        let v = raw.u16;
                        *raw = RawValue::zeroed();
                        raw.i32 = v as i32;
                    }
                    _ => continue,
                }
            }
            self.descriptors[index] = self.descriptors[index].variadic_promotion();
        }
    }

    /// Copy in/out cells back to their managed owners
    pub(crate) fn write_back(&self) {
        for (reference, tag, temp) in &self.references {
            if let Some(memory) = self.temporaries.get(*temp) {
                // SAFETY: scratch cell written in `push`, sized for `tag`
                reference.set(unsafe { Value::read_scalar(*tag, memory.pointer()) });
            }
        }
    }

    /// Arrays pinned by this frame
    #[cfg(test)]
    pub(crate) fn pinned(&self) -> usize {
        self.pins.len()
    }
}

/// Whether `value` may be passed where `declared` is expected
pub(crate) fn compatible(declared: &LogicalType, value: &Value) -> bool {
    use LogicalType as T;
    match (declared, value) {
        (T::Bool, Value::Bool(_))
        | (T::I8, Value::I8(_))
        | (T::U8, Value::U8(_))
        | (T::I16, Value::I16(_))
        | (T::U16, Value::U16(_))
        | (T::I32, Value::I32(_))
        | (T::U32, Value::U32(_))
        | (T::I64, Value::I64(_))
        | (T::U64, Value::U64(_))
        | (T::F32, Value::F32(_))
        | (T::F64, Value::F64(_)) => true,
        (T::NativeLong | T::NativeULong | T::SizeT, v) => v.as_i128().is_some(),
        (
            T::Pointer,
            Value::Null
            | Value::Pointer(_)
            | Value::Memory(_)
            | Value::Array(_)
            | Value::Struct(_)
            | Value::Function(_)
            | Value::Callback(_),
        ) => true,
        (T::String, Value::String(_) | Value::Null) => true,
        (T::WString, Value::WString(_) | Value::Null) => true,
        (T::Struct(def), Value::Struct(s)) => s.def() == def,
        (T::Struct(_), Value::Null) => true,
        (T::StructByValue(def), Value::Struct(s)) => s.def() == def,
        (T::Callback(sig), Value::Callback(cb)) => **cb.signature() == **sig,
        (T::Callback(_), Value::Function(_) | Value::Pointer(_) | Value::Null) => true,
        (T::Array, Value::Array(_) | Value::Null | Value::Pointer(_) | Value::Memory(_)) => true,
        (T::Reference, Value::Reference(_)) => true,
        _ => false,
    }
}

/// Logical types that can never come back from a native call
pub(crate) fn check_return(ret: &LogicalType) -> Result<()> {
    match ret {
        LogicalType::Array | LogicalType::Reference => Err(BridgeError::UnsupportedType {
            position: Position::Return,
            type_name: ret.name(),
        }),
        _ => Ok(()),
    }
}

/// Raw bytes a native call returned
pub struct RawResult {
    storage: Vec<u64>,
    ret: TypeDescriptor,
}

impl RawResult {
    pub(crate) fn new(ret: TypeDescriptor, bytes: usize) -> Self {
        Self {
            storage: vec![0u64; (bytes + 7) / 8],
            ret,
        }
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.storage.as_mut_ptr() as *mut c_void
    }

    #[inline]
    pub fn return_type(&self) -> &TypeDescriptor {
        &self.ret
    }

    #[inline]
    pub fn pointer(&self) -> Pointer {
        Pointer::from_raw(self.storage.as_ptr())
    }

    /// The returned value's own bytes
    pub fn bytes(&self) -> Vec<u8> {
        // SAFETY: storage holds at least `ret.size()` bytes
        unsafe { self.pointer().read_bytes(0, self.ret.size()) }
    }

    /// Scalar view of the result per the return descriptor
    ///
    /// Sub-word integers come back widened to a full word, so they are read
    /// as a word and truncated.
    pub fn scalar(&self) -> Value {
        let at = self.pointer();
        let tag = self.ret.tag();
        if tag.is_integral() && tag.size() < std::mem::size_of::<ReturnWord>() {
            // SAFETY: storage holds at least one word
            let word = unsafe { at.read::<ReturnWord>(0) };
            return match tag {
                TypeTag::Bool => Value::Bool(word as u8 != 0),
                TypeTag::SInt8 => Value::I8(word as i8),
                TypeTag::UInt8 => Value::U8(word as u8),
                TypeTag::SInt16 => Value::I16(word as i16),
                TypeTag::UInt16 => Value::U16(word as u16),
                TypeTag::SInt32 => Value::I32(word as i32),
                _ => Value::U32(word as u32),
            };
        }
        // SAFETY: storage holds at least `tag.size()` bytes
        unsafe { Value::read_scalar(tag, at) }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.scalar().as_i64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.scalar().as_f64()
    }

    /// Convert to the managed value for `ret`
    ///
    /// `ret` must already be resolved to a built-in type.
    pub(crate) fn into_value(self, ret: &LogicalType, callbacks: &CallbackRegistry) -> Result<Value> {
        let address = || {
            // SAFETY: pointer results fill the first word
            unsafe { self.pointer().read::<usize>(0) }
        };
        let value = match ret {
            LogicalType::Void => Value::Void,
            LogicalType::Pointer => Value::pointer_or_null(address()),
            LogicalType::String => match address() {
                0 => Value::Null,
                // SAFETY: the native function promised a C string
                a => Value::String(unsafe { Pointer::new(a).read_c_string(0) }),
            },
            LogicalType::WString => match address() {
                0 => Value::Null,
                // SAFETY: the native function promised a wide string
                a => Value::WString(unsafe { Pointer::new(a).read_wide_string(0) }),
            },
            LogicalType::Struct(def) => match address() {
                0 => Value::Null,
                // SAFETY: the native function promised a structure of this shape
                a => Value::Struct(unsafe { Structure::at(def.clone(), Pointer::new(a)) }),
            },
            LogicalType::StructByValue(def) => {
                // SAFETY: the return storage holds the whole aggregate
                Value::Struct(unsafe { Structure::copied_from(def.clone(), self.pointer())? })
            }
            LogicalType::Callback(signature) => match address() {
                0 => Value::Null,
                a => function_value(Pointer::new(a), signature, callbacks),
            },
            LogicalType::Array | LogicalType::Reference | LogicalType::Mapped(_) => {
                return Err(BridgeError::UnsupportedType {
                    position: Position::Return,
                    type_name: ret.name(),
                })
            }
            _ => self.scalar(),
        };
        Ok(value)
    }
}

impl fmt::Debug for RawResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResult")
            .field("ret", &self.ret)
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// Managed view of a native function pointer
///
/// Our own trampolines map back to the callback that owns them.
pub(crate) fn function_value(
    address: Pointer,
    signature: &Arc<super::types::Signature>,
    callbacks: &CallbackRegistry,
) -> Value {
    if let Some(callback) = callbacks.lookup(address) {
        if let Some(target) = callback.target() {
            return Value::Callback(ManagedCallback::new(target, callback.signature().clone()));
        }
    }
    // SAFETY: native code handed us this address as a function of `signature`
    let function = unsafe { Function::new(address, signature.convention()) }.with_signature(signature.clone());
    Value::Function(function)
}
