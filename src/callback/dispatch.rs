//! Trampoline dispatch: native arguments in, one managed call, native result out
//!
//! Design:
//! - `trampoline_entry` is the only code libffi jumps to; it never unwinds
//! - Every exit path that is not a successful managed call writes a zeroed
//!   result of the declared width
//! - Conversion plans are computed at registration, dispatch only follows them
//! - A string or structure returned to native code stays alive until the same
//!   callback returns again on the same thread, or until release

use std::collections::HashMap;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use libffi::low::ffi_cif;
use parking_lot::Mutex;

use super::arena::SlotCell;
use super::handler::{self, CallbackInfo};
use super::{CallbackId, CallbackRegistry, Conversion, DispatchMode};
use crate::error::{BridgeError, CallFailure, Position, Result};
use crate::interop::types::ReturnWord;
use crate::interop::{
    self, CallInterface, Function, LogicalType, Memory, Pointer, RawValue, Signature, StructDef, Structure,
    TypeConverter, TypeDescriptor, TypeMapper, TypeTag, Value,
};
use crate::logging;
use crate::refs::{AttachGuard, CrossLangRef, ManagedRuntime, ManagedTarget, MethodId};

/// How one parameter or the return value crosses the trampoline
pub(crate) struct Plan {
    /// Built-in type after custom mapping
    ty: LogicalType,
    /// Native type at the trampoline boundary
    desc: TypeDescriptor,
    conversion: Conversion,
    converter: Option<Arc<dyn TypeConverter>>,
}

impl Plan {
    /// Plan for `declared` found at `position`
    ///
    /// Parameters in a variadic tail travel promoted.
    pub(crate) fn new(
        mapper: &TypeMapper,
        declared: &LogicalType,
        position: Position,
        variadic: bool,
    ) -> Result<Self> {
        let (ty, converter) = mapper.resolve(declared, position)?;
        if matches!(ty, LogicalType::Array | LogicalType::Reference) {
            return Err(BridgeError::UnsupportedType {
                position,
                type_name: declared.name(),
            });
        }
        let mut desc = mapper.describe_at(&ty, position)?;
        if variadic {
            desc = desc.variadic_promotion();
        }
        let conversion = match &ty {
            LogicalType::F32 if variadic => Conversion::PromoteFloat,
            LogicalType::Pointer => Conversion::WrapPointer,
            LogicalType::String => Conversion::DecodeString,
            LogicalType::WString => Conversion::DecodeWString,
            LogicalType::Struct(_) => Conversion::WrapStruct,
            LogicalType::StructByValue(_) => Conversion::CopyStruct,
            LogicalType::Callback(_) => Conversion::NestedCallback,
            _ => Conversion::Plain,
        };
        Ok(Self {
            ty,
            desc,
            conversion,
            converter,
        })
    }

    #[inline]
    pub(crate) fn descriptor(&self) -> &TypeDescriptor {
        &self.desc
    }

    /// Flag as reported to callers; mapped types report `Mapped`
    fn flag(&self) -> Conversion {
        if self.converter.is_some() {
            Conversion::Mapped
        } else {
            self.conversion
        }
    }

    fn struct_def(&self) -> std::result::Result<&Arc<StructDef>, CallFailure> {
        match &self.ty {
            LogicalType::Struct(def) | LogicalType::StructByValue(def) => Ok(def),
            other => Err(CallFailure::new(format!("{} is not a structure", other))),
        }
    }

    fn callback_signature(&self) -> std::result::Result<&Arc<Signature>, CallFailure> {
        match &self.ty {
            LogicalType::Callback(signature) => Ok(signature),
            other => Err(CallFailure::new(format!("{} is not a callback", other))),
        }
    }
}

/// Native memory backing the last pointer result handed out on a thread
enum Retained {
    Memory(Memory),
    Structure(Structure),
}

/// Everything the trampoline needs, shared between the callback and its slot
pub(crate) struct CallbackCore {
    id: CallbackId,
    target: CrossLangRef,
    method: MethodId,
    signature: Arc<Signature>,
    cif: Arc<CallInterface>,
    params: Vec<Plan>,
    ret: Plan,
    mode: DispatchMode,
    runtime: Arc<dyn ManagedRuntime>,
    registry: Weak<CallbackRegistry>,
    /// Latest string or structure result per thread
    retained: Mutex<HashMap<ThreadId, Retained>>,
}

impl CallbackCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CallbackId,
        target: &Arc<dyn ManagedTarget>,
        method: MethodId,
        signature: Arc<Signature>,
        cif: Arc<CallInterface>,
        params: Vec<Plan>,
        ret: Plan,
        runtime: Arc<dyn ManagedRuntime>,
        registry: Weak<CallbackRegistry>,
    ) -> Self {
        Self {
            id,
            target: CrossLangRef::new(target),
            method,
            signature,
            cif,
            params,
            ret,
            mode: target.dispatch_mode(),
            runtime,
            registry,
            retained: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> CallbackId {
        self.id
    }

    #[inline]
    pub(crate) fn target(&self) -> &CrossLangRef {
        &self.target
    }

    #[inline]
    pub(crate) fn signature(&self) -> &Arc<Signature> {
        &self.signature
    }

    #[inline]
    pub(crate) fn cif(&self) -> &Arc<CallInterface> {
        &self.cif
    }

    #[inline]
    pub(crate) fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub(crate) fn conversions(&self) -> Vec<Conversion> {
        self.params.iter().map(Plan::flag).collect()
    }

    pub(crate) fn return_conversion(&self) -> Conversion {
        self.ret.flag()
    }

    pub(crate) fn info(&self) -> CallbackInfo {
        CallbackInfo {
            id: self.id,
            method: self.method.clone(),
            target: self.target.describe().to_string(),
        }
    }

    pub(crate) fn clear_retained(&self) {
        self.retained.lock().clear();
    }

    /// Number of results currently kept alive
    pub(crate) fn retained_results(&self) -> usize {
        self.retained.lock().len()
    }

    /// Keep `result` alive, dropping this thread's previous one
    fn retain(&self, result: Retained) {
        self.retained.lock().insert(thread::current().id(), result);
    }

    /// Run one invocation
    ///
    /// # Safety
    /// `args` and `result` come from libffi for this core's CIF.
    unsafe fn dispatch(&self, args: *const *const c_void, result: Pointer) {
        let Some(target) = self.target.resolve() else {
            logging::log_target_gone(self.id.0);
            zero_result(self.cif.return_type(), result);
            return;
        };

        let _attached = match AttachGuard::acquire(self.runtime.clone()) {
            Ok(guard) => guard,
            Err(err) => return self.fail(CallFailure::from(err), result),
        };

        let registry = self.registry.upgrade();
        let mut values = Vec::with_capacity(self.params.len());
        for (index, plan) in self.params.iter().enumerate() {
            let at = Pointer::from_raw(*args.add(index));
            match self.decode(plan, at, registry.as_deref()) {
                Ok(value) => values.push(value),
                Err(failure) => return self.fail(failure, result),
            }
        }

        let outcome = self
            .runtime
            .invoke_method(&target, &self.method, values)
            .and_then(|value| self.encode(value, result, registry.as_deref()));
        if let Err(failure) = outcome {
            self.fail(failure, result);
        }
    }

    unsafe fn fail(&self, failure: CallFailure, result: Pointer) {
        handler::report(&self.info(), &failure);
        zero_result(self.cif.return_type(), result);
    }

    /// Native argument at `at` to a managed value
    unsafe fn decode(
        &self,
        plan: &Plan,
        at: Pointer,
        registry: Option<&CallbackRegistry>,
    ) -> std::result::Result<Value, CallFailure> {
        let address = || at.read::<usize>(0);

        if self.mode == DispatchMode::Proxy && plan.ty.is_pointer_like() {
            return Ok(Value::pointer_or_null(address()));
        }

        let value = match plan.conversion {
            Conversion::Plain | Conversion::Mapped => {
                let raw = Value::read_scalar(plan.desc.tag(), at);
                // Promoted small integers narrow back to the declared width
                match plan.ty.builtin_descriptor().map(|d| d.tag()) {
                    Some(tag) if tag != plan.desc.tag() => raw.coerce(tag).unwrap_or(raw),
                    _ => raw,
                }
            }
            Conversion::PromoteFloat => Value::F32(at.read::<f64>(0) as f32),
            Conversion::WrapPointer => Value::pointer_or_null(address()),
            Conversion::DecodeString => match address() {
                0 => Value::Null,
                a => Value::String(Pointer::new(a).read_c_string(0)),
            },
            Conversion::DecodeWString => match address() {
                0 => Value::Null,
                a => Value::WString(Pointer::new(a).read_wide_string(0)),
            },
            Conversion::WrapStruct => match address() {
                0 => Value::Null,
                a => Value::Struct(Structure::at(plan.struct_def()?.clone(), Pointer::new(a))),
            },
            Conversion::CopyStruct => {
                let copy = Structure::copied_from(plan.struct_def()?.clone(), at)?;
                Value::Struct(copy.by_value())
            }
            Conversion::NestedCallback => match address() {
                0 => Value::Null,
                a => {
                    let signature = plan.callback_signature()?;
                    match registry {
                        Some(registry) => interop::function_value(Pointer::new(a), signature, registry),
                        None => Value::Function(
                            Function::new(Pointer::new(a), signature.convention()).with_signature(signature.clone()),
                        ),
                    }
                }
            },
        };

        match (&plan.converter, self.mode) {
            (Some(converter), DispatchMode::Direct) => converter.from_native(value),
            _ => Ok(value),
        }
    }

    /// Managed result to the native return slot
    unsafe fn encode(
        &self,
        value: Value,
        result: Pointer,
        registry: Option<&CallbackRegistry>,
    ) -> std::result::Result<(), CallFailure> {
        if self.ret.ty == LogicalType::Void {
            return Ok(());
        }
        let value = match (&self.ret.converter, self.mode) {
            (Some(converter), DispatchMode::Direct) => converter.to_native(value)?,
            _ => value,
        };

        match self.mode {
            DispatchMode::Direct => self.encode_exact(value, result, registry),
            DispatchMode::Proxy => {
                if self.encode_exact(value.clone(), result, registry).is_ok() {
                    return Ok(());
                }
                let tag = self.ret.desc.tag();
                let written = value
                    .coerce(tag)
                    .map_or(false, |coerced| write_return_scalar(tag, &coerced, result));
                if !written {
                    zero_result(&self.ret.desc, result);
                }
                Ok(())
            }
        }
    }

    unsafe fn encode_exact(
        &self,
        value: Value,
        result: Pointer,
        registry: Option<&CallbackRegistry>,
    ) -> std::result::Result<(), CallFailure> {
        use LogicalType as T;

        let plan = &self.ret;
        let mismatch = |value: &Value| {
            CallFailure::from(BridgeError::UnsupportedResult {
                expected: plan.ty.name(),
                actual: value.type_name().to_string(),
            })
        };
        let write_address = |address: Pointer| result.write::<usize>(0, address.address());

        match (&plan.ty, value) {
            (T::Pointer | T::String | T::WString | T::Struct(_) | T::Callback(_), Value::Null) => {
                write_address(Pointer::NULL);
            }
            (T::String, Value::String(s)) => {
                let memory = Memory::from_c_string(&s)?;
                write_address(memory.pointer());
                self.retain(Retained::Memory(memory));
            }
            (T::WString, Value::WString(s)) => {
                let memory = Memory::from_wide_string(&s)?;
                write_address(memory.pointer());
                self.retain(Retained::Memory(memory));
            }
            (T::Struct(def), Value::Struct(s)) if s.def() == def => {
                write_address(s.pointer());
                if s.is_owned() {
                    self.retain(Retained::Structure(s));
                }
            }
            (T::StructByValue(def), Value::Struct(s)) if s.def() == def => {
                s.copy_to(result);
            }
            (T::Callback(_) | T::Pointer, Value::Callback(managed)) => {
                let registry = registry.ok_or_else(|| CallFailure::new("callback registry is gone"))?;
                let nested = registry.register(managed.target(), managed.signature())?;
                write_address(nested.trampoline());
            }
            (T::Callback(_), Value::Function(function)) => {
                write_address(function.address());
            }
            (ty, value) if interop::compatible(ty, &value) => {
                if !write_return_scalar(plan.desc.tag(), &value, result) {
                    return Err(mismatch(&value));
                }
            }
            (_, value) => return Err(mismatch(&value)),
        }
        Ok(())
    }
}

/// Write a scalar return value
///
/// Integers are written as a full return word, extended per signedness;
/// libffi reads the whole word back.
unsafe fn write_return_scalar(tag: TypeTag, value: &Value, result: Pointer) -> bool {
    if !tag.is_integral() || tag.size() > std::mem::size_of::<ReturnWord>() {
        return value.write_scalar(tag, result);
    }

    let mut raw = RawValue::zeroed();
    let cell = Pointer::from_raw(&mut raw as *mut RawValue);
    if !value.write_scalar(tag, cell) {
        return false;
    }
    let word = match Value::read_scalar(tag, cell) {
        Value::Bool(b) => b as ReturnWord,
        narrowed if tag.is_signed() => narrowed.as_i64().unwrap_or(0) as isize as ReturnWord,
        narrowed => narrowed.as_i128().unwrap_or(0) as u64 as ReturnWord,
    };
    result.write::<ReturnWord>(0, word);
    true
}

/// Zero the return slot for `ret`
///
/// Integer and pointer slots are at least a word wide.
pub(crate) unsafe fn zero_result(ret: &TypeDescriptor, result: Pointer) {
    let bytes = match ret.tag() {
        TypeTag::Void => 0,
        TypeTag::Aggregate | TypeTag::Float32 | TypeTag::Float64 => ret.size(),
        _ => ret.size().max(std::mem::size_of::<ReturnWord>()),
    };
    if bytes > 0 && !result.is_null() {
        std::ptr::write_bytes(result.as_ptr::<u8>(), 0, bytes);
    }
}

/// Entry point of every trampoline
///
/// # Safety
/// Called by libffi with the closure's CIF, return buffer, argument array
/// and the slot cell registered as userdata.
pub(crate) unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    cell: &SlotCell,
) {
    let result = Pointer::from_raw(result as *mut c_void);
    let _frame = cell.enter();

    let Some(core) = cell.binding() else {
        logging::log_invoked_after_release(cell.code());
        if let Some(cif) = cell.cif() {
            zero_result(cif.return_type(), result);
        }
        return;
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| core.dispatch(args, result)));
    if let Err(payload) = outcome {
        let failure = CallFailure::from_panic(payload);
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            handler::report(&core.info(), &failure);
            zero_result(core.cif().return_type(), result);
        }));
    }
}
