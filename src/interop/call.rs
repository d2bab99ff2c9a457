//! Forward dispatch: managed arguments in, one native call, managed result out
//!
//! Design:
//! - `Function` is only a capability (address + convention); it owns no code
//! - All conversion and CIF lookup happens before the native call, so a
//!   setup error never leaves a half-made call behind
//! - The native function runs exactly once per invocation; no retries

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::abi::ConventionTag;
use super::cif::{CallInterface, CifCache};
use super::library::{self, Library};
use super::mapper::TypeMapper;
use super::marshal::{self, ArgumentFrame, RawResult};
use super::memory::Pointer;
use super::types::{LogicalType, Signature};
use super::value::Value;
use super::InteropStats;
use crate::callback::CallbackRegistry;
use crate::error::{BridgeError, Position, Result};
use crate::logging;
use crate::refs::{AttachGuard, ManagedRuntime};

/// Native function handle
#[derive(Clone)]
pub struct Function {
    address: Pointer,
    convention: ConventionTag,
    name: Option<Arc<str>>,
    signature: Option<Arc<Signature>>,
}

impl Function {
    /// Wrap a native code address
    ///
    /// # Safety
    /// `address` must be a function following `convention` for as long as
    /// this handle (or any clone) is invoked.
    pub unsafe fn new(address: Pointer, convention: ConventionTag) -> Self {
        Self {
            address,
            convention,
            name: None,
            signature: None,
        }
    }

    /// Look up `name` in `library`
    pub fn from_library(library: &Library, name: &str, convention: ConventionTag) -> Result<Self> {
        let address = library.symbol(name)?;
        // SAFETY: exported symbols are code the caller chose to bind
        let function = unsafe { Self::new(address, convention) };
        Ok(function.with_name(name))
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(Arc::from(name));
        self
    }

    /// Attach the signature used by [`Dispatcher::invoke_function`]
    pub fn with_signature(mut self, signature: Arc<Signature>) -> Self {
        self.signature = Some(signature);
        self
    }

    #[inline]
    pub fn address(&self) -> Pointer {
        self.address
    }

    #[inline]
    pub fn convention(&self) -> ConventionTag {
        self.convention
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn signature(&self) -> Option<&Arc<Signature>> {
        self.signature.as_ref()
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => format!("{:?}", self.address),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("address", &self.address)
            .field("convention", &self.convention)
            .field("name", &self.name)
            .finish()
    }
}

/// Executes native calls
pub struct Dispatcher {
    cifs: Arc<CifCache>,
    mapper: Arc<TypeMapper>,
    callbacks: Arc<CallbackRegistry>,
    runtime: Arc<dyn ManagedRuntime>,
    max_args: usize,
    calls_made: AtomicUsize,
    marshaling_errors: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn new(
        cifs: Arc<CifCache>,
        mapper: Arc<TypeMapper>,
        callbacks: Arc<CallbackRegistry>,
        runtime: Arc<dyn ManagedRuntime>,
        max_args: usize,
    ) -> Self {
        Self {
            cifs,
            mapper,
            callbacks,
            runtime,
            max_args,
            calls_made: AtomicUsize::new(0),
            marshaling_errors: AtomicUsize::new(0),
        }
    }

    /// Call `function`, inferring native types from the arguments
    ///
    /// # Safety
    /// The inferred native signature must match the function's real one.
    pub unsafe fn invoke(&self, function: &Function, ret: &LogicalType, args: &[Value]) -> Result<Value> {
        self.dispatch(function, ret, args, None, None)
    }

    /// Call a variadic function; arguments from `fixed` on are promoted
    ///
    /// # Safety
    /// As [`Dispatcher::invoke`].
    pub unsafe fn invoke_variadic(
        &self,
        function: &Function,
        ret: &LogicalType,
        fixed: usize,
        args: &[Value],
    ) -> Result<Value> {
        if fixed > args.len() {
            return Err(BridgeError::ArgumentCount {
                expected: fixed,
                actual: args.len(),
            });
        }
        self.dispatch(function, ret, args, None, Some(fixed))
    }

    /// Call `function` with a declared signature, checking every argument
    ///
    /// # Safety
    /// `signature` must describe the function's real native signature.
    pub unsafe fn invoke_signature(
        &self,
        function: &Function,
        signature: &Signature,
        args: &[Value],
    ) -> Result<Value> {
        if args.len() != signature.params().len() {
            return Err(BridgeError::ArgumentCount {
                expected: signature.params().len(),
                actual: args.len(),
            });
        }
        if signature.convention() != function.convention() {
            return Err(BridgeError::BadCallingConvention {
                convention: signature.convention(),
                target: format!("a {} function", function.convention()),
            });
        }
        self.dispatch(
            function,
            signature.ret(),
            args,
            Some(signature.params()),
            signature.fixed_params(),
        )
    }

    /// Call a function that carries its own signature
    ///
    /// # Safety
    /// As [`Dispatcher::invoke_signature`].
    pub unsafe fn invoke_function(&self, function: &Function, args: &[Value]) -> Result<Value> {
        let signature = function
            .signature()
            .cloned()
            .ok_or_else(|| BridgeError::UnsupportedType {
                position: Position::Standalone,
                type_name: format!("function {} without a signature", function.label()),
            })?;
        self.invoke_signature(function, &signature, args)
    }

    /// Call through an already prepared interface and return the raw result
    ///
    /// Each argument's inferred native type must equal the interface's.
    ///
    /// # Safety
    /// `cif` must describe the function's real native signature.
    pub unsafe fn invoke_prepared(
        &self,
        function: &Function,
        cif: &CallInterface,
        args: &[Value],
    ) -> Result<RawResult> {
        if args.len() != cif.arg_count() {
            return Err(BridgeError::ArgumentCount {
                expected: cif.arg_count(),
                actual: args.len(),
            });
        }
        let mut frame = self.marshal(args, None)?;
        if let Some(fixed) = cif.fixed_args() {
            frame.promote_variadic(fixed);
        }
        for (index, (actual, expected)) in frame.descriptors().iter().zip(cif.arg_types()).enumerate() {
            if actual != expected {
                self.marshaling_errors.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::argument(
                    index,
                    format!("{:?}", expected),
                    format!("{:?}", actual),
                ));
            }
        }

        let _attached = self.attach()?;
        let raw = self.call(function, cif, &mut frame)?;
        frame.write_back();
        Ok(raw)
    }

    unsafe fn dispatch(
        &self,
        function: &Function,
        ret: &LogicalType,
        args: &[Value],
        declared: Option<&[LogicalType]>,
        fixed: Option<usize>,
    ) -> Result<Value> {
        let (ret_native, ret_converter) = self.mapper.resolve(ret, Position::Return)?;
        marshal::check_return(&ret_native)?;
        let ret_desc = self.mapper.describe_at(&ret_native, Position::Return)?;

        let mut frame = self.marshal(args, declared)?;
        let descriptors = frame.descriptors();
        let cif = match fixed {
            None => self.cifs.prepare(descriptors, &ret_desc, function.convention())?,
            Some(fixed) => {
                let cif = self.cifs.prepare_variadic(
                    &descriptors[..fixed],
                    &descriptors[fixed..],
                    &ret_desc,
                    function.convention(),
                )?;
                frame.promote_variadic(fixed);
                cif
            }
        };

        let _attached = self.attach()?;
        let raw = self.call(function, &cif, &mut frame)?;
        frame.write_back();

        let value = raw.into_value(&ret_native, &self.callbacks)?;
        match ret_converter {
            Some(converter) => converter.from_native(value).map_err(|failure| BridgeError::UnsupportedResult {
                expected: ret.name(),
                actual: failure.message().to_string(),
            }),
            None => Ok(value),
        }
    }

    fn marshal(&self, args: &[Value], declared: Option<&[LogicalType]>) -> Result<ArgumentFrame> {
        if args.len() > self.max_args {
            return Err(BridgeError::TooManyArguments {
                max: self.max_args,
                actual: args.len(),
            });
        }

        let mut frame = ArgumentFrame::new(args.len());
        for (index, value) in args.iter().enumerate() {
            let declared = declared.and_then(|d| d.get(index));
            if let Err(err) = frame.push(index, declared, value, &self.mapper, &self.callbacks) {
                self.marshaling_errors.fetch_add(1, Ordering::Relaxed);
                logging::log_marshal_error(index, &err);
                return Err(err);
            }
        }
        Ok(frame)
    }

    /// The calling thread counts as attached while it is inside native code
    fn attach(&self) -> Result<AttachGuard> {
        AttachGuard::acquire(self.runtime.clone())
    }

    unsafe fn call(&self, function: &Function, cif: &CallInterface, frame: &mut ArgumentFrame) -> Result<RawResult> {
        if function.address().is_null() {
            return Err(BridgeError::NullPointer {
                what: "function address",
            });
        }

        let label = function.label();
        logging::log_ffi_call(&label, cif.arg_count());

        let mut result = RawResult::new(cif.return_type().clone(), cif.return_storage());
        let code: unsafe extern "C" fn() = std::mem::transmute(function.address().address());
        libffi::raw::ffi_call(cif.as_raw_ptr(), Some(code), result.as_mut_ptr(), frame.values_ptr());

        self.calls_made.fetch_add(1, Ordering::Relaxed);
        logging::log_ffi_return(&label);
        Ok(result)
    }

    pub fn cif_cache(&self) -> &CifCache {
        &self.cifs
    }

    pub fn type_mapper(&self) -> &TypeMapper {
        &self.mapper
    }

    pub fn stats(&self) -> InteropStats {
        InteropStats {
            calls_made: self.calls_made.load(Ordering::Relaxed),
            marshaling_errors: self.marshaling_errors.load(Ordering::Relaxed),
            libraries_loaded: library::libraries_loaded(),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_args", &self.max_args)
            .field("stats", &self.stats())
            .finish()
    }
}
