//! Bridge facade - one instance of every component, wired together
//!
//! Design:
//! - A `Bridge` owns the CIF cache, type mapper, callback registry, handle
//!   table and forward dispatcher, all sharing one managed runtime
//! - `Bridge::global()` is created lazily from discovered configuration
//! - Independent bridges may coexist; nothing below is process-global except
//!   the uncaught callback handler

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::callback::{Callback, CallbackRegistry, ExecutableArena, RegistryStats};
use crate::config::BridgeConfig;
use crate::error::{Position, Result};
use crate::interop::{
    CallInterface, CifCache, CifCacheStats, Dispatcher, Function, GlobalVariable, InteropStats, Library, LogicalType,
    Pointer, RawResult, Signature, TypeConverter, TypeDescriptor, TypeMapper, Value,
};
use crate::refs::{HandleTable, ManagedRuntime, ManagedTarget, MethodId, ThreadLocalRuntime};

static GLOBAL: Lazy<Bridge> = Lazy::new(|| {
    let config = BridgeConfig::from_env().unwrap_or_else(|err| {
        tracing::warn!(event = "config_rejected", error = %err, "Using default bridge configuration");
        BridgeConfig::default()
    });
    Bridge::new(config)
});

/// Combined statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub interop: InteropStats,
    pub cif_cache: CifCacheStats,
    pub callbacks: RegistryStats,
    pub handles: usize,
}

pub struct Bridge {
    config: BridgeConfig,
    cifs: Arc<CifCache>,
    mapper: Arc<TypeMapper>,
    callbacks: Arc<CallbackRegistry>,
    handles: HandleTable,
    runtime: Arc<dyn ManagedRuntime>,
    dispatcher: Dispatcher,
}

impl Bridge {
    /// Bridge over the default thread-local runtime
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_runtime(config, Arc::new(ThreadLocalRuntime::new()))
    }

    pub fn with_runtime(config: BridgeConfig, runtime: Arc<dyn ManagedRuntime>) -> Self {
        let cifs = Arc::new(if config.dispatch.cache_signatures {
            CifCache::new(config.dispatch.cif_cache_capacity)
        } else {
            CifCache::disabled()
        });
        let mapper = Arc::new(TypeMapper::new());
        let arena = Arc::new(
            ExecutableArena::with_options(config.callbacks.slots_per_chunk, config.callbacks.recycle_released)
                .with_quarantine(config.callbacks.release_quarantine),
        );
        let callbacks = CallbackRegistry::new(
            arena,
            cifs.clone(),
            mapper.clone(),
            runtime.clone(),
            MethodId::new(&config.callbacks.method_name),
        );
        let dispatcher = Dispatcher::new(
            cifs.clone(),
            mapper.clone(),
            callbacks.clone(),
            runtime.clone(),
            config.dispatch.max_args,
        );

        tracing::debug!(
            event = "bridge_created",
            max_args = config.dispatch.max_args,
            cache_signatures = config.dispatch.cache_signatures,
            recycle_released = config.callbacks.recycle_released,
        );

        Self {
            config,
            cifs,
            mapper,
            callbacks,
            handles: HandleTable::new(),
            runtime,
            dispatcher,
        }
    }

    /// Process-wide bridge, configured from `native-bridge.toml` and the environment
    pub fn global() -> &'static Bridge {
        &GLOBAL
    }

    // ===== Forward calls =====

    /// Call `function`, inferring native types from `args`
    ///
    /// # Safety
    /// The inferred native signature must match the function's real one.
    pub unsafe fn invoke(&self, function: &Function, ret: &LogicalType, args: &[Value]) -> Result<Value> {
        self.dispatcher.invoke(function, ret, args)
    }

    /// # Safety
    /// `signature` must describe the function's real native signature.
    pub unsafe fn invoke_signature(&self, function: &Function, signature: &Signature, args: &[Value]) -> Result<Value> {
        self.dispatcher.invoke_signature(function, signature, args)
    }

    /// # Safety
    /// As [`Bridge::invoke`]; arguments from `fixed` on travel promoted.
    pub unsafe fn invoke_variadic(
        &self,
        function: &Function,
        ret: &LogicalType,
        fixed: usize,
        args: &[Value],
    ) -> Result<Value> {
        self.dispatcher.invoke_variadic(function, ret, fixed, args)
    }

    /// # Safety
    /// The function's attached signature must be its real one.
    pub unsafe fn invoke_function(&self, function: &Function, args: &[Value]) -> Result<Value> {
        self.dispatcher.invoke_function(function, args)
    }

    /// # Safety
    /// `cif` must describe the function's real native signature.
    pub unsafe fn invoke_prepared(&self, function: &Function, cif: &CallInterface, args: &[Value]) -> Result<RawResult> {
        self.dispatcher.invoke_prepared(function, cif, args)
    }

    /// Prepared (and cached) call interface for `signature`
    pub fn prepare(&self, signature: &Signature) -> Result<Arc<CallInterface>> {
        let params = signature
            .params()
            .iter()
            .enumerate()
            .map(|(index, ty)| self.mapper.describe_at(ty, Position::Parameter(index)))
            .collect::<Result<Vec<TypeDescriptor>>>()?;
        let ret = self.mapper.describe_at(signature.ret(), Position::Return)?;
        match signature.fixed_params() {
            Some(fixed) if fixed <= params.len() => {
                self.cifs
                    .prepare_variadic(&params[..fixed], &params[fixed..], &ret, signature.convention())
            }
            _ => self.cifs.prepare(&params, &ret, signature.convention()),
        }
    }

    /// Native descriptor of `ty`
    pub fn describe(&self, ty: &LogicalType) -> Result<TypeDescriptor> {
        self.mapper.describe(ty)
    }

    /// Register a converter for `LogicalType::Mapped(name)`
    pub fn register_type(&self, name: &str, converter: Arc<dyn TypeConverter>) -> Result<()> {
        self.mapper.register(name, converter)
    }

    /// Open a shared library
    pub fn open_library(&self, name: &str) -> Result<Library> {
        Ok(Library::open(name)?)
    }

    /// Exported variable of `library`, with custom types resolved by this bridge
    pub fn global_variable<'lib>(
        &self,
        library: &'lib Library,
        name: &str,
        ty: LogicalType,
    ) -> Result<GlobalVariable<'lib>> {
        GlobalVariable::resolve(library, name, ty, Some(self.mapper.as_ref()))
    }

    // ===== Callbacks =====

    /// Trampoline calling the configured default method of `target`
    pub fn register_callback(&self, target: &Arc<dyn ManagedTarget>, signature: &Signature) -> Result<Arc<Callback>> {
        self.callbacks.register(target, signature)
    }

    pub fn register_callback_method(
        &self,
        target: &Arc<dyn ManagedTarget>,
        method: MethodId,
        signature: &Signature,
    ) -> Result<Arc<Callback>> {
        self.callbacks.register_method(target, method, signature)
    }

    /// Release the callback behind `trampoline`
    pub fn release_callback(&self, trampoline: Pointer) -> bool {
        self.callbacks.release(trampoline)
    }

    /// Release callbacks and handles whose targets are gone
    pub fn purge(&self) -> usize {
        self.callbacks.purge() + self.handles.purge()
    }

    /// Release every callback and handle
    ///
    /// Trampolines stay mapped until the bridge is dropped.
    pub fn shutdown(&self) -> usize {
        let released = self.callbacks.release_all();
        self.handles.clear();
        tracing::debug!(event = "bridge_shutdown", released);
        released
    }

    // ===== Accessors =====

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn type_mapper(&self) -> &TypeMapper {
        &self.mapper
    }

    pub fn cif_cache(&self) -> &CifCache {
        &self.cifs
    }

    pub fn runtime(&self) -> &Arc<dyn ManagedRuntime> {
        &self.runtime
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            interop: self.dispatcher.stats(),
            cif_cache: self.cifs.stats(),
            callbacks: self.callbacks.stats(),
            handles: self.handles.len(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.callbacks.release_all();
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests;
