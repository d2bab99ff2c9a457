//! Cross-language references - keep managed targets reachable, never alive
//!
//! Design:
//! - `CrossLangRef` holds a weak reference; every use re-validates it
//! - `HandleTable` hands native code opaque integers instead of addresses
//! - `AttachGuard` pairs attach/detach so a thread is only detached by the
//!   frame that attached it

mod handles;

pub use handles::{HandleGuard, HandleTable, ObjectHandle};

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::callback::DispatchMode;
use crate::error::{CallFailure, Result};
use crate::interop::Value;

/// Name of the managed method a callback invokes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId(Arc<str>);

impl MethodId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MethodId {
    fn default() -> Self {
        Self::new("callback")
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A managed object native code can call into
pub trait ManagedTarget: Send + Sync {
    /// Invoke `method` with already converted arguments
    fn invoke(&self, method: &MethodId, args: Vec<Value>) -> std::result::Result<Value, CallFailure>;

    /// How callbacks bound to this target receive arguments
    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Direct
    }

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Closure-backed target
pub struct FnTarget<F> {
    f: F,
    mode: DispatchMode,
    name: Option<String>,
}

impl<F> FnTarget<F>
where
    F: Fn(&[Value]) -> std::result::Result<Value, CallFailure> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            mode: DispatchMode::Direct,
            name: None,
        }
    }

    /// Receive pointer-like arguments raw and have results coerced
    pub fn proxy(mut self) -> Self {
        self.mode = DispatchMode::Proxy;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn into_target(self) -> Arc<dyn ManagedTarget> {
        Arc::new(self)
    }
}

impl<F> ManagedTarget for FnTarget<F>
where
    F: Fn(&[Value]) -> std::result::Result<Value, CallFailure> + Send + Sync + 'static,
{
    fn invoke(&self, _method: &MethodId, args: Vec<Value>) -> std::result::Result<Value, CallFailure> {
        (self.f)(&args)
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }

    fn describe(&self) -> String {
        self.name.clone().unwrap_or_else(|| "closure".to_string())
    }
}

/// Wrap a closure as a direct-mode target
pub fn target_fn<F>(f: F) -> Arc<dyn ManagedTarget>
where
    F: Fn(&[Value]) -> std::result::Result<Value, CallFailure> + Send + Sync + 'static,
{
    FnTarget::new(f).into_target()
}

/// Identity of a target, independent of the vtable
#[inline]
pub(crate) fn target_address(target: &Arc<dyn ManagedTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// Weak handle to a managed target
pub struct CrossLangRef {
    target: RwLock<Option<Weak<dyn ManagedTarget>>>,
    address: usize,
    description: String,
}

impl CrossLangRef {
    pub fn new(target: &Arc<dyn ManagedTarget>) -> Self {
        Self {
            target: RwLock::new(Some(Arc::downgrade(target))),
            address: target_address(target),
            description: target.describe(),
        }
    }

    /// Strong reference to the target, if it is still alive and unreleased
    pub fn resolve(&self) -> Option<Arc<dyn ManagedTarget>> {
        self.target.read().as_ref().and_then(Weak::upgrade)
    }

    /// Drop the reference; true only the first time
    pub fn release(&self) -> bool {
        self.target.write().take().is_some()
    }

    pub fn is_released(&self) -> bool {
        self.target.read().is_none()
    }

    pub fn is_alive(&self) -> bool {
        self.resolve().is_some()
    }

    /// Whether this reference still points at `target`
    pub fn refers_to(&self, target: &Arc<dyn ManagedTarget>) -> bool {
        self.address == target_address(target) && self.is_alive()
    }

    pub fn describe(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for CrossLangRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossLangRef")
            .field("target", &self.description)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// The managed side's call and thread collaborator
pub trait ManagedRuntime: Send + Sync {
    fn is_thread_attached(&self) -> bool;

    fn attach_current_thread(&self) -> Result<()>;

    fn detach_current_thread(&self);

    /// Perform a managed call on an attached thread
    fn invoke_method(
        &self,
        target: &Arc<dyn ManagedTarget>,
        method: &MethodId,
        args: Vec<Value>,
    ) -> std::result::Result<Value, CallFailure> {
        target.invoke(method, args)
    }
}

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ATTACHED: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// Runtime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub attaches: usize,
    pub detaches: usize,
}

/// Default runtime: attach state is a per-thread flag
#[derive(Debug)]
pub struct ThreadLocalRuntime {
    id: u64,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl ThreadLocalRuntime {
    pub fn new() -> Self {
        Self {
            id: NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed),
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            attaches: self.attaches.load(Ordering::Relaxed),
            detaches: self.detaches.load(Ordering::Relaxed),
        }
    }
}

impl Default for ThreadLocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedRuntime for ThreadLocalRuntime {
    fn is_thread_attached(&self) -> bool {
        ATTACHED
            .try_with(|set| set.borrow().contains(&self.id))
            .unwrap_or(false)
    }

    fn attach_current_thread(&self) -> Result<()> {
        let inserted = ATTACHED
            .try_with(|set| set.borrow_mut().insert(self.id))
            .map_err(|_| crate::error::BridgeError::Attach("thread is shutting down".to_string()))?;
        if inserted {
            self.attaches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn detach_current_thread(&self) {
        let removed = ATTACHED
            .try_with(|set| set.borrow_mut().remove(&self.id))
            .unwrap_or(false);
        if removed {
            self.detaches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Keeps the current thread attached for the guard's scope
///
/// Detaches on drop only if this guard did the attaching.
pub struct AttachGuard {
    runtime: Arc<dyn ManagedRuntime>,
    attached_here: bool,
    // Attach state is per thread
    _not_send: PhantomData<*const ()>,
}

impl AttachGuard {
    pub fn acquire(runtime: Arc<dyn ManagedRuntime>) -> Result<Self> {
        let attached_here = if runtime.is_thread_attached() {
            false
        } else {
            runtime.attach_current_thread()?;
            tracing::trace!(event = "thread_attached");
            true
        };
        Ok(Self {
            runtime,
            attached_here,
            _not_send: PhantomData,
        })
    }

    pub fn attached_here(&self) -> bool {
        self.attached_here
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if self.attached_here {
            self.runtime.detach_current_thread();
            tracing::trace!(event = "thread_detached");
        }
    }
}

impl fmt::Debug for AttachGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachGuard")
            .field("attached_here", &self.attached_here)
            .finish()
    }
}
