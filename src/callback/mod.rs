//! Callbacks - native-callable trampolines into managed code
//!
//! Design:
//! - Each `Callback` owns one slot of the `ExecutableArena`; the slot's code
//!   address is what native code receives
//! - The slot's userdata is a `SlotCell`, never the callback itself, so a
//!   stale trampoline always lands on memory that is still mapped
//! - Arguments and results are converted per precomputed `Conversion` flags
//! - Failures inside managed code never unwind into native frames
//!
//! Lifecycle: `Created -> Prepared -> Active -> Released`

mod arena;
mod dispatch;
mod handler;
mod registry;

pub use arena::{ArenaStats, ExecutableArena, DEFAULT_RELEASE_QUARANTINE};
pub use handler::{clear_uncaught_handler, set_uncaught_handler, uncaught_handler, CallbackInfo, UncaughtHandler};
pub use registry::{CallbackRegistry, RegistryStats};

pub(crate) use arena::SlotLease;
pub(crate) use dispatch::CallbackCore;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::interop::{Pointer, Signature};
use crate::logging;
use crate::refs::ManagedTarget;

/// Unique callback identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(crate) u64);

impl CallbackId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a callback hands arguments to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchMode {
    /// Decoded arguments; the result must have exactly the declared type
    #[default]
    Direct,
    /// Pointer-like arguments arrive raw; the result is coerced leniently
    Proxy,
}

/// Per-parameter/return conversion applied at the trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversion {
    /// Scalar copied bit for bit
    Plain,
    /// `f32` arriving as a promoted `f64`
    PromoteFloat,
    /// Address delivered as `Value::Pointer`
    WrapPointer,
    DecodeString,
    DecodeWString,
    /// Structure pointer delivered as a view
    WrapStruct,
    /// By-value structure copied into managed ownership
    CopyStruct,
    /// Function pointer delivered as a callback or function
    NestedCallback,
    /// Custom type converted through the type mapper
    Mapped,
}

/// Callback lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallbackState {
    Created = 0,
    Prepared = 1,
    Active = 2,
    Released = 3,
}

impl CallbackState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CallbackState::Created,
            1 => CallbackState::Prepared,
            2 => CallbackState::Active,
            _ => CallbackState::Released,
        }
    }
}

/// A managed target plus the native signature it is called with
///
/// This is what managed code passes where a native function pointer is
/// expected; marshalling registers it and passes the trampoline.
#[derive(Clone)]
pub struct ManagedCallback {
    target: Arc<dyn ManagedTarget>,
    signature: Arc<Signature>,
}

impl ManagedCallback {
    pub fn new(target: Arc<dyn ManagedTarget>, signature: Arc<Signature>) -> Self {
        Self { target, signature }
    }

    #[inline]
    pub fn target(&self) -> &Arc<dyn ManagedTarget> {
        &self.target
    }

    #[inline]
    pub fn signature(&self) -> &Arc<Signature> {
        &self.signature
    }

    /// Same target object and same signature
    pub fn same_target(&self, other: &ManagedCallback) -> bool {
        crate::refs::target_address(&self.target) == crate::refs::target_address(&other.target)
            && self.signature == other.signature
    }

    pub fn describe(&self) -> String {
        format!("{} ({} params)", self.target.describe(), self.signature.params().len())
    }
}

impl fmt::Debug for ManagedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCallback")
            .field("target", &self.target.describe())
            .field("signature", &self.signature)
            .finish()
    }
}

/// A registered callback and its trampoline
pub struct Callback {
    id: CallbackId,
    trampoline: Pointer,
    core: Arc<CallbackCore>,
    lease: Mutex<Option<SlotLease>>,
    arena: Arc<ExecutableArena>,
    state: AtomicU8,
}

impl Callback {
    pub(crate) fn new(core: Arc<CallbackCore>, lease: SlotLease, arena: Arc<ExecutableArena>) -> Self {
        Self {
            id: core.id(),
            trampoline: lease.code(),
            core,
            lease: Mutex::new(Some(lease)),
            arena,
            state: AtomicU8::new(CallbackState::Created as u8),
        }
    }

    /// Prepare the slot's closure and publish the binding
    pub(crate) fn activate(&self) -> crate::error::Result<()> {
        let guard = self.lease.lock();
        if let Some(lease) = guard.as_ref() {
            // SAFETY: the lease is exclusively ours and the core keeps its CIF alive
            unsafe { self.arena.prepare(lease, self.core.cif().clone())? };
            self.set_state(CallbackState::Prepared);
            self.arena.bind(lease, self.core.clone());
            self.set_state(CallbackState::Active);
        }
        Ok(())
    }

    fn set_state(&self, state: CallbackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Native entry point
    #[inline]
    pub fn trampoline(&self) -> Pointer {
        self.trampoline
    }

    pub fn state(&self) -> CallbackState {
        CallbackState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn signature(&self) -> &Arc<Signature> {
        self.core.signature()
    }

    #[inline]
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.core.mode()
    }

    pub fn conversions(&self) -> Vec<Conversion> {
        self.core.conversions()
    }

    pub fn return_conversion(&self) -> Conversion {
        self.core.return_conversion()
    }

    /// The target, if it is alive and this callback is not released
    pub fn target(&self) -> Option<Arc<dyn ManagedTarget>> {
        if self.is_released() {
            return None;
        }
        self.core.target().resolve()
    }

    /// Whether this callback was registered for `target`
    pub(crate) fn core_target_is(&self, target: &Arc<dyn ManagedTarget>) -> bool {
        self.core.target().refers_to(target)
    }

    pub fn is_released(&self) -> bool {
        self.state() == CallbackState::Released
    }

    /// Release the trampoline
    ///
    /// Idempotent. Once this returns no new invocation starts; invocations
    /// in flight on other threads have finished. Called from inside this
    /// callback's own dispatch it does not wait for itself. The trampoline
    /// address stays mapped and yields a zeroed result from now on.
    pub fn release(&self) -> bool {
        let previous = self.state.swap(CallbackState::Released as u8, Ordering::AcqRel);
        if previous == CallbackState::Released as u8 {
            return false;
        }
        self.core.target().release();
        if let Some(lease) = self.lease.lock().take() {
            self.arena.release(lease);
        }
        self.core.clear_retained();
        logging::log_callback_released(self.id.0);
        true
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .field("trampoline", &self.trampoline)
            .field("state", &self.state())
            .field("mode", &self.core.mode())
            .finish()
    }
}
