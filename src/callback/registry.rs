//! Callback registry - one trampoline per (target, method, signature)
//!
//! Design:
//! - Entries are keyed by target identity and re-validated on every hit, so
//!   a recycled target address never inherits someone else's callback
//! - The registry holds callbacks until they are released, forgotten or
//!   purged; managed code never has to keep a trampoline alive itself
//! - Trampoline addresses map back to their callback for nested callbacks

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::dispatch::{CallbackCore, Plan};
use super::{ArenaStats, Callback, CallbackId, ExecutableArena};
use crate::error::{Position, Result};
use crate::interop::{CifCache, Pointer, Signature, TypeDescriptor, TypeMapper};
use crate::logging;
use crate::refs::{self, ManagedRuntime, ManagedTarget, MethodId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    target: usize,
    method: MethodId,
    signature: Signature,
}

/// Registry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub live: usize,
    pub created: usize,
    pub released: usize,
    pub arena: ArenaStats,
}

/// Creates, caches and releases callbacks
pub struct CallbackRegistry {
    me: Weak<CallbackRegistry>,
    arena: Arc<ExecutableArena>,
    cifs: Arc<CifCache>,
    mapper: Arc<TypeMapper>,
    runtime: Arc<dyn ManagedRuntime>,
    method: MethodId,
    entries: DashMap<Key, Arc<Callback>>,
    by_trampoline: DashMap<Pointer, Weak<Callback>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    released: AtomicUsize,
}

impl CallbackRegistry {
    pub fn new(
        arena: Arc<ExecutableArena>,
        cifs: Arc<CifCache>,
        mapper: Arc<TypeMapper>,
        runtime: Arc<dyn ManagedRuntime>,
        method: MethodId,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            arena,
            cifs,
            mapper,
            runtime,
            method,
            entries: DashMap::new(),
            by_trampoline: DashMap::new(),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Callback invoking the default method of `target`
    pub fn register(&self, target: &Arc<dyn ManagedTarget>, signature: &Signature) -> Result<Arc<Callback>> {
        self.register_method(target, self.method.clone(), signature)
    }

    /// Callback invoking `method` of `target`
    ///
    /// Returns the cached callback when one is still live for the same
    /// target, method and signature.
    pub fn register_method(
        &self,
        target: &Arc<dyn ManagedTarget>,
        method: MethodId,
        signature: &Signature,
    ) -> Result<Arc<Callback>> {
        let key = Key {
            target: refs::target_address(target),
            method,
            signature: signature.clone(),
        };
        if let Some(existing) = self.live_entry(&key, target) {
            return Ok(existing);
        }

        let callback = Arc::new(self.create(target, &key)?);

        // Two threads may race to create the same callback; the first wins
        let (winner, replaced) = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| callback.clone());
            let mut replaced = None;
            if !Arc::ptr_eq(entry.value(), &callback) && !is_live(entry.value(), target) {
                replaced = Some(std::mem::replace(entry.value_mut(), callback.clone()));
            }
            (entry.value().clone(), replaced)
        };
        // A stale callback may release on drop; never do that under the map lock
        drop(replaced);
        if !Arc::ptr_eq(&winner, &callback) {
            callback.release();
            return Ok(winner);
        }

        self.by_trampoline.insert(callback.trampoline(), Arc::downgrade(&callback));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(callback)
    }

    fn live_entry(&self, key: &Key, target: &Arc<dyn ManagedTarget>) -> Option<Arc<Callback>> {
        let entry = self.entries.get(key)?;
        if is_live(entry.value(), target) {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    fn create(&self, target: &Arc<dyn ManagedTarget>, key: &Key) -> Result<Callback> {
        let signature = Arc::new(key.signature.clone());

        let params = signature
            .params()
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                Plan::new(
                    &self.mapper,
                    ty,
                    Position::Parameter(index),
                    signature.is_variadic_param(index),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let ret = Plan::new(&self.mapper, signature.ret(), Position::Return, false)?;

        let descriptors: Vec<TypeDescriptor> = params.iter().map(|p| p.descriptor().clone()).collect();
        let cif = self.cifs.prepare(&descriptors, ret.descriptor(), signature.convention())?;

        let lease = self.arena.acquire()?;
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(CallbackCore::new(
            id,
            target,
            key.method.clone(),
            signature,
            cif,
            params,
            ret,
            self.runtime.clone(),
            self.me.clone(),
        ));

        let callback = Callback::new(core, lease, self.arena.clone());
        callback.activate()?;
        logging::log_callback_created(id.raw(), callback.trampoline(), &target.describe());
        Ok(callback)
    }

    /// Callback owning `trampoline`, if it is live
    pub fn lookup(&self, trampoline: Pointer) -> Option<Arc<Callback>> {
        let callback = self.by_trampoline.get(&trampoline)?.value().upgrade()?;
        if callback.is_released() {
            None
        } else {
            Some(callback)
        }
    }

    /// Release and drop the callback for `target` and `signature`
    pub fn forget(&self, target: &Arc<dyn ManagedTarget>, signature: &Signature) -> bool {
        let key = Key {
            target: refs::target_address(target),
            method: self.method.clone(),
            signature: signature.clone(),
        };
        match self.entries.remove(&key) {
            Some((_, callback)) => self.retire(&callback),
            None => false,
        }
    }

    /// Release the callback owning `trampoline` and drop it
    pub fn release(&self, trampoline: Pointer) -> bool {
        let Some(callback) = self.by_trampoline.get(&trampoline).and_then(|weak| weak.value().upgrade()) else {
            return false;
        };
        // The removed entry is not the last reference, so nothing releases under the lock
        self.entries.retain(|_, entry| !Arc::ptr_eq(entry, &callback));
        self.retire(&callback)
    }

    /// Release every callback whose target is gone or that was released
    pub fn purge(&self) -> usize {
        let stale: Vec<Key> = self
            .entries
            .iter()
            .filter(|entry| entry.value().target().is_none())
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in stale {
            if let Some((_, callback)) = self.entries.remove_if(&key, |_, cb| cb.target().is_none()) {
                self.retire(&callback);
                purged += 1;
            }
        }
        self.by_trampoline.retain(|_, weak| weak.strong_count() > 0);
        if purged > 0 {
            tracing::debug!(event = "callbacks_purged", purged);
        }
        purged
    }

    /// Release every callback
    pub fn release_all(&self) -> usize {
        let keys: Vec<Key> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let mut released = 0;
        for key in keys {
            if let Some((_, callback)) = self.entries.remove(&key) {
                if self.retire(&callback) {
                    released += 1;
                }
            }
        }
        self.by_trampoline.clear();
        released
    }

    fn retire(&self, callback: &Arc<Callback>) -> bool {
        self.by_trampoline.remove(&callback.trampoline());
        let released = callback.release();
        if released {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn arena(&self) -> &ExecutableArena {
        &self.arena
    }

    pub fn default_method(&self) -> &MethodId {
        &self.method
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.entries.iter().filter(|entry| !entry.value().is_released()).count(),
            created: self.created.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            arena: self.arena.stats(),
        }
    }
}

fn is_live(callback: &Callback, target: &Arc<dyn ManagedTarget>) -> bool {
    !callback.is_released() && callback.core_target_is(target)
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("method", &self.method)
            .field("stats", &self.stats())
            .finish()
    }
}
