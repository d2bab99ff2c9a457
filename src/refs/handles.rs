//! Opaque handles for managed objects held by native code
//!
//! Native code gets a number, never an address. Numbers are never reused, so
//! a stale handle resolves to nothing instead of to someone else's object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{CrossLangRef, ManagedTarget};
use crate::interop::Pointer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The handle as a `void*` native code can store
    #[inline]
    pub fn as_pointer(self) -> Pointer {
        Pointer::new(self.0 as usize)
    }

    #[inline]
    pub fn from_pointer(ptr: Pointer) -> Self {
        Self(ptr.address() as u64)
    }
}

/// Table of live handles (lock-free concurrent map)
pub struct HandleTable {
    entries: DashMap<u64, CrossLangRef>,
    next: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity(64),
            next: AtomicU64::new(1),
        }
    }

    /// Hand out a new handle for `target`
    pub fn register(&self, target: &Arc<dyn ManagedTarget>) -> ObjectHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, CrossLangRef::new(target));
        tracing::trace!(event = "handle_registered", handle = id);
        ObjectHandle(id)
    }

    /// Target behind `handle`, validated
    ///
    /// A handle whose target is gone is removed.
    pub fn resolve(&self, handle: ObjectHandle) -> Option<Arc<dyn ManagedTarget>> {
        let resolved = self.entries.get(&handle.0).and_then(|entry| entry.resolve());
        if resolved.is_none() {
            self.entries.remove(&handle.0);
        }
        resolved
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    /// Invalidate `handle`; true only the first time
    pub fn release(&self, handle: ObjectHandle) -> bool {
        match self.entries.remove(&handle.0) {
            Some((_, reference)) => {
                reference.release();
                true
            }
            None => false,
        }
    }

    /// Drop every handle whose target is gone
    pub fn purge(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, reference| reference.is_alive());
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::debug!(event = "handles_purged", purged);
        }
        purged
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `target` for the guard's scope
    pub fn guard(&self, target: &Arc<dyn ManagedTarget>) -> HandleGuard<'_> {
        HandleGuard {
            table: self,
            handle: self.register(target),
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// RAII guard for automatic handle registration/release
pub struct HandleGuard<'a> {
    table: &'a HandleTable,
    handle: ObjectHandle,
}

impl HandleGuard<'_> {
    #[inline]
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }
}

impl Drop for HandleGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.table.release(self.handle);
    }
}
