//! Per-thread pool of marshalling buffers
//!
//! Design:
//! - Power-of-two size classes from 16 bytes to 4 KiB, each with a bounded
//!   free list
//! - Larger requests bypass the pool: C heap in, C heap out
//! - A buffer goes back to the pool of whichever thread drops it; once that
//!   thread's pool is gone it is simply freed

use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};

use super::memory::{encode_wide, Pointer, WChar};
use crate::error::{BridgeError, Result};

const MIN_CLASS: u32 = 4;
const MAX_CLASS: u32 = 12;
const CLASSES: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;

/// Buffers kept per size class
pub const BUFFERS_PER_CLASS: usize = 8;

/// Largest request served from the pool
pub const MAX_POOLED: usize = 1 << MAX_CLASS;

thread_local! {
    static POOL: RefCell<BufferPool> = RefCell::new(BufferPool::new());
}

/// Pool statistics for the current thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub hits: usize,
    pub misses: usize,
    pub cached: usize,
}

struct BufferPool {
    free: [Vec<NonNull<u8>>; CLASSES],
    hits: usize,
    misses: usize,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            free: Default::default(),
            hits: 0,
            misses: 0,
        }
    }

    fn take(&mut self, class: usize) -> Option<NonNull<u8>> {
        let found = self.free[class].pop();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Keep `ptr` if its class has room; hand it back otherwise
    fn put(&mut self, class: usize, ptr: NonNull<u8>) -> Option<NonNull<u8>> {
        let list = &mut self.free[class];
        if list.len() < BUFFERS_PER_CLASS {
            list.push(ptr);
            None
        } else {
            Some(ptr)
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits,
            misses: self.misses,
            cached: self.free.iter().map(Vec::len).sum(),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for ptr in self.free.iter_mut().flat_map(|list| list.drain(..)) {
            // SAFETY: every cached buffer came from malloc and is owned by the pool
            unsafe { libc::free(ptr.as_ptr() as *mut c_void) };
        }
    }
}

/// Statistics of the calling thread's pool
pub fn pool_stats() -> PoolStats {
    POOL.try_with(|pool| pool.borrow().stats()).unwrap_or_default()
}

fn size_class(len: usize) -> Option<usize> {
    if len > MAX_POOLED {
        return None;
    }
    let bits = len.max(1).next_power_of_two().trailing_zeros().max(MIN_CLASS);
    Some((bits - MIN_CLASS) as usize)
}

fn class_capacity(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS)
}

/// Temporary native buffer for the duration of one call
///
/// The first `len` bytes are zeroed on acquisition.
pub(crate) struct PooledBuffer {
    ptr: NonNull<u8>,
    len: usize,
    class: Option<usize>,
}

// SAFETY: the buffer is plain bytes owned by this handle
unsafe impl Send for PooledBuffer {}
unsafe impl Sync for PooledBuffer {}

impl PooledBuffer {
    /// `len` zeroed bytes (at least one)
    pub(crate) fn zeroed(len: usize) -> Result<Self> {
        let len = len.max(1);
        let class = size_class(len);
        let cached = class.and_then(|class| POOL.try_with(|pool| pool.borrow_mut().take(class)).ok().flatten());
        let ptr = match cached {
            Some(ptr) => ptr,
            None => {
                let capacity = class.map_or(len, class_capacity);
                // SAFETY: malloc has no preconditions; null is handled below
                let raw = unsafe { libc::malloc(capacity) } as *mut u8;
                NonNull::new(raw).ok_or(BridgeError::AllocationFailure {
                    what: "marshalling buffer",
                    size: capacity,
                })?
            }
        };
        // SAFETY: the block holds at least `len` bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(Self { ptr, len, class })
    }

    pub(crate) fn copy_of(bytes: &[u8]) -> Result<Self> {
        let buffer = Self::zeroed(bytes.len())?;
        // SAFETY: room for `bytes` was just reserved
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.ptr.as_ptr(), bytes.len()) };
        Ok(buffer)
    }

    /// NUL-terminated UTF-8 copy of `s`
    pub(crate) fn c_string(s: &str) -> Result<Self> {
        // Zeroing supplies the terminator
        let buffer = Self::zeroed(s.len() + 1)?;
        // SAFETY: len + 1 bytes reserved
        unsafe { ptr::copy_nonoverlapping(s.as_ptr(), buffer.ptr.as_ptr(), s.len()) };
        Ok(buffer)
    }

    /// NUL-terminated `wchar_t` copy of `s`
    pub(crate) fn wide_string(s: &str) -> Result<Self> {
        let units = encode_wide(s);
        let buffer = Self::zeroed(units.len() * std::mem::size_of::<WChar>())?;
        // SAFETY: the buffer holds exactly `units`; malloc alignment covers WChar
        unsafe { ptr::copy_nonoverlapping(units.as_ptr(), buffer.ptr.as_ptr() as *mut WChar, units.len()) };
        Ok(buffer)
    }

    #[inline]
    pub(crate) fn pointer(&self) -> Pointer {
        Pointer::from_raw(self.ptr.as_ptr())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` bytes were initialized on acquisition
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let ptr = self.ptr;
        let rejected = match self.class {
            Some(class) => POOL
                .try_with(|pool| pool.borrow_mut().put(class, ptr))
                .unwrap_or(Some(ptr)),
            None => Some(ptr),
        };
        if let Some(ptr) = rejected {
            // SAFETY: allocated by malloc in `zeroed` and no longer pooled
            unsafe { libc::free(ptr.as_ptr() as *mut c_void) };
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("ptr", &self.pointer())
            .field("len", &self.len)
            .field("pooled", &self.class.is_some())
            .finish()
    }
}
