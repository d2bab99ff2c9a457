//! Executable arena - pooled trampoline slots
//!
//! Design:
//! - Slots are libffi closures allocated a chunk at a time, chunk size
//!   derived from the page size
//! - Slots are never unmapped before the arena itself drops
//! - Released slots queue FIFO; with recycling on (the default) the oldest
//!   idle one is reused once more than `quarantine` slots are waiting, so a
//!   stale trampoline address keeps yielding zero for a while before reuse
//! - Allocation state sits behind one mutex; dispatch never touches it

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libffi::low::{self, ffi_closure, CodePtr};
use parking_lot::{Mutex, RwLock};

use super::dispatch::{self, CallbackCore};
use crate::error::{BridgeError, Result};
use crate::interop::{CallInterface, Pointer};
use crate::logging;

thread_local! {
    /// Slot cells this thread is currently dispatching through, innermost last
    static ACTIVE_SLOTS: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// Userdata of one closure
pub(crate) struct SlotCell {
    code: Pointer,
    binding: RwLock<Option<Arc<CallbackCore>>>,
    /// Retained after unbinding so the closure's CIF pointer stays valid
    cif: RwLock<Option<Arc<CallInterface>>>,
    in_flight: AtomicUsize,
}

impl SlotCell {
    fn new(code: Pointer) -> Self {
        Self {
            code,
            binding: RwLock::new(None),
            cif: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const SlotCell as usize
    }

    #[inline]
    pub(crate) fn code(&self) -> Pointer {
        self.code
    }

    /// Mark an invocation as running on this slot
    pub(crate) fn enter(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _ = ACTIVE_SLOTS.try_with(|slots| slots.borrow_mut().push(self.key()));
        InFlight { cell: self }
    }

    /// Callback currently bound, if any
    #[inline]
    pub(crate) fn binding(&self) -> Option<Arc<CallbackCore>> {
        self.binding.read().clone()
    }

    /// CIF the closure was last prepared with
    #[inline]
    pub(crate) fn cif(&self) -> Option<Arc<CallInterface>> {
        self.cif.read().clone()
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Invocations of this slot on the current thread's stack
    fn own_frames(&self) -> usize {
        let key = self.key();
        ACTIVE_SLOTS
            .try_with(|slots| slots.borrow().iter().filter(|k| **k == key).count())
            .unwrap_or(0)
    }

    /// Stop new invocations, then wait out the ones on other threads
    fn unbind(&self) {
        drop(self.binding.write().take());

        let own = self.own_frames();
        let mut spins = 0u32;
        while self.in_flight.load(Ordering::SeqCst) > own {
            if spins < 64 {
                std::hint::spin_loop();
            } else if spins < 256 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(std::time::Duration::from_micros(50));
            }
            spins = spins.saturating_add(1);
        }
    }
}

/// Invocation marker; leaving the dispatch routine drops it
pub(crate) struct InFlight<'a> {
    cell: &'a SlotCell,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let key = self.cell.key();
        let _ = ACTIVE_SLOTS.try_with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(pos) = slots.iter().rposition(|k| *k == key) {
                slots.remove(pos);
            }
        });
        self.cell.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Slot {
    closure: *mut ffi_closure,
    code: CodePtr,
    cell: Arc<SlotCell>,
}

/// Exclusive use of one slot
pub(crate) struct SlotLease {
    index: usize,
    closure: *mut ffi_closure,
    code: CodePtr,
    cell: Arc<SlotCell>,
}

// SAFETY: the closure is only written through an exclusive lease
unsafe impl Send for SlotLease {}
unsafe impl Sync for SlotLease {}

impl SlotLease {
    #[inline]
    pub(crate) fn code(&self) -> Pointer {
        self.cell.code()
    }
}

struct ArenaState {
    slots: Vec<Slot>,
    fresh: Vec<usize>,
    released: VecDeque<usize>,
    chunks: usize,
    live: usize,
}

/// Arena statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    pub chunks: usize,
    pub capacity: usize,
    pub live: usize,
    pub fresh: usize,
    pub released: usize,
    pub recycled: usize,
}

/// Released slots held back from reuse unless configured otherwise
pub const DEFAULT_RELEASE_QUARANTINE: usize = 16;

/// Pool of executable trampoline slots
pub struct ExecutableArena {
    state: Mutex<ArenaState>,
    slots_per_chunk: usize,
    recycle_released: bool,
    quarantine: usize,
    recycled: AtomicUsize,
}

// SAFETY: closure pointers are touched only under `state` or through a lease
unsafe impl Send for ExecutableArena {}
unsafe impl Sync for ExecutableArena {}

impl ExecutableArena {
    /// Arena with page-derived chunks and quarantined recycling
    pub fn new() -> Self {
        Self::with_options(None, true)
    }

    pub fn with_options(slots_per_chunk: Option<usize>, recycle_released: bool) -> Self {
        let slots_per_chunk = slots_per_chunk.unwrap_or_else(default_slots_per_chunk).max(1);
        Self {
            state: Mutex::new(ArenaState {
                slots: Vec::new(),
                fresh: Vec::new(),
                released: VecDeque::new(),
                chunks: 0,
                live: 0,
            }),
            slots_per_chunk,
            recycle_released,
            quarantine: DEFAULT_RELEASE_QUARANTINE,
            recycled: AtomicUsize::new(0),
        }
    }

    /// Number of most recently released slots never handed out again
    pub fn with_quarantine(mut self, quarantine: usize) -> Self {
        self.quarantine = quarantine;
        self
    }

    #[inline]
    pub fn slots_per_chunk(&self) -> usize {
        self.slots_per_chunk
    }

    #[inline]
    pub fn recycles_released(&self) -> bool {
        self.recycle_released
    }

    #[inline]
    pub fn quarantine(&self) -> usize {
        self.quarantine
    }

    /// Take a slot: an idle released one past quarantine, else a fresh one
    pub(crate) fn acquire(&self) -> Result<SlotLease> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut index = None;
        if self.recycle_released {
            let slots = &state.slots;
            let eligible = state.released.len().saturating_sub(self.quarantine);
            let idle = state
                .released
                .iter()
                .take(eligible)
                .position(|&i| slots[i].cell.is_idle());
            if let Some(pos) = idle {
                index = state.released.remove(pos);
                self.recycled.fetch_add(1, Ordering::Relaxed);
            }
        }
        let index = match index.or_else(|| state.fresh.pop()) {
            Some(index) => index,
            None => {
                self.grow(state)?;
                state.fresh.pop().ok_or(BridgeError::AllocationFailure {
                    what: "trampoline slot",
                    size: 0,
                })?
            }
        };

        state.live += 1;
        let slot = &state.slots[index];
        Ok(SlotLease {
            index,
            closure: slot.closure,
            code: slot.code,
            cell: slot.cell.clone(),
        })
    }

    fn grow(&self, state: &mut ArenaState) -> Result<()> {
        let start = state.slots.len();
        for _ in 0..self.slots_per_chunk {
            let (closure, code) = low::closure_alloc();
            if closure.is_null() {
                break;
            }
            let cell = Arc::new(SlotCell::new(Pointer::from_raw(code.as_ptr())));
            state.slots.push(Slot { closure, code, cell });
        }
        if state.slots.len() == start {
            return Err(BridgeError::AllocationFailure {
                what: "trampoline",
                size: std::mem::size_of::<ffi_closure>(),
            });
        }
        // Hand out low indices first
        state.fresh.extend((start..state.slots.len()).rev());
        state.chunks += 1;
        logging::log_arena_grow(state.chunks, state.slots.len());
        Ok(())
    }

    /// Point the lease's closure at `cif`
    ///
    /// # Safety
    /// The lease must not be bound and `cif` must describe the call shape
    /// native code will use on the trampoline.
    pub(crate) unsafe fn prepare(&self, lease: &SlotLease, cif: Arc<CallInterface>) -> Result<()> {
        low::prep_closure(
            lease.closure,
            cif.as_raw_ptr(),
            dispatch::trampoline_entry,
            Arc::as_ptr(&lease.cell),
            lease.code,
        )
        .map_err(|err| BridgeError::layout(format!("libffi rejected the closure: {:?}", err)))?;
        // Swap only after the closure no longer refers to the previous CIF
        let previous = lease.cell.cif.write().replace(cif);
        drop(previous);
        Ok(())
    }

    /// Publish `core` on the lease's slot
    pub(crate) fn bind(&self, lease: &SlotLease, core: Arc<CallbackCore>) {
        *lease.cell.binding.write() = Some(core);
    }

    /// Unbind and queue the slot
    pub(crate) fn release(&self, lease: SlotLease) {
        lease.cell.unbind();
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        state.released.push_back(lease.index);
    }

    pub fn stats(&self) -> ArenaStats {
        let state = self.state.lock();
        ArenaStats {
            chunks: state.chunks,
            capacity: state.slots.len(),
            live: state.live,
            fresh: state.fresh.len(),
            released: state.released.len(),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}

impl Default for ExecutableArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutableArena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for slot in state.slots.drain(..) {
            // SAFETY: allocated by closure_alloc, freed once; nothing can call
            // into the arena once its owner is gone
            unsafe { low::closure_free(slot.closure) };
        }
    }
}

impl fmt::Debug for ExecutableArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableArena")
            .field("slots_per_chunk", &self.slots_per_chunk)
            .field("recycle_released", &self.recycle_released)
            .field("quarantine", &self.quarantine)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Closures that fit in one page
fn default_slots_per_chunk() -> usize {
    (page_size() / std::mem::size_of::<ffi_closure>()).max(1)
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    // SAFETY: GetSystemInfo fills the struct it is given
    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

#[cfg(not(any(unix, windows)))]
fn page_size() -> usize {
    4096
}
