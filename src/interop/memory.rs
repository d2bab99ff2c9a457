//! Native memory handles
//!
//! `Pointer` is an unowned address: nothing is checked and every access is
//! `unsafe`. `Memory` owns a zeroed block from the C heap, bounds-checks its
//! accessors and frees the block on drop.

use std::ffi::CStr;
use std::fmt;
use std::os::raw::{c_char, c_void};
use std::ptr::{self, NonNull};

use crate::error::{BridgeError, Result};

/// Native `wchar_t`
#[cfg(windows)]
pub type WChar = u16;
#[cfg(not(windows))]
pub type WChar = u32;

/// Opaque native address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pointer(usize);

impl Pointer {
    pub const NULL: Pointer = Pointer(0);

    #[inline]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    #[inline]
    pub fn from_raw<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn address(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// # Safety
    /// `self + offset` must be valid for reads of `T`.
    #[inline]
    pub unsafe fn read<T: NativeScalar>(self, offset: usize) -> T {
        ptr::read_unaligned(self.offset(offset).as_ptr::<T>())
    }

    /// # Safety
    /// `self + offset` must be valid for writes of `T`.
    #[inline]
    pub unsafe fn write<T: NativeScalar>(self, offset: usize, value: T) {
        ptr::write_unaligned(self.offset(offset).as_ptr::<T>(), value)
    }

    /// # Safety
    /// `len` bytes at `self + offset` must be readable.
    pub unsafe fn read_bytes(self, offset: usize, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        ptr::copy_nonoverlapping(self.offset(offset).as_ptr::<u8>(), bytes.as_mut_ptr(), len);
        bytes
    }

    /// # Safety
    /// `bytes.len()` bytes at `self + offset` must be writable.
    pub unsafe fn write_bytes(self, offset: usize, bytes: &[u8]) {
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.offset(offset).as_ptr::<u8>(), bytes.len());
    }

    /// Decode a NUL-terminated narrow string, replacing invalid UTF-8
    ///
    /// # Safety
    /// Must point at a NUL-terminated buffer.
    pub unsafe fn read_c_string(self, offset: usize) -> String {
        CStr::from_ptr(self.offset(offset).as_ptr::<c_char>())
            .to_string_lossy()
            .into_owned()
    }

    /// Decode a NUL-terminated `wchar_t` string
    ///
    /// # Safety
    /// Must point at a NUL-terminated, `wchar_t`-aligned buffer.
    pub unsafe fn read_wide_string(self, offset: usize) -> String {
        let start = self.offset(offset).as_ptr::<WChar>();
        let mut len = 0;
        while *start.add(len) != 0 {
            len += 1;
        }
        let units = std::slice::from_raw_parts(start, len);
        decode_wide(units)
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native@{:#x}", self.0)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(windows)]
fn decode_wide(units: &[WChar]) -> String {
    String::from_utf16_lossy(units)
}

#[cfg(not(windows))]
fn decode_wide(units: &[WChar]) -> String {
    units
        .iter()
        .map(|&u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(windows)]
pub(crate) fn encode_wide(s: &str) -> Vec<WChar> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(not(windows))]
pub(crate) fn encode_wide(s: &str) -> Vec<WChar> {
    s.chars().map(|c| c as WChar).chain(std::iter::once(0)).collect()
}

mod sealed {
    pub trait Sealed {}
}

/// Plain-old-data types that may be read from arbitrary native bytes
pub trait NativeScalar: Copy + sealed::Sealed + 'static {}

macro_rules! native_scalars {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl NativeScalar for $t {}
        )*
    };
}

native_scalars!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize, f32, f64);

/// Owned, zero-initialized native block
pub struct Memory {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the block is plain bytes owned by this handle
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    /// Allocate `size` zeroed bytes
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(BridgeError::AllocationFailure {
                what: "native memory",
                size,
            });
        }
        // SAFETY: calloc has no preconditions; null is handled below
        let raw = unsafe { libc::calloc(1, size) } as *mut u8;
        let ptr = NonNull::new(raw).ok_or(BridgeError::AllocationFailure {
            what: "native memory",
            size,
        })?;
        Ok(Self { ptr, size })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let memory = Self::allocate(bytes.len().max(1))?;
        // SAFETY: freshly allocated with room for `bytes`
        unsafe { memory.pointer().write_bytes(0, bytes) };
        Ok(memory)
    }

    /// NUL-terminated UTF-8 copy of `s`
    pub fn from_c_string(s: &str) -> Result<Self> {
        // Zeroed allocation supplies the terminator
        let memory = Self::allocate(s.len() + 1)?;
        // SAFETY: len + 1 bytes were allocated
        unsafe { memory.pointer().write_bytes(0, s.as_bytes()) };
        Ok(memory)
    }

    /// NUL-terminated `wchar_t` copy of `s`
    pub fn from_wide_string(s: &str) -> Result<Self> {
        let units = encode_wide(s);
        let memory = Self::allocate(units.len() * std::mem::size_of::<WChar>())?;
        // SAFETY: the block holds exactly `units`
        unsafe {
            ptr::copy_nonoverlapping(units.as_ptr(), memory.pointer().as_ptr::<WChar>(), units.len());
        }
        Ok(memory)
    }

    #[inline]
    pub fn pointer(&self) -> Pointer {
        Pointer::from_raw(self.ptr.as_ptr())
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BridgeError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn read<T: NativeScalar>(&self, offset: usize) -> Result<T> {
        self.check(offset, std::mem::size_of::<T>())?;
        // SAFETY: bounds checked above
        Ok(unsafe { self.pointer().read(offset) })
    }

    pub fn write<T: NativeScalar>(&self, offset: usize, value: T) -> Result<()> {
        self.check(offset, std::mem::size_of::<T>())?;
        // SAFETY: bounds checked above
        unsafe { self.pointer().write(offset, value) };
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        // SAFETY: bounds checked above
        Ok(unsafe { self.pointer().read_bytes(offset, len) })
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        // SAFETY: bounds checked above
        unsafe { self.pointer().write_bytes(offset, bytes) };
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // SAFETY: the whole block is ours
        unsafe { self.pointer().read_bytes(0, self.size) }
    }

    pub fn clear(&self) {
        // SAFETY: the whole block is ours
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), 0, self.size) };
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        // SAFETY: allocated by calloc in `allocate`
        unsafe { libc::free(self.ptr.as_ptr() as *mut c_void) };
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("ptr", &self.pointer())
            .field("size", &self.size)
            .finish()
    }
}

/// Raw, uninitialized allocation from the C heap
pub fn alloc(size: usize) -> Result<Pointer> {
    // SAFETY: malloc has no preconditions
    let raw = unsafe { libc::malloc(size.max(1)) };
    if raw.is_null() {
        return Err(BridgeError::AllocationFailure {
            what: "native memory",
            size,
        });
    }
    Ok(Pointer::from_raw(raw))
}

/// Release a block obtained from [`alloc`]
///
/// # Safety
/// `ptr` must come from [`alloc`] (or be null) and not be freed twice.
pub unsafe fn free(ptr: Pointer) {
    libc::free(ptr.as_ptr::<c_void>());
}
