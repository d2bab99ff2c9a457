//! Dynamic library loading and symbol resolution
//!
//! Platform-agnostic wrapper around dlopen/LoadLibrary. The handle is only an
//! address; closing happens on drop.

use std::ffi::CString;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use super::abi::ConventionTag;
use super::call::Function;
use super::global::GlobalVariable;
use super::memory::Pointer;
use super::types::LogicalType;
use crate::error::Result as BridgeResult;

static LIBRARIES_LOADED: AtomicUsize = AtomicUsize::new(0);

/// Number of libraries opened since start-up
pub fn libraries_loaded() -> usize {
    LIBRARIES_LOADED.load(Ordering::Relaxed)
}

/// Handle to a dynamically loaded library
pub struct Library {
    handle: NonNull<c_void>,
    name: String,
}

impl Library {
    /// Load a library by name or path
    pub fn open(name: &str) -> Result<Self, LoadError> {
        let handle = open_impl(Some(name))?;
        LIBRARIES_LOADED.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(event = "library_opened", library = name);
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    /// Handle for the running executable and everything it already loaded
    pub fn this_process() -> Result<Self, LoadError> {
        let handle = open_impl(None)?;
        Ok(Self {
            handle,
            name: "<process>".to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<Pointer, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName(name.to_string()))?;
        let address = symbol_impl(self.handle, &cname);
        if address.is_null() {
            Err(SymbolError::NotFound {
                symbol: name.to_string(),
                library: self.name.clone(),
            })
        } else {
            Ok(Pointer::from_raw(address))
        }
    }

    /// Exported function bound to `convention`
    pub fn function(&self, name: &str, convention: ConventionTag) -> Result<Function, SymbolError> {
        let address = self.symbol(name)?;
        // SAFETY: exported symbols are code the caller chose to bind
        let function = unsafe { Function::new(address, convention) };
        Ok(function.with_name(name))
    }

    /// Exported variable `name` of type `ty`
    ///
    /// Mapped types need a bridge: use `Bridge::global_variable`.
    pub fn global(&self, name: &str, ty: LogicalType) -> BridgeResult<GlobalVariable<'_>> {
        GlobalVariable::resolve(self, name, ty, None)
    }

    /// Close explicitly; dropping does the same
    pub fn close(self) {}
}

impl Drop for Library {
    fn drop(&mut self) {
        close_impl(self.handle);
        tracing::trace!(event = "library_closed", library = %self.name);
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

// SAFETY: OS library handles may be used and closed from any thread
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

#[cfg(unix)]
fn open_impl(name: Option<&str>) -> Result<NonNull<c_void>, LoadError> {
    let cname = match name {
        Some(name) => Some(CString::new(name).map_err(|_| LoadError::InvalidName(name.to_string()))?),
        None => None,
    };
    let raw_name = cname.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());

    // SAFETY: `raw_name` is null or a valid C string
    unsafe {
        let handle = libc::dlopen(raw_name, libc::RTLD_NOW | libc::RTLD_LOCAL);
        NonNull::new(handle).ok_or_else(|| {
            let err = libc::dlerror();
            let message = if err.is_null() {
                "unknown error".to_string()
            } else {
                std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
            };
            LoadError::LoadFailed {
                library: name.unwrap_or("<process>").to_string(),
                message,
            }
        })
    }
}

#[cfg(unix)]
fn symbol_impl(handle: NonNull<c_void>, name: &CString) -> *mut c_void {
    // SAFETY: handle came from dlopen and is still open
    unsafe { libc::dlsym(handle.as_ptr(), name.as_ptr()) }
}

#[cfg(unix)]
fn close_impl(handle: NonNull<c_void>) {
    // SAFETY: handle came from dlopen and is closed once
    unsafe {
        libc::dlclose(handle.as_ptr());
    }
}

#[cfg(windows)]
fn open_impl(name: Option<&str>) -> Result<NonNull<c_void>, LoadError> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::libloaderapi::{GetModuleHandleW, LoadLibraryW};

    // SAFETY: wide strings are NUL-terminated
    unsafe {
        let handle = match name {
            Some(name) => {
                let wide: Vec<u16> = OsStr::new(name).encode_wide().chain(Some(0)).collect();
                LoadLibraryW(wide.as_ptr())
            }
            None => GetModuleHandleW(std::ptr::null()),
        };
        NonNull::new(handle as *mut c_void).ok_or_else(|| LoadError::LoadFailed {
            library: name.unwrap_or("<process>").to_string(),
            message: format!("error code {}", GetLastError()),
        })
    }
}

#[cfg(windows)]
fn symbol_impl(handle: NonNull<c_void>, name: &CString) -> *mut c_void {
    use winapi::um::libloaderapi::GetProcAddress;
    // SAFETY: handle is a loaded module
    unsafe { GetProcAddress(handle.as_ptr() as _, name.as_ptr()) as *mut c_void }
}

#[cfg(windows)]
fn close_impl(handle: NonNull<c_void>) {
    use winapi::um::libloaderapi::FreeLibrary;
    // SAFETY: handle is a loaded module, released once
    unsafe {
        FreeLibrary(handle.as_ptr() as _);
    }
}

/// Library loading errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("invalid library name {0:?}")]
    InvalidName(String),

    #[error("failed to load library {library}: {message}")]
    LoadFailed { library: String, message: String },
}

/// Symbol lookup errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("invalid symbol name {0:?}")]
    InvalidName(String),

    #[error("symbol {symbol} not found in {library}")]
    NotFound { symbol: String, library: String },
}
