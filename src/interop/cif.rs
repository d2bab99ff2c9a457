//! Call interfaces
//!
//! Design:
//! - A `CallInterface` is prepared once per distinct (args, return,
//!   convention, fixed count) tuple and never mutated afterwards
//! - It owns the libffi type graph and argument-type array it was prepared
//!   with, so the `ffi_cif` pointers stay valid for its whole life
//! - `CifCache` hands out shared `Arc`s; a race between two preparers is
//!   settled by keeping whichever entry landed first

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use libffi::low::{self, ffi_cif, ffi_type};
use libffi::middle::Type;

use super::abi::{self, CallLayout, CallingConvention, ConventionTag};
use super::types::{TypeDescriptor, TypeTag};
use crate::error::{BridgeError, Position, Result};
use crate::logging;

/// Prepared description of one call shape
pub struct CallInterface {
    args: Vec<TypeDescriptor>,
    ret: TypeDescriptor,
    convention: &'static dyn CallingConvention,
    fixed_args: Option<usize>,
    layout: CallLayout,
    // libffi graph referenced by `raw`; must outlive it
    _arg_types: Vec<Type>,
    _ret_type: Type,
    _atypes: Box<[*mut ffi_type]>,
    raw: Box<UnsafeCell<ffi_cif>>,
}

// SAFETY: nothing is mutated after `prep_cif`; libffi only reads the cif
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    pub fn prepare(args: &[TypeDescriptor], ret: &TypeDescriptor, convention: ConventionTag) -> Result<Self> {
        Self::build(args.to_vec(), ret.clone(), convention, None)
    }

    /// Prepare a variadic call; the variadic tail is promoted per C rules
    pub fn prepare_variadic(
        fixed: &[TypeDescriptor],
        variadic: &[TypeDescriptor],
        ret: &TypeDescriptor,
        convention: ConventionTag,
    ) -> Result<Self> {
        let args = promoted_args(fixed, variadic);
        Self::build(args, ret.clone(), convention, Some(fixed.len()))
    }

    fn build(
        args: Vec<TypeDescriptor>,
        ret: TypeDescriptor,
        tag: ConventionTag,
        fixed_args: Option<usize>,
    ) -> Result<Self> {
        let convention = abi::resolve(tag)?;
        let ffi_abi = convention
            .ffi_abi()
            .ok_or_else(|| BridgeError::BadCallingConvention {
                convention: tag,
                target: convention.target().to_string(),
            })?;

        if let Some(index) = args.iter().position(|a| a.is_void()) {
            return Err(BridgeError::UnsupportedType {
                position: Position::Parameter(index),
                type_name: "void".to_string(),
            });
        }

        let arg_types: Vec<Type> = args.iter().map(ffi_type_for).collect();
        let ret_type = ffi_type_for(&ret);
        let mut atypes: Box<[*mut ffi_type]> = arg_types.iter().map(|t| t.as_raw_ptr()).collect();
        // SAFETY: an all-zero ffi_cif is a valid blank for prep_cif to fill
        let raw = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<ffi_cif>() }));

        // SAFETY: every pointer handed to libffi is owned by the value being built
        let prepared = unsafe {
            match fixed_args {
                None => low::prep_cif(raw.get(), ffi_abi, args.len(), ret_type.as_raw_ptr(), atypes.as_mut_ptr()),
                Some(fixed) => low::prep_cif_var(
                    raw.get(),
                    ffi_abi,
                    fixed,
                    args.len(),
                    ret_type.as_raw_ptr(),
                    atypes.as_mut_ptr(),
                ),
            }
        };
        prepared.map_err(|err| match err {
            low::Error::Abi => BridgeError::BadCallingConvention {
                convention: tag,
                target: convention.target().to_string(),
            },
            other => BridgeError::layout(format!("libffi rejected the call interface: {:?}", other)),
        })?;

        // libffi lays out aggregates during preparation; both views must agree
        for (desc, ty) in args.iter().chain(std::iter::once(&ret)).zip(arg_types.iter().chain(std::iter::once(&ret_type))) {
            if desc.is_aggregate() {
                // SAFETY: prepared types are initialized
                let (size, align) = unsafe {
                    let raw_ty = &*ty.as_raw_ptr();
                    (raw_ty.size, raw_ty.alignment as usize)
                };
                if size != desc.size() || align != desc.align() {
                    return Err(BridgeError::layout(format!(
                        "aggregate layout mismatch: computed {}/{} but the backend uses {}/{}",
                        desc.size(),
                        desc.align(),
                        size,
                        align
                    )));
                }
            }
        }

        let layout = abi::compute_layout(convention, &args, &ret);
        logging::log_cif_prepared(args.len(), convention.name(), layout.stack_bytes);

        Ok(Self {
            args,
            ret,
            convention,
            fixed_args,
            layout,
            _arg_types: arg_types,
            _ret_type: ret_type,
            _atypes: atypes,
            raw,
        })
    }

    #[inline]
    pub fn arg_types(&self) -> &[TypeDescriptor] {
        &self.args
    }

    #[inline]
    pub fn return_type(&self) -> &TypeDescriptor {
        &self.ret
    }

    #[inline]
    pub fn convention(&self) -> ConventionTag {
        self.convention.tag()
    }

    #[inline]
    pub fn calling_convention(&self) -> &'static dyn CallingConvention {
        self.convention
    }

    #[inline]
    pub fn layout(&self) -> &CallLayout {
        &self.layout
    }

    #[inline]
    pub fn fixed_args(&self) -> Option<usize> {
        self.fixed_args
    }

    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.fixed_args.is_some()
    }

    #[inline]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Bytes of return storage to hand libffi
    ///
    /// Never less than two words: small integers come back widened and
    /// register-returned aggregates may be stored whole.
    #[inline]
    pub(crate) fn return_storage(&self) -> usize {
        self.ret.size().max(2 * std::mem::size_of::<u64>())
    }

    #[inline]
    pub(crate) fn as_raw_ptr(&self) -> *mut ffi_cif {
        self.raw.get()
    }
}

impl fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInterface")
            .field("args", &self.args)
            .field("ret", &self.ret)
            .field("convention", &self.convention.name())
            .field("fixed_args", &self.fixed_args)
            .field("stack_bytes", &self.layout.stack_bytes)
            .finish()
    }
}

fn promoted_args(fixed: &[TypeDescriptor], variadic: &[TypeDescriptor]) -> Vec<TypeDescriptor> {
    fixed
        .iter()
        .cloned()
        .chain(variadic.iter().map(TypeDescriptor::variadic_promotion))
        .collect()
}

fn ffi_type_for(desc: &TypeDescriptor) -> Type {
    match desc.tag() {
        TypeTag::Void => Type::void(),
        TypeTag::Bool | TypeTag::UInt8 => Type::u8(),
        TypeTag::SInt8 => Type::i8(),
        TypeTag::SInt16 => Type::i16(),
        TypeTag::UInt16 => Type::u16(),
        TypeTag::SInt32 => Type::i32(),
        TypeTag::UInt32 => Type::u32(),
        TypeTag::SInt64 => Type::i64(),
        TypeTag::UInt64 => Type::u64(),
        TypeTag::Float32 => Type::f32(),
        TypeTag::Float64 => Type::f64(),
        TypeTag::Pointer => Type::pointer(),
        TypeTag::Aggregate if desc.is_union() => union_type(desc),
        TypeTag::Aggregate => Type::structure(desc.members().iter().map(|m| ffi_type_for(&m.ty))),
    }
}

/// libffi has no unions: one travels as a structure of alignment-sized
/// words, each floating point only if every member overlapping it is
fn union_type(desc: &TypeDescriptor) -> Type {
    let unit = desc.align().min(8);
    let leaves = desc.flatten();
    let words = (0..desc.size() / unit).map(|index| {
        let start = index * unit;
        let mut overlapping = leaves
            .iter()
            .filter(|(offset, tag)| *offset < start + unit && offset + tag.size() > start)
            .peekable();
        let float = overlapping.peek().is_some() && overlapping.all(|(_, tag)| tag.is_float());
        match (unit, float) {
            (8, true) => Type::f64(),
            (8, false) => Type::u64(),
            (4, true) => Type::f32(),
            (4, false) => Type::u32(),
            (2, _) => Type::u16(),
            _ => Type::u8(),
        }
    });
    Type::structure(words)
}

/// Cache key: everything that distinguishes two call shapes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CifKey {
    args: Vec<TypeDescriptor>,
    ret: TypeDescriptor,
    convention: ConventionTag,
    fixed_args: Option<usize>,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CifCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Concurrent cache of prepared call interfaces
pub struct CifCache {
    entries: DashMap<CifKey, Arc<CallInterface>>,
    capacity: usize,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CifCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            enabled: capacity > 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache that prepares a fresh interface every time
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn prepare(
        &self,
        args: &[TypeDescriptor],
        ret: &TypeDescriptor,
        convention: ConventionTag,
    ) -> Result<Arc<CallInterface>> {
        let key = CifKey {
            args: args.to_vec(),
            ret: ret.clone(),
            convention,
            fixed_args: None,
        };
        self.get_or_build(key)
    }

    pub fn prepare_variadic(
        &self,
        fixed: &[TypeDescriptor],
        variadic: &[TypeDescriptor],
        ret: &TypeDescriptor,
        convention: ConventionTag,
    ) -> Result<Arc<CallInterface>> {
        let key = CifKey {
            args: promoted_args(fixed, variadic),
            ret: ret.clone(),
            convention,
            fixed_args: Some(fixed.len()),
        };
        self.get_or_build(key)
    }

    fn get_or_build(&self, key: CifKey) -> Result<Arc<CallInterface>> {
        if self.enabled {
            if let Some(hit) = self.entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit.value().clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let cif = Arc::new(CallInterface::build(
            key.args.clone(),
            key.ret.clone(),
            key.convention,
            key.fixed_args,
        )?);

        if !self.enabled || self.entries.len() >= self.capacity {
            return Ok(cif);
        }
        Ok(self.entries.entry(key).or_insert(cif).value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CifCacheStats {
        CifCacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CifCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CifCache")
            .field("stats", &self.stats())
            .field("capacity", &self.capacity)
            .finish()
    }
}
