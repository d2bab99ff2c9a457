//! Native and managed type descriptions
//!
//! Design:
//! - `TypeTag`/`TypeDescriptor` describe what the native side sees (size,
//!   alignment, signedness, aggregate members with offsets)
//! - `LogicalType` describes what the managed side declares
//! - Sizes and alignments come from the host so aggregate layouts match
//!   `repr(C)` exactly

use std::fmt;
use std::mem::{align_of, size_of};
use std::os::raw::{c_long, c_void};
use std::sync::Arc;

use super::abi::ConventionTag;
use super::structure::StructDef;
use crate::error::{BridgeError, Result};

/// Deepest aggregate nesting accepted by the layout engine
pub const MAX_NESTING: usize = 32;

/// Word written by libffi for integral return values
pub(crate) type ReturnWord = usize;

/// Native type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Void,
    Bool,
    SInt8,
    UInt8,
    SInt16,
    UInt16,
    SInt32,
    UInt32,
    SInt64,
    UInt64,
    Float32,
    Float64,
    Pointer,
    Aggregate,
}

impl TypeTag {
    /// Size in bytes (0 for void and aggregates)
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void | Self::Aggregate => 0,
            Self::Bool | Self::SInt8 | Self::UInt8 => 1,
            Self::SInt16 | Self::UInt16 => 2,
            Self::SInt32 | Self::UInt32 => 4,
            Self::Float32 => size_of::<f32>(),
            Self::SInt64 | Self::UInt64 => size_of::<i64>(),
            Self::Float64 => size_of::<f64>(),
            Self::Pointer => size_of::<*const c_void>(),
        }
    }

    /// Alignment in bytes as the host compiler lays it out
    #[inline]
    pub const fn align(self) -> usize {
        match self {
            Self::Void | Self::Aggregate => 1,
            Self::Bool | Self::SInt8 | Self::UInt8 => 1,
            Self::SInt16 | Self::UInt16 => align_of::<i16>(),
            Self::SInt32 | Self::UInt32 => align_of::<i32>(),
            Self::Float32 => align_of::<f32>(),
            Self::SInt64 | Self::UInt64 => align_of::<i64>(),
            Self::Float64 => align_of::<f64>(),
            Self::Pointer => align_of::<*const c_void>(),
        }
    }

    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::SInt8
                | Self::UInt8
                | Self::SInt16
                | Self::UInt16
                | Self::SInt32
                | Self::UInt32
                | Self::SInt64
                | Self::UInt64
        )
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::SInt8 | Self::SInt16 | Self::SInt32 | Self::SInt64)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::SInt8 => "int8",
            Self::UInt8 => "uint8",
            Self::SInt16 => "int16",
            Self::UInt16 => "uint16",
            Self::SInt32 => "int32",
            Self::UInt32 => "uint32",
            Self::SInt64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Pointer => "pointer",
            Self::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One laid-out member of an aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub offset: usize,
    pub ty: TypeDescriptor,
}

/// Native type descriptor
///
/// Immutable once built. Primitive descriptors carry no member list, so they
/// are cheap to copy around and compare.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    tag: TypeTag,
    size: usize,
    align: usize,
    members: Option<Arc<[Member]>>,
    union: bool,
}

impl TypeDescriptor {
    pub const VOID: Self = Self::primitive(TypeTag::Void);
    pub const BOOL: Self = Self::primitive(TypeTag::Bool);
    pub const I8: Self = Self::primitive(TypeTag::SInt8);
    pub const U8: Self = Self::primitive(TypeTag::UInt8);
    pub const I16: Self = Self::primitive(TypeTag::SInt16);
    pub const U16: Self = Self::primitive(TypeTag::UInt16);
    pub const I32: Self = Self::primitive(TypeTag::SInt32);
    pub const U32: Self = Self::primitive(TypeTag::UInt32);
    pub const I64: Self = Self::primitive(TypeTag::SInt64);
    pub const U64: Self = Self::primitive(TypeTag::UInt64);
    pub const F32: Self = Self::primitive(TypeTag::Float32);
    pub const F64: Self = Self::primitive(TypeTag::Float64);
    pub const POINTER: Self = Self::primitive(TypeTag::Pointer);

    /// Descriptor for a scalar tag
    ///
    /// `TypeTag::Aggregate` yields an empty placeholder; use
    /// [`TypeDescriptor::aggregate`] for real structures.
    #[inline]
    pub const fn primitive(tag: TypeTag) -> Self {
        Self {
            tag,
            size: tag.size(),
            align: tag.align(),
            members: None,
            union: false,
        }
    }

    /// Lay out an aggregate with the natural-alignment rule
    ///
    /// Each member starts at the next multiple of its own alignment, the
    /// aggregate aligns to its strictest member and trailing padding rounds
    /// the size up to that alignment.
    pub fn aggregate(members: impl IntoIterator<Item = TypeDescriptor>) -> Result<Self> {
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut laid_out = Vec::new();

        for (index, ty) in members.into_iter().enumerate() {
            check_member(index, &ty)?;
            offset = align_up(offset, ty.align);
            align = align.max(ty.align);
            let size = ty.size;
            laid_out.push(Member { offset, ty });
            offset += size;
        }

        if laid_out.is_empty() {
            return Err(BridgeError::layout("aggregate has no members"));
        }

        Ok(Self {
            tag: TypeTag::Aggregate,
            size: align_up(offset, align),
            align,
            members: Some(laid_out.into()),
            union: false,
        })
    }

    /// Lay out a union: every member starts at offset 0
    ///
    /// The union aligns to its strictest member and its size is the largest
    /// member rounded up to that alignment.
    pub fn union(members: impl IntoIterator<Item = TypeDescriptor>) -> Result<Self> {
        let mut size = 0usize;
        let mut align = 1usize;
        let mut laid_out = Vec::new();

        for (index, ty) in members.into_iter().enumerate() {
            check_member(index, &ty)?;
            size = size.max(ty.size);
            align = align.max(ty.align);
            laid_out.push(Member { offset: 0, ty });
        }

        if laid_out.is_empty() {
            return Err(BridgeError::layout("union has no members"));
        }

        Ok(Self {
            tag: TypeTag::Aggregate,
            size: align_up(size, align),
            align,
            members: Some(laid_out.into()),
            union: true,
        })
    }

    #[inline]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Aggregate members in declaration order (empty for scalars)
    #[inline]
    pub fn members(&self) -> &[Member] {
        self.members.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn is_aggregate(&self) -> bool {
        self.tag == TypeTag::Aggregate
    }

    /// Aggregate whose members overlap at offset 0
    #[inline]
    pub fn is_union(&self) -> bool {
        self.union
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        self.tag == TypeTag::Void
    }

    /// Nesting depth (0 for scalars)
    pub fn depth(&self) -> usize {
        self.members()
            .iter()
            .map(|m| m.ty.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Scalar leaves of this descriptor with their absolute offsets
    pub fn flatten(&self) -> Vec<(usize, TypeTag)> {
        let mut leaves = Vec::new();
        self.flatten_into(0, &mut leaves);
        leaves
    }

    fn flatten_into(&self, base: usize, leaves: &mut Vec<(usize, TypeTag)>) {
        if self.is_aggregate() {
            for member in self.members() {
                member.ty.flatten_into(base + member.offset, leaves);
            }
        } else {
            leaves.push((base, self.tag));
        }
    }

    /// C default argument promotion for the variadic part of a call
    ///
    /// float becomes double; bool, char and short become int.
    pub fn variadic_promotion(&self) -> TypeDescriptor {
        match self.tag {
            TypeTag::Float32 => Self::F64,
            TypeTag::Bool
            | TypeTag::SInt8
            | TypeTag::UInt8
            | TypeTag::SInt16
            | TypeTag::UInt16 => Self::I32,
            _ => self.clone(),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_aggregate() {
            let kind = if self.union { "union" } else { "struct" };
            write!(f, "{}(size={}, align={}) {{ ", kind, self.size, self.align)?;
            for member in self.members() {
                write!(f, "+{}: {:?}; ", member.offset, member.ty)?;
            }
            write!(f, "}}")
        } else {
            f.write_str(self.tag.name())
        }
    }
}

fn check_member(index: usize, ty: &TypeDescriptor) -> Result<()> {
    if ty.tag == TypeTag::Void || ty.size == 0 {
        return Err(BridgeError::layout(format!(
            "member {} of type {} has no storage",
            index, ty.tag
        )));
    }
    if ty.depth() >= MAX_NESTING {
        return Err(BridgeError::layout(format!(
            "member {} nests deeper than {} levels",
            index, MAX_NESTING
        )));
    }
    Ok(())
}

/// `(size, align)` of a descriptor
#[inline]
pub fn native_size(desc: &TypeDescriptor) -> (usize, usize) {
    (desc.size(), desc.align())
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Tag of the host's C `long`
pub const fn native_long_tag(signed: bool) -> TypeTag {
    match (size_of::<c_long>(), signed) {
        (8, true) => TypeTag::SInt64,
        (8, false) => TypeTag::UInt64,
        (_, true) => TypeTag::SInt32,
        (_, false) => TypeTag::UInt32,
    }
}

/// Tag of the host's `size_t`
pub const fn size_t_tag() -> TypeTag {
    match size_of::<usize>() {
        8 => TypeTag::UInt64,
        _ => TypeTag::UInt32,
    }
}

/// Raw storage for one scalar argument or return value
#[repr(C)]
pub union RawValue {
    pub u8: u8,
    pub i8: i8,
    pub u16: u16,
    pub i16: i16,
    pub u32: u32,
    pub i32: i32,
    pub u64: u64,
    pub i64: i64,
    pub f32: f32,
    pub f64: f64,
    pub word: usize,
    pub ptr: *mut c_void,
}

impl RawValue {
    #[inline]
    pub const fn zeroed() -> Self {
        Self { u64: 0 }
    }

    #[inline]
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        let mut raw = Self::zeroed();
        raw.ptr = ptr;
        raw
    }
}

impl Default for RawValue {
    #[inline]
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Copy for RawValue {}
impl Clone for RawValue {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: every bit pattern is a valid u64
        write!(f, "RawValue({:#018x})", unsafe { self.u64 })
    }
}

/// Managed-side type declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// C `long`, 32 or 64 bits depending on the platform
    NativeLong,
    NativeULong,
    SizeT,
    F32,
    F64,
    Pointer,
    /// NUL-terminated UTF-8 (`char*`)
    String,
    /// NUL-terminated `wchar_t*`
    WString,
    /// Structure passed by address
    Struct(Arc<StructDef>),
    /// Structure passed by value
    StructByValue(Arc<StructDef>),
    Callback(Arc<Signature>),
    /// Primitive array, passed as a pointer to its pinned storage
    Array,
    /// In/out scalar cell
    Reference,
    /// Custom type resolved through the `TypeMapper`
    Mapped(Arc<str>),
}

impl LogicalType {
    /// Descriptor for types with a fixed native representation
    ///
    /// Returns `None` for `Mapped`, which needs a registered converter.
    pub fn builtin_descriptor(&self) -> Option<TypeDescriptor> {
        let desc = match self {
            Self::Void => TypeDescriptor::VOID,
            Self::Bool => TypeDescriptor::BOOL,
            Self::I8 => TypeDescriptor::I8,
            Self::U8 => TypeDescriptor::U8,
            Self::I16 => TypeDescriptor::I16,
            Self::U16 => TypeDescriptor::U16,
            Self::I32 => TypeDescriptor::I32,
            Self::U32 => TypeDescriptor::U32,
            Self::I64 => TypeDescriptor::I64,
            Self::U64 => TypeDescriptor::U64,
            Self::NativeLong => TypeDescriptor::primitive(native_long_tag(true)),
            Self::NativeULong => TypeDescriptor::primitive(native_long_tag(false)),
            Self::SizeT => TypeDescriptor::primitive(size_t_tag()),
            Self::F32 => TypeDescriptor::F32,
            Self::F64 => TypeDescriptor::F64,
            Self::Pointer
            | Self::String
            | Self::WString
            | Self::Struct(_)
            | Self::Callback(_)
            | Self::Array
            | Self::Reference => TypeDescriptor::POINTER,
            Self::StructByValue(def) => def.descriptor().clone(),
            Self::Mapped(_) => return None,
        };
        Some(desc)
    }

    /// Whether the native representation is an address
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self,
            Self::Pointer
                | Self::String
                | Self::WString
                | Self::Struct(_)
                | Self::Callback(_)
                | Self::Array
                | Self::Reference
        )
    }

    pub fn name(&self) -> String {
        match self {
            Self::Void => "void".into(),
            Self::Bool => "bool".into(),
            Self::I8 => "i8".into(),
            Self::U8 => "u8".into(),
            Self::I16 => "i16".into(),
            Self::U16 => "u16".into(),
            Self::I32 => "i32".into(),
            Self::U32 => "u32".into(),
            Self::I64 => "i64".into(),
            Self::U64 => "u64".into(),
            Self::NativeLong => "native long".into(),
            Self::NativeULong => "native unsigned long".into(),
            Self::SizeT => "size_t".into(),
            Self::F32 => "f32".into(),
            Self::F64 => "f64".into(),
            Self::Pointer => "pointer".into(),
            Self::String => "string".into(),
            Self::WString => "wide string".into(),
            Self::Struct(def) => format!("struct {}*", def.name()),
            Self::StructByValue(def) => format!("struct {}", def.name()),
            Self::Callback(_) => "callback".into(),
            Self::Array => "array".into(),
            Self::Reference => "reference".into(),
            Self::Mapped(name) => format!("mapped {}", name),
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Declared shape of a native function or callback
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<LogicalType>,
    ret: LogicalType,
    convention: ConventionTag,
    fixed_params: Option<usize>,
}

impl Signature {
    pub fn new(params: Vec<LogicalType>, ret: LogicalType) -> Self {
        Self {
            params,
            ret,
            convention: ConventionTag::C,
            fixed_params: None,
        }
    }

    pub fn with_convention(mut self, convention: ConventionTag) -> Self {
        self.convention = convention;
        self
    }

    /// Mark everything after the first `fixed` parameters as variadic
    pub fn variadic(mut self, fixed: usize) -> Self {
        self.fixed_params = Some(fixed.min(self.params.len()));
        self
    }

    #[inline]
    pub fn params(&self) -> &[LogicalType] {
        &self.params
    }

    #[inline]
    pub fn ret(&self) -> &LogicalType {
        &self.ret
    }

    #[inline]
    pub fn convention(&self) -> ConventionTag {
        self.convention
    }

    #[inline]
    pub fn fixed_params(&self) -> Option<usize> {
        self.fixed_params
    }

    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.fixed_params.is_some()
    }

    /// Whether parameter `index` sits in the variadic tail
    #[inline]
    pub fn is_variadic_param(&self, index: usize) -> bool {
        self.fixed_params.map_or(false, |fixed| index >= fixed)
    }
}
