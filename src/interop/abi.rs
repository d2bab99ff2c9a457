//! Calling conventions
//!
//! Design:
//! - One `CallingConvention` implementation per (architecture, OS, convention)
//! - The CIF builder only talks to the trait; no architecture conditionals
//!   leak out of this file
//! - Layout is computed for every known target, but only the host's
//!   conventions hand out a libffi ABI and can actually be called

use std::fmt;

use libffi::raw::ffi_abi;
use serde::{Deserialize, Serialize};

use super::types::{align_up, TypeDescriptor, TypeTag};
use crate::error::{BridgeError, Result};

/// Convention requested by a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConventionTag {
    /// Platform default C convention
    #[default]
    C,
    /// Callee-cleanup convention of 32-bit Windows
    Stdcall,
}

impl fmt::Display for ConventionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConventionTag::C => f.write_str("c"),
            ConventionTag::Stdcall => f.write_str("stdcall"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Aarch64,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    /// Linux and the BSDs
    Unix,
    MacOs,
    Windows,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub arch: Arch,
    pub os: Os,
}

impl Target {
    pub const fn new(arch: Arch, os: Os) -> Self {
        Self { arch, os }
    }

    /// Target this crate was compiled for
    pub const fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        let arch = Arch::X86_64;
        #[cfg(target_arch = "x86")]
        let arch = Arch::X86;
        #[cfg(target_arch = "aarch64")]
        let arch = Arch::Aarch64;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        let arch = Arch::Other;

        #[cfg(windows)]
        let os = Os::Windows;
        #[cfg(target_os = "macos")]
        let os = Os::MacOs;
        #[cfg(all(unix, not(target_os = "macos")))]
        let os = Os::Unix;
        #[cfg(not(any(windows, unix)))]
        let os = Os::Other;

        Self { arch, os }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?}", self.arch, self.os)
    }
}

/// How a return value comes back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnClass {
    Void,
    /// One general-purpose or scalar float register
    Register,
    /// Two general-purpose registers
    RegisterPair,
    /// Aggregate split across `n` floating-point registers
    FloatRegisters(u8),
    /// Caller-supplied buffer whose address is passed as a hidden argument
    Indirect,
}

/// How an argument is passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Integer,
    Float,
    /// Aggregate spread over registers
    Split { int: usize, float: usize },
    /// Aggregate copied onto the stack
    Memory,
    /// Aggregate copied by the caller and passed by address
    Reference,
}

/// Widening applied to sub-word values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    None,
    Sign,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Registers { int: usize, float: usize },
    Stack { offset: usize },
}

/// Derived layout of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    /// Storage size rounded up to the word size
    pub size: usize,
    pub extension: Extension,
    pub placement: Placement,
    pub by_reference: bool,
}

/// Derived layout of a whole call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLayout {
    pub slots: Vec<ArgSlot>,
    pub stack_bytes: usize,
    pub ret: ReturnClass,
    pub hidden_return_pointer: bool,
}

pub trait CallingConvention: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn tag(&self) -> ConventionTag;

    fn target(&self) -> Target;

    fn word_size(&self) -> usize;

    fn int_registers(&self) -> usize;

    fn float_registers(&self) -> usize;

    /// Integer and float arguments draw from one positional register pool
    fn shares_register_slots(&self) -> bool {
        false
    }

    /// Stack space the caller reserves below register arguments
    fn shadow_space(&self) -> usize {
        0
    }

    fn stack_alignment(&self) -> usize {
        16
    }

    /// Whether an indirect return address occupies the first argument register
    fn hidden_return_uses_arg_register(&self) -> bool {
        true
    }

    fn callee_pops_stack(&self) -> bool {
        false
    }

    fn classify_return(&self, ty: &TypeDescriptor) -> ReturnClass;

    fn classify_arg(&self, ty: &TypeDescriptor) -> ArgClass;

    /// libffi ABI for this convention, if it can be called on this host
    fn ffi_abi(&self) -> Option<ffi_abi> {
        if self.target() == Target::host() {
            host_abi(self.tag())
        } else {
            None
        }
    }
}

fn host_abi(tag: ConventionTag) -> Option<ffi_abi> {
    match tag {
        ConventionTag::C => Some(libffi::raw::ffi_abi_FFI_DEFAULT_ABI),
        #[cfg(all(target_arch = "x86", windows))]
        ConventionTag::Stdcall => Some(libffi::raw::ffi_abi_FFI_STDCALL),
        #[cfg(not(all(target_arch = "x86", windows)))]
        ConventionTag::Stdcall => None,
    }
}

fn scalar_class(ty: &TypeDescriptor) -> ArgClass {
    if ty.tag().is_float() {
        ArgClass::Float
    } else {
        ArgClass::Integer
    }
}

fn scalar_return(ty: &TypeDescriptor, word: usize) -> ReturnClass {
    match ty.tag() {
        TypeTag::Void => ReturnClass::Void,
        _ if ty.size() > word && !ty.tag().is_float() => ReturnClass::RegisterPair,
        _ => ReturnClass::Register,
    }
}

// ===== System V AMD64 =====

#[derive(Debug)]
pub struct SysVAmd64 {
    os: Os,
}

impl SysVAmd64 {
    /// Eightbyte classes of a small aggregate as (integer, sse) counts,
    /// `None` when it goes to memory
    fn eightbytes(ty: &TypeDescriptor) -> Option<(usize, usize)> {
        if ty.size() > 16 {
            return None;
        }
        let words = align_up(ty.size(), 8) / 8;
        let mut integer = [false; 2];
        for (offset, tag) in ty.flatten() {
            if offset % tag.align() != 0 {
                return None;
            }
            if !tag.is_float() {
                integer[offset / 8] = true;
            }
        }
        let int = integer[..words].iter().filter(|&&i| i).count();
        Some((int, words - int))
    }
}

impl CallingConvention for SysVAmd64 {
    fn name(&self) -> &'static str {
        "sysv-amd64"
    }

    fn tag(&self) -> ConventionTag {
        ConventionTag::C
    }

    fn target(&self) -> Target {
        Target::new(Arch::X86_64, self.os)
    }

    fn word_size(&self) -> usize {
        8
    }

    fn int_registers(&self) -> usize {
        6 // RDI, RSI, RDX, RCX, R8, R9
    }

    fn float_registers(&self) -> usize {
        8 // XMM0-XMM7
    }

    fn classify_return(&self, ty: &TypeDescriptor) -> ReturnClass {
        if !ty.is_aggregate() {
            return scalar_return(ty, 8);
        }
        match Self::eightbytes(ty) {
            None => ReturnClass::Indirect,
            Some((0, sse)) => ReturnClass::FloatRegisters(sse as u8),
            Some((1, 0)) => ReturnClass::Register,
            Some(_) => ReturnClass::RegisterPair,
        }
    }

    fn classify_arg(&self, ty: &TypeDescriptor) -> ArgClass {
        if !ty.is_aggregate() {
            return scalar_class(ty);
        }
        match Self::eightbytes(ty) {
            None => ArgClass::Memory,
            Some((int, float)) => ArgClass::Split { int, float },
        }
    }
}

// ===== Microsoft x64 =====

#[derive(Debug)]
pub struct Win64;

impl Win64 {
    fn fits_register(ty: &TypeDescriptor) -> bool {
        matches!(ty.size(), 1 | 2 | 4 | 8)
    }
}

impl CallingConvention for Win64 {
    fn name(&self) -> &'static str {
        "win64"
    }

    fn tag(&self) -> ConventionTag {
        ConventionTag::C
    }

    fn target(&self) -> Target {
        Target::new(Arch::X86_64, Os::Windows)
    }

    fn word_size(&self) -> usize {
        8
    }

    fn int_registers(&self) -> usize {
        4 // RCX, RDX, R8, R9
    }

    fn float_registers(&self) -> usize {
        4 // XMM0-XMM3
    }

    fn shares_register_slots(&self) -> bool {
        true
    }

    fn shadow_space(&self) -> usize {
        32
    }

    fn classify_return(&self, ty: &TypeDescriptor) -> ReturnClass {
        if !ty.is_aggregate() {
            return scalar_return(ty, 8);
        }
        if Self::fits_register(ty) {
            ReturnClass::Register
        } else {
            ReturnClass::Indirect
        }
    }

    fn classify_arg(&self, ty: &TypeDescriptor) -> ArgClass {
        if !ty.is_aggregate() {
            return scalar_class(ty);
        }
        if Self::fits_register(ty) {
            ArgClass::Integer
        } else {
            ArgClass::Reference
        }
    }
}

// ===== AArch64 (AAPCS64) =====

#[derive(Debug)]
pub struct Aapcs64 {
    os: Os,
}

impl Aapcs64 {
    /// Member count of a homogeneous floating-point aggregate
    fn hfa_members(ty: &TypeDescriptor) -> Option<usize> {
        let leaves = ty.flatten();
        let first = leaves.first()?.1;
        if !first.is_float() || leaves.len() > 4 {
            return None;
        }
        if leaves.iter().all(|(_, tag)| *tag == first) {
            Some(leaves.len())
        } else {
            None
        }
    }
}

impl CallingConvention for Aapcs64 {
    fn name(&self) -> &'static str {
        "aapcs64"
    }

    fn tag(&self) -> ConventionTag {
        ConventionTag::C
    }

    fn target(&self) -> Target {
        Target::new(Arch::Aarch64, self.os)
    }

    fn word_size(&self) -> usize {
        8
    }

    fn int_registers(&self) -> usize {
        8 // X0-X7
    }

    fn float_registers(&self) -> usize {
        8 // V0-V7
    }

    // Indirect results travel in X8
    fn hidden_return_uses_arg_register(&self) -> bool {
        false
    }

    fn classify_return(&self, ty: &TypeDescriptor) -> ReturnClass {
        if !ty.is_aggregate() {
            return scalar_return(ty, 8);
        }
        if let Some(n) = Self::hfa_members(ty) {
            return ReturnClass::FloatRegisters(n as u8);
        }
        match ty.size() {
            0..=8 => ReturnClass::Register,
            9..=16 => ReturnClass::RegisterPair,
            _ => ReturnClass::Indirect,
        }
    }

    fn classify_arg(&self, ty: &TypeDescriptor) -> ArgClass {
        if !ty.is_aggregate() {
            return scalar_class(ty);
        }
        if let Some(n) = Self::hfa_members(ty) {
            return ArgClass::Split { int: 0, float: n };
        }
        if ty.size() <= 16 {
            ArgClass::Split {
                int: align_up(ty.size(), 8) / 8,
                float: 0,
            }
        } else {
            ArgClass::Reference
        }
    }
}

// ===== i386 =====

#[derive(Debug)]
pub struct I386Cdecl {
    os: Os,
}

impl I386Cdecl {
    /// Windows and macOS return small aggregates in EAX/EDX
    fn small_aggregates_in_registers(os: Os) -> bool {
        matches!(os, Os::Windows | Os::MacOs)
    }
}

fn i386_return(os: Os, ty: &TypeDescriptor) -> ReturnClass {
    if !ty.is_aggregate() {
        return scalar_return(ty, 4);
    }
    if !I386Cdecl::small_aggregates_in_registers(os) {
        return ReturnClass::Indirect;
    }
    match ty.size() {
        1 | 2 | 4 => ReturnClass::Register,
        8 => ReturnClass::RegisterPair,
        _ => ReturnClass::Indirect,
    }
}

fn i386_arg(ty: &TypeDescriptor) -> ArgClass {
    if ty.is_aggregate() {
        ArgClass::Memory
    } else {
        scalar_class(ty)
    }
}

impl CallingConvention for I386Cdecl {
    fn name(&self) -> &'static str {
        "i386-cdecl"
    }

    fn tag(&self) -> ConventionTag {
        ConventionTag::C
    }

    fn target(&self) -> Target {
        Target::new(Arch::X86, self.os)
    }

    fn word_size(&self) -> usize {
        4
    }

    fn int_registers(&self) -> usize {
        0
    }

    fn float_registers(&self) -> usize {
        0
    }

    fn stack_alignment(&self) -> usize {
        if self.os == Os::Windows {
            4
        } else {
            16
        }
    }

    // Everything is on the stack, including the hidden result address
    fn hidden_return_uses_arg_register(&self) -> bool {
        false
    }

    fn classify_return(&self, ty: &TypeDescriptor) -> ReturnClass {
        i386_return(self.os, ty)
    }

    fn classify_arg(&self, ty: &TypeDescriptor) -> ArgClass {
        i386_arg(ty)
    }
}

#[derive(Debug)]
pub struct I386Stdcall;

impl CallingConvention for I386Stdcall {
    fn name(&self) -> &'static str {
        "i386-stdcall"
    }

    fn tag(&self) -> ConventionTag {
        ConventionTag::Stdcall
    }

    fn target(&self) -> Target {
        Target::new(Arch::X86, Os::Windows)
    }

    fn word_size(&self) -> usize {
        4
    }

    fn int_registers(&self) -> usize {
        0
    }

    fn float_registers(&self) -> usize {
        0
    }

    fn stack_alignment(&self) -> usize {
        4
    }

    fn hidden_return_uses_arg_register(&self) -> bool {
        false
    }

    fn callee_pops_stack(&self) -> bool {
        true
    }

    fn classify_return(&self, ty: &TypeDescriptor) -> ReturnClass {
        i386_return(Os::Windows, ty)
    }

    fn classify_arg(&self, ty: &TypeDescriptor) -> ArgClass {
        i386_arg(ty)
    }
}

static SYSV_UNIX: SysVAmd64 = SysVAmd64 { os: Os::Unix };
static SYSV_MACOS: SysVAmd64 = SysVAmd64 { os: Os::MacOs };
static WIN64: Win64 = Win64;
static AAPCS64_UNIX: Aapcs64 = Aapcs64 { os: Os::Unix };
static AAPCS64_MACOS: Aapcs64 = Aapcs64 { os: Os::MacOs };
static AAPCS64_WINDOWS: Aapcs64 = Aapcs64 { os: Os::Windows };
static I386_UNIX: I386Cdecl = I386Cdecl { os: Os::Unix };
static I386_MACOS: I386Cdecl = I386Cdecl { os: Os::MacOs };
static I386_WINDOWS: I386Cdecl = I386Cdecl { os: Os::Windows };
static I386_STDCALL: I386Stdcall = I386Stdcall;

/// Convention implementation for any known target
pub fn for_target(target: Target, tag: ConventionTag) -> Result<&'static dyn CallingConvention> {
    let convention: Option<&'static dyn CallingConvention> = match (target.arch, target.os, tag) {
        (Arch::X86_64, Os::Unix, ConventionTag::C) => Some(&SYSV_UNIX),
        (Arch::X86_64, Os::MacOs, ConventionTag::C) => Some(&SYSV_MACOS),
        (Arch::X86_64, Os::Windows, ConventionTag::C) => Some(&WIN64),
        (Arch::Aarch64, Os::Unix, ConventionTag::C) => Some(&AAPCS64_UNIX),
        (Arch::Aarch64, Os::MacOs, ConventionTag::C) => Some(&AAPCS64_MACOS),
        (Arch::Aarch64, Os::Windows, ConventionTag::C) => Some(&AAPCS64_WINDOWS),
        (Arch::X86, Os::Unix, ConventionTag::C) => Some(&I386_UNIX),
        (Arch::X86, Os::MacOs, ConventionTag::C) => Some(&I386_MACOS),
        (Arch::X86, Os::Windows, ConventionTag::C) => Some(&I386_WINDOWS),
        (Arch::X86, Os::Windows, ConventionTag::Stdcall) => Some(&I386_STDCALL),
        _ => None,
    };
    convention.ok_or_else(|| BridgeError::BadCallingConvention {
        convention: tag,
        target: target.to_string(),
    })
}

/// Convention implementation for the host, failing if it cannot be called
pub fn resolve(tag: ConventionTag) -> Result<&'static dyn CallingConvention> {
    let convention = for_target(Target::host(), tag)?;
    if convention.ffi_abi().is_none() {
        return Err(BridgeError::BadCallingConvention {
            convention: tag,
            target: Target::host().to_string(),
        });
    }
    Ok(convention)
}

/// Register bookkeeping while laying out one call
pub struct RegisterAllocator<'a> {
    convention: &'a dyn CallingConvention,
    int_regs_used: usize,
    fp_regs_used: usize,
}

impl<'a> RegisterAllocator<'a> {
    #[inline]
    pub fn new(convention: &'a dyn CallingConvention) -> Self {
        Self {
            convention,
            int_regs_used: 0,
            fp_regs_used: 0,
        }
    }

    /// Claim `int` general-purpose and `float` vector registers, all or nothing
    pub fn claim(&mut self, int: usize, float: usize) -> bool {
        let conv = self.convention;
        if conv.shares_register_slots() {
            // Every argument takes one positional slot whatever its class
            let position = self.int_regs_used + self.fp_regs_used;
            if position < conv.int_registers() {
                if float > 0 {
                    self.fp_regs_used += 1;
                } else {
                    self.int_regs_used += 1;
                }
                return true;
            }
            return false;
        }

        if self.int_regs_used + int <= conv.int_registers()
            && self.fp_regs_used + float <= conv.float_registers()
        {
            self.int_regs_used += int;
            self.fp_regs_used += float;
            true
        } else {
            false
        }
    }

    /// Reset for a new call
    #[inline]
    pub fn reset(&mut self) {
        self.int_regs_used = 0;
        self.fp_regs_used = 0;
    }
}

/// Lay out a call for `convention`
pub fn compute_layout(
    convention: &dyn CallingConvention,
    args: &[TypeDescriptor],
    ret: &TypeDescriptor,
) -> CallLayout {
    let word = convention.word_size();
    let mut registers = RegisterAllocator::new(convention);
    let mut stack = convention.shadow_space();

    let ret_class = convention.classify_return(ret);
    let hidden_return_pointer = ret_class == ReturnClass::Indirect;
    if hidden_return_pointer {
        if convention.hidden_return_uses_arg_register() {
            if !registers.claim(1, 0) {
                stack += word;
            }
        } else if convention.int_registers() == 0 {
            stack += word;
        }
    }

    let mut slots = Vec::with_capacity(args.len());
    for ty in args {
        let class = convention.classify_arg(ty);
        let (int, float, by_reference) = match class {
            ArgClass::Integer => (1, 0, false),
            ArgClass::Float => (0, 1, false),
            ArgClass::Split { int, float } => (int, float, false),
            ArgClass::Reference => (1, 0, true),
            ArgClass::Memory => (usize::MAX, usize::MAX, false),
        };

        let size = if by_reference {
            word
        } else {
            align_up(ty.size().max(1), word)
        };

        let in_registers = class != ArgClass::Memory && registers.claim(int, float);
        let placement = if in_registers {
            Placement::Registers { int, float }
        } else {
            let offset = stack;
            stack += size;
            Placement::Stack { offset }
        };

        let extension = if ty.size() >= word || !ty.tag().is_integral() {
            Extension::None
        } else if ty.tag().is_signed() {
            Extension::Sign
        } else {
            Extension::Zero
        };

        slots.push(ArgSlot {
            size,
            extension,
            placement,
            by_reference,
        });
    }

    CallLayout {
        slots,
        stack_bytes: align_up(stack, convention.stack_alignment()),
        ret: ret_class,
        hidden_return_pointer,
    }
}
