use super::*;

use std::mem::{align_of, size_of, MaybeUninit};
use std::os::raw::c_char;
use std::sync::Arc;

use proptest::prelude::*;

use super::abi::{compute_layout, for_target, ArgClass, Arch, Os, Placement, ReturnClass};
use crate::callback::{CallbackRegistry, ExecutableArena, ManagedCallback};
use crate::error::{BridgeError, CallFailure, Position};
use crate::refs::{target_fn, ManagedRuntime, MethodId, ThreadLocalRuntime};

fn dispatcher() -> Dispatcher {
    let cifs = Arc::new(CifCache::new(64));
    let mapper = Arc::new(TypeMapper::new());
    let runtime: Arc<dyn ManagedRuntime> = Arc::new(ThreadLocalRuntime::new());
    let callbacks = CallbackRegistry::new(
        Arc::new(ExecutableArena::new()),
        cifs.clone(),
        mapper.clone(),
        runtime.clone(),
        MethodId::default(),
    );
    Dispatcher::new(cifs, mapper, callbacks, runtime, 32)
}

fn native(address: *const ()) -> Function {
    // SAFETY: every test function is called with its declared signature
    unsafe { Function::new(Pointer::from_raw(address), ConventionTag::C) }
}

macro_rules! offset_of {
    ($t:ty, $field:ident) => {{
        let uninit = MaybeUninit::<$t>::uninit();
        let base = uninit.as_ptr();
        // SAFETY: only the field address is taken, nothing is read
        unsafe { std::ptr::addr_of!((*base).$field) as usize - base as usize }
    }};
}

// ===== Native test functions =====

extern "C" fn echo_i8(x: i8) -> i8 { x }
extern "C" fn echo_u8(x: u8) -> u8 { x }
extern "C" fn echo_i16(x: i16) -> i16 { x }
extern "C" fn echo_u16(x: u16) -> u16 { x }
extern "C" fn echo_i32(x: i32) -> i32 { x }
extern "C" fn echo_u32(x: u32) -> u32 { x }
extern "C" fn echo_i64(x: i64) -> i64 { x }
extern "C" fn echo_u64(x: u64) -> u64 { x }
extern "C" fn echo_f32(x: f32) -> f32 { x }
extern "C" fn echo_f64(x: f64) -> f64 { x }
extern "C" fn negate(x: bool) -> bool { !x }

extern "C" fn mix(a: i8, b: f32, c: i64, d: f64, e: u16) -> f64 {
    a as f64 + b as f64 + c as f64 + d + e as f64
}

extern "C" fn double_it(x: i32) -> i32 {
    x * 2
}

extern "C" fn apply(f: Option<extern "C" fn(i32) -> i32>, x: i32) -> i32 {
    f.map_or(-1, |f| f(x))
}

extern "C" fn identity(f: usize) -> usize {
    f
}

extern "C" fn c_strlen(s: *const c_char) -> usize {
    if s.is_null() {
        return usize::MAX;
    }
    // SAFETY: the bridge passes NUL-terminated strings
    unsafe { std::ffi::CStr::from_ptr(s) }.to_bytes().len()
}

extern "C" fn greeting() -> *const c_char {
    b"hello from native\0".as_ptr() as *const c_char
}

extern "C" fn sum_i32(data: *const i32, len: usize) -> i64 {
    // SAFETY: `data` points at `len` pinned elements
    unsafe { std::slice::from_raw_parts(data, len) }.iter().map(|&v| v as i64).sum()
}

extern "C" fn fill(data: *mut f64, len: usize, value: f64) {
    // SAFETY: `data` points at `len` pinned elements
    for slot in unsafe { std::slice::from_raw_parts_mut(data, len) } {
        *slot = value;
    }
}

extern "C" fn increment(cell: *mut i32) {
    // SAFETY: the bridge passes a scratch cell for the reference
    unsafe { *cell += 1 };
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Inner {
    a: u8,
    b: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Outer {
    flag: bool,
    inner: Inner,
    tail: u16,
    count: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: i32,
    y: f64,
}

extern "C" fn point_sum(p: Point) -> f64 {
    p.x as f64 + p.y
}

extern "C" fn make_point(x: i32, y: f64) -> Point {
    Point { x, y }
}

extern "C" fn scale_point(p: *mut Point, k: i32) {
    // SAFETY: the bridge passes the structure's own memory
    unsafe {
        (*p).x *= k;
        (*p).y *= k as f64;
    }
}

extern "C" fn outer_count(o: *const Outer) -> i32 {
    // SAFETY: the bridge passes the structure's own memory
    unsafe { (*o).count + (*o).inner.a as i32 }
}

extern "C" fn poke_then_call(data: *mut i32, len: usize, f: Option<extern "C" fn() -> i64>) -> i64 {
    if len > 0 {
        // SAFETY: `data` points at `len` pinned elements
        unsafe { *data = 99 };
    }
    f.map_or(-1, |f| f())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Mixed {
    tiny: i8,
    short: i16,
    int: i32,
    long: i64,
    single: f32,
    double: f64,
    byte: u8,
    last: i32,
}

extern "C" fn mixed_total(m: Mixed) -> f64 {
    m.tiny as f64
        + m.short as f64
        + m.int as f64
        + m.long as f64
        + m.single as f64
        + m.double
        + m.byte as f64
        + m.last as f64
}

extern "C" fn mixed_shift(mut m: Mixed, by: i32) -> Mixed {
    m.tiny += by as i8;
    m.short += by as i16;
    m.int += by;
    m.long += by as i64;
    m.single += by as f32;
    m.double += by as f64;
    m.byte += by as u8;
    m.last += by;
    m
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
union Bits {
    word: u32,
    float: f32,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
union Wide {
    int: i64,
    double: f64,
}

#[allow(dead_code)]
#[repr(C)]
union AnyInt {
    a: i8,
    b: i16,
    c: i32,
    d: i64,
    p: *const u8,
}

extern "C" fn bits_word(b: Bits) -> u32 {
    // SAFETY: every bit pattern is a valid u32
    unsafe { b.word }
}

extern "C" fn bits_from_word(word: u32) -> Bits {
    Bits { word }
}

extern "C" fn wide_halve(w: Wide) -> Wide {
    // SAFETY: the caller stores a double
    Wide { double: unsafe { w.double } / 2.0 }
}

fn mixed_def() -> Arc<StructDef> {
    StructDef::new(
        "Mixed",
        [
            ("tiny", LogicalType::I8),
            ("short", LogicalType::I16),
            ("int", LogicalType::I32),
            ("long", LogicalType::I64),
            ("single", LogicalType::F32),
            ("double", LogicalType::F64),
            ("byte", LogicalType::U8),
            ("last", LogicalType::I32),
        ],
    )
    .unwrap()
}

fn bits_def() -> Arc<StructDef> {
    StructDef::union("Bits", [("word", LogicalType::U32), ("float", LogicalType::F32)]).unwrap()
}

fn inner_def() -> Arc<StructDef> {
    StructDef::new("Inner", [("a", LogicalType::U8), ("b", LogicalType::F64)]).unwrap()
}

fn outer_def() -> Arc<StructDef> {
    StructDef::new(
        "Outer",
        [
            ("flag", LogicalType::Bool),
            ("inner", LogicalType::StructByValue(inner_def())),
            ("tail", LogicalType::U16),
            ("count", LogicalType::I32),
        ],
    )
    .unwrap()
}

fn point_def() -> Arc<StructDef> {
    StructDef::new("Point", [("x", LogicalType::I32), ("y", LogicalType::F64)]).unwrap()
}

// ===== Type mapping =====

#[test]
fn test_primitive_descriptors_match_host() {
    let mapper = TypeMapper::new();
    let cases = [
        (LogicalType::I8, size_of::<i8>(), align_of::<i8>()),
        (LogicalType::U16, size_of::<u16>(), align_of::<u16>()),
        (LogicalType::I32, size_of::<i32>(), align_of::<i32>()),
        (LogicalType::U64, size_of::<u64>(), align_of::<u64>()),
        (LogicalType::F32, size_of::<f32>(), align_of::<f32>()),
        (LogicalType::F64, size_of::<f64>(), align_of::<f64>()),
        (LogicalType::Bool, size_of::<bool>(), align_of::<bool>()),
        (LogicalType::Pointer, size_of::<usize>(), align_of::<usize>()),
        (LogicalType::String, size_of::<usize>(), align_of::<usize>()),
        (LogicalType::SizeT, size_of::<usize>(), align_of::<usize>()),
        (LogicalType::NativeLong, size_of::<std::os::raw::c_long>(), align_of::<std::os::raw::c_long>()),
    ];
    for (ty, size, align) in cases {
        let desc = mapper.describe(&ty).unwrap();
        assert_eq!((desc.size(), desc.align()), (size, align), "{}", ty);
    }
}

#[test]
fn test_aggregate_layout_matches_repr_c() {
    let def = outer_def();
    assert_eq!(def.size(), size_of::<Outer>());
    assert_eq!(def.align(), align_of::<Outer>());
    assert_eq!(def.field("flag").unwrap().offset(), offset_of!(Outer, flag));
    assert_eq!(def.field("inner").unwrap().offset(), offset_of!(Outer, inner));
    assert_eq!(def.field("tail").unwrap().offset(), offset_of!(Outer, tail));
    assert_eq!(def.field("count").unwrap().offset(), offset_of!(Outer, count));

    let inner = inner_def();
    assert_eq!(inner.size(), size_of::<Inner>());
    assert_eq!(inner.field("b").unwrap().offset(), offset_of!(Inner, b));
}

#[test]
fn test_mixed_width_layout_matches_repr_c() {
    let def = mixed_def();
    assert_eq!(def.size(), size_of::<Mixed>());
    assert_eq!(def.align(), align_of::<Mixed>());
    let expected = [
        ("tiny", offset_of!(Mixed, tiny)),
        ("short", offset_of!(Mixed, short)),
        ("int", offset_of!(Mixed, int)),
        ("long", offset_of!(Mixed, long)),
        ("single", offset_of!(Mixed, single)),
        ("double", offset_of!(Mixed, double)),
        ("byte", offset_of!(Mixed, byte)),
        ("last", offset_of!(Mixed, last)),
    ];
    for (name, offset) in expected {
        assert_eq!(def.field(name).unwrap().offset(), offset, "{}", name);
    }
}

#[test]
fn test_union_layout() {
    let def = StructDef::union(
        "AnyInt",
        [
            ("a", LogicalType::I8),
            ("b", LogicalType::I16),
            ("c", LogicalType::I32),
            ("d", LogicalType::I64),
            ("p", LogicalType::Pointer),
        ],
    )
    .unwrap();
    assert!(def.is_union());
    assert_eq!(def.size(), size_of::<AnyInt>());
    assert_eq!(def.align(), align_of::<AnyInt>());
    for name in ["a", "b", "c", "d", "p"] {
        assert_eq!(def.field(name).unwrap().offset(), 0, "{}", name);
    }

    // Largest member rounded up to the strictest alignment
    let odd = TypeDescriptor::union([
        TypeDescriptor::aggregate([TypeDescriptor::U8, TypeDescriptor::U8, TypeDescriptor::U8]).unwrap(),
        TypeDescriptor::U16,
    ])
    .unwrap();
    assert_eq!((odd.size(), odd.align()), (4, 2));
    assert!(odd.is_union());
    assert!(!point_def().is_union());

    assert!(matches!(TypeDescriptor::union([]), Err(BridgeError::BadTypeLayout { .. })));
    assert!(matches!(
        TypeDescriptor::union([TypeDescriptor::VOID]),
        Err(BridgeError::BadTypeLayout { .. })
    ));
}

#[test]
fn test_union_fields_overlap() {
    let bits = Structure::new(bits_def()).unwrap();
    bits.set("float", Value::F32(1.5)).unwrap();
    assert_eq!(bits.get("word").unwrap(), Value::U32(1.5f32.to_bits()));
    bits.set("word", Value::U32(0x4000_0000)).unwrap();
    assert_eq!(bits.get("float").unwrap(), Value::F32(2.0));
}

#[test]
fn test_aggregate_rejects_empty_and_void() {
    assert!(matches!(TypeDescriptor::aggregate([]), Err(BridgeError::BadTypeLayout { .. })));
    assert!(matches!(
        TypeDescriptor::aggregate([TypeDescriptor::I32, TypeDescriptor::VOID]),
        Err(BridgeError::BadTypeLayout { .. })
    ));
}

#[test]
fn test_aggregate_nesting_limit() {
    let mut desc = TypeDescriptor::I32;
    let mut result = Ok(());
    for _ in 0..=MAX_NESTING {
        match TypeDescriptor::aggregate([desc.clone()]) {
            Ok(next) => desc = next,
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    assert!(matches!(result, Err(BridgeError::BadTypeLayout { .. })));
}

#[test]
fn test_void_only_valid_as_return() {
    let mapper = TypeMapper::new();
    assert!(mapper.describe_at(&LogicalType::Void, Position::Return).unwrap().is_void());
    assert_eq!(
        mapper.describe_at(&LogicalType::Void, Position::Parameter(2)),
        Err(BridgeError::UnsupportedType {
            position: Position::Parameter(2),
            type_name: "void".to_string(),
        })
    );
}

#[test]
fn test_unknown_mapped_type() {
    let mapper = TypeMapper::new();
    let err = mapper.describe(&LogicalType::Mapped(Arc::from("celsius"))).unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedType { .. }));
}

struct Flag;

impl TypeConverter for Flag {
    fn native_type(&self) -> LogicalType {
        LogicalType::I32
    }

    fn to_native(&self, value: Value) -> std::result::Result<Value, CallFailure> {
        value
            .as_bool()
            .map(|b| Value::I32(b as i32))
            .ok_or_else(|| CallFailure::new("flag must be a bool"))
    }

    fn from_native(&self, value: Value) -> std::result::Result<Value, CallFailure> {
        Ok(Value::Bool(value.as_i64().unwrap_or(0) != 0))
    }
}

#[test]
fn test_mapped_types_in_forward_calls() {
    let dispatcher = dispatcher();
    dispatcher.type_mapper().register("flag", Arc::new(Flag)).unwrap();
    let flag = LogicalType::Mapped(Arc::from("flag"));
    let signature = Signature::new(vec![flag.clone()], flag);
    let echo = native(echo_i32 as *const ());

    let result = unsafe { dispatcher.invoke_signature(&echo, &signature, &[Value::Bool(true)]) }.unwrap();
    assert_eq!(result, Value::Bool(true));

    let err = unsafe { dispatcher.invoke_signature(&echo, &signature, &[Value::I32(1)]) }.unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { index: 0, .. }));
}

// ===== Calling conventions =====

#[test]
fn test_sysv_classification() {
    let sysv = for_target(Target::new(Arch::X86_64, Os::Unix), ConventionTag::C).unwrap();
    let two_longs = TypeDescriptor::aggregate([TypeDescriptor::I64, TypeDescriptor::I64]).unwrap();
    let two_doubles = TypeDescriptor::aggregate([TypeDescriptor::F64, TypeDescriptor::F64]).unwrap();
    let mixed = TypeDescriptor::aggregate([TypeDescriptor::I32, TypeDescriptor::F32]).unwrap();
    let large = TypeDescriptor::aggregate([TypeDescriptor::I64; 3]).unwrap();

    assert_eq!(sysv.classify_arg(&two_longs), ArgClass::Split { int: 2, float: 0 });
    assert_eq!(sysv.classify_arg(&two_doubles), ArgClass::Split { int: 0, float: 2 });
    assert_eq!(sysv.classify_arg(&mixed), ArgClass::Split { int: 1, float: 0 });
    assert_eq!(sysv.classify_arg(&large), ArgClass::Memory);
    assert_eq!(sysv.classify_return(&two_doubles), ReturnClass::FloatRegisters(2));
    assert_eq!(sysv.classify_return(&large), ReturnClass::Indirect);
    assert_eq!(sysv.classify_return(&TypeDescriptor::VOID), ReturnClass::Void);
}

#[test]
fn test_sysv_register_exhaustion() {
    let sysv = for_target(Target::new(Arch::X86_64, Os::Unix), ConventionTag::C).unwrap();
    let args = vec![TypeDescriptor::I64; 7];
    let layout = compute_layout(sysv, &args, &TypeDescriptor::I64);
    assert!(matches!(layout.slots[5].placement, Placement::Registers { int: 1, float: 0 }));
    assert_eq!(layout.slots[6].placement, Placement::Stack { offset: 0 });
    assert_eq!(layout.stack_bytes, 16);
}

#[test]
fn test_win64_shares_register_slots() {
    let win64 = for_target(Target::new(Arch::X86_64, Os::Windows), ConventionTag::C).unwrap();
    let args = [
        TypeDescriptor::F64,
        TypeDescriptor::I64,
        TypeDescriptor::F64,
        TypeDescriptor::I64,
        TypeDescriptor::I64,
    ];
    let layout = compute_layout(win64, &args, &TypeDescriptor::VOID);
    assert_eq!(layout.slots[4].placement, Placement::Stack { offset: 32 });

    let sixteen = TypeDescriptor::aggregate([TypeDescriptor::I64, TypeDescriptor::I64]).unwrap();
    let eight = TypeDescriptor::aggregate([TypeDescriptor::I32, TypeDescriptor::I32]).unwrap();
    assert_eq!(win64.classify_arg(&sixteen), ArgClass::Reference);
    assert_eq!(win64.classify_arg(&eight), ArgClass::Integer);
    assert_eq!(win64.classify_return(&sixteen), ReturnClass::Indirect);
}

#[test]
fn test_aapcs64_homogeneous_float_aggregates() {
    let aapcs = for_target(Target::new(Arch::Aarch64, Os::Unix), ConventionTag::C).unwrap();
    let hfa = TypeDescriptor::aggregate([TypeDescriptor::F32; 3]).unwrap();
    assert_eq!(aapcs.classify_arg(&hfa), ArgClass::Split { int: 0, float: 3 });
    assert_eq!(aapcs.classify_return(&hfa), ReturnClass::FloatRegisters(3));

    let large = TypeDescriptor::aggregate([TypeDescriptor::I64; 3]).unwrap();
    let layout = compute_layout(aapcs, &[], &large);
    assert!(layout.hidden_return_pointer);
    assert_eq!(layout.stack_bytes, 0);
}

#[test]
fn test_stdcall_only_on_x86_windows() {
    assert!(for_target(Target::new(Arch::X86, Os::Windows), ConventionTag::Stdcall).is_ok());
    assert!(matches!(
        for_target(Target::new(Arch::X86_64, Os::Unix), ConventionTag::Stdcall),
        Err(BridgeError::BadCallingConvention { .. })
    ));
    if !cfg!(all(target_arch = "x86", windows)) {
        let err = CallInterface::prepare(&[TypeDescriptor::I32], &TypeDescriptor::I32, ConventionTag::Stdcall)
            .unwrap_err();
        assert!(matches!(err, BridgeError::BadCallingConvention { .. }));
    }
}

#[test]
fn test_register_allocator_is_all_or_nothing() {
    let sysv = for_target(Target::new(Arch::X86_64, Os::Unix), ConventionTag::C).unwrap();
    let mut registers = RegisterAllocator::new(sysv);
    assert!(registers.claim(5, 0));
    assert!(!registers.claim(2, 0));
    assert!(registers.claim(1, 0));
    assert!(!registers.claim(1, 0));
    registers.reset();
    assert!(registers.claim(6, 8));
}

// ===== Call interfaces =====

#[test]
fn test_cif_cache_reuses_interfaces() {
    let cache = CifCache::new(16);
    let args = [TypeDescriptor::I32, TypeDescriptor::F64];
    let first = cache.prepare(&args, &TypeDescriptor::I64, ConventionTag::C).unwrap();
    let second = cache.prepare(&args, &TypeDescriptor::I64, ConventionTag::C).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let other = cache.prepare(&args, &TypeDescriptor::I32, ConventionTag::C).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));

    let stats = cache.stats();
    assert_eq!((stats.entries, stats.hits, stats.misses), (2, 1, 2));
}

#[test]
fn test_cif_cache_capacity() {
    let cache = CifCache::new(1);
    cache.prepare(&[TypeDescriptor::I32], &TypeDescriptor::VOID, ConventionTag::C).unwrap();
    cache.prepare(&[TypeDescriptor::I64], &TypeDescriptor::VOID, ConventionTag::C).unwrap();
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn test_variadic_interface_is_promoted() {
    let cif = CallInterface::prepare_variadic(
        &[TypeDescriptor::POINTER],
        &[TypeDescriptor::F32, TypeDescriptor::I8, TypeDescriptor::I64],
        &TypeDescriptor::I32,
        ConventionTag::C,
    )
    .unwrap();
    assert_eq!(cif.fixed_args(), Some(1));
    assert_eq!(
        cif.arg_types(),
        &[TypeDescriptor::POINTER, TypeDescriptor::F64, TypeDescriptor::I32, TypeDescriptor::I64]
    );
}

#[test]
fn test_void_parameter_rejected() {
    let err = CallInterface::prepare(&[TypeDescriptor::I32, TypeDescriptor::VOID], &TypeDescriptor::VOID, ConventionTag::C)
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::UnsupportedType {
            position: Position::Parameter(1),
            type_name: "void".to_string(),
        }
    );
}

// ===== Forward dispatch =====

#[test]
fn test_boundary_values_round_trip() {
    let dispatcher = dispatcher();
    let cases: Vec<(*const (), LogicalType, Vec<Value>)> = vec![
        (echo_i8 as *const (), LogicalType::I8, vec![Value::I8(i8::MIN), Value::I8(-1), Value::I8(i8::MAX)]),
        (echo_u8 as *const (), LogicalType::U8, vec![Value::U8(0), Value::U8(u8::MAX)]),
        (echo_i16 as *const (), LogicalType::I16, vec![Value::I16(i16::MIN), Value::I16(i16::MAX)]),
        (echo_u16 as *const (), LogicalType::U16, vec![Value::U16(u16::MAX)]),
        (echo_i32 as *const (), LogicalType::I32, vec![Value::I32(i32::MIN), Value::I32(0), Value::I32(i32::MAX)]),
        (echo_u32 as *const (), LogicalType::U32, vec![Value::U32(u32::MAX)]),
        (echo_i64 as *const (), LogicalType::I64, vec![Value::I64(i64::MIN), Value::I64(i64::MAX)]),
        (echo_u64 as *const (), LogicalType::U64, vec![Value::U64(u64::MAX)]),
        (echo_f32 as *const (), LogicalType::F32, vec![Value::F32(f32::MIN_POSITIVE), Value::F32(-0.0), Value::F32(f32::INFINITY)]),
        (echo_f64 as *const (), LogicalType::F64, vec![Value::F64(f64::MAX), Value::F64(f64::NEG_INFINITY)]),
        (negate as *const (), LogicalType::Bool, vec![]),
    ];

    for (address, ret, values) in cases {
        let function = native(address);
        for value in values {
            let result = unsafe { dispatcher.invoke(&function, &ret, &[value.clone()]) }.unwrap();
            assert_eq!(result, value, "{}", ret);
        }
    }

    let negate = native(negate as *const ());
    let result = unsafe { dispatcher.invoke(&negate, &LogicalType::Bool, &[Value::Bool(false)]) }.unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_nan_round_trips() {
    let dispatcher = dispatcher();
    let echo = native(echo_f64 as *const ());
    let result = unsafe { dispatcher.invoke(&echo, &LogicalType::F64, &[Value::F64(f64::NAN)]) }.unwrap();
    assert!(result.as_f64().unwrap().is_nan());
}

#[test]
fn test_mixed_argument_classes() {
    let dispatcher = dispatcher();
    let mix = native(mix as *const ());
    let args = [Value::I8(-1), Value::F32(0.5), Value::I64(10), Value::F64(0.25), Value::U16(2)];
    let result = unsafe { dispatcher.invoke(&mix, &LogicalType::F64, &args) }.unwrap();
    assert_eq!(result, Value::F64(11.75));
    assert_eq!(dispatcher.stats().calls_made, 1);
}

#[test]
fn test_declared_signature_checks_arguments_before_calling() {
    let dispatcher = dispatcher();
    let echo = native(echo_i32 as *const ());
    let signature = Signature::new(vec![LogicalType::I32], LogicalType::I32);

    let err = unsafe { dispatcher.invoke_signature(&echo, &signature, &[Value::String("7".into())]) }.unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { index: 0, .. }));

    let err = unsafe { dispatcher.invoke_signature(&echo, &signature, &[]) }.unwrap_err();
    assert_eq!(err, BridgeError::ArgumentCount { expected: 1, actual: 0 });

    let stats = dispatcher.stats();
    assert_eq!(stats.calls_made, 0);
    assert_eq!(stats.marshaling_errors, 1);
}

#[test]
fn test_out_of_range_integer_rejected() {
    let dispatcher = dispatcher();
    let echo = native(echo_i8 as *const ());
    let signature = Signature::new(vec![LogicalType::I8], LogicalType::I8);
    let ok = unsafe { dispatcher.invoke_signature(&echo, &signature, &[Value::I8(1)]) }.unwrap();
    assert_eq!(ok, Value::I8(1));

    let err = unsafe { dispatcher.invoke_signature(&echo, &signature, &[Value::I32(300)]) }.unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { index: 0, .. }));
}

#[test]
fn test_convention_mismatch_rejected() {
    let dispatcher = dispatcher();
    let echo = native(echo_i32 as *const ());
    let signature = Signature::new(vec![LogicalType::I32], LogicalType::I32).with_convention(ConventionTag::Stdcall);
    let err = unsafe { dispatcher.invoke_signature(&echo, &signature, &[Value::I32(1)]) }.unwrap_err();
    assert!(matches!(err, BridgeError::BadCallingConvention { .. }));
}

#[test]
fn test_null_function_rejected() {
    let dispatcher = dispatcher();
    let null = native(std::ptr::null());
    let err = unsafe { dispatcher.invoke(&null, &LogicalType::Void, &[]) }.unwrap_err();
    assert!(matches!(err, BridgeError::NullPointer { .. }));
}

#[test]
fn test_strings_cross_both_ways() {
    let dispatcher = dispatcher();
    let strlen = native(c_strlen as *const ());
    let len = unsafe { dispatcher.invoke(&strlen, &LogicalType::SizeT, &[Value::String("héllo".into())]) }.unwrap();
    assert_eq!(len.as_i64(), Some("héllo".len() as i64));

    let signature = Signature::new(vec![LogicalType::String], LogicalType::SizeT);
    let len = unsafe { dispatcher.invoke_signature(&strlen, &signature, &[Value::Null]) }.unwrap();
    assert_eq!(len.as_i128(), Some(usize::MAX as i128));

    let greeting = native(greeting as *const ());
    let text = unsafe { dispatcher.invoke(&greeting, &LogicalType::String, &[]) }.unwrap();
    assert_eq!(text, Value::String("hello from native".into()));
}

#[test]
fn test_arrays_are_pinned_for_the_call() {
    let dispatcher = dispatcher();
    let sum = native(sum_i32 as *const ());
    let array = ArrayRef::new(ArrayData::I32(vec![1, 2, 3, 4]));
    let len = Value::U64(array.len() as u64);
    let signature = Signature::new(vec![LogicalType::Array, LogicalType::SizeT], LogicalType::I64);
    let total = unsafe { dispatcher.invoke_signature(&sum, &signature, &[Value::Array(array.clone()), len]) }.unwrap();
    assert_eq!(total, Value::I64(10));
    assert_eq!(array.pin_count(), 0);

    let fill = native(fill as *const ());
    let doubles = ArrayRef::new(ArrayData::F64(vec![0.0; 3]));
    let args = [Value::Array(doubles.clone()), Value::U64(3), Value::F64(1.5)];
    unsafe { dispatcher.invoke(&fill, &LogicalType::Void, &args) }.unwrap();
    assert_eq!(doubles.snapshot(), ArrayData::F64(vec![1.5; 3]));
}

#[test]
fn test_pins_released_on_error() {
    let dispatcher = dispatcher();
    let sum = native(sum_i32 as *const ());
    let array = ArrayRef::new(ArrayData::I32(vec![1, 2]));
    let signature = Signature::new(vec![LogicalType::Array, LogicalType::SizeT], LogicalType::I64);
    let args = [Value::Array(array.clone()), Value::String("two".into())];
    let err = unsafe { dispatcher.invoke_signature(&sum, &signature, &args) }.unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { index: 1, .. }));
    assert_eq!(array.pin_count(), 0);
    // Unpinned: the managed side may use the array again
    array.with(|data| *data = ArrayData::I32(vec![5]));
}

#[test]
fn test_callback_reads_array_during_call() {
    let dispatcher = Arc::new(dispatcher());
    let array = ArrayRef::new(ArrayData::I32(vec![1, 2, 3]));

    let (seen, inner) = (array.clone(), dispatcher.clone());
    let target = target_fn(move |_| {
        assert_eq!(seen.pin_count(), 1);
        // The managed copy is untouched until the call returns
        assert_eq!(seen.snapshot(), ArrayData::I32(vec![1, 2, 3]));
        // Pinning the same array again for a nested call
        let sum = native(sum_i32 as *const ());
        let len = Value::U64(seen.len() as u64);
        let signature = Signature::new(vec![LogicalType::Array, LogicalType::SizeT], LogicalType::I64);
        let total = unsafe { inner.invoke_signature(&sum, &signature, &[Value::Array(seen.clone()), len]) };
        total.map_err(|err| CallFailure::new(err.to_string()))
    });
    let callback_signature = Arc::new(Signature::new(vec![], LogicalType::I64));
    let managed = ManagedCallback::new(target, callback_signature.clone());

    let poke = native(poke_then_call as *const ());
    let signature = Signature::new(
        vec![LogicalType::Array, LogicalType::SizeT, LogicalType::Callback(callback_signature)],
        LogicalType::I64,
    );
    let args = [Value::Array(array.clone()), Value::U64(3), Value::Callback(managed)];
    let result = unsafe { dispatcher.invoke_signature(&poke, &signature, &args) }.unwrap();
    assert_eq!(result, Value::I64(6));
    assert_eq!(array.pin_count(), 0);
    assert_eq!(array.snapshot(), ArrayData::I32(vec![99, 2, 3]));
}

#[test]
fn test_marshalling_buffers_are_pooled() {
    let dispatcher = dispatcher();
    let strlen = native(c_strlen as *const ());
    let text = Value::String("pooled".into());
    unsafe { dispatcher.invoke(&strlen, &LogicalType::SizeT, &[text.clone()]) }.unwrap();

    let before = pool_stats();
    for _ in 0..10 {
        let len = unsafe { dispatcher.invoke(&strlen, &LogicalType::SizeT, &[text.clone()]) }.unwrap();
        assert_eq!(len.as_i64(), Some(6));
    }
    let after = pool_stats();
    assert!(after.hits >= before.hits + 10);
    assert!(after.cached >= 1);
}

#[test]
fn test_buffer_pool_bounds() {
    use super::pool::PooledBuffer;

    let before = pool_stats();
    let held: Vec<_> = (0..BUFFERS_PER_CLASS + 4).map(|_| PooledBuffer::zeroed(100).unwrap()).collect();
    assert!(held.iter().all(|b| b.len() == 100 && b.as_slice().iter().all(|&x| x == 0)));
    drop(held);
    let cached = pool_stats().cached;
    assert!(cached <= before.cached + BUFFERS_PER_CLASS);

    // Oversized buffers never enter the pool
    let large = PooledBuffer::c_string(&"x".repeat(MAX_POOLED)).unwrap();
    assert_eq!(unsafe { large.pointer().read_c_string(0) }.len(), MAX_POOLED);
    drop(large);
    assert_eq!(pool_stats().cached, cached);

    // Reused buffers come back zeroed
    let mut dirty = PooledBuffer::copy_of(&[0xff; 32]).unwrap();
    assert_eq!(dirty.as_slice(), &[0xff; 32]);
    dirty = PooledBuffer::zeroed(32).unwrap();
    assert_eq!(dirty.as_slice(), &[0u8; 32]);
}

#[test]
fn test_by_reference_writes_back() {
    let dispatcher = dispatcher();
    let increment = native(increment as *const ());
    let cell = ByReference::new(Value::I32(41));
    unsafe { dispatcher.invoke(&increment, &LogicalType::Void, &[Value::Reference(cell.clone())]) }.unwrap();
    assert_eq!(cell.get(), Value::I32(42));
}

#[test]
fn test_structures_by_value_and_reference() {
    let dispatcher = dispatcher();
    let def = point_def();

    let point = Structure::new(def.clone()).unwrap();
    point.set("x", Value::I32(2)).unwrap();
    point.set("y", Value::F64(0.5)).unwrap();

    let sum = native(point_sum as *const ());
    let by_value = Value::Struct(point.clone().by_value());
    let total = unsafe { dispatcher.invoke(&sum, &LogicalType::F64, &[by_value]) }.unwrap();
    assert_eq!(total, Value::F64(2.5));

    let scale = native(scale_point as *const ());
    unsafe { dispatcher.invoke(&scale, &LogicalType::Void, &[Value::Struct(point.clone()), Value::I32(3)]) }.unwrap();
    assert_eq!(point.get("x").unwrap(), Value::I32(6));
    assert_eq!(point.get("y").unwrap(), Value::F64(1.5));

    let make = native(make_point as *const ());
    let made = unsafe {
        dispatcher.invoke(&make, &LogicalType::StructByValue(def), &[Value::I32(7), Value::F64(-1.0)])
    }
    .unwrap();
    let Value::Struct(made) = made else {
        panic!("expected a structure, got {:?}", made);
    };
    assert_eq!(made.get("x").unwrap(), Value::I32(7));
    assert_eq!(made.get("y").unwrap(), Value::F64(-1.0));
}

#[test]
fn test_nested_structure_fields() {
    let dispatcher = dispatcher();
    let outer = Structure::new(outer_def()).unwrap();
    outer.set("count", Value::I32(40)).unwrap();
    let Value::Struct(inner) = outer.get("inner").unwrap() else {
        panic!("inner field is a structure");
    };
    inner.set("a", Value::U8(2)).unwrap();

    let count = native(outer_count as *const ());
    let result = unsafe { dispatcher.invoke(&count, &LogicalType::I32, &[Value::Struct(outer)]) }.unwrap();
    assert_eq!(result, Value::I32(42));
}

#[test]
fn test_mixed_width_structure_by_value() {
    let dispatcher = dispatcher();
    let def = mixed_def();
    let mixed = Structure::new(def.clone()).unwrap();
    let fields = [
        ("tiny", Value::I8(-3)),
        ("short", Value::I16(300)),
        ("int", Value::I32(-70_000)),
        ("long", Value::I64(5_000_000_000)),
        ("single", Value::F32(0.25)),
        ("double", Value::F64(-1.5)),
        ("byte", Value::U8(200)),
        ("last", Value::I32(7)),
    ];
    for (name, value) in fields.clone() {
        mixed.set(name, value).unwrap();
    }

    let total = native(mixed_total as *const ());
    let signature = Signature::new(vec![LogicalType::StructByValue(def.clone())], LogicalType::F64);
    let args = [Value::Struct(mixed.clone().by_value())];
    let result = unsafe { dispatcher.invoke_signature(&total, &signature, &args) }.unwrap();
    let expected = -3.0 + 300.0 - 70_000.0 + 5_000_000_000.0 + 0.25 - 1.5 + 200.0 + 7.0;
    assert_eq!(result, Value::F64(expected));

    let shift = native(mixed_shift as *const ());
    let signature = Signature::new(
        vec![LogicalType::StructByValue(def.clone()), LogicalType::I32],
        LogicalType::StructByValue(def),
    );
    let args = [Value::Struct(mixed.clone().by_value()), Value::I32(1)];
    let shifted = unsafe { dispatcher.invoke_signature(&shift, &signature, &args) }.unwrap();
    let Value::Struct(shifted) = shifted else {
        panic!("expected a structure, got {:?}", shifted);
    };
    assert_eq!(shifted.get("tiny").unwrap(), Value::I8(-2));
    assert_eq!(shifted.get("short").unwrap(), Value::I16(301));
    assert_eq!(shifted.get("int").unwrap(), Value::I32(-69_999));
    assert_eq!(shifted.get("long").unwrap(), Value::I64(5_000_000_001));
    assert_eq!(shifted.get("single").unwrap(), Value::F32(1.25));
    assert_eq!(shifted.get("double").unwrap(), Value::F64(-0.5));
    assert_eq!(shifted.get("byte").unwrap(), Value::U8(201));
    assert_eq!(shifted.get("last").unwrap(), Value::I32(8));

    // Passed by value: the original is unchanged
    for (name, value) in fields {
        assert_eq!(mixed.get(name).unwrap(), value, "{}", name);
    }
}

#[test]
fn test_unions_by_value() {
    let dispatcher = dispatcher();
    let def = bits_def();
    let bits = Structure::new(def.clone()).unwrap();
    bits.set("float", Value::F32(-2.5)).unwrap();

    let word = native(bits_word as *const ());
    let result = unsafe { dispatcher.invoke(&word, &LogicalType::U32, &[Value::Struct(bits.by_value())]) }.unwrap();
    assert_eq!(result, Value::U32((-2.5f32).to_bits()));

    let from_word = native(bits_from_word as *const ());
    let made = unsafe {
        dispatcher.invoke(&from_word, &LogicalType::StructByValue(def), &[Value::U32(0.75f32.to_bits())])
    }
    .unwrap();
    let Value::Struct(made) = made else {
        panic!("expected a union, got {:?}", made);
    };
    assert_eq!(made.get("float").unwrap(), Value::F32(0.75));

    let wide = StructDef::union("Wide", [("int", LogicalType::I64), ("double", LogicalType::F64)]).unwrap();
    assert_eq!(wide.size(), size_of::<Wide>());
    let value = Structure::new(wide.clone()).unwrap();
    value.set("double", Value::F64(9.0)).unwrap();
    let halve = native(wide_halve as *const ());
    let signature = Signature::new(vec![LogicalType::StructByValue(wide.clone())], LogicalType::StructByValue(wide));
    let halved = unsafe { dispatcher.invoke_signature(&halve, &signature, &[Value::Struct(value.by_value())]) }.unwrap();
    let Value::Struct(halved) = halved else {
        panic!("expected a union, got {:?}", halved);
    };
    assert_eq!(halved.get("double").unwrap(), Value::F64(4.5));
}

#[test]
fn test_callback_arguments_and_function_results() {
    let dispatcher = dispatcher();
    let inner = Arc::new(Signature::new(vec![LogicalType::I32], LogicalType::I32));
    let target = target_fn(|args| match args {
        [Value::I32(x)] => Ok(Value::I32(x + 1)),
        _ => Err(CallFailure::new("bad arguments")),
    });
    let managed = ManagedCallback::new(target.clone(), inner.clone());

    let apply = native(apply as *const ());
    let signature = Signature::new(vec![LogicalType::Callback(inner.clone()), LogicalType::I32], LogicalType::I32);
    let result = unsafe { dispatcher.invoke_signature(&apply, &signature, &[Value::Callback(managed.clone()), Value::I32(41)]) }
        .unwrap();
    assert_eq!(result, Value::I32(42));

    // Our own trampoline comes back as the managed callback
    let identity = native(identity as *const ());
    let echo = Signature::new(vec![LogicalType::Callback(inner.clone())], LogicalType::Callback(inner.clone()));
    let back = unsafe { dispatcher.invoke_signature(&identity, &echo, &[Value::Callback(managed.clone())]) }.unwrap();
    assert_eq!(back, Value::Callback(managed));

    // A plain native function comes back as a callable function
    let double = native(double_it as *const ()).with_signature(inner);
    let back = unsafe { dispatcher.invoke_signature(&identity, &echo, &[Value::Function(double)]) }.unwrap();
    let Value::Function(function) = back else {
        panic!("expected a function, got {:?}", back);
    };
    let result = unsafe { dispatcher.invoke_function(&function, &[Value::I32(21)]) }.unwrap();
    assert_eq!(result, Value::I32(42));
}

#[test]
fn test_invoke_prepared_checks_types() {
    let dispatcher = dispatcher();
    let echo = native(echo_i64 as *const ());
    let cif = dispatcher
        .cif_cache()
        .prepare(&[TypeDescriptor::I64], &TypeDescriptor::I64, ConventionTag::C)
        .unwrap();

    let raw = unsafe { dispatcher.invoke_prepared(&echo, &cif, &[Value::I64(-9)]) }.unwrap();
    assert_eq!(raw.as_i64(), Some(-9));
    assert_eq!(raw.bytes(), (-9i64).to_ne_bytes().to_vec());

    let err = unsafe { dispatcher.invoke_prepared(&echo, &cif, &[Value::I32(-9)]) }.unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { index: 0, .. }));
    assert!(format!("{:?}", raw).starts_with("RawResult"));
}

#[test]
fn test_variadic_argument_count() {
    let dispatcher = dispatcher();
    let echo = native(echo_i32 as *const ());
    let err = unsafe { dispatcher.invoke_variadic(&echo, &LogicalType::I32, 2, &[Value::I32(1)]) }.unwrap_err();
    assert_eq!(err, BridgeError::ArgumentCount { expected: 2, actual: 1 });
}

#[cfg(unix)]
#[test]
fn test_variadic_snprintf() {
    let dispatcher = dispatcher();
    let process = Library::this_process().unwrap();
    let snprintf = process.function("snprintf", ConventionTag::C).unwrap();
    let buffer = Arc::new(Memory::allocate(64).unwrap());

    let signature = Signature::new(
        vec![LogicalType::Pointer, LogicalType::SizeT, LogicalType::String, LogicalType::I32, LogicalType::F32],
        LogicalType::I32,
    )
    .variadic(3);
    let args = [
        Value::Memory(buffer.clone()),
        Value::U64(buffer.size() as u64),
        Value::String("%d|%.2f".into()),
        Value::I32(-42),
        Value::F32(1.5),
    ];
    let written = unsafe { dispatcher.invoke_signature(&snprintf, &signature, &args) }.unwrap();
    assert_eq!(written, Value::I32(8));
    assert_eq!(unsafe { buffer.pointer().read_c_string(0) }, "-42|1.50");
}

// ===== Memory and libraries =====

#[test]
fn test_memory_is_zeroed_and_bounded() {
    let memory = Memory::allocate(16).unwrap();
    assert_eq!(memory.to_vec(), vec![0u8; 16]);
    memory.write::<u32>(12, 0xdead_beef).unwrap();
    assert_eq!(memory.read::<u32>(12).unwrap(), 0xdead_beef);
    assert_eq!(
        memory.write::<u64>(12, 1),
        Err(BridgeError::OutOfBounds { offset: 12, len: 8, size: 16 })
    );

    let text = Memory::from_c_string("abc").unwrap();
    assert_eq!(text.to_vec(), b"abc\0".to_vec());
}

#[test]
fn test_raw_alloc_and_free() {
    let ptr = alloc(32).unwrap();
    assert!(!ptr.is_null());
    unsafe {
        ptr.write::<i64>(8, -1);
        assert_eq!(ptr.read::<i64>(8), -1);
        free(ptr);
    }
}

#[test]
fn test_missing_library_and_symbol() {
    let err = Library::open("libdefinitely-not-present-anywhere.so.99").unwrap_err();
    assert!(matches!(err, LoadError::LoadFailed { .. }));
    assert!(matches!(Library::open("bad\0name"), Err(LoadError::InvalidName(_))));

    let process = Library::this_process().unwrap();
    assert!(matches!(
        process.symbol("definitely_not_a_symbol_in_this_process"),
        Err(SymbolError::NotFound { .. })
    ));
}

#[cfg(unix)]
#[test]
fn test_global_variable_read_write() {
    let process = Library::this_process().unwrap();
    let optind = process.global("optind", LogicalType::I32).unwrap();
    assert_eq!(optind.name(), "optind");
    assert!(!optind.address().is_null());

    let Value::I32(original) = optind.get().unwrap() else {
        panic!("optind is an int");
    };
    optind.set(Value::I32(original + 5)).unwrap();
    assert_eq!(optind.get().unwrap(), Value::I32(original + 5));
    assert_eq!(unsafe { optind.read::<i32>() }, original + 5);
    unsafe { optind.write::<i32>(original) };
    assert_eq!(optind.get().unwrap(), Value::I32(original));

    let err = optind.set(Value::F64(1.0)).unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { index: 0, .. }));
}

#[cfg(unix)]
#[test]
fn test_global_variable_rejections() {
    let process = Library::this_process().unwrap();

    // `char *tzname[2]`: the first element reads as a string
    let tzname = process.global("tzname", LogicalType::String).unwrap();
    assert!(matches!(tzname.get().unwrap(), Value::String(_) | Value::Null));
    let err = tzname.set(Value::String("UTC".into())).unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedArgument { .. }));

    let mapped = process.global("optind", LogicalType::Mapped(Arc::from("flag"))).unwrap_err();
    assert!(matches!(mapped, BridgeError::UnsupportedType { position: Position::Standalone, .. }));
    let array = process.global("optind", LogicalType::Array).unwrap_err();
    assert!(matches!(array, BridgeError::UnsupportedType { .. }));

    let missing = process.global("definitely_not_a_global_in_this_process", LogicalType::I32).unwrap_err();
    assert!(matches!(missing, BridgeError::Symbol(SymbolError::NotFound { .. })));
}

// ===== Properties =====

proptest! {
    #[test]
    fn test_i64_round_trip(x in any::<i64>()) {
        let dispatcher = dispatcher();
        let echo = native(echo_i64 as *const ());
        let result = unsafe { dispatcher.invoke(&echo, &LogicalType::I64, &[Value::I64(x)]) }.unwrap();
        prop_assert_eq!(result, Value::I64(x));
    }

    #[test]
    fn test_sub_word_round_trip(x in any::<i16>(), y in any::<u8>()) {
        let dispatcher = dispatcher();
        let echo = native(echo_i16 as *const ());
        let result = unsafe { dispatcher.invoke(&echo, &LogicalType::I16, &[Value::I16(x)]) }.unwrap();
        prop_assert_eq!(result, Value::I16(x));

        let echo = native(echo_u8 as *const ());
        let result = unsafe { dispatcher.invoke(&echo, &LogicalType::U8, &[Value::U8(y)]) }.unwrap();
        prop_assert_eq!(result, Value::U8(y));
    }

    #[test]
    fn test_f64_round_trip(x in any::<f64>().prop_filter("not NaN", |x| !x.is_nan())) {
        let dispatcher = dispatcher();
        let echo = native(echo_f64 as *const ());
        let result = unsafe { dispatcher.invoke(&echo, &LogicalType::F64, &[Value::F64(x)]) }.unwrap();
        prop_assert_eq!(result, Value::F64(x));
    }
}
