//! Dispatch benchmarks
//!
//! Measures forward call overhead, interface preparation and trampoline
//! round trips.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use native_bridge::{
    target_fn, Bridge, BridgeConfig, CallFailure, ConventionTag, Function, LogicalType, Pointer, Signature, Value,
};

extern "C" fn add(a: i64, b: i64) -> i64 {
    a.wrapping_add(b)
}

extern "C" fn sum8(a: i64, b: i64, c: i64, d: i64, e: f64, f: f64, g: f64, h: f64) -> f64 {
    (a + b + c + d) as f64 + e + f + g + h
}

fn function(address: *const ()) -> Function {
    // SAFETY: benchmark functions are invoked with their declared signatures
    unsafe { Function::new(Pointer::from_raw(address), ConventionTag::C) }
}

fn bench_forward_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let bridge = Bridge::new(BridgeConfig::default());

    let add = function(add as *const ());
    let binary = Signature::new(vec![LogicalType::I64, LogicalType::I64], LogicalType::I64);
    group.bench_function("inferred_2_args", |b| {
        b.iter(|| unsafe { bridge.invoke(&add, &LogicalType::I64, black_box(&[Value::I64(1), Value::I64(2)])) })
    });
    group.bench_function("declared_2_args", |b| {
        b.iter(|| unsafe { bridge.invoke_signature(&add, &binary, black_box(&[Value::I64(1), Value::I64(2)])) })
    });

    let cif = bridge.prepare(&binary).expect("prepare");
    group.bench_function("prepared_2_args", |b| {
        b.iter(|| unsafe { bridge.invoke_prepared(&add, &cif, black_box(&[Value::I64(1), Value::I64(2)])) })
    });

    let sum8 = function(sum8 as *const ());
    let args = [
        Value::I64(1),
        Value::I64(2),
        Value::I64(3),
        Value::I64(4),
        Value::F64(0.5),
        Value::F64(0.25),
        Value::F64(0.125),
        Value::F64(0.0625),
    ];
    group.bench_function("inferred_8_args", |b| {
        b.iter(|| unsafe { bridge.invoke(&sum8, &LogicalType::F64, black_box(&args)) })
    });

    group.finish();
}

fn bench_prepare(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare");

    for cached in [true, false] {
        let mut config = BridgeConfig::default();
        config.dispatch.cache_signatures = cached;
        let bridge = Bridge::new(config);
        let signature = Signature::new(vec![LogicalType::I32; 6], LogicalType::F64);
        group.bench_with_input(BenchmarkId::new("signature", cached), &signature, |b, signature| {
            b.iter(|| bridge.prepare(black_box(signature)))
        });
    }

    group.finish();
}

fn bench_trampolines(c: &mut Criterion) {
    let mut group = c.benchmark_group("trampoline");
    let bridge = Bridge::new(BridgeConfig::default());

    let target = target_fn(|args| match args {
        [Value::I64(a), Value::I64(b)] => Ok(Value::I64(a + b)),
        _ => Err(CallFailure::new("bad arguments")),
    });
    let signature = Signature::new(vec![LogicalType::I64, LogicalType::I64], LogicalType::I64);
    let callback = bridge.register_callback(&target, &signature).expect("register");
    // SAFETY: the trampoline was prepared for exactly this signature
    let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(callback.trampoline().address()) };

    group.bench_function("native_to_managed", |b| b.iter(|| f(black_box(20), black_box(22))));
    group.bench_function("register_cached", |b| {
        b.iter(|| bridge.register_callback(black_box(&target), &signature))
    });

    group.finish();
}

criterion_group!(benches, bench_forward_calls, bench_prepare, bench_trampolines);
criterion_main!(benches);
