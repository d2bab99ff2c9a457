use super::*;

use crate::callback::ManagedCallback;
use crate::error::{BridgeError, CallFailure};
use crate::interop::ConventionTag;
use crate::refs::target_fn;

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn apply(f: Option<extern "C" fn(i32, i32) -> i32>, a: i32, b: i32) -> i32 {
    match f {
        Some(f) => f(a, b),
        None => -1,
    }
}

fn function(address: *const ()) -> Function {
    // SAFETY: test functions are declared with matching signatures below
    unsafe { Function::new(Pointer::from_raw(address), ConventionTag::C) }
}

fn binary_i32() -> Signature {
    Signature::new(vec![LogicalType::I32, LogicalType::I32], LogicalType::I32)
}

/// Target answering with the name of the method it was invoked as
struct MethodEcho;

impl ManagedTarget for MethodEcho {
    fn invoke(&self, method: &MethodId, _args: Vec<Value>) -> std::result::Result<Value, CallFailure> {
        Ok(Value::I32(method.as_str().len() as i32))
    }
}

/// `int` storage seen as a managed boolean
struct Switch;

impl TypeConverter for Switch {
    fn native_type(&self) -> LogicalType {
        LogicalType::I32
    }

    fn to_native(&self, value: Value) -> std::result::Result<Value, CallFailure> {
        value
            .as_bool()
            .map(|on| Value::I32(on as i32))
            .ok_or_else(|| CallFailure::new("switch must be a bool"))
    }

    fn from_native(&self, value: Value) -> std::result::Result<Value, CallFailure> {
        Ok(Value::Bool(value.as_i64().unwrap_or(0) != 0))
    }
}

// ===== Construction =====

#[test]
fn test_new_bridge_is_empty() {
    let bridge = Bridge::new(BridgeConfig::default());
    let stats = bridge.stats();
    assert_eq!(stats.interop.calls_made, 0);
    assert_eq!(stats.callbacks.live, 0);
    assert_eq!(stats.handles, 0);
    assert_eq!(bridge.config(), &BridgeConfig::default());
}

#[test]
fn test_global_is_shared() {
    assert!(std::ptr::eq(Bridge::global(), Bridge::global()));
}

// ===== Forward calls =====

#[test]
fn test_invoke_signature() {
    let bridge = Bridge::new(BridgeConfig::default());
    let add = function(add as *const ());
    let result = unsafe { bridge.invoke_signature(&add, &binary_i32(), &[Value::I32(3), Value::I32(4)]) }.unwrap();
    assert_eq!(result, Value::I32(7));
    assert_eq!(bridge.stats().interop.calls_made, 1);
}

#[test]
fn test_invoke_inferred() {
    let bridge = Bridge::new(BridgeConfig::default());
    let add = function(add as *const ());
    let result = unsafe { bridge.invoke(&add, &LogicalType::I32, &[Value::I32(i32::MAX), Value::I32(1)]) }.unwrap();
    assert_eq!(result, Value::I32(i32::MIN));
}

#[test]
fn test_max_args_is_enforced() {
    let mut config = BridgeConfig::default();
    config.dispatch.max_args = 1;
    let bridge = Bridge::new(config);
    let add = function(add as *const ());
    let err = unsafe { bridge.invoke(&add, &LogicalType::I32, &[Value::I32(1), Value::I32(2)]) }.unwrap_err();
    assert_eq!(err, BridgeError::TooManyArguments { max: 1, actual: 2 });
    assert_eq!(bridge.stats().interop.calls_made, 0);
}

#[test]
fn test_prepare_reuses_interfaces() {
    let bridge = Bridge::new(BridgeConfig::default());
    let first = bridge.prepare(&binary_i32()).unwrap();
    let second = bridge.prepare(&binary_i32()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.arg_count(), 2);

    let add = function(add as *const ());
    let raw = unsafe { bridge.invoke_prepared(&add, &first, &[Value::I32(20), Value::I32(22)]) }.unwrap();
    assert_eq!(raw.as_i64(), Some(42));
}

#[test]
fn test_prepare_without_cache() {
    let mut config = BridgeConfig::default();
    config.dispatch.cache_signatures = false;
    let bridge = Bridge::new(config);
    let first = bridge.prepare(&binary_i32()).unwrap();
    let second = bridge.prepare(&binary_i32()).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(bridge.cif_cache().is_empty());
}

// ===== Callbacks =====

#[test]
fn test_native_calls_back_into_managed_code() {
    let bridge = Bridge::new(BridgeConfig::default());
    let adder = target_fn(|args| match args {
        [Value::I32(a), Value::I32(b)] => Ok(Value::I32(a + b)),
        _ => Err(CallFailure::new("bad arguments")),
    });
    let callback_signature = Arc::new(binary_i32());
    let signature = Signature::new(
        vec![LogicalType::Callback(callback_signature.clone()), LogicalType::I32, LogicalType::I32],
        LogicalType::I32,
    );

    let apply = function(apply as *const ());
    let managed = Value::Callback(ManagedCallback::new(adder.clone(), callback_signature));
    let result = unsafe { bridge.invoke_signature(&apply, &signature, &[managed.clone(), Value::I32(3), Value::I32(4)]) }
        .unwrap();
    assert_eq!(result, Value::I32(7));

    // The second call reuses the registered trampoline
    unsafe { bridge.invoke_signature(&apply, &signature, &[managed, Value::I32(1), Value::I32(1)]) }.unwrap();
    assert_eq!(bridge.callbacks().len(), 1);
    assert_eq!(bridge.stats().callbacks.created, 1);
}

#[test]
fn test_configured_method_name() {
    let mut config = BridgeConfig::default();
    config.callbacks.method_name = "compare".to_string();
    let bridge = Bridge::new(config);

    let target: Arc<dyn ManagedTarget> = Arc::new(MethodEcho);
    let callback = bridge
        .register_callback(&target, &Signature::new(vec![], LogicalType::I32))
        .unwrap();
    let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(callback.trampoline().address()) };
    assert_eq!(f(), "compare".len() as i32);

    let other = bridge
        .register_callback_method(&target, MethodId::new("run"), &Signature::new(vec![], LogicalType::I32))
        .unwrap();
    let g: extern "C" fn() -> i32 = unsafe { std::mem::transmute(other.trampoline().address()) };
    assert_eq!(g(), 3);
}

#[test]
fn test_release_callback_by_trampoline() {
    let bridge = Bridge::new(BridgeConfig::default());
    let target = target_fn(|_| Ok(Value::I32(9)));
    let callback = bridge
        .register_callback(&target, &Signature::new(vec![], LogicalType::I32))
        .unwrap();
    let trampoline = callback.trampoline();

    assert!(bridge.release_callback(trampoline));
    assert!(!bridge.release_callback(trampoline));
    assert!(callback.is_released());
    assert!(bridge.callbacks().is_empty());

    let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(trampoline.address()) };
    assert_eq!(f(), 0);
}

#[test]
fn test_purge_and_shutdown() {
    let bridge = Bridge::new(BridgeConfig::default());
    let kept = target_fn(|_| Ok(Value::Void));
    let dropped = target_fn(|_| Ok(Value::Void));
    let signature = Signature::new(vec![], LogicalType::Void);
    bridge.register_callback(&kept, &signature).unwrap();
    bridge.register_callback(&dropped, &signature).unwrap();
    let handle = bridge.handles().register(&dropped);
    drop(dropped);

    assert_eq!(bridge.purge(), 2);
    assert!(!bridge.handles().contains(handle));
    assert_eq!(bridge.shutdown(), 1);
    assert!(bridge.callbacks().is_empty());
}

#[test]
fn test_recycling_follows_config() {
    let mut config = BridgeConfig::default();
    assert!(Bridge::new(config.clone()).callbacks().arena().recycles_released());

    config.callbacks.recycle_released = false;
    config.callbacks.release_quarantine = 3;
    config.callbacks.slots_per_chunk = Some(4);
    let bridge = Bridge::new(config);
    assert!(!bridge.callbacks().arena().recycles_released());
    assert_eq!(bridge.callbacks().arena().quarantine(), 3);
    assert_eq!(bridge.callbacks().arena().slots_per_chunk(), 4);
}

// ===== Globals =====

#[cfg(unix)]
#[test]
fn test_mapped_global_variable() {
    let bridge = Bridge::new(BridgeConfig::default());
    bridge.register_type("switch", Arc::new(Switch)).unwrap();
    let process = Library::this_process().unwrap();
    let switch = LogicalType::Mapped(Arc::from("switch"));

    let opterr = bridge.global_variable(&process, "opterr", switch.clone()).unwrap();
    let original = unsafe { opterr.read::<i32>() };
    opterr.set(Value::Bool(false)).unwrap();
    assert_eq!(unsafe { opterr.read::<i32>() }, 0);
    assert_eq!(opterr.get().unwrap(), Value::Bool(false));
    opterr.set(Value::Bool(true)).unwrap();
    assert_eq!(opterr.get().unwrap(), Value::Bool(true));
    assert!(matches!(opterr.set(Value::I32(1)), Err(BridgeError::UnsupportedArgument { .. })));
    unsafe { opterr.write::<i32>(original) };

    // Without the bridge the mapped name means nothing
    assert!(matches!(process.global("opterr", switch), Err(BridgeError::UnsupportedType { .. })));
}
