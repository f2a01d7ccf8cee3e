//! Integration tests for the object bridge against real wasm guests.
//!
//! Guests are inline WAT, compiled by wasmtime's text-format support, so
//! the suite needs no prebuilt binary fixtures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use refbridge::{
    Arg, BridgeError, HostCallbacks, HostValue, InstanceConfig, Sandbox, Value, ValueKind,
};

/// Plain arithmetic, no memory, no imports.
const MATH_WAT: &str = r#"
(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
"#;

/// Externref pass-through and a guest-side global holding one reference.
const KEEP_WAT: &str = r#"
(module
  (global $slot (mut externref) (ref.null extern))
  (func (export "store_object") (param externref) (result externref)
    local.get 0
    global.set $slot
    global.get $slot)
  (func (export "keep") (param externref) (result externref)
    local.get 0))
"#;

/// Guests that signal reference drops through the built-in release import.
const DROP_WAT: &str = r#"
(module
  (import "host" "ref_drop" (func $ref_drop (param externref)))
  (func (export "drop_and_return") (param externref) (result externref)
    local.get 0
    call $ref_drop
    local.get 0)
  (func (export "drop_only") (param externref)
    local.get 0
    call $ref_drop))
"#;

/// Linear memory plus a bump allocator, for buffer and seed marshaling.
const ALLOC_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 8))
  (func (export "alloc") (param i32) (result i32)
    (local $ptr i32)
    global.get $next
    local.set $ptr
    global.get $next
    local.get 0
    i32.add
    global.set $next
    local.get $ptr)
  (func (export "dealloc") (param i32 i32))
  (func (export "sum_bytes") (param i32 i32) (result i32)
    (local $acc i32)
    (local $i i32)
    block $done
      loop $more
        local.get $i
        local.get 1
        i32.ge_u
        br_if $done
        local.get $acc
        local.get 0
        local.get $i
        i32.add
        i32.load8_u
        i32.add
        local.set $acc
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $more
      end
    end
    local.get $acc)
  (func (export "consume_and_trap") (param i32 i32)
    unreachable)
  (func (export "set_seed") (param i32 i32) (result i32)
    local.get 0))
"#;

/// Unbounded recursion, to exhaust the configured stack budget.
const RECURSE_WAT: &str = r#"
(module
  (func $spin (export "recurse")
    call $spin))
"#;

/// Guests exercising host callbacks, including re-entry into the sandbox.
const CALLBACK_WAT: &str = r#"
(module
  (import "host" "transform" (func $transform (param externref) (result externref)))
  (import "host" "compute" (func $compute (param i32 i32) (result i32)))
  (func (export "relay") (param externref) (result externref)
    local.get 0
    call $transform)
  (func (export "outer") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    call $compute)
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
"#;

fn host(value: &str) -> HostValue {
    Arc::new(value.to_string())
}

fn to_args(values: &[Value]) -> Vec<Arg> {
    values
        .iter()
        .map(|v| match v {
            Value::I32(n) => Arg::I32(*n),
            Value::I64(n) => Arg::I64(*n),
            Value::F32(n) => Arg::F32(*n),
            Value::F64(n) => Arg::F64(*n),
            Value::Ref(r) => Arg::Ref(r.clone()),
            Value::NullRef => Arg::NullRef,
        })
        .collect()
}

// =============================================================================
// Scalar calls and the function table
// =============================================================================

#[test]
fn test_add_scenario() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    let results = instance
        .invoke("add", &[Arg::I32(2), Arg::I32(3)])
        .expect("add call failed");
    assert_eq!(results[0].as_i32(), Some(5));
}

#[test]
fn test_unknown_function() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    match instance.invoke("nope", &[]) {
        Err(BridgeError::UnknownFunction(name)) => assert_eq!(name, "nope"),
        other => panic!("expected UnknownFunction, got {other:?}"),
    }
}

#[test]
fn test_lookup_reports_signature() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    let info = instance.lookup("add").expect("lookup");
    assert_eq!(info.params, vec!["i32", "i32"]);
    assert_eq!(info.results, vec!["i32"]);

    assert!(matches!(
        instance.lookup("nope"),
        Err(BridgeError::UnknownFunction(_))
    ));
}

#[test]
fn test_missing_export_fails_at_load() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    match sandbox.load(
        MATH_WAT.as_bytes(),
        &[("sub", "subtract")],
        HostCallbacks::new(),
    ) {
        Err(BridgeError::MissingExport(msg)) => assert!(msg.contains("subtract")),
        other => panic!("expected MissingExport, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_invalid_module_rejected() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    match sandbox.load(b"not a module", &[], HostCallbacks::new()) {
        Err(BridgeError::InstantiationFailed(_)) => {}
        other => panic!("expected InstantiationFailed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_heap_limit_rejects_oversized_memory() {
    // One wasm page (64 KiB) exceeds a 4 KiB heap budget.
    let config = InstanceConfig::default().heap_size(4096);
    let sandbox = Sandbox::new(config).expect("sandbox");
    match sandbox.load(ALLOC_WAT.as_bytes(), &[], HostCallbacks::new()) {
        Err(BridgeError::InstantiationFailed(_)) => {}
        other => panic!("expected InstantiationFailed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_type_mismatch() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    assert!(matches!(
        instance.invoke("add", &[Arg::I32(1)]),
        Err(BridgeError::TypeMismatch(_))
    ));
    assert!(matches!(
        instance.invoke("add", &[Arg::I64(1), Arg::I64(2)]),
        Err(BridgeError::TypeMismatch(_))
    ));
}

#[test]
fn test_exported_functions() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let instance = sandbox
        .load(ALLOC_WAT.as_bytes(), &[], HostCallbacks::new())
        .expect("load");

    let exports = instance.exported_functions().expect("exports");
    assert!(exports.contains(&"alloc".to_string()));
    assert!(exports.contains(&"sum_bytes".to_string()));
}

// =============================================================================
// Identity bridge through the public surface
// =============================================================================

#[test]
fn test_store_object_identity() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            KEEP_WAT.as_bytes(),
            &[("storeObject", "store_object"), ("keep", "keep")],
            HostCallbacks::new(),
        )
        .expect("load");

    let x = host("X");
    let results = instance
        .invoke("storeObject", &[Arg::Ref(x.clone())])
        .expect("storeObject call failed");
    let back = results[0].host_ref().expect("result should be a reference");
    assert!(Arc::ptr_eq(&x, back), "result must be identity-equal to X");
}

#[test]
fn test_register_idempotent() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(KEEP_WAT.as_bytes(), &[("keep", "keep")], HostCallbacks::new())
        .expect("load");

    let x = host("X");
    let h1 = instance.register(&x).expect("register");
    let h2 = instance.register(&x).expect("register again");
    assert_eq!(h1, h2);

    // Marshaling the same object reuses the entry rather than minting one.
    instance
        .invoke("keep", &[Arg::Ref(x.clone())])
        .expect("keep call failed");
    assert_eq!(instance.live_handles(), 1);

    // Distinct allocations with equal contents get distinct handles.
    let y: HostValue = Arc::new("X".to_string());
    let h3 = instance.register(&y).expect("register y");
    assert_ne!(h1, h3);
}

#[test]
fn test_resolve_and_release() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(KEEP_WAT.as_bytes(), &[("keep", "keep")], HostCallbacks::new())
        .expect("load");

    let x = host("X");
    let handle = instance.register(&x).expect("register");
    let back = instance.resolve(handle).expect("resolve");
    assert!(Arc::ptr_eq(&x, &back));

    instance.release(handle).expect("release");
    assert!(matches!(
        instance.resolve(handle),
        Err(BridgeError::UnknownHandle(_))
    ));
    assert_eq!(instance.live_handles(), 0);
}

#[test]
fn test_resolve_unknown_handle() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let instance = sandbox
        .load(KEEP_WAT.as_bytes(), &[], HostCallbacks::new())
        .expect("load");

    assert!(matches!(
        instance.resolve(42),
        Err(BridgeError::UnknownHandle(_))
    ));
}

#[test]
fn test_null_ref_roundtrip() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(KEEP_WAT.as_bytes(), &[("keep", "keep")], HostCallbacks::new())
        .expect("load");

    let results = instance.invoke("keep", &[Arg::NullRef]).expect("keep");
    assert!(matches!(results[0], Value::NullRef));
    assert_eq!(instance.live_handles(), 0);
}

#[test]
fn test_retention_keeps_object_alive() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(KEEP_WAT.as_bytes(), &[("keep", "keep")], HostCallbacks::new())
        .expect("load");

    let x: HostValue = Arc::new(vec![1u8, 2, 3]);
    let weak = Arc::downgrade(&x);
    let handle = instance.register(&x).expect("register");
    drop(x);

    // Only the bridge retains the object now.
    assert!(weak.upgrade().is_some());
    instance.release(handle).expect("release");
    assert!(weak.upgrade().is_none(), "released object must be collectible");
}

// =============================================================================
// Re-entrant release notifications
// =============================================================================

#[test]
fn test_reentrant_drop_keeps_handle_resolvable() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            DROP_WAT.as_bytes(),
            &[("dropAndReturn", "drop_and_return")],
            HostCallbacks::new(),
        )
        .expect("load");

    let x = host("X");
    let handle = instance.register(&x).expect("register");

    // The guest sends the release notification for the argument mid-call,
    // then still returns the reference. The in-flight pin must keep the
    // entry resolvable until the call completes.
    let results = instance
        .invoke("dropAndReturn", &[Arg::Ref(x.clone())])
        .expect("drop_and_return call failed");
    let back = results[0].host_ref().expect("reference result");
    assert!(Arc::ptr_eq(&x, back));

    // Once the call has drained, the deferred release takes effect.
    assert!(matches!(
        instance.resolve(handle),
        Err(BridgeError::UnknownHandle(_))
    ));
    assert_eq!(instance.live_handles(), 0);
}

#[test]
fn test_drop_notification_without_return() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            DROP_WAT.as_bytes(),
            &[("dropOnly", "drop_only")],
            HostCallbacks::new(),
        )
        .expect("load");

    let x = host("X");
    let handle = instance.register(&x).expect("register");
    let results = instance
        .invoke("dropOnly", &[Arg::Ref(x.clone())])
        .expect("drop_only call failed");
    assert!(results.is_empty());
    assert!(instance.resolve(handle).is_err());
}

// =============================================================================
// Scratch regions and the seed slot
// =============================================================================

#[test]
fn test_buffer_marshaling() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            ALLOC_WAT.as_bytes(),
            &[("sumBytes", "sum_bytes")],
            HostCallbacks::new(),
        )
        .expect("load");

    let results = instance
        .invoke("sumBytes", &[Arg::Bytes(b"abcd".to_vec())])
        .expect("sum_bytes call failed");
    assert_eq!(results[0].as_i32(), Some(97 + 98 + 99 + 100));

    let stats = instance.scratch_stats().expect("stats");
    assert_eq!(stats.live_regions, 0, "scratch must not outlive the call");
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.frees, 1);
}

#[test]
fn test_trap_frees_scratch() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            ALLOC_WAT.as_bytes(),
            &[("boom", "consume_and_trap")],
            HostCallbacks::new(),
        )
        .expect("load");

    let before = instance.scratch_stats().expect("stats");
    match instance.invoke("boom", &[Arg::Bytes(vec![0u8; 64])]) {
        Err(BridgeError::SandboxTrap(msg)) => {
            println!("trap surfaced as: {msg}");
        }
        other => panic!("expected SandboxTrap, got {other:?}"),
    }
    let after = instance.scratch_stats().expect("stats");
    assert_eq!(after.live_regions, before.live_regions);
    assert_eq!(after.allocations, after.frees);
}

#[test]
fn test_unknown_function_allocates_nothing() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(ALLOC_WAT.as_bytes(), &[], HostCallbacks::new())
        .expect("load");

    assert!(matches!(
        instance.invoke("nope", &[Arg::Bytes(vec![1, 2, 3])]),
        Err(BridgeError::UnknownFunction(_))
    ));
    let stats = instance.scratch_stats().expect("stats");
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.live_regions, 0);
}

#[test]
fn test_buffer_requires_guest_allocator() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    match instance.invoke("add", &[Arg::Bytes(vec![1]), Arg::I32(0)]) {
        Err(BridgeError::MissingExport(name)) => assert_eq!(name, "alloc"),
        other => panic!("expected MissingExport, got {other:?}"),
    }
}

#[test]
fn test_seed_slot_persists_and_overwrites() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            ALLOC_WAT.as_bytes(),
            &[("setSeed", "set_seed")],
            HostCallbacks::new(),
        )
        .expect("load");

    let results = instance
        .invoke("setSeed", &[Arg::Seed(b"seed-one".to_vec())])
        .expect("set_seed call failed");
    let first = instance
        .seed_region()
        .expect("instance loaded")
        .expect("seed written");
    assert_eq!(results[0].as_i32(), Some(first.base as i32));
    assert_eq!(first.len, 8);

    // The region survives the call.
    let stats = instance.scratch_stats().expect("stats");
    assert_eq!(stats.live_regions, 1);
    let bytes = instance.read_memory(first.base, first.len).expect("read");
    assert_eq!(bytes, b"seed-one");

    // The next producer call overwrites the slot and frees the old region.
    instance
        .invoke("setSeed", &[Arg::Seed(b"seed-two!".to_vec())])
        .expect("second set_seed failed");
    let second = instance
        .seed_region()
        .expect("instance loaded")
        .expect("seed rewritten");
    assert_ne!(second.base, first.base);
    let stats = instance.scratch_stats().expect("stats");
    assert_eq!(stats.live_regions, 1);
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.frees, 1);
}

// =============================================================================
// Resource limits and teardown
// =============================================================================

#[test]
fn test_stack_exhaustion() {
    let config = InstanceConfig::default().stack_size(128 * 1024);
    let sandbox = Sandbox::new(config).expect("sandbox");
    let mut instance = sandbox
        .load(
            RECURSE_WAT.as_bytes(),
            &[("recurse", "recurse")],
            HostCallbacks::new(),
        )
        .expect("load");

    assert_eq!(instance.stack_size(), 128 * 1024);
    match instance.invoke("recurse", &[]) {
        Err(BridgeError::StackExhausted) => {}
        other => panic!("expected StackExhausted, got {other:?}"),
    }
}

#[test]
fn test_fuel_metering() {
    let config = InstanceConfig::default().fuel_limit(1_000_000);
    let sandbox = Sandbox::new(config).expect("sandbox");
    let mut instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    let initial = instance.remaining_fuel().expect("fuel enabled");
    assert_eq!(initial, 1_000_000);

    let results = instance
        .invoke("add", &[Arg::I32(1), Arg::I32(2)])
        .expect("add call failed");
    assert_eq!(results[0].as_i32(), Some(3));

    let remaining = instance.remaining_fuel().expect("fuel enabled");
    assert!(remaining < initial, "fuel should have been consumed");
}

#[test]
fn test_unload_idempotent() {
    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(MATH_WAT.as_bytes(), &[("add", "add")], HostCallbacks::new())
        .expect("load");

    assert!(instance.is_loaded());
    instance.unload();
    assert!(!instance.is_loaded());

    // Second unload is a no-op, not an error.
    instance.unload();

    assert!(matches!(
        instance.invoke("add", &[Arg::I32(1), Arg::I32(2)]),
        Err(BridgeError::InstanceUnloaded)
    ));
}

// =============================================================================
// Host callbacks and re-entry
// =============================================================================

#[test]
fn test_callback_receives_and_returns_references() {
    let x = host("X");
    let y = host("Y");
    let saw_x = Arc::new(AtomicBool::new(false));

    let expected = x.clone();
    let replacement = y.clone();
    let saw = saw_x.clone();
    let callbacks = HostCallbacks::new()
        .define(
            "transform",
            &[ValueKind::Ref],
            &[ValueKind::Ref],
            move |_scope, args| {
                if let Some(incoming) = args[0].host_ref() {
                    saw.store(Arc::ptr_eq(incoming, &expected), Ordering::SeqCst);
                }
                Ok(vec![Value::Ref(replacement.clone())])
            },
        )
        .define(
            "compute",
            &[ValueKind::I32, ValueKind::I32],
            &[ValueKind::I32],
            |_scope, _args| Ok(vec![Value::I32(0)]),
        );

    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(CALLBACK_WAT.as_bytes(), &[("relay", "relay")], callbacks)
        .expect("load");

    let results = instance
        .invoke("relay", &[Arg::Ref(x.clone())])
        .expect("relay call failed");
    assert!(saw_x.load(Ordering::SeqCst), "callback must see X itself");
    let back = results[0].host_ref().expect("reference result");
    assert!(Arc::ptr_eq(&y, back), "result must be identity-equal to Y");

    // Both objects crossed the boundary and stay retained.
    assert_eq!(instance.live_handles(), 2);
}

#[test]
fn test_callback_reenters_sandbox() {
    // `outer` calls the host, and the host calls `add` back in the same
    // execution environment: ordinary nested call frames.
    let callbacks = HostCallbacks::new()
        .define(
            "compute",
            &[ValueKind::I32, ValueKind::I32],
            &[ValueKind::I32],
            |scope, args| {
                let nested = scope.invoke("add", &to_args(args))?;
                Ok(nested)
            },
        )
        .define(
            "transform",
            &[ValueKind::Ref],
            &[ValueKind::Ref],
            |_scope, args| Ok(vec![args[0].clone()]),
        );

    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(
            CALLBACK_WAT.as_bytes(),
            &[("outer", "outer"), ("add", "add")],
            callbacks,
        )
        .expect("load");

    let results = instance
        .invoke("outer", &[Arg::I32(2), Arg::I32(3)])
        .expect("outer call failed");
    assert_eq!(results[0].as_i32(), Some(5));
}

#[test]
fn test_callback_error_resurfaces_typed() {
    let callbacks = HostCallbacks::new()
        .define(
            "compute",
            &[ValueKind::I32, ValueKind::I32],
            &[ValueKind::I32],
            |_scope, _args| Err(BridgeError::UnknownHandle("injected".to_string())),
        )
        .define(
            "transform",
            &[ValueKind::Ref],
            &[ValueKind::Ref],
            |_scope, args| Ok(vec![args[0].clone()]),
        );

    let sandbox = Sandbox::new(InstanceConfig::default()).expect("sandbox");
    let mut instance = sandbox
        .load(CALLBACK_WAT.as_bytes(), &[("outer", "outer")], callbacks)
        .expect("load");

    match instance.invoke("outer", &[Arg::I32(1), Arg::I32(2)]) {
        Err(BridgeError::UnknownHandle(msg)) => assert!(msg.contains("injected")),
        other => panic!("expected UnknownHandle, got {other:?}"),
    }
}
