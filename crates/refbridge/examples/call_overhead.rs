//! Bridge call-overhead measurements.
//!
//! Run with: cargo run -p refbridge --example call_overhead --release

use std::sync::Arc;
use std::time::Instant;

use refbridge::{Arg, HostCallbacks, HostValue, InstanceConfig, Sandbox};

const GUEST_WAT: &str = r#"
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
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)
  (func (export "keep") (param externref) (result externref)
    local.get 0)
  (func (export "first_byte") (param i32 i32) (result i32)
    local.get 0
    i32.load8_u))
"#;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Bridge Call Overhead ===\n");

    let sandbox = Sandbox::new(InstanceConfig::default()).expect("failed to create sandbox");
    let mut instance = sandbox
        .load(
            GUEST_WAT.as_bytes(),
            &[
                ("add", "add"),
                ("keep", "keep"),
                ("firstByte", "first_byte"),
            ],
            HostCallbacks::new(),
        )
        .expect("failed to load module");

    // Warm up
    for _ in 0..100 {
        let _ = instance.invoke("add", &[Arg::I32(1), Arg::I32(1)]);
    }

    println!("## Scalar call");
    let mut times = Vec::new();
    for i in 0..1000 {
        let start = Instant::now();
        let results = instance
            .invoke("add", &[Arg::I32(i), Arg::I32(i)])
            .expect("add call failed");
        times.push(start.elapsed().as_nanos() as u64);
        assert_eq!(results[0].as_i32(), Some(i * 2));
    }
    print_stats("add(i32,i32)", &times);

    println!("\n## Externref round trip (same object, existing handle)");
    let payload: HostValue = Arc::new("benchmark payload".to_string());
    let mut times = Vec::new();
    for _ in 0..1000 {
        let start = Instant::now();
        let results = instance
            .invoke("keep", &[Arg::Ref(payload.clone())])
            .expect("keep call failed");
        times.push(start.elapsed().as_nanos() as u64);
        assert!(results[0].host_ref().is_some());
    }
    print_stats("keep(externref)", &times);
    println!("live handles after 1000 round trips: {}", instance.live_handles());

    println!("\n## Buffer call (64-byte scratch region per call)");
    let bytes = vec![7u8; 64];
    let mut times = Vec::new();
    for _ in 0..1000 {
        let start = Instant::now();
        let results = instance
            .invoke("firstByte", &[Arg::Bytes(bytes.clone())])
            .expect("first_byte call failed");
        times.push(start.elapsed().as_nanos() as u64);
        assert_eq!(results[0].as_i32(), Some(7));
    }
    print_stats("first_byte(ptr,len)", &times);
    let stats = instance.scratch_stats().expect("stats");
    println!(
        "scratch accounting: {} allocations, {} frees, {} live",
        stats.allocations, stats.frees, stats.live_regions
    );

    println!("\n=== Done ===");
}

fn print_stats(name: &str, times: &[u64]) {
    let mut sorted = times.to_vec();
    sorted.sort();
    let mean = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    let p50 = sorted[sorted.len() / 2];
    let p99 = sorted[sorted.len() * 99 / 100];
    println!(
        "{}: n={} mean={:.0}ns p50={}ns p99={}ns max={}ns",
        name,
        sorted.len(),
        mean,
        p50,
        p99,
        sorted[sorted.len() - 1]
    );
}
