//! # refbridge
//!
//! Cross-runtime object bridge between a garbage-collected host environment
//! and a sandboxed WebAssembly module.
//!
//! A host application needs to hold references into, and be held onto by, a
//! wasm module with its own linear memory and lifetime rules. This crate is
//! the lifetime and identity layer that makes that safe: a bijection between
//! host object identity and externref handles, retention bookkeeping so
//! neither side frees what the other still needs, and call marshaling that
//! cleans up scratch memory and in-flight pins on every exit path.
//!
//! ## Structure
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Identity bridge | `identity` | host object ⇄ externref handle bijection, retention |
//! | Externref table | `table` | slot install/fetch/clear over the engine's table |
//! | Allocator adapter | `memory` | scratch regions via the guest's exported allocator |
//! | Instance manager | `instance` | load, function table, seed slot, teardown |
//! | Call dispatcher | `dispatch` | marshaling, scoped retain/release, trap conversion |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use refbridge::{Arg, HostCallbacks, InstanceConfig, Sandbox};
//! use std::sync::Arc;
//!
//! let sandbox = Sandbox::new(InstanceConfig::default())?;
//! let mut instance = sandbox.load(wasm_bytes, &[("add", "add")], HostCallbacks::new())?;
//!
//! // Scalars pass by value, host objects by externref handle.
//! let sum = instance.invoke("add", &[Arg::I32(2), Arg::I32(3)])?;
//!
//! let payload: refbridge::HostValue = Arc::new("held by the sandbox".to_string());
//! let echoed = instance.invoke("keep", &[Arg::Ref(payload.clone())])?;
//! ```
//!
//! ## Lifetime rules
//!
//! - Registering the same host object twice yields the same handle.
//! - The bridge holds a strong reference to every registered object until
//!   the sandbox signals the drop through `host.ref_drop` (or the embedder
//!   calls `release`), *and* no in-flight call still uses the handle.
//! - A release notification arriving from a re-entrant callback while the
//!   handle is pinned by an outer call defers removal until that call
//!   completes.
//! - Resolving a handle that was never registered, or whose entry is gone,
//!   fails with `UnknownHandle`; it is never silently tolerated.
//! - A broken bijection poisons the instance: the current call fails with
//!   `ConsistencyViolation` and the instance stays untrusted.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;

mod dispatch;
mod identity;
mod instance;
mod memory;
mod table;
mod value;

// Re-export main types
pub use config::InstanceConfig;
pub use error::{BridgeError, Result};
pub use instance::{
    FunctionInfo, HostCallbacks, HostScope, ModuleInstance, Sandbox, HOST_MODULE, REF_DROP,
};
pub use memory::ScratchStats;
pub use value::{Arg, HostValue, OpaqueSandboxRef, ScratchRegion, Value, ValueKind};
