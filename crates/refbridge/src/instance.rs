//! Module instance lifecycle: load, call dispatch entry points, teardown.
//!
//! One [`Sandbox`] owns the engine and configuration; each [`load`] produces
//! a [`ModuleInstance`] holding the compiled module, the instantiated
//! module with its execution environment (the store), the placeholder
//! function table, the externref table, and the persistent seed slot.
//! Exactly one call executes inside an instance at a time; `invoke` takes
//! `&mut self`, and the only nested entry point is a host callback's
//! `Caller`, which is the same borrow on the same logical thread.
//!
//! [`load`]: Sandbox::load

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use wasmtime::{
    AsContext, Caller, Config, Engine, ExternRef, ExternType, Func, FuncType, Instance, Linker,
    Memory, Module, OptLevel, RootScope, Rooted, Store, StoreLimits, StoreLimitsBuilder, Table,
};

use crate::config::InstanceConfig;
use crate::dispatch;
use crate::error::{BridgeError, Result};
use crate::identity::IdentityBridge;
use crate::memory::{self, GuestAllocator, ScratchStats, ScratchTracker};
use crate::table;
use crate::value::{Arg, HostValue, ScratchRegion, Value, ValueKind};

/// Import module namespace under which host functions are visible to the
/// guest.
pub const HOST_MODULE: &str = "host";

/// Name of the built-in release-notification import: the guest calls
/// `host.ref_drop(externref)` when it drops a reference, standing in for an
/// engine-side externref finalizer.
pub const REF_DROP: &str = "ref_drop";

/// Store payload: everything a call needs, reachable both from the instance
/// (top-level calls) and from a `Caller` (re-entrant host callbacks).
pub(crate) struct HostState {
    pub(crate) limits: StoreLimits,
    pub(crate) bridge: Arc<IdentityBridge>,
    pub(crate) refs: Option<Table>,
    pub(crate) functions: HashMap<String, Func>,
    pub(crate) memory: Option<Memory>,
    pub(crate) allocator: GuestAllocator,
    pub(crate) scratch: ScratchTracker,
    pub(crate) seed: Option<ScratchRegion>,
}

/// Signature summary of a bound export, as reported by
/// [`ModuleInstance::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Placeholder name the function was bound under
    pub name: String,
    /// Parameter types, human-readable
    pub params: Vec<String>,
    /// Result types, human-readable
    pub results: Vec<String>,
}

/// Context handed to host callbacks.
///
/// A callback may call back into the sandbox through [`invoke`]; that is an
/// ordinary nested call frame on the current call's thread, not a
/// concurrent invocation.
///
/// [`invoke`]: HostScope::invoke
pub struct HostScope<'a, 'c> {
    caller: &'a mut Caller<'c, HostState>,
}

impl HostScope<'_, '_> {
    /// Invoke a bound sandbox function from inside a callback.
    pub fn invoke(&mut self, name: &str, args: &[Arg]) -> Result<Vec<Value>> {
        dispatch::invoke_on(&mut *self.caller, name, args)
    }

    /// The current persistent seed region, if a producer call wrote one.
    pub fn seed_region(&self) -> Option<ScratchRegion> {
        self.caller.data().seed
    }

    /// Read bytes from sandbox linear memory.
    pub fn read_memory(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        memory::read(&mut *self.caller, offset, len)
    }
}

type CallbackHandler = dyn Fn(&mut HostScope<'_, '_>, &[Value]) -> Result<Vec<Value>> + Send + Sync;

struct CallbackDef {
    name: String,
    params: Vec<ValueKind>,
    results: Vec<ValueKind>,
    handler: Arc<CallbackHandler>,
}

/// Host functions the guest may import from the `host` module, declared
/// before load. The built-in `ref_drop` import is always present.
#[derive(Default)]
pub struct HostCallbacks {
    defs: Vec<CallbackDef>,
}

impl HostCallbacks {
    /// No callbacks beyond the built-in release notification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one host function with its wasm-level signature.
    pub fn define(
        mut self,
        name: impl Into<String>,
        params: &[ValueKind],
        results: &[ValueKind],
        handler: impl Fn(&mut HostScope<'_, '_>, &[Value]) -> Result<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.defs.push(CallbackDef {
            name: name.into(),
            params: params.to_vec(),
            results: results.to_vec(),
            handler: Arc::new(handler),
        });
        self
    }
}

/// The load factory: engine plus instance configuration.
pub struct Sandbox {
    engine: Engine,
    config: InstanceConfig,
}

impl Sandbox {
    /// Create a sandbox with the given configuration.
    pub fn new(config: InstanceConfig) -> Result<Self> {
        let mut engine_config = Config::new();
        engine_config.wasm_reference_types(true);
        engine_config.max_wasm_stack(config.stack_size);
        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });
        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::InstantiationFailed(format!("engine creation failed: {e}")))?;

        Ok(Self { engine, config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Compile and instantiate a module.
    ///
    /// `bindings` maps each placeholder name the host intends to call to the
    /// export implementing it; every binding is resolved here so a missing
    /// export fails at load, not at first use. On any failure all
    /// partially-created resources are dropped before returning.
    pub fn load(
        &self,
        bytes: &[u8],
        bindings: &[(&str, &str)],
        callbacks: HostCallbacks,
    ) -> Result<ModuleInstance> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BridgeError::InstantiationFailed(format!("module rejected: {e}")))?;

        let bridge = Arc::new(IdentityBridge::new());
        let state = HostState {
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.heap_size)
                .build(),
            bridge: bridge.clone(),
            refs: None,
            functions: HashMap::new(),
            memory: None,
            allocator: GuestAllocator::default(),
            scratch: ScratchTracker::default(),
            seed: None,
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::InstantiationFailed(format!("fuel setup failed: {e}")))?;
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        register_ref_drop(&mut linker)?;
        for def in callbacks.defs {
            register_callback(&mut linker, &self.engine, def)?;
        }

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| BridgeError::InstantiationFailed(format!("instantiation failed: {e}")))?;

        let refs = table::new_table(
            &mut store,
            self.config.ref_table_capacity,
            self.config.ref_table_max,
        )?;

        let memory = instance.get_memory(&mut store, "memory");
        let allocator = GuestAllocator {
            alloc: instance.get_typed_func::<i32, i32>(&mut store, "alloc").ok(),
            dealloc: instance
                .get_typed_func::<(i32, i32), ()>(&mut store, "dealloc")
                .ok(),
        };

        let mut functions = HashMap::with_capacity(bindings.len());
        for (name, export) in bindings {
            let func = instance.get_func(&mut store, export).ok_or_else(|| {
                BridgeError::MissingExport(format!("{export} (bound as {name})"))
            })?;
            if functions.insert((*name).to_string(), func).is_some() {
                return Err(BridgeError::InstantiationFailed(format!(
                    "duplicate placeholder name {name}"
                )));
            }
        }

        let state = store.data_mut();
        state.refs = Some(refs);
        state.memory = memory;
        state.allocator = allocator;
        state.functions = functions;

        debug!(
            functions = bindings.len(),
            stack_size = self.config.stack_size,
            heap_size = self.config.heap_size,
            "module instance loaded"
        );
        Ok(ModuleInstance {
            core: Some(InstanceCore {
                store,
                instance,
                module,
            }),
            bridge,
            config: self.config.clone(),
        })
    }
}

/// One loaded and instantiated sandbox module.
pub struct ModuleInstance {
    core: Option<InstanceCore>,
    bridge: Arc<IdentityBridge>,
    config: InstanceConfig,
}

/// Field order is teardown order: the store (execution environment and
/// instance) must be destroyed before the compiled module.
struct InstanceCore {
    store: Store<HostState>,
    #[allow(dead_code)]
    instance: Instance,
    module: Module,
}

impl ModuleInstance {
    fn core(&self) -> Result<&InstanceCore> {
        self.core.as_ref().ok_or(BridgeError::InstanceUnloaded)
    }

    fn core_mut(&mut self) -> Result<&mut InstanceCore> {
        self.core.as_mut().ok_or(BridgeError::InstanceUnloaded)
    }

    /// Invoke a bound function with marshaled arguments.
    pub fn invoke(&mut self, name: &str, args: &[Arg]) -> Result<Vec<Value>> {
        let core = self.core_mut()?;
        dispatch::invoke_on(&mut core.store, name, args)
    }

    /// Register a host object with the bridge outside any call, returning
    /// its externref handle. Idempotent under identity.
    pub fn register(&mut self, value: &HostValue) -> Result<u32> {
        let core = self.core_mut()?;
        // The scope bounds the temporary root; the table keeps the externref
        // alive.
        let mut scope = RootScope::new(&mut core.store);
        let (handle, _) = dispatch::register_object(&mut scope, value, false)?;
        Ok(handle)
    }

    /// Resolve an externref handle back to its host object.
    pub fn resolve(&self, handle: u32) -> Result<HostValue> {
        self.core()?;
        self.bridge.resolve(handle)
    }

    /// Release notification from the embedder side: the sandbox engine
    /// reports the externref dropped. Removal is deferred while a call is
    /// in flight.
    pub fn release(&mut self, handle: u32) -> Result<()> {
        let core = self.core_mut()?;
        core.store.data().bridge.release(handle)?;
        dispatch::drain_pending(&mut core.store)
    }

    /// Signature of a bound function; `UnknownFunction` if the placeholder
    /// was never bound at load time.
    pub fn lookup(&self, name: &str) -> Result<FunctionInfo> {
        let core = self.core()?;
        let func = core
            .store
            .data()
            .functions
            .get(name)
            .ok_or_else(|| BridgeError::UnknownFunction(name.to_string()))?;
        let ty: FuncType = func.ty(core.store.as_context());
        Ok(FunctionInfo {
            name: name.to_string(),
            params: ty.params().map(|t| dispatch::val_type_name(&t)).collect(),
            results: ty.results().map(|t| dispatch::val_type_name(&t)).collect(),
        })
    }

    /// Names of all functions the module exports (bound or not).
    pub fn exported_functions(&self) -> Result<Vec<String>> {
        let core = self.core()?;
        Ok(core
            .module
            .exports()
            .filter(|e| matches!(e.ty(), ExternType::Func(_)))
            .map(|e| e.name().to_string())
            .collect())
    }

    /// Read bytes from sandbox linear memory.
    pub fn read_memory(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let core = self.core_mut()?;
        memory::read(&mut core.store, offset, len)
    }

    /// Write bytes to sandbox linear memory.
    pub fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let core = self.core_mut()?;
        memory::write(&mut core.store, offset, bytes)
    }

    /// The persistent seed region, if a producer call wrote one. Valid until
    /// the next `Seed` argument overwrites it or the instance unloads.
    pub fn seed_region(&self) -> Result<Option<ScratchRegion>> {
        Ok(self.core()?.store.data().seed)
    }

    /// Allocator accounting snapshot.
    pub fn scratch_stats(&self) -> Result<ScratchStats> {
        Ok(self.core()?.store.data().scratch.stats())
    }

    /// Number of live externref handles.
    pub fn live_handles(&self) -> usize {
        self.bridge.live_handles()
    }

    /// Remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.core.as_ref()?.store.get_fuel().ok()
    }

    /// The stack budget fixed at instantiation.
    pub fn stack_size(&self) -> usize {
        self.config.stack_size
    }

    /// The linear memory limit fixed at instantiation.
    pub fn heap_size(&self) -> usize {
        self.config.heap_size
    }

    /// Whether the instance still holds its module.
    pub fn is_loaded(&self) -> bool {
        self.core.is_some()
    }

    /// Tear down the instance: execution environment, then instance, then
    /// module. Idempotent; a second call is a no-op.
    pub fn unload(&mut self) {
        match self.core.take() {
            Some(core) => {
                debug!("module instance unloaded");
                drop(core);
            }
            None => trace!("unload on already-unloaded instance"),
        }
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        self.unload();
    }
}

fn register_ref_drop(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            REF_DROP,
            |mut caller: Caller<'_, HostState>,
             reference: Option<Rooted<ExternRef>>|
             -> wasmtime::Result<()> {
                let Some(reference) = reference else {
                    warn!("release notification for null externref ignored");
                    return Ok(());
                };
                let token = table::token_of(caller.as_context(), &reference)?;
                let Some(token) = token else {
                    return Err(BridgeError::UnknownHandle(
                        "release of a foreign externref".to_string(),
                    )
                    .into());
                };
                let bridge = caller.data().bridge.clone();
                let (handle, _) = bridge.resolve_token(token)?;
                trace!(handle, "sandbox dropped externref");
                bridge.release(handle)?;
                dispatch::drain_pending(&mut caller)?;
                Ok(())
            },
        )
        .map_err(|e| BridgeError::InstantiationFailed(format!("host function ref_drop: {e}")))?;
    Ok(())
}

fn register_callback(
    linker: &mut Linker<HostState>,
    engine: &Engine,
    def: CallbackDef,
) -> Result<()> {
    let ty = FuncType::new(
        engine,
        def.params.iter().map(|&k| dispatch::val_type(k)),
        def.results.iter().map(|&k| dispatch::val_type(k)),
    );
    let handler = def.handler;
    let name = def.name.clone();
    linker
        .func_new(
            HOST_MODULE,
            &def.name,
            ty,
            move |mut caller: Caller<'_, HostState>, params, results| {
                let args = dispatch::lift_values(&mut caller, params)?;
                let mut scope = HostScope {
                    caller: &mut caller,
                };
                let out = handler(&mut scope, &args)?;
                dispatch::lower_values(&mut caller, &out, results)?;
                Ok(())
            },
        )
        .map_err(|e| BridgeError::InstantiationFailed(format!("host function {name}: {e}")))?;
    Ok(())
}
