//! Call marshaling between tagged host values and sandbox invocations.
//!
//! Everything here is written against `AsContextMut<Data = HostState>`, so
//! the same pipeline serves a top-level `ModuleInstance::invoke` (the
//! store) and a re-entrant call made from inside a host callback (the
//! `Caller`). Re-entrancy is ordinary nested call frames on one logical
//! thread of control, never concurrent execution.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use wasmtime::{
    AsContext, AsContextMut, ExternRef, Func, FuncType, HeapType, RootScope, Rooted, Table, Trap,
    Val, ValType,
};

use crate::error::{BridgeError, Result};
use crate::identity::IdentityBridge;
use crate::instance::HostState;
use crate::memory;
use crate::table;
use crate::value::{Arg, HostValue, OpaqueSandboxRef, ScratchRegion, Value, ValueKind};

/// Invoke a bound function with marshaled arguments.
///
/// Function resolution happens before anything is allocated, so an unknown
/// name cannot leak scratch. Scratch regions, the call frame's pins, and
/// pending externref slot clears are all drained on every exit path,
/// including traps.
pub(crate) fn invoke_on<C>(mut ctx: C, name: &str, args: &[Arg]) -> Result<Vec<Value>>
where
    C: AsContextMut<Data = HostState>,
{
    let bridge = ctx.as_context().data().bridge.clone();
    bridge.check()?;
    let func = ctx
        .as_context()
        .data()
        .functions
        .get(name)
        .copied()
        .ok_or_else(|| BridgeError::UnknownFunction(name.to_string()))?;
    trace!(name, args = args.len(), "invoking sandbox function");

    let frame = bridge.begin_call();
    let mut scratch = Vec::new();
    let outcome = run_call(&mut ctx, func, args, &mut scratch);

    // Unconditional cleanup: scratch first, then the frame (whose pins may
    // be the only thing deferring removals), then the physical slot clears
    // those removals queued.
    let freed = free_scratch(&mut ctx, &scratch);
    drop(frame);
    let drained = drain_pending(&mut ctx);

    let values = outcome?;
    freed?;
    drained?;
    Ok(values)
}

fn run_call<C>(
    ctx: &mut C,
    func: Func,
    args: &[Arg],
    scratch: &mut Vec<ScratchRegion>,
) -> Result<Vec<Value>>
where
    C: AsContextMut<Data = HostState>,
{
    let ty = func.ty(ctx.as_context());

    // The scope bounds the GC roots created while marshaling; results are
    // lifted to plain host values before it closes.
    let mut scope = RootScope::new(&mut *ctx);
    let mut params = Vec::with_capacity(args.len());
    lower_args(&mut scope, args, scratch, &mut params)?;
    check_signature(&ty, &params)?;

    let mut results = vec![Val::I32(0); ty.results().len()];
    match func.call(&mut scope, &params, &mut results) {
        Ok(()) => lift_values(&mut scope, &results),
        Err(err) => Err(convert_trap(err)),
    }
}

/// Register a host object, returning its handle and the rooted externref
/// stored in the table. Idempotent under identity: a second registration of
/// the same allocation returns the existing handle.
pub(crate) fn register_object(
    mut ctx: impl AsContextMut<Data = HostState>,
    value: &HostValue,
    pin: bool,
) -> Result<(u32, Rooted<ExternRef>)> {
    let (bridge, refs) = state_handles(&ctx)?;
    if let Some(handle) = bridge.existing_handle(value)? {
        if pin {
            bridge.pin(handle)?;
        }
        let reference = table::fetch(&mut ctx, refs, handle)?;
        return Ok((handle, reference));
    }

    let (token, free_slot) = bridge.begin_register()?;
    let (handle, reference) = match table::install(&mut ctx, refs, free_slot, token) {
        Ok(installed) => installed,
        Err(err) => {
            bridge.abandon_register(free_slot);
            return Err(err);
        }
    };
    bridge.commit_register(value, handle, token)?;
    if pin {
        bridge.pin(handle)?;
    }
    trace!(handle, "registered host object");
    Ok((handle, reference))
}

/// Clear the table slots of entries removed since the last drain and make
/// them reusable.
pub(crate) fn drain_pending(mut ctx: impl AsContextMut<Data = HostState>) -> Result<()> {
    let (bridge, refs) = state_handles(&ctx)?;
    for slot in bridge.take_pending_clears() {
        table::clear(&mut ctx, refs, slot)?;
        bridge.recycle(slot);
        trace!(handle = slot, "externref slot cleared");
    }
    Ok(())
}

/// Lift raw sandbox values into tagged host values (call results and the
/// arguments handed to host callbacks).
pub(crate) fn lift_values(
    mut ctx: impl AsContextMut<Data = HostState>,
    vals: &[Val],
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(vals.len());
    for val in vals {
        out.push(match val {
            Val::I32(v) => Value::I32(*v),
            Val::I64(v) => Value::I64(*v),
            Val::F32(bits) => Value::F32(f32::from_bits(*bits)),
            Val::F64(bits) => Value::F64(f64::from_bits(*bits)),
            Val::ExternRef(None) => Value::NullRef,
            Val::ExternRef(Some(reference)) => Value::Ref(lift_ref(&mut ctx, *reference)?),
            _ => {
                return Err(BridgeError::TypeMismatch(
                    "unsupported sandbox value (funcref or v128)".to_string(),
                ))
            }
        });
    }
    Ok(out)
}

/// Lower tagged host values into the raw result slots of a host callback.
pub(crate) fn lower_values(
    mut ctx: impl AsContextMut<Data = HostState>,
    values: &[Value],
    out: &mut [Val],
) -> Result<()> {
    if values.len() != out.len() {
        return Err(BridgeError::TypeMismatch(format!(
            "host callback produced {} results, signature expects {}",
            values.len(),
            out.len()
        )));
    }
    for (value, slot) in values.iter().zip(out.iter_mut()) {
        *slot = match value {
            Value::I32(v) => Val::I32(*v),
            Value::I64(v) => Val::I64(*v),
            Value::F32(v) => Val::F32(v.to_bits()),
            Value::F64(v) => Val::F64(v.to_bits()),
            Value::Ref(object) => {
                let (_, reference) = register_object(&mut ctx, object, true)?;
                Val::ExternRef(Some(reference))
            }
            Value::NullRef => Val::null_extern_ref(),
        };
    }
    Ok(())
}

fn lower_args(
    mut ctx: impl AsContextMut<Data = HostState>,
    args: &[Arg],
    scratch: &mut Vec<ScratchRegion>,
    out: &mut Vec<Val>,
) -> Result<()> {
    for arg in args {
        match arg {
            Arg::I32(v) => out.push(Val::I32(*v)),
            Arg::I64(v) => out.push(Val::I64(*v)),
            Arg::F32(v) => out.push(Val::F32(v.to_bits())),
            Arg::F64(v) => out.push(Val::F64(v.to_bits())),
            Arg::Ref(value) => {
                let (_, reference) = register_object(&mut ctx, value, true)?;
                out.push(Val::ExternRef(Some(reference)));
            }
            Arg::NullRef => out.push(Val::null_extern_ref()),
            Arg::Bytes(bytes) => {
                let region = memory::allocate(&mut ctx, bytes.len() as u32)?;
                // Tracked before the write so a failing write still frees it.
                scratch.push(region);
                memory::write_region(&mut ctx, region, bytes)?;
                out.push(Val::I32(region.base as i32));
                out.push(Val::I32(region.len as i32));
            }
            Arg::Seed(bytes) => {
                let region = write_seed(&mut ctx, bytes)?;
                out.push(Val::I32(region.base as i32));
                out.push(Val::I32(region.len as i32));
            }
        }
    }
    Ok(())
}

/// Resolve a returned externref to its host object.
fn lift_ref(
    mut ctx: impl AsContextMut<Data = HostState>,
    reference: Rooted<ExternRef>,
) -> Result<HostValue> {
    let (bridge, refs) = state_handles(&ctx)?;
    if let Some(token) = table::token_of(ctx.as_context(), &reference)? {
        let (handle, object) = bridge.resolve_token(token)?;
        trace!(handle, "resolved returned externref");
        return Ok(object);
    }

    // The sandbox produced a reference this bridge never minted. Wrap it on
    // first sight: adopt the reference under a fresh opaque host identity,
    // so later sightings map back to the same wrapper.
    if let Some(object) = find_adopted(&mut ctx, &bridge, refs, &reference)? {
        return Ok(object);
    }
    let wrapper: HostValue = Arc::new(OpaqueSandboxRef);
    let (token, free_slot) = bridge.begin_register()?;
    let handle = match table::adopt(&mut ctx, refs, free_slot, reference) {
        Ok(slot) => slot,
        Err(err) => {
            bridge.abandon_register(free_slot);
            return Err(err);
        }
    };
    bridge.commit_register(&wrapper, handle, token)?;
    debug!(handle, "adopted sandbox-originated reference");
    Ok(wrapper)
}

/// Scan live slots for an already-adopted reference identical to `needle`.
/// Adopted references carry no bridge token, so identity goes through the
/// engine's reference equality.
fn find_adopted<C>(
    ctx: &mut C,
    bridge: &IdentityBridge,
    refs: Table,
    needle: &Rooted<ExternRef>,
) -> Result<Option<HostValue>>
where
    C: AsContextMut<Data = HostState>,
{
    for handle in bridge.handles() {
        let Ok(candidate) = table::fetch(&mut *ctx, refs, handle) else {
            continue;
        };
        let same = Rooted::ref_eq(ctx.as_context(), needle, &candidate)
            .map_err(|e| BridgeError::Memory(format!("externref compare: {e}")))?;
        if same {
            return Ok(Some(bridge.resolve(handle)?));
        }
    }
    Ok(None)
}

/// Write the persistent seed slot, freeing the previous region. The new
/// region survives the call and is dropped only at teardown or the next
/// overwrite.
fn write_seed(
    ctx: &mut impl AsContextMut<Data = HostState>,
    bytes: &[u8],
) -> Result<ScratchRegion> {
    if let Some(previous) = ctx.as_context_mut().data_mut().seed.take() {
        memory::free(&mut *ctx, previous)?;
    }
    let region = memory::allocate(&mut *ctx, bytes.len() as u32)?;
    memory::write_region(&mut *ctx, region, bytes)?;
    ctx.as_context_mut().data_mut().seed = Some(region);
    trace!(base = region.base, len = region.len, "seed slot overwritten");
    Ok(region)
}

fn free_scratch(
    ctx: &mut impl AsContextMut<Data = HostState>,
    regions: &[ScratchRegion],
) -> Result<()> {
    let mut first_err = None;
    for region in regions {
        if let Err(err) = memory::free(&mut *ctx, *region) {
            warn!(base = region.base, %err, "scratch region leaked");
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn state_handles(
    ctx: &impl AsContextMut<Data = HostState>,
) -> Result<(Arc<IdentityBridge>, Table)> {
    let state = ctx.as_context().data();
    let refs = state
        .refs
        .ok_or_else(|| BridgeError::ConsistencyViolation("externref table missing".to_string()))?;
    Ok((state.bridge.clone(), refs))
}

fn check_signature(ty: &FuncType, params: &[Val]) -> Result<()> {
    if ty.params().len() != params.len() {
        return Err(BridgeError::TypeMismatch(format!(
            "export takes {} parameters, {} were marshaled",
            ty.params().len(),
            params.len()
        )));
    }
    for (i, (expected, actual)) in ty.params().zip(params.iter()).enumerate() {
        if !val_matches(&expected, actual) {
            return Err(BridgeError::TypeMismatch(format!(
                "parameter {i}: export expects {}",
                val_type_name(&expected)
            )));
        }
    }
    Ok(())
}

fn val_matches(ty: &ValType, val: &Val) -> bool {
    match (ty, val) {
        (ValType::I32, Val::I32(_)) => true,
        (ValType::I64, Val::I64(_)) => true,
        (ValType::F32, Val::F32(_)) => true,
        (ValType::F64, Val::F64(_)) => true,
        (ValType::Ref(r), Val::ExternRef(_)) => {
            matches!(r.heap_type(), HeapType::Extern | HeapType::NoExtern)
        }
        _ => false,
    }
}

/// Human-readable name for a wasm value type.
pub(crate) fn val_type_name(ty: &ValType) -> String {
    match ty {
        ValType::I32 => "i32".to_string(),
        ValType::I64 => "i64".to_string(),
        ValType::F32 => "f32".to_string(),
        ValType::F64 => "f64".to_string(),
        ValType::V128 => "v128".to_string(),
        ValType::Ref(r) => match r.heap_type() {
            HeapType::Func | HeapType::ConcreteFunc(_) | HeapType::NoFunc => "funcref".to_string(),
            HeapType::Extern | HeapType::NoExtern => "externref".to_string(),
            other => format!("ref:{other:?}"),
        },
    }
}

/// Map a `ValueKind` declaration to the engine type.
pub(crate) fn val_type(kind: ValueKind) -> ValType {
    match kind {
        ValueKind::I32 => ValType::I32,
        ValueKind::I64 => ValType::I64,
        ValueKind::F32 => ValType::F32,
        ValueKind::F64 => ValType::F64,
        ValueKind::Ref => ValType::EXTERNREF,
    }
}

/// Convert an engine-side call failure into a typed bridge error. A host
/// callback's `BridgeError` resurfaces as itself; a wasm trap never
/// propagates as a native fault.
fn convert_trap(err: wasmtime::Error) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(bridge_err) => bridge_err,
        Err(err) => match err.downcast_ref::<Trap>() {
            Some(Trap::StackOverflow) => BridgeError::StackExhausted,
            Some(trap) => BridgeError::SandboxTrap(trap.to_string()),
            None => BridgeError::SandboxTrap(err.to_string()),
        },
    }
}
