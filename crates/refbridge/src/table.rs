//! Slot management over the engine's externref table.
//!
//! The table itself is the engine's primitive; this module only installs,
//! fetches and clears slots. Slot indices are the bridge's integer handles,
//! and the table's elements are what keep bridge-minted externrefs rooted
//! between calls.

use std::any::Any;

use wasmtime::{AsContextMut, ExternRef, Ref, RefType, Rooted, StoreContext, Table, TableType};

use crate::error::{BridgeError, Result};

/// Payload minted into every bridge-created externref.
///
/// The token is a never-reused serial. Handles (table slots) can be reused
/// after a release, so resolution of a returned externref goes through the
/// token: a stale reference that survived slot reuse fails `UnknownHandle`
/// instead of aliasing the slot's new occupant.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BridgeToken {
    pub(crate) token: u64,
}

/// Create the instance's externref table.
pub(crate) fn new_table(
    mut ctx: impl AsContextMut,
    initial: u32,
    max: Option<u32>,
) -> Result<Table> {
    let ty = TableType::new(RefType::EXTERNREF, initial, max);
    Table::new(&mut ctx, ty, Ref::Extern(None))
        .map_err(|e| BridgeError::InstantiationFailed(format!("externref table: {e}")))
}

/// Mint a fresh externref carrying `token` and install it, reusing a freed
/// slot when one is available. Returns the slot and the rooted reference.
pub(crate) fn install(
    mut ctx: impl AsContextMut,
    table: Table,
    free_slot: Option<u32>,
    token: u64,
) -> Result<(u32, Rooted<ExternRef>)> {
    let reference = ExternRef::new(&mut ctx, BridgeToken { token })
        .map_err(|e| BridgeError::Memory(format!("externref allocation: {e}")))?;
    let slot = place(&mut ctx, table, free_slot, reference)?;
    Ok((slot, reference))
}

/// Install a sandbox-originated externref under a bridge slot, so the
/// adopted reference stays rooted and keeps one identity.
pub(crate) fn adopt(
    mut ctx: impl AsContextMut,
    table: Table,
    free_slot: Option<u32>,
    reference: Rooted<ExternRef>,
) -> Result<u32> {
    place(&mut ctx, table, free_slot, reference)
}

fn place(
    mut ctx: impl AsContextMut,
    table: Table,
    free_slot: Option<u32>,
    reference: Rooted<ExternRef>,
) -> Result<u32> {
    match free_slot {
        Some(slot) => {
            table
                .set(&mut ctx, slot.into(), Ref::Extern(Some(reference)))
                .map_err(|e| {
                    BridgeError::ConsistencyViolation(format!("externref slot {slot}: {e}"))
                })?;
            Ok(slot)
        }
        None => {
            let slot = table
                .grow(&mut ctx, 1, Ref::Extern(Some(reference)))
                .map_err(|e| BridgeError::Memory(format!("externref table full: {e}")))?;
            Ok(slot as u32)
        }
    }
}

/// Fetch the externref stored in a slot.
pub(crate) fn fetch(
    mut ctx: impl AsContextMut,
    table: Table,
    slot: u32,
) -> Result<Rooted<ExternRef>> {
    match table.get(&mut ctx, slot.into()) {
        Some(Ref::Extern(Some(reference))) => Ok(reference),
        _ => Err(BridgeError::UnknownHandle(slot.to_string())),
    }
}

/// Null out a slot after its entry was removed, releasing the engine-side
/// root.
pub(crate) fn clear(mut ctx: impl AsContextMut, table: Table, slot: u32) -> Result<()> {
    table
        .set(&mut ctx, slot.into(), Ref::Extern(None))
        .map_err(|e| BridgeError::ConsistencyViolation(format!("externref slot {slot}: {e}")))
}

/// Read the bridge token out of an externref payload, if it carries one.
/// `None` means the reference was not minted by this bridge.
pub(crate) fn token_of<'a, T: 'static>(
    store: impl Into<StoreContext<'a, T>>,
    reference: &Rooted<ExternRef>,
) -> Result<Option<u64>> {
    let data: Option<&(dyn Any + Send + Sync)> = reference
        .data(store)
        .map_err(|e| BridgeError::Memory(format!("externref payload: {e}")))?;
    Ok(data
        .and_then(|payload| payload.downcast_ref::<BridgeToken>())
        .map(|token| token.token))
}
