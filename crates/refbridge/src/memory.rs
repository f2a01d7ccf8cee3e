//! Scratch allocation inside sandbox linear memory.
//!
//! Buffer-shaped arguments travel through regions obtained from the guest's
//! own exported allocator (`alloc(size) -> ptr` / `dealloc(ptr, size)`), so
//! the guest's heap stays the single owner of its address space. The host
//! keeps its own accounting so tests and teardown can assert that no region
//! outlives the call that allocated it.

use std::collections::BTreeMap;

use tracing::trace;
use wasmtime::{AsContextMut, TypedFunc};

use crate::error::{BridgeError, Result};
use crate::instance::HostState;
use crate::value::ScratchRegion;

/// The guest's exported allocator entry points, resolved lazily at load.
///
/// A module that never takes buffer arguments need not export an allocator;
/// the first buffer-carrying call against such a module fails
/// `MissingExport`.
#[derive(Default, Clone)]
pub(crate) struct GuestAllocator {
    pub(crate) alloc: Option<TypedFunc<i32, i32>>,
    pub(crate) dealloc: Option<TypedFunc<(i32, i32), ()>>,
}

/// Host-side accounting of live scratch regions.
#[derive(Debug, Default)]
pub(crate) struct ScratchTracker {
    live: BTreeMap<u32, u32>,
    allocations: u64,
    frees: u64,
}

impl ScratchTracker {
    fn record_alloc(&mut self, region: ScratchRegion) {
        self.live.insert(region.base, region.len);
        self.allocations += 1;
    }

    fn record_free(&mut self, region: ScratchRegion) {
        self.live.remove(&region.base);
        self.frees += 1;
    }

    pub(crate) fn stats(&self) -> ScratchStats {
        ScratchStats {
            live_regions: self.live.len(),
            live_bytes: self.live.values().map(|&len| u64::from(len)).sum(),
            allocations: self.allocations,
            frees: self.frees,
        }
    }
}

/// Point-in-time allocator accounting, for leak assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchStats {
    /// Regions currently allocated (including the seed slot, if written)
    pub live_regions: usize,
    /// Bytes currently allocated
    pub live_bytes: u64,
    /// Cumulative allocation count
    pub allocations: u64,
    /// Cumulative free count
    pub frees: u64,
}

/// Allocate a scratch region through the guest allocator.
pub(crate) fn allocate(
    mut ctx: impl AsContextMut<Data = HostState>,
    len: u32,
) -> Result<ScratchRegion> {
    let alloc = ctx
        .as_context()
        .data()
        .allocator
        .alloc
        .clone()
        .ok_or_else(|| BridgeError::MissingExport("alloc".to_string()))?;
    let base = alloc
        .call(&mut ctx, len as i32)
        .map_err(|e| BridgeError::Memory(format!("guest alloc({len}) failed: {e}")))?;
    if base <= 0 {
        return Err(BridgeError::Memory(format!(
            "guest alloc({len}) returned null"
        )));
    }
    let region = ScratchRegion {
        base: base as u32,
        len,
    };
    ctx.as_context_mut().data_mut().scratch.record_alloc(region);
    trace!(base = region.base, len, "scratch region allocated");
    Ok(region)
}

/// Return a scratch region to the guest allocator.
pub(crate) fn free(
    mut ctx: impl AsContextMut<Data = HostState>,
    region: ScratchRegion,
) -> Result<()> {
    let dealloc = ctx
        .as_context()
        .data()
        .allocator
        .dealloc
        .clone()
        .ok_or_else(|| BridgeError::MissingExport("dealloc".to_string()))?;
    dealloc
        .call(&mut ctx, (region.base as i32, region.len as i32))
        .map_err(|e| BridgeError::Memory(format!("guest dealloc({}) failed: {e}", region.base)))?;
    ctx.as_context_mut().data_mut().scratch.record_free(region);
    trace!(base = region.base, len = region.len, "scratch region freed");
    Ok(())
}

/// Copy bytes into a scratch region.
pub(crate) fn write_region(
    ctx: impl AsContextMut<Data = HostState>,
    region: ScratchRegion,
    bytes: &[u8],
) -> Result<()> {
    if bytes.len() > region.len as usize {
        return Err(BridgeError::Memory(format!(
            "{} bytes do not fit a {}-byte region",
            bytes.len(),
            region.len
        )));
    }
    write(ctx, region.base, bytes)
}

/// Write bytes to linear memory at the given address.
pub(crate) fn write(
    mut ctx: impl AsContextMut<Data = HostState>,
    offset: u32,
    bytes: &[u8],
) -> Result<()> {
    let memory = exported_memory(&ctx)?;
    let data = memory.data_mut(&mut ctx);
    let offset = offset as usize;
    if offset + bytes.len() > data.len() {
        return Err(BridgeError::Memory(
            "memory write out of bounds".to_string(),
        ));
    }
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Read bytes from linear memory at the given address.
pub(crate) fn read(
    mut ctx: impl AsContextMut<Data = HostState>,
    offset: u32,
    len: u32,
) -> Result<Vec<u8>> {
    let memory = exported_memory(&ctx)?;
    let data = memory.data(&mut ctx);
    let offset = offset as usize;
    let len = len as usize;
    if offset + len > data.len() {
        return Err(BridgeError::Memory("memory read out of bounds".to_string()));
    }
    Ok(data[offset..offset + len].to_vec())
}

fn exported_memory(ctx: &impl AsContextMut<Data = HostState>) -> Result<wasmtime::Memory> {
    ctx.as_context()
        .data()
        .memory
        .ok_or_else(|| BridgeError::MissingExport("memory".to_string()))
}
