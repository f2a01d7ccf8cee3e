//! The identity bridge: bidirectional mapping between host object identity
//! and externref handles, with retention bookkeeping.
//!
//! This is pure bookkeeping with no engine types in it. Handles are slot
//! indices into the instance's externref table; installing, fetching and
//! clearing the slots themselves happens in [`crate::table`], driven by the
//! dispatcher, because those operations need the store.
//!
//! Invariant: `hostObjectIdentity -> handle` is a bijection at any instant.
//! No host object maps to two live handles and no live handle maps to two
//! host objects. A detected violation poisons the bridge; every subsequent
//! operation fails with `ConsistencyViolation`.
//!
//! Retention: an entry holds a strong [`HostValue`] clone for its entire
//! life, so the host collector cannot reclaim an object the sandbox can
//! still reach. A release notification sets the `released` flag; the entry
//! is physically removed only once no in-flight call pins it, whichever
//! comes later.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::value::{HostValue, ObjectId};

/// One registered host object.
struct HandleEntry {
    object: HostValue,
    id: ObjectId,
    token: u64,
    /// In-flight reference count; nonzero defers physical removal.
    pins: u32,
    /// The sandbox has signalled it dropped the reference.
    released: bool,
}

#[derive(Default)]
struct BridgeState {
    by_object: HashMap<ObjectId, u32>,
    by_handle: HashMap<u32, HandleEntry>,
    by_token: HashMap<u64, u32>,
    /// One inner Vec per in-flight call; handles pinned by that call.
    frames: Vec<Vec<u32>>,
    /// Table slots cleared and ready for reuse.
    free_slots: Vec<u32>,
    /// Slots of removed entries awaiting a physical table clear.
    pending_clear: Vec<u32>,
    next_token: u64,
    poisoned: Option<String>,
}

/// The bijection table plus retention bookkeeping, under one lock.
///
/// The lock is held only for the duration of a table mutation, never across
/// a sandbox call, so release notifications arriving from re-entrant host
/// callbacks cannot deadlock against an in-progress marshal.
pub(crate) struct IdentityBridge {
    state: Mutex<BridgeState>,
}

/// RAII scope for one sandbox call. Every handle marshaled for the call is
/// pinned onto this frame; dropping the frame unpins them and removes any
/// entry whose release was deferred while the call was in flight.
pub(crate) struct CallFrame<'a> {
    bridge: &'a IdentityBridge,
}

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        self.bridge.end_call();
    }
}

impl IdentityBridge {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState {
                next_token: 1,
                ..Default::default()
            }),
        }
    }

    /// Fail fast if a prior consistency violation poisoned the bridge.
    pub(crate) fn check(&self) -> Result<()> {
        match &self.state.lock().poisoned {
            Some(msg) => Err(BridgeError::ConsistencyViolation(msg.clone())),
            None => Ok(()),
        }
    }

    /// Look up the live handle for an object, if it has one.
    ///
    /// A hit cancels a pending drop: the reference is being handed across
    /// the boundary again, so the stale release notification no longer
    /// stands.
    pub(crate) fn existing_handle(&self, value: &HostValue) -> Result<Option<u32>> {
        let mut state = self.state.lock();
        check_state(&state)?;
        let id = ObjectId::of(value);
        let Some(&handle) = state.by_object.get(&id) else {
            return Ok(None);
        };
        let found = match state.by_handle.get_mut(&handle) {
            Some(entry) => {
                if entry.released {
                    trace!(handle, "re-register cancels pending drop");
                    entry.released = false;
                }
                true
            }
            None => false,
        };
        if !found {
            return Err(poison(&mut state, "forward map points at a missing entry"));
        }
        Ok(Some(handle))
    }

    /// Start registering a new object: mint a token and pick a reusable
    /// table slot if one is free. The caller installs the externref and then
    /// either commits or abandons.
    pub(crate) fn begin_register(&self) -> Result<(u64, Option<u32>)> {
        let mut state = self.state.lock();
        check_state(&state)?;
        let token = state.next_token;
        state.next_token += 1;
        let free_slot = state.free_slots.pop();
        Ok((token, free_slot))
    }

    /// Record a freshly-installed entry. Fails (and poisons the bridge) if
    /// the object or the slot is already mapped: either case means the
    /// bijection broke.
    pub(crate) fn commit_register(
        &self,
        value: &HostValue,
        handle: u32,
        token: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        check_state(&state)?;
        let id = ObjectId::of(value);
        if state.by_object.contains_key(&id) {
            return Err(poison(
                &mut state,
                &format!("object already registered while committing handle {handle}"),
            ));
        }
        if state.by_handle.contains_key(&handle) {
            return Err(poison(
                &mut state,
                &format!("handle {handle} already occupied"),
            ));
        }
        state.by_object.insert(id, handle);
        state.by_token.insert(token, handle);
        state.by_handle.insert(
            handle,
            HandleEntry {
                object: value.clone(),
                id,
                token,
                pins: 0,
                released: false,
            },
        );
        Ok(())
    }

    /// Undo `begin_register` after a failed slot install.
    pub(crate) fn abandon_register(&self, free_slot: Option<u32>) {
        if let Some(slot) = free_slot {
            self.state.lock().free_slots.push(slot);
        }
    }

    /// Reverse lookup: handle to host object.
    pub(crate) fn resolve(&self, handle: u32) -> Result<HostValue> {
        let state = self.state.lock();
        check_state(&state)?;
        state
            .by_handle
            .get(&handle)
            .map(|entry| entry.object.clone())
            .ok_or_else(|| BridgeError::UnknownHandle(handle.to_string()))
    }

    /// Resolve a token read out of an externref payload.
    ///
    /// A miss means the externref outlived its entry (use-after-release) or
    /// was never minted by this bridge; both must be surfaced.
    pub(crate) fn resolve_token(&self, token: u64) -> Result<(u32, HostValue)> {
        let state = self.state.lock();
        check_state(&state)?;
        let handle = state
            .by_token
            .get(&token)
            .copied()
            .ok_or_else(|| BridgeError::UnknownHandle(format!("stale externref (token {token})")))?;
        let entry = state
            .by_handle
            .get(&handle)
            .ok_or_else(|| BridgeError::UnknownHandle(handle.to_string()))?;
        Ok((handle, entry.object.clone()))
    }

    /// Release notification: the sandbox dropped the externref.
    ///
    /// Returns `true` if the entry was removed now (its slot is queued for a
    /// physical clear), `false` if removal was deferred behind in-flight
    /// pins or the drop was already recorded.
    pub(crate) fn release(&self, handle: u32) -> Result<bool> {
        let mut state = self.state.lock();
        check_state(&state)?;
        let entry = state
            .by_handle
            .get_mut(&handle)
            .ok_or_else(|| BridgeError::UnknownHandle(handle.to_string()))?;
        if entry.released {
            trace!(handle, "duplicate release notification");
            return Ok(false);
        }
        entry.released = true;
        if entry.pins > 0 {
            trace!(handle, pins = entry.pins, "release deferred behind in-flight call");
            return Ok(false);
        }
        remove_entry(&mut state, handle)?;
        trace!(handle, "handle released");
        Ok(true)
    }

    /// Open a call frame. Dropping the returned guard closes it on every
    /// exit path, including traps and early errors.
    pub(crate) fn begin_call(&self) -> CallFrame<'_> {
        self.state.lock().frames.push(Vec::new());
        CallFrame { bridge: self }
    }

    /// Pin a handle onto the innermost call frame.
    pub(crate) fn pin(&self, handle: u32) -> Result<()> {
        let mut state = self.state.lock();
        check_state(&state)?;
        if state.frames.is_empty() {
            return Err(poison(
                &mut state,
                &format!("pin of handle {handle} outside any call frame"),
            ));
        }
        let entry = state
            .by_handle
            .get_mut(&handle)
            .ok_or_else(|| BridgeError::UnknownHandle(handle.to_string()))?;
        entry.pins += 1;
        if let Some(frame) = state.frames.last_mut() {
            frame.push(handle);
        }
        Ok(())
    }

    fn end_call(&self) {
        let mut state = self.state.lock();
        let Some(frame) = state.frames.pop() else {
            return;
        };
        for handle in frame {
            let Some(entry) = state.by_handle.get_mut(&handle) else {
                continue;
            };
            entry.pins -= 1;
            if entry.pins == 0 && entry.released {
                // Ignore secondary corruption here; the frame must drain.
                let _ = remove_entry(&mut state, handle);
                trace!(handle, "deferred release completed");
            }
        }
    }

    /// Slots of removed entries that still need their table slot cleared.
    pub(crate) fn take_pending_clears(&self) -> Vec<u32> {
        std::mem::take(&mut self.state.lock().pending_clear)
    }

    /// Mark a slot physically cleared and reusable.
    pub(crate) fn recycle(&self, slot: u32) {
        self.state.lock().free_slots.push(slot);
    }

    /// Snapshot of all live handles (for the adopted-reference scan).
    pub(crate) fn handles(&self) -> Vec<u32> {
        self.state.lock().by_handle.keys().copied().collect()
    }

    /// Number of live entries.
    pub(crate) fn live_handles(&self) -> usize {
        self.state.lock().by_handle.len()
    }
}

fn check_state(state: &BridgeState) -> Result<()> {
    match &state.poisoned {
        Some(msg) => Err(BridgeError::ConsistencyViolation(msg.clone())),
        None => Ok(()),
    }
}

/// Record a bijection violation and return the error for it. Not locally
/// recoverable: the current call fails and the instance stays untrusted.
fn poison(state: &mut BridgeState, msg: &str) -> BridgeError {
    state.poisoned = Some(msg.to_string());
    BridgeError::ConsistencyViolation(msg.to_string())
}

fn remove_entry(state: &mut BridgeState, handle: u32) -> Result<()> {
    let Some(entry) = state.by_handle.remove(&handle) else {
        return Err(poison(state, &format!("removal of missing handle {handle}")));
    };
    match state.by_object.remove(&entry.id) {
        Some(mapped) if mapped == handle => {}
        _ => {
            return Err(poison(
                state,
                &format!("handle {handle} and its object disagree"),
            ))
        }
    }
    state.by_token.remove(&entry.token);
    state.pending_clear.push(handle);
    Ok(())
}
