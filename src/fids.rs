// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Server-side file handle (FID) table
//!
//! FIDs have a two-phase lifecycle: `active` from allocation, then `clunked`
//! once a Tclunk has been issued, and finally free again when the Rclunk
//! arrives. The clunked phase is what makes a concurrent double release a
//! no-op. The externally visible FID is `index + 1`; FID 0 is reserved for
//! the root handle established by attach.

/// Number of concurrently open file handles.
pub(crate) const NUM_FIDS: usize = 32;

/// The root directory handle bound by Tattach.
pub(crate) const ROOT_FID: u32 = 0;

#[derive(Clone, Copy, Default)]
struct FidSlot {
    active: bool,
    clunked: bool,
}

pub(crate) struct FidTable {
    slots: [FidSlot; NUM_FIDS],
}

impl FidTable {
    pub(crate) fn new() -> Self {
        FidTable {
            slots: [FidSlot::default(); NUM_FIDS],
        }
    }

    /// Claim a fresh FID, or `None` when the table is full.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.active {
                slot.active = true;
                slot.clunked = false;
                return Some(i as u32 + 1);
            }
        }
        None
    }

    /// True if `fid` names a live handle that has not been clunked.
    ///
    /// The root FID 0 is not tracked here; it exists only as the fixed walk
    /// source and is never passed to per-file operations.
    pub(crate) fn is_valid(&self, fid: u32) -> bool {
        match self.slot(fid) {
            Some(slot) => slot.active && !slot.clunked,
            None => false,
        }
    }

    /// Record that a Tclunk has been issued so a second release is absorbed.
    /// The slot stays active until the Rclunk handler clears it.
    pub(crate) fn mark_clunked(&mut self, fid: u32) {
        if let Some(slot) = self.slot_mut(fid) {
            slot.clunked = true;
        }
    }

    /// Free the slot once the server has dropped the handle. Returns false if
    /// the slot was not active, which callers report as a flow error.
    pub(crate) fn clear(&mut self, fid: u32) -> bool {
        match self.slot_mut(fid) {
            Some(slot) if slot.active => {
                *slot = FidSlot::default();
                true
            }
            _ => false,
        }
    }

    /// Free a slot that was allocated but never bound on the server (the
    /// request was rolled back before sending, or the server rejected the
    /// walk outright), so no Tclunk is owed.
    pub(crate) fn discard(&mut self, fid: u32) {
        if let Some(slot) = self.slot_mut(fid) {
            *slot = FidSlot::default();
        }
    }

    /// Drop every handle. Used when the connection dies.
    pub(crate) fn reset(&mut self) {
        self.slots = [FidSlot::default(); NUM_FIDS];
    }

    fn slot(&self, fid: u32) -> Option<&FidSlot> {
        let index = fid.checked_sub(1)? as usize;
        self.slots.get(index)
    }

    fn slot_mut(&mut self, fid: u32) -> Option<&mut FidSlot> {
        let index = fid.checked_sub(1)? as usize;
        self.slots.get_mut(index)
    }
}
