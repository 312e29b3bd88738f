// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-flight request table
//!
//! A fixed pool of request slots indexed by the 16-bit wire tag. A slot is
//! `active` from allocation until the caller (or an abandon path) clears it,
//! and `pending` from submission until the worker stores the response. While
//! `pending` only the worker writes the payload; once `pending` drops, only
//! the caller reads it.

use crate::fcall::{DirEntry, FileStat, MsgType, WalkKind};

/// Number of ordinary request slots. Tag values `0..NUM_TAGS` are ordinary;
/// `NUM_TAGS` itself is reserved for the attach handshake and 0xFFFF (NOTAG)
/// for the version handshake, so neither can collide with a live request.
pub(crate) const NUM_TAGS: usize = 16;

/// Reserved tag used by Tattach/Rattach.
pub(crate) const ATTACH_TAG: u16 = NUM_TAGS as u16;

/// Operation context and result storage for one in-flight request.
#[derive(Debug)]
pub(crate) enum Op {
    Walk { new_fid: u32, kind: WalkKind, nwname: u16 },
    Clunk { fid: u32 },
    Open { ok: bool },
    Create { ok: bool },
    FileRead { requested: u32, data: Vec<u8>, count: i32 },
    DirRead { entry: DirEntry, count: i32 },
    Write { count: i32 },
    Remove { fid: u32, ok: bool },
    Stat { stat: Option<FileStat> },
    Wstat { ok: bool },
}

impl Op {
    /// The response type that completes this operation. Rerror is accepted in
    /// place of any of these.
    pub(crate) fn expected(&self) -> MsgType {
        match self {
            Op::Walk { .. } => MsgType::Rwalk,
            Op::Clunk { .. } => MsgType::Rclunk,
            Op::Open { .. } => MsgType::Ropen,
            Op::Create { .. } => MsgType::Rcreate,
            Op::FileRead { .. } | Op::DirRead { .. } => MsgType::Rread,
            Op::Write { .. } => MsgType::Rwrite,
            Op::Remove { .. } => MsgType::Rremove,
            Op::Stat { .. } => MsgType::Rstat,
            Op::Wstat { .. } => MsgType::Rwstat,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TagSlot {
    pub active: bool,
    pub pending: bool,
    pub op: Option<Op>,
}

pub(crate) struct TagTable {
    slots: [TagSlot; NUM_TAGS],
}

impl TagTable {
    pub(crate) fn new() -> Self {
        TagTable {
            slots: Default::default(),
        }
    }

    /// Claim the first free slot, or `None` when all are in flight.
    pub(crate) fn allocate(&mut self) -> Option<u16> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.active {
                slot.active = true;
                return Some(i as u16);
            }
        }
        None
    }

    /// Record the operation and mark the slot pending. Must happen before the
    /// T-message is sent so the response can never race the bookkeeping.
    pub(crate) fn submit(&mut self, tag: u16, op: Op) {
        let slot = &mut self.slots[tag as usize];
        debug_assert!(slot.active && !slot.pending);
        slot.pending = true;
        slot.op = Some(op);
    }

    /// Return the slot to the pool. Out-of-range tags are ignored.
    pub(crate) fn clear(&mut self, tag: u16) {
        if let Some(slot) = self.slots.get_mut(tag as usize) {
            *slot = TagSlot::default();
        }
    }

    /// Drop every slot, in-flight or not. Used when the connection dies.
    pub(crate) fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = TagSlot::default();
        }
    }

    /// True if the worker has stored a response for this tag.
    pub(crate) fn response_ready(&self, tag: u16) -> bool {
        match self.slots.get(tag as usize) {
            Some(slot) => slot.active && !slot.pending,
            None => false,
        }
    }

    /// True if a response is ready and the operation expects `typ`.
    pub(crate) fn response_ready_for(&self, tag: u16, typ: MsgType) -> bool {
        self.response_ready(tag)
            && self.slots[tag as usize]
                .op
                .as_ref()
                .is_some_and(|op| op.expected() == typ)
    }

    /// True if the tag names a request still waiting for its response.
    pub(crate) fn in_flight(&self, tag: u16) -> bool {
        match self.slots.get(tag as usize) {
            Some(slot) => slot.pending,
            None => false,
        }
    }

    pub(crate) fn op(&self, tag: u16) -> Option<&Op> {
        self.slots.get(tag as usize).and_then(|s| s.op.as_ref())
    }

    pub(crate) fn op_mut(&mut self, tag: u16) -> Option<&mut Op> {
        self.slots.get_mut(tag as usize).and_then(|s| s.op.as_mut())
    }

    /// Take the operation out of a completed slot and free it.
    pub(crate) fn collect(&mut self, tag: u16) -> Option<Op> {
        let slot = self.slots.get_mut(tag as usize)?;
        let op = slot.op.take();
        *slot = TagSlot::default();
        op
    }

    /// Mark the response stored; the caller may now read the payload.
    pub(crate) fn complete(&mut self, tag: u16) {
        if let Some(slot) = self.slots.get_mut(tag as usize) {
            slot.pending = false;
        }
    }
}
