//! # Page Frame Descriptors
//!
//! One [`PageFrame`] per physical page, stored in an arena indexed by page
//! frame number (PFN). Free lists link descriptors by PFN, never by pointer.
//!
//! Only the first frame of a block (its *head*) carries block state; every
//! other frame of a free or allocated block is a [`FrameState::Tail`].

use crate::pmm::ZoneId;

/// Link value terminating a free list.
pub const NIL: u64 = u64::MAX;

/// Ownership state of a frame.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameState {
    /// Not managed: firmware, holes, the descriptor table itself.
    Reserved = 0,
    /// Head of a block on a free list.
    Free = 1,
    /// Head of an allocated block.
    Allocated = 2,
    /// Interior frame of a larger block.
    Tail = 3,
}

impl FrameState {
    #[inline]
    #[must_use]
    const fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Reserved),
            1 => Some(Self::Free),
            2 => Some(Self::Allocated),
            3 => Some(Self::Tail),
            _ => None,
        }
    }
}

/// Descriptor of one physical page.
///
/// Every field is a plain integer so that any bit pattern is a valid value;
/// the table is carved out of raw physical memory during bring-up.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFrame {
    pub(crate) next: u64,
    pub(crate) prev: u64,
    stamp: u64,
    ref_count: u32,
    pin_count: u32,
    tag: u32,
    zone: u8,
    order: u8,
    node: u8,
    state: u8,
    inactive: u8,
}

impl PageFrame {
    /// A reserved, unlinked descriptor.
    #[must_use]
    pub const fn reserved(zone: ZoneId) -> Self {
        Self {
            next: NIL,
            prev: NIL,
            stamp: 0,
            ref_count: 0,
            pin_count: 0,
            tag: 0,
            zone: zone as u8,
            order: 0,
            node: 0,
            state: FrameState::Reserved as u8,
            inactive: 0,
        }
    }

    /// Decoded state; `None` if the byte was overwritten with garbage.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> Option<FrameState> {
        FrameState::from_raw(self.state)
    }

    #[inline]
    pub(crate) const fn set_state(&mut self, state: FrameState) {
        self.state = state as u8;
    }

    #[inline]
    #[must_use]
    pub const fn is(&self, state: FrameState) -> bool {
        self.state == state as u8
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self) -> Option<ZoneId> {
        ZoneId::from_raw(self.zone)
    }

    #[inline]
    #[must_use]
    pub const fn order(&self) -> usize {
        self.order as usize
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn set_order(&mut self, order: usize) {
        self.order = order as u8;
    }

    #[inline]
    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[inline]
    pub(crate) const fn set_ref_count(&mut self, n: u32) {
        self.ref_count = n;
    }

    #[inline]
    #[must_use]
    pub const fn pin_count(&self) -> u32 {
        self.pin_count
    }

    #[inline]
    pub(crate) const fn set_pin_count(&mut self, n: u32) {
        self.pin_count = n;
    }

    /// NUMA node. Always 0 until topology discovery exists.
    #[inline]
    #[must_use]
    pub const fn node(&self) -> u8 {
        self.node
    }

    /// Caller-supplied allocation tag.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> u32 {
        self.tag
    }

    /// Allocation sequence number of the block.
    #[inline]
    #[must_use]
    pub const fn stamp(&self) -> u64 {
        self.stamp
    }

    #[inline]
    #[must_use]
    pub const fn is_inactive(&self) -> bool {
        self.inactive != 0
    }

    #[inline]
    pub(crate) const fn set_inactive(&mut self, inactive: bool) {
        self.inactive = inactive as u8;
    }

    /// Turn this head into a freshly allocated block.
    pub(crate) const fn mark_allocated(&mut self, order: usize, tag: u32, stamp: u64) {
        self.set_state(FrameState::Allocated);
        self.set_order(order);
        self.ref_count = 1;
        self.pin_count = 0;
        self.inactive = 0;
        self.tag = tag;
        self.stamp = stamp;
        self.next = NIL;
        self.prev = NIL;
    }

    /// Turn this frame into the interior of a block.
    pub(crate) const fn mark_tail(&mut self) {
        self.set_state(FrameState::Tail);
        self.order = 0;
        self.ref_count = 0;
        self.next = NIL;
        self.prev = NIL;
    }
}

const _: () = {
    assert!(size_of::<PageFrame>() == 48);
};
