//! # Zones and Buddy Free Lists
//!
//! A zone owns the descriptors of a contiguous PFN range and one free list per
//! order. Blocks of order `k` are `2^k` pages, start at a PFN divisible by
//! `2^k`, and their buddy is found by flipping bit `k` of the PFN.
//!
//! ```text
//!  order 2 block at PFN 8          split once              split twice
//! ┌───┬───┬───┬───┐           ┌───┬───┐┌───┬───┐       ┌───┐┌───┐┌───────┐
//! │ 8 │ 9 │10 │11 │    →      │ 8 │ 9 ││10 │11 │   →   │ 8 ││ 9 ││10  11 │
//! └───┴───┴───┴───┘           └───┴───┘└───┴───┘       └───┘└───┘└───────┘
//!                               o1        o1 (free)     o0   o0    o1 (free)
//!                                                      taken free
//! ```
//!
//! Freeing walks the same picture backwards: while the buddy is a free head of
//! the same order, unlink it and continue one order up.

use crate::flags::AllocFlags;
use crate::pmm::frame::{FrameState, NIL, PageFrame};
use crate::pmm::stats::{ZoneCounters, ZoneStats};
use crate::MmError;
use kernel_info::memory::{MAX_ORDER, ORDER_COUNT, PAGE_SHIFT};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{SpinLock, SpinLockGuard};
use log::error;

/// Number of zones.
pub const ZONE_COUNT: usize = 4;

/// Physical memory zone, ordered by address.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ZoneId {
    /// ISA DMA reachable memory.
    Dma = 0,
    /// Memory reachable by 32-bit DMA engines.
    Dma32 = 1,
    /// Ordinary memory covered by the direct map.
    Normal = 2,
    /// Memory above the direct-map limit.
    High = 3,
}

impl ZoneId {
    pub const ALL: [Self; ZONE_COUNT] = [Self::Dma, Self::Dma32, Self::Normal, Self::High];

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Dma),
            1 => Some(Self::Dma32),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Dma32 => "DMA32",
            Self::Normal => "Normal",
            Self::High => "HighMem",
        }
    }

    /// Zone a request is served from first.
    #[must_use]
    pub const fn preferred(flags: AllocFlags) -> Self {
        if flags.contains(AllocFlags::DMA) {
            Self::Dma
        } else if flags.contains(AllocFlags::DMA32) {
            Self::Dma32
        } else {
            Self::Normal
        }
    }

    /// Every zone a request may be served from, in search order.
    ///
    /// Starts at the preferred zone, continues through higher zones the request
    /// permits and then walks down towards DMA.
    #[must_use]
    pub const fn candidates(flags: AllocFlags) -> [Option<Self>; ZONE_COUNT] {
        match Self::preferred(flags) {
            Self::Dma => [Some(Self::Dma), None, None, None],
            Self::Dma32 => [Some(Self::Dma32), Some(Self::Dma), None, None],
            Self::Normal | Self::High => {
                if flags.contains(AllocFlags::HIGHMEM) {
                    [Some(Self::Normal), Some(Self::High), Some(Self::Dma32), Some(Self::Dma)]
                } else {
                    [Some(Self::Normal), Some(Self::Dma32), Some(Self::Dma), None]
                }
            }
        }
    }
}

impl core::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-protected part of a zone.
pub(crate) struct ZoneInner<'m> {
    frames: &'m mut [PageFrame],
    base: u64,
    heads: [u64; ORDER_COUNT],
    counts: [u64; ORDER_COUNT],
    free: u64,
    active: u64,
    inactive: u64,
}

impl<'m> ZoneInner<'m> {
    fn new(frames: &'m mut [PageFrame], base: u64) -> Self {
        Self {
            frames,
            base,
            heads: [NIL; ORDER_COUNT],
            counts: [0; ORDER_COUNT],
            free: 0,
            active: 0,
            inactive: 0,
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, pfn: u64) -> Option<usize> {
        let i = pfn.checked_sub(self.base)?;
        (i < self.frames.len() as u64).then_some(i as usize)
    }

    #[inline]
    pub(crate) fn frame(&self, pfn: u64) -> Option<&PageFrame> {
        self.slot(pfn).map(|i| &self.frames[i])
    }

    #[inline]
    fn frame_mut(&mut self, pfn: u64) -> Result<&mut PageFrame, MmError> {
        let i = self.slot(pfn).ok_or(MmError::Corruption("free-list link leaves the zone"))?;
        Ok(&mut self.frames[i])
    }

    fn push(&mut self, pfn: u64, order: usize) -> Result<(), MmError> {
        let head = self.heads[order];
        let f = self.frame_mut(pfn)?;
        f.set_state(FrameState::Free);
        f.set_order(order);
        f.set_ref_count(0);
        f.set_pin_count(0);
        f.set_inactive(false);
        f.next = head;
        f.prev = NIL;
        if head != NIL {
            self.frame_mut(head)?.prev = pfn;
        }
        self.heads[order] = pfn;
        self.counts[order] += 1;
        self.free += 1 << order;
        Ok(())
    }

    fn unlink(&mut self, pfn: u64, order: usize) -> Result<(), MmError> {
        let f = *self.frame_mut(pfn)?;
        if !f.is(FrameState::Free) || f.order() != order {
            return Err(corrupt("unlinking a frame that is not a free head of this order"));
        }
        if f.prev == NIL {
            if self.heads[order] != pfn {
                return Err(corrupt("free head without predecessor is not the list head"));
            }
            self.heads[order] = f.next;
        } else {
            self.frame_mut(f.prev)?.next = f.next;
        }
        if f.next != NIL {
            self.frame_mut(f.next)?.prev = f.prev;
        }
        let f = self.frame_mut(pfn)?;
        f.next = NIL;
        f.prev = NIL;
        self.counts[order] = self
            .counts[order]
            .checked_sub(1)
            .ok_or(MmError::Corruption("free-list count underflow"))?;
        self.free -= 1 << order;
        Ok(())
    }

    fn pop(&mut self, order: usize) -> Result<Option<u64>, MmError> {
        let head = self.heads[order];
        if head == NIL {
            return Ok(None);
        }
        let f = self.frame_mut(head)?;
        if f.ref_count() != 0 || f.pin_count() != 0 {
            return Err(corrupt("free block still referenced"));
        }
        self.unlink(head, order)?;
        Ok(Some(head))
    }

    /// Take a block of `order`, splitting a larger one if necessary.
    pub(crate) fn take(&mut self, order: usize, tag: u32, stamp: u64) -> Result<Option<u64>, MmError> {
        for from in order..ORDER_COUNT {
            let Some(pfn) = self.pop(from)? else {
                continue;
            };
            let mut cur = from;
            while cur > order {
                cur -= 1;
                self.push(pfn + (1 << cur), cur)?;
            }
            self.frame_mut(pfn)?.mark_allocated(order, tag, stamp);
            self.active += 1 << order;
            return Ok(Some(pfn));
        }
        Ok(None)
    }

    /// Give an allocated block whose last reference is gone back to the lists.
    pub(crate) fn release(&mut self, pfn: u64) -> Result<(), MmError> {
        let f = *self.frame_mut(pfn)?;
        if !f.is(FrameState::Allocated) || f.ref_count() != 0 {
            return Err(corrupt("releasing a block that is still in use"));
        }
        let pages = 1u64 << f.order();
        if f.is_inactive() {
            self.inactive = self.inactive.saturating_sub(pages);
        } else {
            self.active = self.active.saturating_sub(pages);
        }

        let mut head = pfn;
        let mut order = f.order();
        while order < MAX_ORDER {
            let buddy = head ^ (1 << order);
            let mergeable = self
                .frame(buddy)
                .is_some_and(|b| b.is(FrameState::Free) && b.order() == order);
            if !mergeable {
                break;
            }
            self.unlink(buddy, order)?;
            self.frame_mut(buddy)?.mark_tail();
            if buddy < head {
                self.frame_mut(head)?.mark_tail();
                head = buddy;
            }
            order += 1;
        }
        self.push(head, order)
    }

    /// Turn every maximal run of `Tail` frames into aligned free blocks.
    ///
    /// Bring-up marks the frames of usable regions as `Tail`; this is the only
    /// place where such unattached tails exist.
    fn seed(&mut self) -> Result<u64, MmError> {
        let end = self.base + self.frames.len() as u64;
        let mut pfn = self.base;
        while pfn < end {
            if !self.frame(pfn).is_some_and(|f| f.is(FrameState::Tail)) {
                pfn += 1;
                continue;
            }
            let run_start = pfn;
            while pfn < end && self.frame(pfn).is_some_and(|f| f.is(FrameState::Tail)) {
                pfn += 1;
            }
            self.seed_run(run_start, pfn)?;
        }
        Ok(self.free)
    }

    fn seed_run(&mut self, start: u64, end: u64) -> Result<(), MmError> {
        let mut p = start;
        while p < end {
            let mut order = MAX_ORDER;
            while order > 0 && (p & ((1 << order) - 1) != 0 || p + (1 << order) > end) {
                order -= 1;
            }
            self.push(p, order)?;
            p += 1 << order;
        }
        Ok(())
    }

    /// Walk every list and check links, states and counts.
    pub(crate) fn verify(&self) -> Result<(), MmError> {
        let mut pages = 0;
        for order in 0..ORDER_COUNT {
            let mut n = 0u64;
            let mut prev = NIL;
            let mut cur = self.heads[order];
            while cur != NIL {
                let f = self.frame(cur).ok_or(MmError::Corruption("free-list link leaves the zone"))?;
                if !f.is(FrameState::Free) || f.order() != order || f.ref_count() != 0 {
                    return Err(MmError::Corruption("linked frame is not a free head of its list"));
                }
                if f.prev != prev {
                    return Err(MmError::Corruption("broken back link"));
                }
                if cur & ((1 << order) - 1) != 0 {
                    return Err(MmError::Corruption("misaligned free block"));
                }
                n += 1;
                if n > self.frames.len() as u64 {
                    return Err(MmError::Corruption("free-list cycle"));
                }
                prev = cur;
                cur = f.next;
            }
            if n != self.counts[order] {
                return Err(MmError::Corruption("free-list count mismatch"));
            }
            pages += n << order;
        }
        if pages != self.free {
            return Err(MmError::Corruption("zone free count mismatch"));
        }
        Ok(())
    }

    pub(crate) fn note_deactivated(&mut self, pages: u64) {
        self.active = self.active.saturating_sub(pages);
        self.inactive += pages;
    }

    pub(crate) fn note_activated(&mut self, pages: u64) {
        self.inactive = self.inactive.saturating_sub(pages);
        self.active += pages;
    }

    /// Descriptor of an allocated block head, for reference count updates.
    pub(crate) fn allocated_head(&mut self, pfn: u64) -> Result<&mut PageFrame, MmError> {
        let f = self.frame_mut(pfn).map_err(|_| MmError::InvalidArgument("frame is not tracked"))?;
        match f.state() {
            Some(FrameState::Allocated) => Ok(f),
            Some(FrameState::Free) => Err(corrupt("frame is used while on a free list")),
            Some(FrameState::Reserved | FrameState::Tail) => {
                Err(MmError::InvalidArgument("not the head of an allocated block"))
            }
            None => Err(corrupt("frame state is garbage")),
        }
    }
}

#[inline]
fn corrupt(what: &'static str) -> MmError {
    error!("PMM: frame descriptor corruption: {what}");
    MmError::Corruption(what)
}

/// One physical memory zone.
pub struct Zone<'m> {
    id: ZoneId,
    start_pfn: u64,
    end_pfn: u64,
    managed: u64,
    inner: SpinLock<ZoneInner<'m>>,
    counters: ZoneCounters,
}

impl<'m> Zone<'m> {
    /// Wrap the descriptors of `[start_pfn, start_pfn + frames.len())` and seed
    /// the free lists from the frames bring-up marked usable.
    pub(crate) fn new(id: ZoneId, start_pfn: u64, frames: &'m mut [PageFrame]) -> Result<Self, MmError> {
        let end_pfn = start_pfn + frames.len() as u64;
        let mut inner = ZoneInner::new(frames, start_pfn);
        let managed = inner.seed()?;
        let zone = Self {
            id,
            start_pfn,
            end_pfn,
            managed,
            inner: SpinLock::new(inner),
            counters: ZoneCounters::default(),
        };
        zone.publish(&zone.inner.lock());
        Ok(zone)
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ZoneId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: u64) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    /// Pages handed to the allocator at bring-up.
    #[inline]
    #[must_use]
    pub const fn managed_pages(&self) -> u64 {
        self.managed
    }

    #[inline]
    pub(crate) fn lock(&self) -> SpinLockGuard<'_, ZoneInner<'m>> {
        self.inner.lock()
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> Option<SpinLockGuard<'_, ZoneInner<'m>>> {
        self.inner.try_lock()
    }

    /// Mirror the locked counts into the lock-free statistics.
    pub(crate) fn publish(&self, inner: &ZoneInner<'_>) {
        self.counters.store(inner.free, inner.active, inner.inactive, &inner.counts);
    }

    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.counters.free()
    }

    #[must_use]
    pub fn stats(&self) -> ZoneStats {
        self.counters.snapshot(
            self.id,
            PhysicalAddress::new(self.start_pfn << PAGE_SHIFT),
            PhysicalAddress::new(self.end_pfn << PAGE_SHIFT),
            self.managed,
        )
    }

    /// Check every free list of the zone.
    ///
    /// # Errors
    /// [`MmError::Corruption`] describing the first inconsistency.
    pub fn verify(&self) -> Result<(), MmError> {
        self.inner.lock().verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<PageFrame> {
        vec![PageFrame::reserved(ZoneId::Normal); n]
    }

    fn usable(frames: &mut [PageFrame], range: core::ops::Range<usize>) {
        for f in &mut frames[range] {
            f.mark_tail();
        }
    }

    #[test]
    fn seeding_uses_largest_aligned_blocks() {
        let mut f = frames(64);
        usable(&mut f, 3..40);
        let mut z = ZoneInner::new(&mut f, 0);
        assert_eq!(z.seed().unwrap(), 37);
        // 3 | 4..8 | 8..16 | 16..32 | 32..40
        assert_eq!(z.counts[0], 1);
        assert_eq!(z.counts[2], 1);
        assert_eq!(z.counts[3], 2);
        assert_eq!(z.counts[4], 1);
        z.verify().unwrap();
    }

    #[test]
    fn split_then_free_coalesces_back() {
        let mut f = frames(16);
        usable(&mut f, 0..16);
        let mut z = ZoneInner::new(&mut f, 0);
        z.seed().unwrap();
        assert_eq!(z.counts[4], 1);

        let a = z.take(0, 0, 1).unwrap().unwrap();
        assert_eq!(a, 0);
        assert_eq!(z.counts[4], 0);
        assert_eq!((z.counts[0], z.counts[1], z.counts[2], z.counts[3]), (1, 1, 1, 1));
        z.verify().unwrap();

        z.allocated_head(a).unwrap().set_ref_count(0);
        z.release(a).unwrap();
        assert_eq!(z.counts[4], 1);
        assert_eq!(z.free, 16);
        assert_eq!(z.active, 0);
        z.verify().unwrap();
    }

    #[test]
    fn every_order_up_to_the_largest_block_round_trips() {
        let pages = 2usize << MAX_ORDER;
        let total = 2u64 << MAX_ORDER;
        let mut f = frames(pages);
        usable(&mut f, 0..pages);
        let mut z = ZoneInner::new(&mut f, 0);
        z.seed().unwrap();
        assert_eq!(z.counts[MAX_ORDER], 2);

        for order in 0..=MAX_ORDER {
            let pfn = z.take(order, 0, 1).unwrap().unwrap();
            assert_eq!(pfn & ((1 << order) - 1), 0, "order {order} block is aligned");
            assert_eq!(z.free, total - (1 << order));
            z.verify().unwrap();

            z.allocated_head(pfn).unwrap().set_ref_count(0);
            z.release(pfn).unwrap();
            assert_eq!(z.free, total);
            assert_eq!(z.counts[MAX_ORDER], 2, "order {order} merged back");
            z.verify().unwrap();
        }
    }

    #[test]
    fn merge_stops_at_a_busy_buddy() {
        let mut f = frames(4);
        usable(&mut f, 0..4);
        let mut z = ZoneInner::new(&mut f, 0);
        z.seed().unwrap();
        let a = z.take(0, 0, 1).unwrap().unwrap();
        let b = z.take(0, 0, 2).unwrap().unwrap();
        assert_eq!((a, b), (0, 1));

        z.allocated_head(b).unwrap().set_ref_count(0);
        z.release(b).unwrap();
        assert_eq!(z.counts[0], 1, "buddy 0 is still allocated");
        assert_eq!(z.counts[1], 1);
        z.verify().unwrap();
    }

    #[test]
    fn merges_never_cross_the_zone_edge() {
        // Zone starts at PFN 2: the buddy of 2 at order 1 is PFN 0, outside.
        let mut f = frames(2);
        usable(&mut f, 0..2);
        let mut z = ZoneInner::new(&mut f, 2);
        z.seed().unwrap();
        assert_eq!(z.counts[1], 1);
        let a = z.take(1, 0, 1).unwrap().unwrap();
        assert_eq!(a, 2);
        z.allocated_head(a).unwrap().set_ref_count(0);
        z.release(a).unwrap();
        assert_eq!(z.counts[1], 1);
        assert_eq!(z.counts[2], 0);
    }

    #[test]
    fn released_block_must_be_unreferenced() {
        let mut f = frames(2);
        usable(&mut f, 0..2);
        let mut z = ZoneInner::new(&mut f, 0);
        z.seed().unwrap();
        let a = z.take(0, 0, 1).unwrap().unwrap();
        assert!(matches!(z.release(a), Err(MmError::Corruption(_))));
    }

    #[test]
    fn candidate_order() {
        assert_eq!(ZoneId::candidates(AllocFlags::DMA), [Some(ZoneId::Dma), None, None, None]);
        assert_eq!(
            ZoneId::candidates(AllocFlags::DMA32 | AllocFlags::HIGHMEM),
            [Some(ZoneId::Dma32), Some(ZoneId::Dma), None, None]
        );
        assert_eq!(
            ZoneId::candidates(AllocFlags::empty()),
            [Some(ZoneId::Normal), Some(ZoneId::Dma32), Some(ZoneId::Dma), None]
        );
        assert_eq!(
            ZoneId::candidates(AllocFlags::HIGHMEM)[1],
            Some(ZoneId::High)
        );
    }
}
