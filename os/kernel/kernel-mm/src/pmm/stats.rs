//! Lock-free PMM statistics.
//!
//! Counters are written after the locked part of an operation and read
//! without any lock, so a snapshot may be a few operations stale.

use crate::pmm::ZoneId;
use crate::pmm::zone::ZONE_COUNT;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::ORDER_COUNT;
use kernel_memory_addresses::PhysicalAddress;

/// Snapshot of one zone.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ZoneStats {
    pub id: ZoneId,
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub managed_pages: u64,
    pub free_pages: u64,
    pub active_pages: u64,
    pub inactive_pages: u64,
    /// Free blocks per order.
    pub free_blocks: [u64; ORDER_COUNT],
}

/// Snapshot of the whole allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmmStats {
    pub managed_pages: u64,
    pub free_pages: u64,
    pub allocations: u64,
    pub frees: u64,
    pub failures: u64,
    pub under_pressure: bool,
    pub zones: [ZoneStats; ZONE_COUNT],
}

#[derive(Default)]
pub(crate) struct ZoneCounters {
    free: AtomicU64,
    active: AtomicU64,
    inactive: AtomicU64,
    blocks: [AtomicU64; ORDER_COUNT],
}

impl ZoneCounters {
    pub(crate) fn store(&self, free: u64, active: u64, inactive: u64, blocks: &[u64; ORDER_COUNT]) {
        self.free.store(free, Ordering::Relaxed);
        self.active.store(active, Ordering::Relaxed);
        self.inactive.store(inactive, Ordering::Relaxed);
        for (dst, &n) in self.blocks.iter().zip(blocks) {
            dst.store(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn free(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(
        &self,
        id: ZoneId,
        start: PhysicalAddress,
        end: PhysicalAddress,
        managed_pages: u64,
    ) -> ZoneStats {
        ZoneStats {
            id,
            start,
            end,
            managed_pages,
            free_pages: self.free(),
            active_pages: self.active.load(Ordering::Relaxed),
            inactive_pages: self.inactive.load(Ordering::Relaxed),
            free_blocks: core::array::from_fn(|i| self.blocks[i].load(Ordering::Relaxed)),
        }
    }
}

#[derive(Default)]
pub(crate) struct PmmCounters {
    pub(crate) allocations: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) failures: AtomicU64,
}

impl PmmCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
