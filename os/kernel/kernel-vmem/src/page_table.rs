//! # Page Table Page
//!
//! A 4 KiB-aligned array of 512 [`PageEntry`] values, plus the per-level
//! index arithmetic for virtual addresses.

use crate::PageEntry;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries per table at every level.
pub const ENTRIES: usize = 512;

/// Paging level of a table: 4 = PML4, 3 = PDPT, 2 = PD, 1 = PT.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Level(u8);

impl Level {
    pub const PML4: Self = Self(4);
    pub const PDPT: Self = Self(3);
    pub const PD: Self = Self(2);
    pub const PT: Self = Self(1);

    /// The level below, `None` at the PT.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        if self.0 > 1 { Some(Self(self.0 - 1)) } else { None }
    }

    /// Bit position of this level's index field in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self.0 as u32 - 1)
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Index into a table of this level for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }
}

/// Split `va` into its (PML4, PDPT, PD, PT) indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (usize, usize, usize, usize) {
    (
        Level::PML4.index_of(va),
        Level::PDPT.index_of(va),
        Level::PD.index_of(va),
        Level::PT.index_of(va),
    )
}

/// One page-table page, valid at any level.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES],
}

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::new(); ENTRIES],
        }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntry {
        self.entries[i]
    }

    /// Caller must handle any required TLB invalidation.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntry) {
        self.entries[i] = e;
    }

    #[inline]
    pub const fn entry_mut(&mut self, i: usize) -> &mut PageEntry {
        &mut self.entries[i]
    }

    /// No entry carries any state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageEntry::is_unused)
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
