//! # Page Table Tree (x86-64, PML4-rooted)
//!
//! [`PageTables`] is a handle to one four-level tree. It creates intermediate
//! tables on demand, installs and clears leaves, translates addresses and
//! walks ranges of 4 KiB leaves. It performs no locking and no TLB
//! maintenance; both are the caller's business.
//!
//! Mutating operations take `&mut self`, so an entry reference handed out by
//! [`PageTables::pte_mut`] or [`PageTables::ensure_pte`] cannot outlive the
//! next walk through the same handle.

use crate::map_size::MapSize;
use crate::page_table::{ENTRIES, Level, PageTable};
use crate::{MapError, PageEntry, PhysMapper, TableAlloc};
use core::ops::Range;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Mask selecting the 48 implemented bits of a virtual address.
const LINEAR_MASK: u64 = (1 << VirtualAddress::BITS) - 1;

/// Map a physical page-table frame and return it as a table.
///
/// # Safety
/// `page` must be a 4 KiB frame holding a page table that is reachable
/// through `m`, and no other live reference to it may be used concurrently.
#[inline]
unsafe fn table_at<'a, M: PhysMapper>(m: &M, page: PhysicalPage<Size4K>) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(page.base()) }
}

/// Result of descending towards a target level.
enum Walk {
    /// Reached the table at the requested level.
    Table(PhysicalPage<Size4K>),
    /// Hit a huge leaf above the requested level.
    Leaf {
        table: PhysicalPage<Size4K>,
        index: usize,
        level: Level,
    },
    /// Some level on the way is not present.
    Missing,
}

/// Handle to a single page-table tree.
pub struct PageTables<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> PageTables<'m, M> {
    /// Wrap an existing root (PML4) frame.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Allocate and clear a fresh root table.
    ///
    /// # Errors
    /// [`MapError::OutOfTables`] if `alloc` has no frame.
    pub fn create<A: TableAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_table().ok_or(MapError::OutOfTables)?;
        // SAFETY: freshly allocated frame, exclusively ours.
        unsafe { table_at(mapper, root) }.zero();
        Ok(Self { root, mapper })
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Follow `table[idx]` one level down, creating the next table if needed.
    ///
    /// Existing links are widened (writable/user) to at least `link`.
    fn next_or_create<A: TableAlloc>(
        &self,
        alloc: &mut A,
        table: &mut PageTable,
        idx: usize,
        link: PageEntry,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let e = table.get(idx);
        if e.present() {
            if e.large_page() {
                return Err(MapError::HugePageInPath(va));
            }
            let widened = e
                .with_writable(e.writable() || link.writable())
                .with_user_access(e.user_access() || link.user_access());
            if widened != e {
                table.set(idx, widened);
            }
            return Ok(e.frame());
        }

        let page = alloc.alloc_table().ok_or(MapError::OutOfTables)?;
        // SAFETY: freshly allocated frame, exclusively ours.
        unsafe { table_at(self.mapper, page) }.zero();
        table.set(
            idx,
            link.with_large_page(false)
                .with_present(true)
                .with_physical_address(page.base()),
        );
        Ok(page)
    }

    /// Walk from the root down to the table at `level`, creating what's missing.
    fn ensure_table<A: TableAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        level: Level,
        link: PageEntry,
    ) -> Result<&mut PageTable, MapError> {
        let mut page = self.root;
        let mut current = Level::PML4;
        while current > level {
            // SAFETY: `page` is the root or was linked from a table of this tree.
            let table = unsafe { table_at(self.mapper, page) };
            page = self.next_or_create(alloc, table, current.index_of(va), link, va)?;
            let Some(lower) = current.lower() else { break };
            current = lower;
        }
        // SAFETY: as above; the borrow is tied to `&mut self`.
        Ok(unsafe { table_at(self.mapper, page) })
    }

    fn descend(&self, va: VirtualAddress, target: Level) -> Walk {
        let mut page = self.root;
        let mut level = Level::PML4;
        while level > target {
            // SAFETY: `page` belongs to this tree; only read here.
            let table = unsafe { table_at(self.mapper, page) };
            let index = level.index_of(va);
            let e = table.get(index);
            if !e.present() {
                return Walk::Missing;
            }
            if e.large_page() {
                return Walk::Leaf {
                    table: page,
                    index,
                    level,
                };
            }
            page = e.frame();
            let Some(lower) = level.lower() else { break };
            level = lower;
        }
        Walk::Table(page)
    }

    /// Install one leaf of size `S` mapping `va → pa`.
    ///
    /// `flags` supplies permission and software bits; `present`, `PS` and the
    /// address are filled in. Intermediate tables are linked with `link`.
    ///
    /// # Errors
    /// - [`MapError::NonCanonical`] / [`MapError::Misaligned`] for bad inputs.
    /// - [`MapError::AlreadyMapped`] if a present leaf exists; it is left untouched.
    /// - [`MapError::HugePageInPath`] if a larger leaf already covers `va`.
    /// - [`MapError::OutOfTables`] if an intermediate table can't be allocated.
    pub fn map<S: MapSize, A: TableAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntry,
        link: PageEntry,
    ) -> Result<(), MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical(va));
        }
        if !va.is_aligned::<S>() || !pa.is_aligned::<S>() {
            return Err(MapError::Misaligned);
        }
        let table = self.ensure_table(alloc, va, S::LEAF_LEVEL, link)?;
        let slot = table.entry_mut(S::LEAF_LEVEL.index_of(va));
        if slot.present() {
            return Err(MapError::AlreadyMapped(va));
        }
        *slot = flags
            .with_present(true)
            .with_large_page(S::HUGE)
            .with_physical_address(pa);
        Ok(())
    }

    /// The 4 KiB leaf slot for `va`, creating intermediate tables as needed.
    ///
    /// # Errors
    /// As for [`map`](Self::map), minus the alignment and already-mapped checks.
    pub fn ensure_pte<A: TableAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        link: PageEntry,
    ) -> Result<&mut PageEntry, MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical(va));
        }
        let table = self.ensure_table(alloc, va, Level::PT, link)?;
        Ok(table.entry_mut(Level::PT.index_of(va)))
    }

    /// Copy of the leaf entry covering `va`: the PTE, or a huge leaf above it.
    /// An all-zero entry if nothing is there.
    #[must_use]
    pub fn pte(&self, va: VirtualAddress) -> PageEntry {
        match self.descend(va, Level::PT) {
            // SAFETY: tables of this tree, read only.
            Walk::Table(pt) => unsafe { table_at(self.mapper, pt) }.get(Level::PT.index_of(va)),
            Walk::Leaf { table, index, .. } => unsafe { table_at(self.mapper, table) }.get(index),
            Walk::Missing => PageEntry::new(),
        }
    }

    /// Mutable 4 KiB leaf slot for `va` if its page table exists.
    pub fn pte_mut(&mut self, va: VirtualAddress) -> Option<&mut PageEntry> {
        match self.descend(va, Level::PT) {
            // SAFETY: table of this tree; the borrow is tied to `&mut self`.
            Walk::Table(pt) => {
                Some(unsafe { table_at(self.mapper, pt) }.entry_mut(Level::PT.index_of(va)))
            }
            Walk::Leaf { .. } | Walk::Missing => None,
        }
    }

    /// Translate `va` to a physical address if a present leaf maps it.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the larger in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (e, span) = match self.descend(va, Level::PT) {
            Walk::Table(pt) => {
                // SAFETY: table of this tree, read only.
                let e = unsafe { table_at(self.mapper, pt) }.get(Level::PT.index_of(va));
                (e, Level::PT.entry_span())
            }
            Walk::Leaf {
                table,
                index,
                level,
            } => {
                // SAFETY: as above.
                let e = unsafe { table_at(self.mapper, table) }.get(index);
                (e, level.entry_span())
            }
            Walk::Missing => return None,
        };
        e.present()
            .then(|| e.physical_address() + (va.as_u64() & (span - 1)))
    }

    /// Clear the leaf covering `va` and return the previous entry.
    ///
    /// Returns `None` if the slot was already empty. Non-present entries with
    /// software state (e.g. swapped) are cleared and returned as well.
    pub fn unmap(&mut self, va: VirtualAddress) -> Option<PageEntry> {
        let (table, index) = match self.descend(va, Level::PT) {
            Walk::Table(pt) => (pt, Level::PT.index_of(va)),
            Walk::Leaf { table, index, .. } => (table, index),
            Walk::Missing => return None,
        };
        // SAFETY: table of this tree, exclusive through `&mut self`.
        let table = unsafe { table_at(self.mapper, table) };
        let old = table.get(index);
        if old.is_unused() {
            return None;
        }
        table.set(index, PageEntry::new());
        Some(old)
    }

    /// Visit every non-empty 4 KiB leaf slot with `first <= va <= last`.
    ///
    /// Subtrees that are not present are skipped without being touched;
    /// huge leaves are not visited.
    pub fn for_each_pte<F>(&mut self, first: VirtualAddress, last: VirtualAddress, mut f: F)
    where
        F: FnMut(VirtualAddress, &mut PageEntry),
    {
        let lo = first.as_u64() & LINEAR_MASK;
        let hi = last.as_u64() & LINEAR_MASK;
        if lo > hi {
            return;
        }
        self.visit(self.root, Level::PML4, 0, lo, hi, &mut f);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn visit<F>(&self, page: PhysicalPage<Size4K>, level: Level, base: u64, lo: u64, hi: u64, f: &mut F)
    where
        F: FnMut(VirtualAddress, &mut PageEntry),
    {
        let span = level.entry_span();
        let table_last = base + (ENTRIES as u64) * span - 1;
        let first = ((lo.max(base) - base) / span) as usize;
        let last = ((hi.min(table_last) - base) / span) as usize;

        // SAFETY: `page` belongs to this tree; tables are disjoint frames.
        let table = unsafe { table_at(self.mapper, page) };
        for i in first..=last {
            let entry_base = base + i as u64 * span;
            let e = table.get(i);
            match level.lower() {
                None => {
                    if !e.is_unused() {
                        f(VirtualAddress::canonicalize(entry_base), table.entry_mut(i));
                    }
                }
                Some(lower) => {
                    if e.is_table_link() {
                        self.visit(e.frame(), lower, entry_base, lo, hi, f);
                    }
                }
            }
        }
    }

    /// Root (PML4) entry at `slot`.
    #[must_use]
    pub fn root_entry(&self, slot: usize) -> PageEntry {
        // SAFETY: the root frame, read only.
        unsafe { table_at(self.mapper, self.root) }.get(slot)
    }

    pub fn set_root_entry(&mut self, slot: usize, e: PageEntry) {
        // SAFETY: the root frame, exclusive through `&mut self`.
        unsafe { table_at(self.mapper, self.root) }.set(slot, e);
    }

    /// Make sure root slot `slot` links to a PDPT and return it.
    ///
    /// # Errors
    /// [`MapError::OutOfTables`] if the PDPT can't be allocated.
    pub fn ensure_root_slot<A: TableAlloc>(
        &mut self,
        alloc: &mut A,
        slot: usize,
        link: PageEntry,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        // SAFETY: the root frame, exclusive through `&mut self`.
        let root = unsafe { table_at(self.mapper, self.root) };
        let va = VirtualAddress::canonicalize((slot as u64) << Level::PML4.shift());
        self.next_or_create(alloc, root, slot, link, va)
    }

    /// Free every table hanging off the root slots in `slots` and clear them.
    ///
    /// Leaf frames are not touched; unmap them first. Returns the number of
    /// table frames handed back to `alloc`.
    pub fn free_subtrees<A: TableAlloc>(&mut self, alloc: &mut A, slots: Range<usize>) -> usize {
        let mut freed = 0;
        for slot in slots {
            let e = self.root_entry(slot);
            if e.is_table_link() {
                freed += self.free_tree(alloc, e.frame(), Level::PDPT);
            }
            self.set_root_entry(slot, PageEntry::new());
        }
        freed
    }

    fn free_tree<A: TableAlloc>(&self, alloc: &mut A, page: PhysicalPage<Size4K>, level: Level) -> usize {
        let mut freed = 0;
        if let Some(lower) = level.lower() {
            // SAFETY: `page` belongs to this tree, read only.
            let table = unsafe { table_at(self.mapper, page) };
            for i in 0..ENTRIES {
                let e = table.get(i);
                if e.is_table_link() {
                    freed += self.free_tree(alloc, e.frame(), lower);
                }
            }
        }
        alloc.free_table(page);
        freed + 1
    }

    /// Hand the root frame back; the tree must already be empty below it.
    pub fn free_root<A: TableAlloc>(self, alloc: &mut A) {
        alloc.free_table(self.root);
    }
}
