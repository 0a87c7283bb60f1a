//! # Virtual Memory Support
//!
//! x86-64 four-level paging structures and a walker over them.
//!
//! ## What you get
//! - [`PageEntry`]: one bitfield type for entries of all four levels,
//!   including the software bits the memory manager keeps in them
//!   (copy-on-write, shared, swapped, device).
//! - [`PageTable`]: a 4 KiB-aligned table of 512 entries and the
//!   per-[`Level`] index arithmetic.
//! - [`PageTables`]: a handle to one PML4-rooted tree that maps, unmaps,
//!   translates and walks ranges.
//! - The seams to the rest of the kernel: [`PhysMapper`] turns physical
//!   addresses into pointers, [`TableAlloc`] supplies table frames.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 63‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | sign  |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each index selects one of 512 eight-byte entries. A PDPTE or PDE with
//! `PS=1` ends the walk early with a 1 GiB or 2 MiB leaf; a PTE always maps
//! 4 KiB. Bits 63..48 must replicate bit 47 (canonical form).
//!
//! Effective permissions are the intersection over the walk, which is why
//! intermediate links are created writable (and user-accessible for the
//! lower half) and the leaf decides.
//!
//! ## TLB
//!
//! Nothing in this crate invalidates translations. Whoever changes a live
//! mapping must flush it afterwards.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod map_size;
mod page_entry;
pub mod page_table;
mod page_tables;

pub use crate::map_size::MapSize;
pub use crate::page_entry::PageEntry;
pub use crate::page_table::{Level, PageTable};
pub use crate::page_tables::PageTables;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Supplies zero-or-garbage 4 KiB frames for page tables and takes them back.
///
/// The walker clears every table it allocates, so implementations need not.
pub trait TableAlloc {
    /// Allocate one 4 KiB physical frame. `None` on out-of-memory.
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously obtained from [`alloc_table`](Self::alloc_table).
    fn free_table(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable references in the current address
/// space (e.g. via a higher-half direct map, HHDM).
///
/// # Safety
/// - `pa` must be mapped writable for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` and the caller must not create
///   aliasing mutable references.
pub trait PhysMapper {
    /// Convert a *physical* address to a mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Convert a physically contiguous run of `len` values starting at `pa`.
    ///
    /// # Safety
    /// As for [`phys_to_mut`](Self::phys_to_mut), for the whole run; the run
    /// must also be virtually contiguous under this mapper.
    unsafe fn phys_to_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        unsafe {
            let first: &mut T = self.phys_to_mut(pa);
            core::slice::from_raw_parts_mut(core::ptr::from_mut(first), len)
        }
    }

    /// Bytes of one 4 KiB frame.
    ///
    /// # Safety
    /// As for [`phys_to_mut`](Self::phys_to_mut).
    unsafe fn frame_bytes<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut [u8; 4096] {
        unsafe { self.phys_to_mut(page.base()) }
    }
}

/// Failures of the page-table walker.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame available for a page table")]
    OutOfTables,
    #[error("virtual address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("a huge page already covers {0}")]
    HugePageInPath(VirtualAddress),
    #[error("address is not aligned to the mapping size")]
    Misaligned,
    #[error("virtual address {0} is not canonical")]
    NonCanonical(VirtualAddress),
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::{Size1G, Size2M};

    /// A 4 KiB-aligned raw frame used as "physical RAM" in tests.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// In-memory "RAM": physical addresses are byte offsets into `frames`.
    ///
    /// Frames start out filled with garbage so that table clearing is tested.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| Aligned4K([0xA5; 4096])).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xfff) as usize;
            let base = self.frames[idx].0.as_ptr().cast_mut();
            // SAFETY: test frames are owned by `self` and outlive every use.
            unsafe { &mut *base.add(off).cast::<T>() }
        }
    }

    /// Bump allocator with a free list, counting live tables.
    struct BumpAlloc {
        next: u64,
        end: u64,
        freed: Vec<PhysicalPage<Size4K>>,
        live: usize,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                freed: Vec::new(),
                live: 0,
            }
        }
    }

    impl TableAlloc for BumpAlloc {
        fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
            let page = if let Some(p) = self.freed.pop() {
                p
            } else {
                if self.next + 4096 > self.end {
                    return None;
                }
                let p = PhysicalAddress::new(self.next).page();
                self.next += 4096;
                p
            };
            self.live += 1;
            Some(page)
        }

        fn free_table(&mut self, page: PhysicalPage<Size4K>) {
            self.live -= 1;
            self.freed.push(page);
        }
    }

    fn setup(frames: usize) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(frames);
        (phys, BumpAlloc::new(0, (frames as u64) << 12))
    }

    fn user_rw() -> PageEntry {
        PageEntry::new()
            .with_writable(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    #[test]
    fn map_4k_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(64);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x0000_0040_0020_3000);
        let pa = PhysicalAddress::new(0x0030_0000);
        pt.map::<Size4K, _>(&mut alloc, va, pa, user_rw(), PageEntry::table_link(true))
            .unwrap();

        // root + PDPT + PD + PT
        assert_eq!(alloc.live, 4);
        assert_eq!(pt.translate(va + 0x123), Some(pa + 0x123));

        let e = pt.pte(va);
        assert!(e.present() && e.writable() && e.user_access() && e.no_execute());
        assert!(!e.large_page());
        assert!(pt.root_entry(Level::PML4.index_of(va)).user_access());

        // neighbouring page in the same PT is untouched
        assert!(pt.pte(va + 4096).is_unused());
        assert_eq!(pt.translate(va + 4096), None);
    }

    #[test]
    fn second_map_reports_already_mapped_and_keeps_first() {
        let (phys, mut alloc) = setup(64);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x7000);
        let p1 = PhysicalAddress::new(0x10_000);
        let p2 = PhysicalAddress::new(0x20_000);
        let link = PageEntry::table_link(true);

        pt.map::<Size4K, _>(&mut alloc, va, p1, user_rw(), link).unwrap();
        assert_eq!(
            pt.map::<Size4K, _>(&mut alloc, va, p2, user_rw(), link),
            Err(MapError::AlreadyMapped(va))
        );
        assert_eq!(pt.translate(va), Some(p1));
    }

    #[test]
    fn rejects_bad_addresses() {
        let (phys, mut alloc) = setup(16);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let link = PageEntry::table_link(false);
        let bad = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(
            pt.map::<Size4K, _>(&mut alloc, bad, PhysicalAddress::zero(), user_rw(), link),
            Err(MapError::NonCanonical(bad))
        );
        assert_eq!(
            pt.map::<Size4K, _>(
                &mut alloc,
                VirtualAddress::new(0x1001),
                PhysicalAddress::zero(),
                user_rw(),
                link
            ),
            Err(MapError::Misaligned)
        );
        // nothing but the root was allocated
        assert_eq!(alloc.live, 1);
    }

    #[test]
    fn out_of_tables_is_reported() {
        let (phys, mut alloc) = setup(2);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let r = pt.map::<Size4K, _>(
            &mut alloc,
            VirtualAddress::new(0x1000),
            PhysicalAddress::new(0x1000),
            user_rw(),
            PageEntry::table_link(true),
        );
        assert_eq!(r, Err(MapError::OutOfTables));
    }

    #[test]
    fn huge_leaves_translate_with_large_offsets() {
        let (phys, mut alloc) = setup(64);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let link = PageEntry::table_link(false);

        let va2m = VirtualAddress::new(0xffff_8000_2000_0000);
        let pa2m = PhysicalAddress::new(0x0400_0000);
        pt.map::<Size2M, _>(&mut alloc, va2m, pa2m, PageEntry::new().with_writable(true), link)
            .unwrap();
        assert!(pt.pte(va2m).large_page());
        assert_eq!(pt.translate(va2m + 0x1_2345), Some(pa2m + 0x1_2345));

        let va1g = VirtualAddress::new(0x0000_4000_0000_0000);
        let pa1g = PhysicalAddress::new(0x4000_0000);
        pt.map::<Size1G, _>(&mut alloc, va1g, pa1g, PageEntry::new(), link)
            .unwrap();
        assert_eq!(pt.translate(va1g + 0x2345_6789), Some(pa1g + 0x2345_6789));

        // a 4K mapping under a huge leaf is refused
        let inner = va2m + 0x1000;
        assert_eq!(
            pt.map::<Size4K, _>(&mut alloc, inner, PhysicalAddress::zero(), PageEntry::new(), link),
            Err(MapError::HugePageInPath(inner))
        );
        assert!(pt.pte_mut(inner).is_none());
    }

    #[test]
    fn unmap_returns_previous_entry() {
        let (phys, mut alloc) = setup(64);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x9000);
        pt.map::<Size4K, _>(&mut alloc, va, pa, user_rw(), PageEntry::table_link(true))
            .unwrap();

        let old = pt.unmap(va).unwrap();
        assert_eq!(old.physical_address(), pa);
        assert_eq!(pt.translate(va), None);
        assert!(pt.unmap(va).is_none());
        assert!(pt.unmap(VirtualAddress::new(0x7FFF_0000_0000)).is_none());
    }

    #[test]
    fn for_each_pte_visits_exactly_the_range() {
        let (phys, mut alloc) = setup(128);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let link = PageEntry::table_link(true);

        // pages spread over two PTs and two PML4 slots
        let vas = [
            0x1000u64,
            0x2000,
            0x20_0000,
            0x0000_0080_0000_0000,
            0x0000_0080_0000_5000,
        ];
        for (i, va) in vas.iter().enumerate() {
            pt.map::<Size4K, _>(
                &mut alloc,
                VirtualAddress::new(*va),
                PhysicalAddress::new((i as u64 + 100) << 12),
                user_rw(),
                link,
            )
            .unwrap();
        }

        let mut seen = Vec::new();
        pt.for_each_pte(
            VirtualAddress::new(0x2000),
            VirtualAddress::new(0x0000_0080_0000_0000),
            |va, e| {
                seen.push(va.as_u64());
                e.set_writable(false);
            },
        );
        assert_eq!(seen, vec![0x2000, 0x20_0000, 0x0000_0080_0000_0000]);
        assert!(pt.pte(VirtualAddress::new(0x1000)).writable());
        assert!(!pt.pte(VirtualAddress::new(0x2000)).writable());
    }

    #[test]
    fn for_each_pte_yields_canonical_upper_half_addresses() {
        let (phys, mut alloc) = setup(64);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xffff_c980_0000_3000);
        pt.map::<Size4K, _>(
            &mut alloc,
            va,
            PhysicalAddress::new(0x5000),
            PageEntry::new(),
            PageEntry::table_link(false),
        )
        .unwrap();

        let mut seen = Vec::new();
        pt.for_each_pte(
            VirtualAddress::new(0xffff_8000_0000_0000),
            VirtualAddress::new(u64::MAX),
            |va, _| seen.push(va),
        );
        assert_eq!(seen, vec![va]);
    }

    #[test]
    fn free_subtrees_releases_every_table() {
        let (phys, mut alloc) = setup(128);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let link = PageEntry::table_link(true);
        for va in [0x1000u64, 0x4000_0000, 0x0000_0100_0000_0000] {
            pt.map::<Size4K, _>(&mut alloc, VirtualAddress::new(va), PhysicalAddress::new(0x1000), user_rw(), link)
                .unwrap();
        }
        let before = alloc.live;
        let freed = pt.free_subtrees(&mut alloc, 0..256);
        assert_eq!(freed, before - 1);
        assert_eq!(alloc.live, 1);
        assert_eq!(pt.translate(VirtualAddress::new(0x1000)), None);
        pt.free_root(&mut alloc);
        assert_eq!(alloc.live, 0);
    }

    #[test]
    fn ensure_root_slot_links_a_pdpt_once() {
        let (phys, mut alloc) = setup(16);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let link = PageEntry::table_link(false);
        let a = pt.ensure_root_slot(&mut alloc, 402, link).unwrap();
        let b = pt.ensure_root_slot(&mut alloc, 402, link).unwrap();
        assert_eq!(a, b);
        assert!(pt.root_entry(402).is_table_link());
        assert_eq!(alloc.live, 2);
    }

    #[test]
    fn ensure_pte_then_write_through_slot() {
        let (phys, mut alloc) = setup(16);
        let mut pt = PageTables::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x5000);
        let slot = pt
            .ensure_pte(&mut alloc, va, PageEntry::table_link(true))
            .unwrap();
        assert!(slot.is_unused());
        *slot = PageEntry::new().with_swapped(true);
        assert!(pt.pte(va).swapped());
        assert_eq!(pt.translate(va), None);
        assert!(pt.unmap(va).is_some_and(|e| e.swapped()));
    }
}
