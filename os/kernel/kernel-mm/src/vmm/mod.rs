//! # Virtual Memory Manager
//!
//! Address spaces, their areas and the page tables behind them. Every
//! operation is a method on [`MemoryManager`](crate::MemoryManager); this
//! module holds the pieces they share.
//!
//! ## Frame ownership
//!
//! A present leaf entry owns one PMM reference on its frame, unless it carries
//! the software `device` bit. Only block heads handed out by the PMM are
//! reference counted; anything else mapped through
//! [`map_page`](crate::MemoryManager::map_page) is treated as a device frame.
//!
//! Entries are always cleared and the TLB flushed *before* their references
//! are dropped, so a frame is never reused while another CPU may still reach
//! it through a stale translation.

mod address_space;
mod device;
mod fault;
mod lifecycle;
mod mapping;
mod table_alloc;
mod vma;

pub use address_space::{AddressSpace, NumaPolicy, SpaceKind, SpaceStats};
pub use fault::{FaultKind, FaultResult, FaultStats, PageFault};
pub use vma::{Vma, VmaInfo, VmaKind, VmaSet};

pub(crate) use address_space::SpaceCounters;
pub(crate) use fault::FaultCounters;
pub(crate) use table_alloc::PmmTables;

use crate::MmError;
use crate::arch::ArchMmu;
use crate::flags::{AllocFlags, Protection};
use crate::manager::MemoryManager;
use alloc::vec::Vec;
use kernel_info::memory::{KERNEL_SPACE_BASE, PAGE_SIZE, USER_SPACE_END};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{PageEntry, PageTables, PhysMapper};
use log::error;

/// Intermediate table link for a space.
pub(crate) const fn link_for(space: &AddressSpace) -> PageEntry {
    PageEntry::table_link(!space.is_kernel())
}

/// Present leaf for a frame backing `vma`.
pub(crate) fn leaf_for(space: &AddressSpace, vma: &Vma, frame: PhysicalPage<Size4K>) -> PageEntry {
    let prot = vma.protection();
    PageEntry::leaf(frame)
        .with_writable(prot.contains(Protection::WRITE))
        .with_no_execute(!prot.contains(Protection::EXEC))
        .with_user_access(!space.is_kernel())
        .with_shared(vma.is_shared())
}

/// Page-align `[start, start + size)` and check it lies in `space`'s half.
pub(crate) fn page_range(space: &AddressSpace, start: u64, size: u64) -> Result<(u64, u64), MmError> {
    if size == 0 {
        return Err(MmError::InvalidArgument("empty range"));
    }
    let first = start & !(PAGE_SIZE - 1);
    let end = start
        .checked_add(size)
        .and_then(|e| e.checked_next_multiple_of(PAGE_SIZE))
        .ok_or(MmError::InvalidArgument("range overflows the address space"))?;
    check_half(space, first, end)?;
    Ok((first, end))
}

/// `[first, end)` must be in the lower half for user spaces and in the upper
/// half for the kernel space.
pub(crate) const fn check_half(space: &AddressSpace, first: u64, end: u64) -> Result<(), MmError> {
    let inside = if space.is_kernel() {
        first >= KERNEL_SPACE_BASE
    } else {
        end <= USER_SPACE_END
    };
    if inside {
        Ok(())
    } else {
        Err(MmError::InvalidArgument("range is outside the address space's half"))
    }
}

/// `va` must be canonical, page aligned and inside `space`'s half.
pub(crate) fn check_page(space: &AddressSpace, va: VirtualAddress) -> Result<(), MmError> {
    if !va.is_canonical() {
        return Err(MmError::InvalidArgument("virtual address is not canonical"));
    }
    if !va.is_aligned::<Size4K>() {
        return Err(MmError::InvalidArgument("address is not page aligned"));
    }
    check_half(space, va.as_u64(), va.as_u64().saturating_add(PAGE_SIZE))
}

pub(crate) fn ensure_alive(space: &AddressSpace) -> Result<(), MmError> {
    if space.is_destroyed() {
        Err(MmError::InvalidArgument("address space already destroyed"))
    } else {
        Ok(())
    }
}

/// Allocation flags for frames backing `space`.
pub(crate) const fn frame_flags(space: &AddressSpace) -> AllocFlags {
    if space.is_kernel() { AllocFlags::KERNEL } else { AllocFlags::USER }
}

impl<'m, M: PhysMapper, A: ArchMmu> MemoryManager<'m, M, A> {
    /// Run `f` on `space`'s tables under its table lock and account for
    /// intermediate tables it allocated or freed.
    pub(crate) fn with_tables<R>(
        &self,
        space: &AddressSpace,
        f: impl FnOnce(&mut PageTables<'m, M>, &mut PmmTables<'_, 'm, M>) -> R,
    ) -> R {
        let mut alloc = PmmTables::new(self.pmm());
        let result = {
            let _guard = space.tables.lock();
            let mut tables = PageTables::from_root(self.mapper(), space.root());
            f(&mut tables, &mut alloc)
        };
        SpaceCounters::add(&space.counters.tables, alloc.allocated());
        SpaceCounters::sub(&space.counters.tables, alloc.freed());
        result
    }

    /// Account for a present entry that left `space`.
    pub(crate) fn note_unmapped(space: &AddressSpace, entry: PageEntry) {
        SpaceCounters::sub(&space.counters.resident, 1);
        if entry.shared() {
            SpaceCounters::sub(&space.counters.shared, 1);
        }
    }

    /// Drop the reference a cleared entry held. Device entries hold none.
    pub(crate) fn release_frame(&self, frame: PhysicalAddress) {
        if let Err(e) = self.pmm().dec_ref_count(frame) {
            error!("VMM: dropping the reference on {frame} failed: {e}");
        }
    }

    /// Clear every leaf in `[first, end)`, flush, then drop the references.
    /// Returns how many present pages were removed.
    pub(crate) fn release_range(&self, space: &AddressSpace, first: u64, end: u64) -> u64 {
        if first >= end {
            return 0;
        }
        let mut frames = Vec::new();
        let mut removed = 0;
        self.with_tables(space, |pt, _| {
            pt.for_each_pte(VirtualAddress::new(first), VirtualAddress::new(end - 1), |_, entry| {
                let old = core::mem::replace(entry, PageEntry::new());
                if !old.present() {
                    return;
                }
                removed += 1;
                Self::note_unmapped(space, old);
                if !old.device() {
                    frames.push(old.physical_address());
                }
            });
        });
        self.mmu().flush_tlb_range(VirtualAddress::new(first), (end - first) / PAGE_SIZE);
        for frame in frames {
            self.release_frame(frame);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::MapFlags;

    #[test]
    fn ranges_are_page_aligned_outwards() {
        let user = AddressSpace::new(1, SpaceKind::User, PhysicalPage::from_pfn(1));
        assert_eq!(page_range(&user, 0x1234, 0x10), Ok((0x1000, 0x2000)));
        assert_eq!(page_range(&user, 0x1ff0, 0x20), Ok((0x1000, 0x3000)));
        assert!(page_range(&user, 0x1000, 0).is_err());
        assert!(page_range(&user, USER_SPACE_END - PAGE_SIZE, 2 * PAGE_SIZE).is_err());
        assert!(page_range(&user, u64::MAX - 10, 100).is_err());
    }

    #[test]
    fn halves_are_enforced() {
        let user = AddressSpace::new(1, SpaceKind::User, PhysicalPage::from_pfn(1));
        let kernel = AddressSpace::new(0, SpaceKind::Kernel, PhysicalPage::from_pfn(2));
        let high = VirtualAddress::new(KERNEL_SPACE_BASE);
        let low = VirtualAddress::new(0x40_0000);
        assert!(check_page(&user, low).is_ok());
        assert!(check_page(&user, high).is_err());
        assert!(check_page(&kernel, high).is_ok());
        assert!(check_page(&kernel, low).is_err());
        assert!(check_page(&user, VirtualAddress::new(0x40_0010)).is_err());
        assert!(check_page(&user, VirtualAddress::new(0x0000_9000_0000_0000)).is_err());
    }

    #[test]
    fn leaves_follow_the_area() {
        let user = AddressSpace::new(1, SpaceKind::User, PhysicalPage::from_pfn(1));
        let code = Vma::new(0x1000, 0x2000, VmaKind::Code, Protection::READ_EXEC, MapFlags::PRIVATE);
        let e = leaf_for(&user, &code, PhysicalPage::from_pfn(7));
        assert!(!e.writable() && !e.no_execute() && e.user_access() && !e.shared());

        let shm = Vma::new(0x1000, 0x2000, VmaKind::Shared, Protection::READ_WRITE, MapFlags::SHARED);
        let e = leaf_for(&user, &shm, PhysicalPage::from_pfn(7));
        assert!(e.writable() && e.no_execute() && e.shared());
        assert_eq!(e.frame().pfn(), 7);
    }
}
