//! Areas and explicit mappings: creating, protecting, growing and removing
//! them, and installing or clearing single pages.

use super::{
    AddressSpace, SpaceCounters, VmaInfo, VmaKind, check_half, check_page, ensure_alive, link_for, page_range,
};
use crate::MmError;
use crate::arch::ArchMmu;
use crate::flags::{MapFlags, PageFlags, Protection};
use crate::manager::MemoryManager;
use crate::vmm::vma::Vma;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::PhysMapper;
use log::debug;

impl<M: PhysMapper, A: ArchMmu> MemoryManager<'_, M, A> {
    /// Create an area of `size` bytes at `start`, both rounded out to pages.
    ///
    /// Without [`MapFlags::FIXED`], overlapping an existing area fails and
    /// leaves the set untouched. With it, the overlapped parts of existing
    /// areas are removed together with their pages. [`MapFlags::LOCKED`]
    /// populates every page up front.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for an empty or out-of-half range, an
    ///   empty protection, `PRIVATE | SHARED`, or [`VmaKind::Device`] (use
    ///   [`map_device`](Self::map_device)).
    /// - [`MmError::VmaConflict`] on overlap without `FIXED`.
    /// - [`MmError::OutOfMemory`] if populating a locked area fails; the area
    ///   is removed again.
    pub fn create_vma(
        &self,
        space: &AddressSpace,
        start: VirtualAddress,
        size: u64,
        protection: Protection,
        flags: MapFlags,
        kind: VmaKind,
    ) -> Result<VmaInfo, MmError> {
        let (first, end) = page_range(space, start.as_u64(), size)?;
        if protection.is_empty() {
            return Err(MmError::InvalidArgument("an area needs at least one access right"));
        }
        if kind == VmaKind::Device {
            return Err(MmError::InvalidArgument("device areas are created by map_device"));
        }
        if flags.contains(MapFlags::PRIVATE | MapFlags::SHARED) {
            return Err(MmError::InvalidArgument("PRIVATE and SHARED are exclusive"));
        }
        let flags = if flags.intersects(MapFlags::PRIVATE | MapFlags::SHARED) {
            flags
        } else if kind == VmaKind::Shared {
            flags | MapFlags::SHARED
        } else {
            flags | MapFlags::PRIVATE
        };

        let mut vmas = space.vmas.write();
        ensure_alive(space)?;
        if vmas.overlaps(first, end) {
            if !flags.contains(MapFlags::FIXED) {
                return Err(MmError::VmaConflict);
            }
            let replaced: u64 = vmas.carve(first, end).iter().map(Vma::pages).sum();
            SpaceCounters::sub(&space.counters.virtual_pages, replaced);
            self.release_range(space, first, end);
        }

        vmas.insert(Vma::new(first, end, kind, protection, flags))?;
        let pages = (end - first) / PAGE_SIZE;
        SpaceCounters::add(&space.counters.virtual_pages, pages);

        if flags.contains(MapFlags::LOCKED) {
            let populated = vmas.find(first).map_or(Ok(()), |vma| {
                (0..pages).try_for_each(|i| {
                    self.demand_page(space, vma, VirtualAddress::new(first + i * PAGE_SIZE))
                        .map(|_| ())
                })
            });
            if let Err(e) = populated {
                vmas.carve(first, end);
                SpaceCounters::sub(&space.counters.virtual_pages, pages);
                self.release_range(space, first, end);
                return Err(e);
            }
        }

        let info = vmas.find(first).map(Vma::info).ok_or(MmError::Corruption("area vanished after insert"))?;
        debug!(
            "VMM: space {} area {:?} {}..{} {:?}",
            space.id(),
            kind,
            info.start,
            info.end,
            protection
        );
        Ok(info)
    }

    /// Map the 4 KiB frame at `phys` at `virt`.
    ///
    /// The mapping takes over the caller's reference on a PMM-allocated
    /// frame; it is dropped again when the page is unmapped. Frames the PMM
    /// does not hand out (MMIO, firmware tables) are marked as device frames
    /// and never reference counted.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for a non-canonical, misaligned or
    ///   out-of-half address.
    /// - [`MmError::AlreadyMapped`] if `virt` is mapped; the existing
    ///   translation is kept.
    /// - [`MmError::OutOfMemory`] if an intermediate table can't be allocated.
    pub fn map_page(
        &self,
        space: &AddressSpace,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MmError> {
        check_page(space, virt)?;
        if !phys.is_aligned::<Size4K>() {
            return Err(MmError::InvalidArgument("address is not page aligned"));
        }
        let _vmas = space.vmas.read();
        ensure_alive(space)?;

        let entry = flags.to_entry().with_device(!self.pmm().is_allocated(phys));
        self.with_tables(space, |pt, alloc| {
            pt.map::<Size4K, _>(alloc, virt, phys, entry, link_for(space))
        })?;

        SpaceCounters::add(&space.counters.resident, 1);
        if entry.shared() {
            SpaceCounters::add(&space.counters.shared, 1);
        }
        self.mmu().flush_tlb_page(virt);
        Ok(())
    }

    /// Unmap the page at `virt` and return the frame it pointed to.
    ///
    /// # Errors
    /// - [`MmError::NotMapped`] if no page is present at `virt`.
    /// - [`MmError::InvalidArgument`] for a bad address or a huge leaf.
    pub fn unmap_page(&self, space: &AddressSpace, virt: VirtualAddress) -> Result<PhysicalAddress, MmError> {
        check_page(space, virt)?;
        let _vmas = space.vmas.read();
        ensure_alive(space)?;

        let old = self.with_tables(space, |pt, _| {
            let e = pt.pte(virt);
            if !e.present() {
                return Err(MmError::NotMapped);
            }
            if e.large_page() {
                return Err(MmError::InvalidArgument("huge mappings are not unmapped page by page"));
            }
            pt.unmap(virt).ok_or(MmError::NotMapped)
        })?;

        self.mmu().flush_tlb_page(virt);
        Self::note_unmapped(space, old);
        if !old.device() {
            self.release_frame(old.physical_address());
        }
        Ok(old.physical_address())
    }

    /// Unmap `count` pages from `virt`; holes are skipped. Returns how many
    /// pages were actually mapped.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] for a bad address or an empty range.
    pub fn unmap_pages(&self, space: &AddressSpace, virt: VirtualAddress, count: u64) -> Result<u64, MmError> {
        check_page(space, virt)?;
        let size = count
            .checked_mul(PAGE_SIZE)
            .ok_or(MmError::InvalidArgument("range overflows the address space"))?;
        let (first, end) = page_range(space, virt.as_u64(), size)?;
        let _vmas = space.vmas.read();
        ensure_alive(space)?;
        Ok(self.release_range(space, first, end))
    }

    /// Physical address `virt` currently translates to in `space`.
    #[must_use]
    pub fn translate(&self, space: &AddressSpace, virt: VirtualAddress) -> Option<PhysicalAddress> {
        if !virt.is_canonical() {
            return None;
        }
        let _vmas = space.vmas.read();
        if space.is_destroyed() {
            return None;
        }
        self.with_tables(space, |pt, _| pt.translate(virt))
    }

    /// Change the protection of `[start, start + size)`.
    ///
    /// Areas are split at the range boundaries, present entries are updated
    /// (copy-on-write entries stay read-only) and neighbours that end up
    /// identical are merged again.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for a bad range, an empty protection or
    ///   a device window.
    /// - [`MmError::NotMapped`] if some page of the range has no area.
    pub fn protect_range(
        &self,
        space: &AddressSpace,
        start: VirtualAddress,
        size: u64,
        protection: Protection,
    ) -> Result<(), MmError> {
        let (first, end) = page_range(space, start.as_u64(), size)?;
        if protection.is_empty() {
            return Err(MmError::InvalidArgument("an area cannot be made inaccessible, unmap it instead"));
        }

        let mut vmas = space.vmas.write();
        ensure_alive(space)?;
        if !vmas.covers(first, end) {
            return Err(MmError::NotMapped);
        }
        if vmas.overlapping(first, end).any(|v| v.kind() == VmaKind::Device) {
            return Err(MmError::InvalidArgument("device windows keep their protection"));
        }
        vmas.split_at(first);
        vmas.split_at(end);
        vmas.set_protection(first, end, protection);

        let writable = protection.contains(Protection::WRITE);
        let executable = protection.contains(Protection::EXEC);
        self.with_tables(space, |pt, _| {
            pt.for_each_pte(VirtualAddress::new(first), VirtualAddress::new(end - 1), |_, e| {
                if e.present() {
                    *e = e
                        .with_writable(writable && !e.copy_on_write())
                        .with_no_execute(!executable);
                }
            });
        });
        self.mmu().flush_tlb_range(VirtualAddress::new(first), (end - first) / PAGE_SIZE);

        vmas.merge_around(first, end);
        debug!(
            "VMM: space {} {:#x}..{:#x} now {:?}",
            space.id(),
            first,
            end,
            protection
        );
        Ok(())
    }

    /// Remove every area (or the overlapping part of it) in
    /// `[start, start + size)` and release the pages behind it.
    ///
    /// Returns the number of pages released. A range without areas is not an
    /// error.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] for a bad range.
    pub fn unmap_range(&self, space: &AddressSpace, start: VirtualAddress, size: u64) -> Result<u64, MmError> {
        let (first, end) = page_range(space, start.as_u64(), size)?;
        let mut vmas = space.vmas.write();
        ensure_alive(space)?;
        let removed: u64 = vmas.carve(first, end).iter().map(Vma::pages).sum();
        SpaceCounters::sub(&space.counters.virtual_pages, removed);
        let released = self.release_range(space, first, end);
        debug!(
            "VMM: space {} {:#x}..{:#x} unmapped, {released} pages released",
            space.id(),
            first,
            end
        );
        Ok(released)
    }

    /// Grow the heap or stack area containing `addr` by `pages` pages.
    ///
    /// Heaps grow upwards, stacks downwards. New pages are demand-paged.
    ///
    /// # Errors
    /// - [`MmError::NotMapped`] if no area contains `addr`.
    /// - [`MmError::InvalidArgument`] for other area kinds, `pages == 0` or
    ///   growth out of the space's half.
    /// - [`MmError::VmaConflict`] if the grown area would overlap another.
    pub fn grow_vma(&self, space: &AddressSpace, addr: VirtualAddress, pages: u64) -> Result<VmaInfo, MmError> {
        if pages == 0 {
            return Err(MmError::InvalidArgument("nothing to grow"));
        }
        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MmError::InvalidArgument("range overflows the address space"))?;
        let overflow = MmError::InvalidArgument("range overflows the address space");

        let mut vmas = space.vmas.write();
        ensure_alive(space)?;
        let vma = vmas.find(addr.as_u64()).ok_or(MmError::NotMapped)?;
        let key = vma.start();
        let (first, end) = match vma.kind() {
            VmaKind::Heap => (vma.start(), vma.end().checked_add(bytes).ok_or(overflow)?),
            VmaKind::Stack => (vma.start().checked_sub(bytes).ok_or(overflow)?, vma.end()),
            _ => return Err(MmError::InvalidArgument("only heap and stack areas grow")),
        };
        check_half(space, first, end)?;
        vmas.resize(key, first, end)?;
        SpaceCounters::add(&space.counters.virtual_pages, pages);

        let info = vmas.find(first).map(Vma::info).ok_or(MmError::Corruption("area vanished after resize"))?;
        debug!(
            "VMM: space {} {:?} area now {}..{}",
            space.id(),
            info.kind,
            info.start,
            info.end
        );
        Ok(info)
    }
}
