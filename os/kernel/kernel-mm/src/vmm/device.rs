//! Uncached MMIO windows in the kernel's device-window slot.

use super::{SpaceCounters, link_for};
use crate::MmError;
use crate::arch::ArchMmu;
use crate::manager::MemoryManager;
use crate::vmm::vma::{Vma, VmaKind};
use kernel_info::memory::{DEVICE_WINDOW_BASE, DEVICE_WINDOW_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{PageEntry, PhysMapper};
use log::debug;

/// Leaf flags of a device window: uncached, write-through, never executable,
/// and not owned by the PMM.
const DEVICE_ENTRY: PageEntry = PageEntry::new()
    .with_writable(true)
    .with_no_execute(true)
    .with_cache_disabled(true)
    .with_write_through(true)
    .with_global_translation(true)
    .with_device(true);

impl<M: PhysMapper, A: ArchMmu> MemoryManager<'_, M, A> {
    /// Map `size` bytes of device memory at `phys` into the kernel space.
    ///
    /// Returns the virtual address of `phys` itself, including its offset
    /// into the first page.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for an empty or overflowing range.
    /// - [`MmError::OutOfMemory`] if the device window is full or a table
    ///   can't be allocated.
    pub fn map_device(&self, phys: PhysicalAddress, size: u64) -> Result<VirtualAddress, MmError> {
        if size == 0 {
            return Err(MmError::InvalidArgument("empty range"));
        }
        let offset = phys.as_u64() & (PAGE_SIZE - 1);
        let base = phys.align_down::<Size4K>();
        let bytes = (offset + size)
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(MmError::InvalidArgument("range overflows the address space"))?;
        let pages = bytes / PAGE_SIZE;

        let kernel = self.kernel_space();
        let mut vmas = kernel.vmas.write();
        let start = vmas
            .find_gap(DEVICE_WINDOW_BASE, DEVICE_WINDOW_BASE + DEVICE_WINDOW_SIZE, bytes)
            .ok_or(MmError::OutOfMemory)?;
        vmas.insert(Vma::device(start, start + bytes, base))?;

        let mapped = self.with_tables(kernel, |pt, alloc| {
            for i in 0..pages {
                let va = VirtualAddress::new(start + i * PAGE_SIZE);
                if let Err(e) = pt.map::<Size4K, _>(alloc, va, base + i * PAGE_SIZE, DEVICE_ENTRY, link_for(kernel)) {
                    for j in 0..i {
                        pt.unmap(VirtualAddress::new(start + j * PAGE_SIZE));
                    }
                    return Err(MmError::from(e));
                }
            }
            Ok(())
        });
        if let Err(e) = mapped {
            vmas.carve(start, start + bytes);
            return Err(e);
        }

        self.mmu().flush_tlb_range(VirtualAddress::new(start), pages);
        SpaceCounters::add(&kernel.counters.virtual_pages, pages);
        SpaceCounters::add(&kernel.counters.resident, pages);
        debug!("VMM: device window {base}+{bytes:#x} at {:#x}", start);
        Ok(VirtualAddress::new(start + offset))
    }

    /// Remove the device window containing `virt`.
    ///
    /// # Errors
    /// - [`MmError::NotMapped`] if no area contains `virt`.
    /// - [`MmError::InvalidArgument`] if the area is not a device window.
    pub fn unmap_device(&self, virt: VirtualAddress) -> Result<(), MmError> {
        let kernel = self.kernel_space();
        let mut vmas = kernel.vmas.write();
        let vma = vmas.find(virt.as_u64()).ok_or(MmError::NotMapped)?;
        if vma.kind() != VmaKind::Device {
            return Err(MmError::InvalidArgument("not a device window"));
        }
        let (start, end) = (vma.start(), vma.end());
        vmas.carve(start, end);

        // Device entries hold no references; this only clears and flushes.
        self.release_range(kernel, start, end);
        SpaceCounters::sub(&kernel.counters.virtual_pages, (end - start) / PAGE_SIZE);
        debug!("VMM: device window at {start:#x} removed");
        Ok(())
    }
}
