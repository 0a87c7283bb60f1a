//! Page-table frames come from the PMM like any other kernel allocation.

use crate::flags::AllocFlags;
use crate::pmm::PhysicalMemoryManager;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_vmem::{PhysMapper, TableAlloc};
use log::error;

/// [`TableAlloc`] over the PMM that counts what it hands out and takes back.
pub(crate) struct PmmTables<'a, 'm, M: PhysMapper> {
    pmm: &'a PhysicalMemoryManager<'m, M>,
    allocated: u64,
    freed: u64,
}

impl<'a, 'm, M: PhysMapper> PmmTables<'a, 'm, M> {
    pub(crate) const fn new(pmm: &'a PhysicalMemoryManager<'m, M>) -> Self {
        Self {
            pmm,
            allocated: 0,
            freed: 0,
        }
    }

    pub(crate) const fn allocated(&self) -> u64 {
        self.allocated
    }

    pub(crate) const fn freed(&self) -> u64 {
        self.freed
    }
}

impl<M: PhysMapper> TableAlloc for PmmTables<'_, '_, M> {
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
        // The walker clears new tables itself.
        let pa = self.pmm.alloc_pages(0, AllocFlags::KERNEL).ok()?;
        self.allocated += 1;
        Some(pa.page())
    }

    fn free_table(&mut self, page: PhysicalPage<Size4K>) {
        match self.pmm.free_pages(page.base(), 0) {
            Ok(()) => self.freed += 1,
            Err(e) => error!("VMM: page table {page} could not be freed: {e}"),
        }
    }
}
