//! # The Memory Manager
//!
//! [`MemoryManager`] ties the PMM, the kernel address space and the
//! architecture hooks together. Kernel start-up builds exactly one and hands
//! references to whoever needs memory; there is no global instance.

use crate::MmError;
use crate::arch::ArchMmu;
use crate::config::MmConfig;
use crate::pmm::PhysicalMemoryManager;
use crate::vmm::{AddressSpace, FaultCounters, FaultStats, PmmTables, SpaceKind};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{DEVICE_WINDOW_BASE, KERNEL_DYNAMIC_BASE};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{Level, MapError, PageEntry, PageTables, PhysMapper};
use log::info;

/// Kernel-half top-level slots that exist from the start.
///
/// User spaces copy the kernel's top-level entries once, when they are
/// created; mappings below these slots are then visible in every space.
const PREALLOCATED_SLOTS: [u64; 2] = [KERNEL_DYNAMIC_BASE, DEVICE_WINDOW_BASE];

/// Physical and virtual memory management for the whole machine.
pub struct MemoryManager<'m, M: PhysMapper, A: ArchMmu> {
    mapper: &'m M,
    mmu: A,
    config: MmConfig,
    pmm: PhysicalMemoryManager<'m, M>,
    kernel: AddressSpace,
    next_space_id: AtomicU64,
    faults: FaultCounters,
}

impl<'m, M: PhysMapper, A: ArchMmu> MemoryManager<'m, M, A> {
    /// Bring up the PMM from `map` and build a fresh kernel address space.
    ///
    /// # Errors
    /// Whatever [`PhysicalMemoryManager::init`] reports, or
    /// [`MmError::OutOfMemory`] if the kernel tables can't be allocated.
    pub fn new(mapper: &'m M, mmu: A, map: &[MemoryRegion], config: MmConfig) -> Result<Self, MmError> {
        let pmm = PhysicalMemoryManager::init(mapper, map, &config)?;
        let root = PageTables::create(mapper, &mut PmmTables::new(&pmm))?.root_page();
        Self::assemble(mapper, mmu, config, pmm, root)
    }

    /// Bring up the PMM and adopt the running kernel's page tables at `root`.
    ///
    /// # Safety
    /// `root` must be a valid PML4 reachable through `mapper`. Neither it nor
    /// the tables below it may lie in memory `map` reports as available.
    ///
    /// # Errors
    /// As for [`new`](Self::new).
    pub unsafe fn with_kernel_root(
        mapper: &'m M,
        mmu: A,
        map: &[MemoryRegion],
        config: MmConfig,
        root: PhysicalPage<Size4K>,
    ) -> Result<Self, MmError> {
        let pmm = PhysicalMemoryManager::init(mapper, map, &config)?;
        Self::assemble(mapper, mmu, config, pmm, root)
    }

    fn assemble(
        mapper: &'m M,
        mmu: A,
        config: MmConfig,
        pmm: PhysicalMemoryManager<'m, M>,
        root: PhysicalPage<Size4K>,
    ) -> Result<Self, MmError> {
        let mm = Self {
            mapper,
            mmu,
            config,
            pmm,
            kernel: AddressSpace::new(0, SpaceKind::Kernel, root),
            next_space_id: AtomicU64::new(1),
            faults: FaultCounters::default(),
        };
        mm.with_tables(&mm.kernel, |pt, alloc| -> Result<(), MapError> {
            for base in PREALLOCATED_SLOTS {
                let slot = Level::PML4.index_of(VirtualAddress::new(base));
                pt.ensure_root_slot(alloc, slot, PageEntry::table_link(false))?;
            }
            Ok(())
        })?;

        let stats = mm.pmm.stats();
        info!(
            "MM: ready, kernel root {}, {} of {} pages free",
            root, stats.free_pages, stats.managed_pages
        );
        Ok(mm)
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &PhysicalMemoryManager<'m, M> {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MmConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &A {
        &self.mmu
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[must_use]
    pub fn fault_stats(&self) -> FaultStats {
        self.faults.snapshot()
    }

    pub(crate) const fn fault_counters(&self) -> &FaultCounters {
        &self.faults
    }

    pub(crate) fn next_space_id(&self) -> u64 {
        self.next_space_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<M: PhysMapper, A: ArchMmu> core::fmt::Debug for MemoryManager<'_, M, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("kernel", &self.kernel)
            .field("free_pages", &self.pmm.free_page_count())
            .finish_non_exhaustive()
    }
}
