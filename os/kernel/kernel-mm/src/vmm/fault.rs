//! # Page Fault Resolution
//!
//! ```text
//!   no area / non-canonical ───────────────────────▶ SegmentationFault
//!   access not allowed by the area ────────────────▶ ProtectionViolation
//!   entry present
//!     ├─ write, COW entry ──▶ copy (or reuse if sole owner) ▶ CopyOnWrite
//!     ├─ write, read-only ─────────────────────────▶ ProtectionViolation
//!     └─ otherwise: stale TLB, flush ──────────────▶ resolved
//!   entry swapped ─────────────────────────────────▶ SwapIn (unresolved)
//!   entry empty ──▶ zeroed frame [+ prefetch] ─────▶ DemandPage
//! ```
//!
//! Faults hold the area set as readers for the whole resolution; frames are
//! allocated outside the table lock and the entry is re-checked before it is
//! installed, so two CPUs faulting on the same page install one frame.

use super::{AddressSpace, SpaceCounters, VmaInfo, frame_flags, leaf_for, link_for};
use crate::MmError;
use crate::arch::ArchMmu;
use crate::dispatch::PageFaultError;
use crate::flags::{AllocFlags, Protection};
use crate::manager::MemoryManager;
use crate::vmm::vma::{Vma, VmaKind, VmaSet};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::{PageEntry, PhysMapper};
use log::{debug, error, warn};

/// What a fault turned out to be.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FaultKind {
    DemandPage,
    CopyOnWrite,
    SwapIn,
    ProtectionViolation,
    SegmentationFault,
}

impl FaultKind {
    pub const ALL: [Self; 5] = [
        Self::DemandPage,
        Self::CopyOnWrite,
        Self::SwapIn,
        Self::ProtectionViolation,
        Self::SegmentationFault,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Outcome handed back to the dispatcher.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultResult {
    pub resolved: bool,
    pub kind: FaultKind,
}

/// One page fault, as decoded by the dispatcher and annotated by the VMM.
#[derive(Debug, Copy, Clone)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub address: VirtualAddress,
    pub error: PageFaultError,
    /// Process the faulting space belongs to.
    pub pid: u64,
    pub timestamp: u64,
    /// Area containing the address, once found.
    pub vma: Option<VmaInfo>,
    pub kind: Option<FaultKind>,
    pub resolved: bool,
    /// Why an otherwise legal fault could not be resolved.
    pub failure: Option<MmError>,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError, pid: u64, timestamp: u64) -> Self {
        Self {
            address,
            error,
            pid,
            timestamp,
            vma: None,
            kind: None,
            resolved: false,
            failure: None,
        }
    }
}

/// Fault totals across all address spaces.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct FaultStats {
    pub demand_page: u64,
    pub copy_on_write: u64,
    pub swap_in: u64,
    pub protection_violation: u64,
    pub segmentation_fault: u64,
    /// Faults resolved by flushing a stale translation.
    pub spurious: u64,
    pub unresolved: u64,
    /// Sum of resolution times in timestamp units.
    pub total_time: u64,
}

#[derive(Default)]
pub(crate) struct FaultCounters {
    by_kind: [AtomicU64; FaultKind::ALL.len()],
    spurious: AtomicU64,
    unresolved: AtomicU64,
    time: AtomicU64,
}

impl FaultCounters {
    fn record(&self, kind: FaultKind, resolved: bool, time: u64) {
        self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
        if !resolved {
            self.unresolved.fetch_add(1, Ordering::Relaxed);
        }
        self.time.fetch_add(time, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> FaultStats {
        let kind = |k: FaultKind| self.by_kind[k.index()].load(Ordering::Relaxed);
        FaultStats {
            demand_page: kind(FaultKind::DemandPage),
            copy_on_write: kind(FaultKind::CopyOnWrite),
            swap_in: kind(FaultKind::SwapIn),
            protection_violation: kind(FaultKind::ProtectionViolation),
            segmentation_fault: kind(FaultKind::SegmentationFault),
            spurious: self.spurious.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            total_time: self.time.load(Ordering::Relaxed),
        }
    }
}

/// Whether `protection` allows the access described by `error`.
///
/// x86 cannot express write-only or execute-only pages, so any permission
/// implies read access.
const fn permits(protection: Protection, error: PageFaultError) -> bool {
    if error.write() {
        protection.contains(Protection::WRITE)
    } else if error.instruction_fetch() {
        protection.contains(Protection::EXEC)
    } else {
        !protection.is_empty()
    }
}

/// Same translation and permissions, ignoring what the CPU sets by itself.
const fn same_mapping(a: PageEntry, b: PageEntry) -> bool {
    a.with_accessed(false).with_dirty(false).into_bits() == b.with_accessed(false).with_dirty(false).into_bits()
}

impl<M: PhysMapper, A: ArchMmu> MemoryManager<'_, M, A> {
    /// Resolve `fault` in `space` and annotate the descriptor.
    ///
    /// Never fails: anything that can't be resolved comes back with
    /// `resolved == false` and the classification the dispatcher acts on.
    pub fn handle_page_fault(&self, space: &AddressSpace, fault: &mut PageFault) -> FaultResult {
        let started = self.mmu().timestamp();
        let (kind, outcome) = {
            let vmas = space.vmas.read();
            self.resolve(space, &vmas, fault)
        };
        let elapsed = self.mmu().timestamp().saturating_sub(started);

        fault.kind = Some(kind);
        fault.resolved = outcome.is_ok();
        fault.failure = outcome.err();

        SpaceCounters::add(&space.counters.faults, 1);
        SpaceCounters::add(&space.counters.fault_time, elapsed);
        self.fault_counters().record(kind, fault.resolved, elapsed);

        match outcome {
            Ok(()) => debug!("VMM: {kind:?} at {} in space {} resolved", fault.address, space.id()),
            Err(e) => debug!(
                "VMM: {kind:?} at {} in space {} unresolved: {e}",
                fault.address,
                space.id()
            ),
        }
        FaultResult {
            resolved: fault.resolved,
            kind,
        }
    }

    fn resolve(&self, space: &AddressSpace, vmas: &VmaSet, fault: &mut PageFault) -> (FaultKind, Result<(), MmError>) {
        use FaultKind::{CopyOnWrite, DemandPage, ProtectionViolation, SegmentationFault, SwapIn};

        if space.is_destroyed() {
            return (SegmentationFault, Err(MmError::NotMapped));
        }
        if !fault.address.is_canonical() {
            return (
                SegmentationFault,
                Err(MmError::InvalidArgument("virtual address is not canonical")),
            );
        }
        let Some(vma) = vmas.find(fault.address.as_u64()) else {
            return (SegmentationFault, Err(MmError::NotMapped));
        };
        vma.record_fault();
        fault.vma = Some(vma.info());

        let error = fault.error;
        if error.reserved_bit() {
            error!("VMM: reserved bit set in a paging entry for {}", fault.address);
            return (
                ProtectionViolation,
                Err(MmError::Corruption("reserved bit set in a paging entry")),
            );
        }
        if (error.user() && space.is_kernel()) || !permits(vma.protection(), error) {
            return (ProtectionViolation, Err(MmError::AccessViolation));
        }

        let page = fault.address.align_down::<Size4K>();
        let entry = self.with_tables(space, |pt, _| pt.pte(page));

        if entry.present() {
            if error.write() && entry.copy_on_write() {
                return (CopyOnWrite, self.copy_on_write(space, page, entry));
            }
            if (error.write() && !entry.writable()) || (error.instruction_fetch() && entry.no_execute()) {
                return (ProtectionViolation, Err(MmError::AccessViolation));
            }
            // Another CPU got here first, or this CPU still caches the old
            // translation.
            self.mmu().flush_tlb_page(page);
            self.fault_counters().spurious.fetch_add(1, Ordering::Relaxed);
            let kind = if error.present() && error.write() { CopyOnWrite } else { DemandPage };
            return (kind, Ok(()));
        }
        if entry.swapped() {
            warn!("VMM: swap-in requested for {page} in space {}", space.id());
            return (SwapIn, Err(MmError::NotMapped));
        }
        if vma.kind() == VmaKind::Device {
            // Device windows are mapped in full when they are created.
            return (SegmentationFault, Err(MmError::NotMapped));
        }

        match self.demand_page(space, vma, page) {
            Ok(_) => {
                self.prefetch(space, vma, page);
                (DemandPage, Ok(()))
            }
            Err(e) => (DemandPage, Err(e)),
        }
    }

    /// Back `page` with a zeroed frame unless something is already there.
    /// Returns whether this call installed the frame.
    pub(crate) fn demand_page(&self, space: &AddressSpace, vma: &Vma, page: VirtualAddress) -> Result<bool, MmError> {
        let frame = self.pmm().alloc_pages(0, frame_flags(space) | AllocFlags::ZERO)?;
        let entry = leaf_for(space, vma, frame.page());
        let installed = self.with_tables(space, |pt, alloc| -> Result<bool, MmError> {
            let slot = pt.ensure_pte(alloc, page, link_for(space))?;
            if slot.present() {
                return Ok(false);
            }
            *slot = entry;
            Ok(true)
        });

        match installed {
            Ok(true) => {
                SpaceCounters::add(&space.counters.resident, 1);
                if entry.shared() {
                    SpaceCounters::add(&space.counters.shared, 1);
                }
                self.mmu().flush_tlb_page(page);
                Ok(true)
            }
            Ok(false) => {
                self.pmm().free_pages(frame, 0)?;
                Ok(false)
            }
            Err(e) => {
                self.pmm().free_pages(frame, 0)?;
                Err(e)
            }
        }
    }

    /// After a fault right behind the previous one, populate the next pages
    /// of the area as well.
    fn prefetch(&self, space: &AddressSpace, vma: &Vma, page: VirtualAddress) {
        let previous = space.last_fault.swap(page.as_u64(), Ordering::Relaxed);
        let window = u64::from(self.config().prefetch_pages);
        if window == 0 || previous.wrapping_add(PAGE_SIZE) != page.as_u64() {
            return;
        }
        let mut last = page.as_u64();
        for i in 1..=window {
            let next = page.as_u64() + i * PAGE_SIZE;
            if !vma.contains(next) {
                break;
            }
            match self.demand_page(space, vma, VirtualAddress::new(next)) {
                Ok(true) => SpaceCounters::add(&space.counters.prefetched, 1),
                Ok(false) => {}
                Err(_) => break,
            }
            last = next;
        }
        // The next sequential fault lands right after the prefetched run.
        space.last_fault.store(last, Ordering::Relaxed);
    }

    /// Give the faulting space a private, writable copy of the page.
    fn copy_on_write(&self, space: &AddressSpace, page: VirtualAddress, entry: PageEntry) -> Result<(), MmError> {
        if entry.device() {
            return Err(MmError::AccessViolation);
        }
        let old = entry.physical_address();
        let private = entry.with_copy_on_write(false).with_writable(true);

        if self.pmm().ref_count(old)? == 1 {
            // Sole owner: the frame is already private.
            let reused = self.with_tables(space, |pt, _| match pt.pte_mut(page) {
                Some(slot) if same_mapping(*slot, entry) => {
                    *slot = private;
                    true
                }
                _ => false,
            });
            self.mmu().flush_tlb_page(page);
            if reused {
                SpaceCounters::add(&space.counters.dirty, 1);
            }
            return Ok(());
        }

        let copy = self.pmm().alloc_pages(0, frame_flags(space))?;
        // SAFETY: two distinct 4 KiB frames; `copy` is not reachable by
        // anyone else yet and `old` is only read.
        unsafe {
            let to = self.mapper().frame_bytes(copy.page());
            *to = *self.mapper().frame_bytes(old.page());
        }

        let installed = self.with_tables(space, |pt, _| match pt.pte_mut(page) {
            Some(slot) if same_mapping(*slot, entry) => {
                *slot = private
                    .with_physical_address(copy)
                    .with_accessed(false)
                    .with_dirty(false);
                true
            }
            _ => false,
        });
        self.mmu().flush_tlb_page(page);

        if installed {
            self.release_frame(old);
            SpaceCounters::add(&space.counters.dirty, 1);
        } else {
            // Raced with another resolution of the same page.
            self.pmm().free_pages(copy, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_follow_x86_rules() {
        let read = PageFaultError::new();
        let write = PageFaultError::new().with_write(true);
        let fetch = PageFaultError::new().with_instruction_fetch(true);

        assert!(permits(Protection::READ, read));
        assert!(!permits(Protection::READ, write));
        assert!(!permits(Protection::READ, fetch));
        assert!(permits(Protection::WRITE, read), "write implies read");
        assert!(permits(Protection::READ_EXEC, fetch));
        assert!(!permits(Protection::empty(), read));
    }

    #[test]
    fn hardware_bits_do_not_break_a_recheck() {
        let e = PageEntry::leaf(kernel_memory_addresses::PhysicalPage::from_pfn(3)).into_copy_on_write();
        assert!(same_mapping(e, e.with_accessed(true).with_dirty(true)));
        assert!(!same_mapping(e, e.with_copy_on_write(false)));
    }

    #[test]
    fn counters_split_by_kind() {
        let c = FaultCounters::default();
        c.record(FaultKind::DemandPage, true, 10);
        c.record(FaultKind::SegmentationFault, false, 5);
        let s = c.snapshot();
        assert_eq!(s.demand_page, 1);
        assert_eq!(s.segmentation_fault, 1);
        assert_eq!(s.unresolved, 1);
        assert_eq!(s.total_time, 15);
    }
}
