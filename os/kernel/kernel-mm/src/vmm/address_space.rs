//! # Address Spaces
//!
//! An [`AddressSpace`] is one PML4-rooted page-table tree plus the
//! [`VmaSet`] describing what may be mapped in it.
//!
//! ## Locking
//!
//! ```text
//!   vmas (RwSpinLock)   readers: fault resolution, queries
//!        │              writers: create/destroy/split/merge areas, fork
//!        ▼
//!   tables (SpinLock)   held only for a walk or an entry update
//!        ▼
//!   PMM zone locks      held only inside the allocator
//! ```
//!
//! Locks are always taken top to bottom. The reader side of `vmas` is never
//! re-entered: a waiting writer blocks new readers.

use crate::vmm::vma::{VmaInfo, VmaSet};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::{RwSpinLock, SpinLock};

/// Kernel or user address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpaceKind {
    /// The single kernel space; owns the upper half.
    Kernel,
    /// A process space; owns the lower half and shares the kernel's upper half.
    User,
}

/// Where frames of a space should come from.
///
/// Only node 0 exists until NUMA topology is discovered, so every policy
/// currently resolves to it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum NumaPolicy {
    #[default]
    Local,
    Preferred(u8),
    Interleave,
}

/// Snapshot of an address space's counters.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct SpaceStats {
    /// Present 4 KiB pages.
    pub resident_pages: u64,
    /// Present pages mapped as shared.
    pub shared_pages: u64,
    /// Pages made private by a copy-on-write fault.
    pub dirty_pages: u64,
    /// Pages covered by areas.
    pub virtual_pages: u64,
    /// Page-table frames below the root.
    pub table_pages: u64,
    pub faults: u64,
    /// Sum of fault resolution times in timestamp units.
    pub fault_time: u64,
    pub prefetched_pages: u64,
}

#[derive(Default)]
pub(crate) struct SpaceCounters {
    pub(crate) resident: AtomicU64,
    pub(crate) shared: AtomicU64,
    pub(crate) dirty: AtomicU64,
    pub(crate) virtual_pages: AtomicU64,
    pub(crate) tables: AtomicU64,
    pub(crate) faults: AtomicU64,
    pub(crate) fault_time: AtomicU64,
    pub(crate) prefetched: AtomicU64,
}

impl SpaceCounters {
    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub(counter: &AtomicU64, n: u64) {
        // Counters are statistics; a racing teardown must not wrap them.
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }
}

/// One address space. Handed out as `Arc<AddressSpace>`.
pub struct AddressSpace {
    id: u64,
    kind: SpaceKind,
    root: PhysicalPage<Size4K>,
    pub(crate) vmas: RwSpinLock<VmaSet>,
    pub(crate) tables: SpinLock<()>,
    pub(crate) counters: SpaceCounters,
    policy: SpinLock<NumaPolicy>,
    holders: AtomicU32,
    /// Page of the most recent demand fault, for sequential detection.
    pub(crate) last_fault: AtomicU64,
    dead: AtomicBool,
}

impl AddressSpace {
    pub(crate) fn new(id: u64, kind: SpaceKind, root: PhysicalPage<Size4K>) -> Self {
        Self {
            id,
            kind,
            root,
            vmas: RwSpinLock::new(VmaSet::new()),
            tables: SpinLock::new(()),
            counters: SpaceCounters::default(),
            policy: SpinLock::new(NumaPolicy::Local),
            holders: AtomicU32::new(1),
            last_fault: AtomicU64::new(u64::MAX),
            dead: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, SpaceKind::Kernel)
    }

    /// Physical page of the PML4, i.e. the CR3 value without flags.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub fn holders(&self) -> u32 {
        self.holders.load(Ordering::Acquire)
    }

    /// Add a holder unless the space is already gone.
    pub(crate) fn retain(&self) -> bool {
        self.holders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 { None } else { n.checked_add(1) }
            })
            .is_ok()
    }

    /// Drop a holder; `true` if it was the last one.
    pub(crate) fn release(&self) -> Option<bool> {
        self.holders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|prev| prev == 1)
    }

    #[inline]
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.dead.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn numa_policy(&self) -> NumaPolicy {
        *self.policy.lock()
    }

    pub fn set_numa_policy(&self, policy: NumaPolicy) {
        *self.policy.lock() = policy;
    }

    /// Snapshot of every area, in address order.
    #[must_use]
    pub fn vmas(&self) -> alloc::vec::Vec<VmaInfo> {
        self.vmas.read().iter().map(|v| v.info()).collect()
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find_vma(&self, va: kernel_memory_addresses::VirtualAddress) -> Option<VmaInfo> {
        self.vmas.read().find(va.as_u64()).map(|v| v.info())
    }

    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SpaceStats {
            resident_pages: get(&c.resident),
            shared_pages: get(&c.shared),
            dirty_pages: get(&c.dirty),
            virtual_pages: get(&c.virtual_pages),
            table_pages: get(&c.tables),
            faults: get(&c.faults),
            fault_time: get(&c.fault_time),
            prefetched_pages: get(&c.prefetched),
        }
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}
