//! # Physical Memory Manager
//!
//! Turns the boot memory map into zones of buddy-managed 4 KiB frames.
//!
//! ## Bring-up
//!
//! ```text
//!  physical memory (up to the highest usable byte)
//! ┌──────────┬──────────────┬──────────┬────────────────────────────┐
//! │ reserved │ descriptors  │ usable   │ reserved │ usable ...      │
//! └──────────┴──────────────┴──────────┴──────────┴─────────────────┘
//!             ▲ first available region large enough, lowest address
//!             one PageFrame per page frame number, carved out of RAM
//! ```
//!
//! 1. Size the descriptor table to cover every frame below the highest usable
//!    address and place it in the lowest available region that fits.
//! 2. Mark every frame reserved.
//! 3. Mark the frames of available regions usable, then re-reserve anything
//!    another region or the table itself claims.
//! 4. Cut the table into per-zone slices and seed each zone's free lists.
//!
//! ## Allocation
//!
//! The preferred zone is chosen from the [`AllocFlags`]. An atomic request
//! only try-locks that zone. Everyone else searches the permitted zones in
//! order, asks the registered [`Reclaim`] hook for memory and retries once.
//!
//! ## Locking
//!
//! Each zone has one spin lock guarding its free lists and descriptors.
//! Locks are never nested and never held while zero-filling, logging
//! statistics or calling the reclaim hook.

mod frame;
mod stats;
mod zone;

pub use frame::{FrameState, PageFrame};
pub use stats::{PmmStats, ZoneStats};
pub use zone::{ZONE_COUNT, Zone, ZoneId};

use crate::config::{MmConfig, Watermarks};
use crate::flags::AllocFlags;
use crate::MmError;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{MAX_ORDER, PAGE_SHIFT, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K};
use kernel_sync::SyncOnceCell;
use kernel_vmem::PhysMapper;
use log::{debug, info, warn};
use stats::PmmCounters;
use zone::ZoneInner;

/// Source of memory under pressure, e.g. a page cache.
///
/// Called from the allocation slow path with no allocator lock held. It may
/// free pages through `pages`, but it must not allocate and must not take
/// address-space locks: the caller may be inside a page-table update.
pub trait Reclaim: Sync {
    /// Release up to `wanted` pages preferably from `zone`; returns how many were released.
    fn reclaim(&self, pages: &dyn ReleasePages, zone: ZoneId, wanted: u64) -> u64;
}

/// The part of the allocator a [`Reclaim`] hook may use.
pub trait ReleasePages {
    /// See [`PhysicalMemoryManager::free_pages`].
    ///
    /// # Errors
    /// As for [`PhysicalMemoryManager::free_pages`].
    fn free_pages(&self, addr: PhysicalAddress, order: usize) -> Result<(), MmError>;
}

/// Watermarks converted to page counts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WatermarkPages {
    pub low: u64,
    pub high: u64,
    pub emergency: u64,
}

impl WatermarkPages {
    fn of(managed: u64, w: &Watermarks) -> Self {
        let pct = |p: u8| managed * u64::from(p) / 100;
        Self {
            low: pct(w.low_percent),
            high: pct(w.high_percent),
            emergency: pct(w.emergency_percent),
        }
    }
}

/// The physical page allocator.
pub struct PhysicalMemoryManager<'m, M: PhysMapper> {
    mapper: &'m M,
    zones: [Zone<'m>; ZONE_COUNT],
    max_pfn: u64,
    table: (PhysicalAddress, u64),
    managed: u64,
    watermarks: WatermarkPages,
    pressure: AtomicBool,
    sequence: AtomicU64,
    counters: PmmCounters,
    reclaim: SyncOnceCell<&'m dyn Reclaim>,
}

impl<'m, M: PhysMapper> PhysicalMemoryManager<'m, M> {
    /// Build the allocator from the boot memory map.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] if the map has no usable page or `config` is inconsistent.
    /// - [`MmError::OutOfMemory`] if no available region can host the descriptor table.
    pub fn init(mapper: &'m M, map: &[MemoryRegion], config: &MmConfig) -> Result<Self, MmError> {
        config.validate()?;

        let highest = map
            .iter()
            .filter(|r| r.is_available())
            .map(|r| r.end() & !(PAGE_SIZE - 1))
            .max()
            .unwrap_or(0);
        let max_pfn = highest >> PAGE_SHIFT;
        if max_pfn == 0 {
            return Err(MmError::InvalidArgument("memory map has no usable memory"));
        }
        let count = usize::try_from(max_pfn)
            .map_err(|_| MmError::InvalidArgument("memory map exceeds the address width"))?;

        let table_bytes = (max_pfn * size_of::<PageFrame>() as u64).next_multiple_of(PAGE_SIZE);
        let table_base = table_placement(map, table_bytes).ok_or(MmError::OutOfMemory)?;
        let table_pa = PhysicalAddress::new(table_base);

        // SAFETY: the table lies inside an available region the memory map
        // hands to us exclusively; every `PageFrame` bit pattern is valid.
        let frames: &'m mut [PageFrame] = unsafe { mapper.phys_to_slice_mut(table_pa, count) };

        let layout = &config.zones;
        let zone_of = |pfn: u64| {
            let a = pfn << PAGE_SHIFT;
            if a < layout.dma_end {
                ZoneId::Dma
            } else if a < layout.dma32_end {
                ZoneId::Dma32
            } else if a < layout.normal_end {
                ZoneId::Normal
            } else {
                ZoneId::High
            }
        };
        for (pfn, f) in (0u64..).zip(frames.iter_mut()) {
            *f = PageFrame::reserved(zone_of(pfn));
        }

        // Usable frames are marked as unattached tails; seeding links them.
        for r in map.iter().filter(|r| r.is_available()) {
            let first = r.base.next_multiple_of(PAGE_SIZE) >> PAGE_SHIFT;
            let end = (r.end() >> PAGE_SHIFT).min(max_pfn);
            for pfn in first..end {
                frames[as_index(pfn)].mark_tail();
            }
        }
        for r in map.iter().filter(|r| !r.is_available()) {
            let first = (r.base >> PAGE_SHIFT).min(max_pfn);
            let end = (r.end().div_ceil(PAGE_SIZE)).min(max_pfn);
            for pfn in first..end {
                frames[as_index(pfn)] = PageFrame::reserved(zone_of(pfn));
            }
        }
        let table_first = table_base >> PAGE_SHIFT;
        for pfn in table_first..(table_first + (table_bytes >> PAGE_SHIFT)).min(max_pfn) {
            frames[as_index(pfn)] = PageFrame::reserved(zone_of(pfn));
        }

        let bounds = [
            layout.dma_end >> PAGE_SHIFT,
            layout.dma32_end >> PAGE_SHIFT,
            layout.normal_end >> PAGE_SHIFT,
            max_pfn,
        ];
        let (dma, rest) = frames.split_at_mut(as_index(bounds[0].min(max_pfn)));
        let (dma32, rest) = rest.split_at_mut(as_index(bounds[1].min(max_pfn) - bounds[0].min(max_pfn)));
        let (normal, high) = rest.split_at_mut(as_index(bounds[2].min(max_pfn) - bounds[1].min(max_pfn)));

        let zones = [
            Zone::new(ZoneId::Dma, 0, dma)?,
            Zone::new(ZoneId::Dma32, bounds[0].min(max_pfn), dma32)?,
            Zone::new(ZoneId::Normal, bounds[1].min(max_pfn), normal)?,
            Zone::new(ZoneId::High, bounds[2].min(max_pfn), high)?,
        ];
        let managed: u64 = zones.iter().map(Zone::managed_pages).sum();
        if managed == 0 {
            return Err(MmError::InvalidArgument("memory map has no usable memory"));
        }

        info!(
            "PMM: {managed} pages managed below {}, descriptor table at {table_pa} ({} KiB)",
            PhysicalAddress::new(highest),
            table_bytes / 1024
        );
        for z in &zones {
            if z.managed_pages() > 0 {
                let s = z.stats();
                info!("PMM: zone {:<7} {}..{} {} pages", z.id(), s.start, s.end, s.managed_pages);
            }
        }

        Ok(Self {
            mapper,
            zones,
            max_pfn,
            table: (table_pa, table_bytes),
            managed,
            watermarks: WatermarkPages::of(managed, &config.watermarks),
            pressure: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            counters: PmmCounters::default(),
            reclaim: SyncOnceCell::new(),
        })
    }

    /// Register the reclaim hook. Only one hook can ever be installed.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if a hook is already registered.
    pub fn register_reclaim(&self, hook: &'m dyn Reclaim) -> Result<(), MmError> {
        self.reclaim
            .set(hook)
            .map_err(|_| MmError::InvalidArgument("reclaim hook already registered"))
    }

    /// Allocate `2^order` contiguous pages.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for `order > 12`.
    /// - [`MmError::OutOfMemory`] if no permitted zone can satisfy the request.
    /// - [`MmError::Corruption`] if a free list fails validation.
    pub fn alloc_pages(&self, order: usize, flags: AllocFlags) -> Result<PhysicalAddress, MmError> {
        self.alloc_pages_tagged(order, flags, 0)
    }

    /// [`alloc_pages`](Self::alloc_pages) with a caller-chosen tag recorded in the block head.
    ///
    /// # Errors
    /// As for [`alloc_pages`](Self::alloc_pages).
    pub fn alloc_pages_tagged(&self, order: usize, flags: AllocFlags, tag: u32) -> Result<PhysicalAddress, MmError> {
        if order > MAX_ORDER {
            return Err(MmError::InvalidArgument("order out of range"));
        }
        let pages = 1u64 << order;
        let stamp = self.sequence.fetch_add(1, Ordering::Relaxed);

        let found = if flags.contains(AllocFlags::ATOMIC) {
            self.alloc_atomic(order, flags, tag, stamp)
        } else {
            self.alloc_slow(order, flags, tag, stamp)
        };
        let pfn = match found {
            Ok(pfn) => pfn,
            Err(e) => {
                PmmCounters::bump(&self.counters.failures);
                if e == MmError::OutOfMemory {
                    debug!("PMM: order {order} request ({flags:?}) failed");
                }
                return Err(e);
            }
        };

        PmmCounters::bump(&self.counters.allocations);
        self.update_pressure();

        let pa = PhysicalAddress::new(pfn << PAGE_SHIFT);
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the block was just handed to us and nobody else can see it.
            let bytes: &mut [u8] = unsafe { self.mapper.phys_to_slice_mut(pa, as_index(pages << PAGE_SHIFT)) };
            bytes.fill(0);
        }
        Ok(pa)
    }

    fn alloc_atomic(&self, order: usize, flags: AllocFlags, tag: u32, stamp: u64) -> Result<u64, MmError> {
        let zone = self.zone(ZoneId::preferred(flags));
        let Some(mut inner) = zone.try_lock() else {
            warn!("PMM: atomic order {order} request hit a contended {} zone", zone.id());
            return Err(MmError::OutOfMemory);
        };
        let got = inner.take(order, tag, stamp);
        zone.publish(&inner);
        drop(inner);
        got?.ok_or(MmError::OutOfMemory)
    }

    fn alloc_slow(&self, order: usize, flags: AllocFlags, tag: u32, stamp: u64) -> Result<u64, MmError> {
        let pages = 1u64 << order;
        let preferred = ZoneId::preferred(flags);
        for attempt in 0..2 {
            if self.reserve_permits(pages, flags) {
                for id in ZoneId::candidates(flags).into_iter().flatten() {
                    let zone = self.zone(id);
                    let mut inner = zone.lock();
                    let got = inner.take(order, tag, stamp);
                    zone.publish(&inner);
                    drop(inner);
                    if let Some(pfn) = got? {
                        return Ok(pfn);
                    }
                }
            }
            if attempt > 0 {
                break;
            }
            let Some(hook) = self.reclaim.get() else {
                break;
            };
            let released = hook.reclaim(self, preferred, pages);
            debug!("PMM: reclaim released {released} pages for an order {order} request");
            if released == 0 {
                break;
            }
        }
        Err(MmError::OutOfMemory)
    }

    /// Below the emergency watermark, only the kernel and atomic callers get memory.
    fn reserve_permits(&self, pages: u64, flags: AllocFlags) -> bool {
        flags.intersects(AllocFlags::KERNEL | AllocFlags::ATOMIC)
            || self.free_page_count().saturating_sub(pages) >= self.watermarks.emergency
    }

    fn update_pressure(&self) {
        let free = self.free_page_count();
        if free < self.watermarks.low {
            if !self.pressure.swap(true, Ordering::Relaxed) {
                warn!("PMM: memory pressure, {free} pages free (low watermark {})", self.watermarks.low);
            }
        } else if free >= self.watermarks.high && self.pressure.swap(false, Ordering::Relaxed) {
            info!("PMM: memory pressure relieved, {free} pages free");
        }
    }

    /// Drop one reference to the block at `addr`, releasing it at zero.
    ///
    /// `order` must match the order the block was allocated with.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for misaligned or untracked addresses,
    ///   an order mismatch, or an address that is not a block head.
    /// - [`MmError::Corruption`] on a double free or a damaged descriptor.
    pub fn free_pages(&self, addr: PhysicalAddress, order: usize) -> Result<(), MmError> {
        if order > MAX_ORDER {
            return Err(MmError::InvalidArgument("order out of range"));
        }
        if (addr.as_u64() >> PAGE_SHIFT) & ((1 << order) - 1) != 0 {
            return Err(MmError::InvalidArgument("address is not aligned to the block order"));
        }
        self.locked(addr, |inner, pfn| {
            if inner.allocated_head(pfn)?.order() != order {
                return Err(MmError::InvalidArgument("order does not match the allocation"));
            }
            Self::drop_reference(inner, pfn)
        })
        .map(|_| ())
    }

    /// Decrement and release at zero. Returns the remaining count.
    fn drop_reference(inner: &mut ZoneInner<'_>, pfn: u64) -> Result<u32, MmError> {
        let f = inner.allocated_head(pfn)?;
        let n = f
            .ref_count()
            .checked_sub(1)
            .ok_or(MmError::Corruption("reference count underflow"))?;
        f.set_ref_count(n);
        if n == 0 {
            if f.pin_count() != 0 {
                return Err(MmError::Corruption("pinned frame lost its last reference"));
            }
            inner.release(pfn)?;
        }
        Ok(n)
    }

    /// Run `op` on the zone owning `addr` with its lock held, then publish the
    /// zone counters and account for a released block.
    ///
    /// `op` reports the reference count left on the block; zero means it went
    /// back to the free lists.
    fn locked(
        &self,
        addr: PhysicalAddress,
        op: impl FnOnce(&mut ZoneInner<'m>, u64) -> Result<u32, MmError>,
    ) -> Result<u32, MmError> {
        let pfn = self.pfn_of(addr)?;
        let zone = self.zone_of_pfn(pfn)?;
        let mut inner = zone.lock();
        let result = op(&mut inner, pfn);
        zone.publish(&inner);
        drop(inner);
        if result == Ok(0) {
            PmmCounters::bump(&self.counters.frees);
            self.update_pressure();
        }
        result
    }

    /// Add a reference to the allocated block at `addr`. Returns the new count.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if `addr` is not an allocated block head.
    pub fn inc_ref_count(&self, addr: PhysicalAddress) -> Result<u32, MmError> {
        self.locked(addr, |inner, pfn| {
            let f = inner.allocated_head(pfn)?;
            let n = f
                .ref_count()
                .checked_add(1)
                .ok_or(MmError::InvalidArgument("reference count overflow"))?;
            f.set_ref_count(n);
            Ok(n)
        })
    }

    /// Drop a reference to the allocated block at `addr`, releasing it at zero.
    /// Returns the remaining count.
    ///
    /// # Errors
    /// As for [`free_pages`](Self::free_pages), without the order check.
    pub fn dec_ref_count(&self, addr: PhysicalAddress) -> Result<u32, MmError> {
        self.locked(addr, Self::drop_reference)
    }

    /// Current reference count of the block at `addr`.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if `addr` is not an allocated block head.
    pub fn ref_count(&self, addr: PhysicalAddress) -> Result<u32, MmError> {
        let pfn = self.pfn_of(addr)?;
        let zone = self.zone_of_pfn(pfn)?;
        let mut inner = zone.lock();
        inner.allocated_head(pfn).map(|f| f.ref_count())
    }

    /// Pin the block: it holds an extra reference until unpinned.
    /// Returns the new pin count.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if `addr` is not an allocated block head.
    pub fn pin_page(&self, addr: PhysicalAddress) -> Result<u32, MmError> {
        let mut pins = 0;
        self.locked(addr, |inner, pfn| {
            let f = inner.allocated_head(pfn)?;
            let (Some(p), Some(refs)) = (f.pin_count().checked_add(1), f.ref_count().checked_add(1)) else {
                return Err(MmError::InvalidArgument("pin count overflow"));
            };
            f.set_pin_count(p);
            f.set_ref_count(refs);
            pins = p;
            Ok(refs)
        })?;
        Ok(pins)
    }

    /// Undo one [`pin_page`](Self::pin_page). Returns the remaining pin count.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if the block is not pinned.
    pub fn unpin_page(&self, addr: PhysicalAddress) -> Result<u32, MmError> {
        let mut pins = 0;
        self.locked(addr, |inner, pfn| {
            let f = inner.allocated_head(pfn)?;
            pins = f
                .pin_count()
                .checked_sub(1)
                .ok_or(MmError::InvalidArgument("page is not pinned"))?;
            f.set_pin_count(pins);
            Self::drop_reference(inner, pfn)
        })?;
        Ok(pins)
    }

    /// Mark the block as recently used.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if `addr` is not an allocated block head.
    pub fn activate_page(&self, addr: PhysicalAddress) -> Result<(), MmError> {
        self.set_inactive(addr, false)
    }

    /// Mark the block as a reclaim candidate.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if `addr` is not an allocated block head.
    pub fn deactivate_page(&self, addr: PhysicalAddress) -> Result<(), MmError> {
        self.set_inactive(addr, true)
    }

    fn set_inactive(&self, addr: PhysicalAddress, inactive: bool) -> Result<(), MmError> {
        self.locked(addr, |inner, pfn| {
            let f = inner.allocated_head(pfn)?;
            let changed = f.is_inactive() != inactive;
            let (pages, refs) = (1u64 << f.order(), f.ref_count());
            f.set_inactive(inactive);
            if changed && inactive {
                inner.note_deactivated(pages);
            } else if changed {
                inner.note_activated(pages);
            }
            Ok(refs)
        })
        .map(|_| ())
    }

    /// Copy of the descriptor of the frame at `addr`.
    #[must_use]
    pub fn frame(&self, addr: PhysicalAddress) -> Option<PageFrame> {
        let pfn = self.pfn_of(addr).ok()?;
        let zone = self.zone_of_pfn(pfn).ok()?;
        zone.lock().frame(pfn).copied()
    }

    /// Whether `addr` is the head of an allocated block, i.e. reference counted.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        self.frame(addr).is_some_and(|f| f.is(FrameState::Allocated))
    }

    fn pfn_of(&self, addr: PhysicalAddress) -> Result<u64, MmError> {
        if !addr.is_aligned::<Size4K>() {
            return Err(MmError::InvalidArgument("physical address is not page aligned"));
        }
        let pfn = addr.as_u64() >> PAGE_SHIFT;
        if pfn >= self.max_pfn {
            return Err(MmError::InvalidArgument("physical address is not tracked"));
        }
        Ok(pfn)
    }

    fn zone_of_pfn(&self, pfn: u64) -> Result<&Zone<'m>, MmError> {
        self.zones
            .iter()
            .find(|z| z.contains(pfn))
            .ok_or(MmError::InvalidArgument("physical address is not tracked"))
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self, id: ZoneId) -> &Zone<'m> {
        &self.zones[id.index()]
    }

    /// Free pages over all zones.
    #[must_use]
    pub fn free_page_count(&self) -> u64 {
        self.zones.iter().map(Zone::free_pages).sum()
    }

    #[inline]
    #[must_use]
    pub const fn managed_pages(&self) -> u64 {
        self.managed
    }

    #[inline]
    #[must_use]
    pub const fn watermarks(&self) -> WatermarkPages {
        self.watermarks
    }

    #[inline]
    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Relaxed)
    }

    /// Physical location and size in bytes of the descriptor table.
    #[inline]
    #[must_use]
    pub const fn descriptor_table(&self) -> (PhysicalAddress, u64) {
        self.table
    }

    /// One past the highest tracked page frame number.
    #[inline]
    #[must_use]
    pub const fn max_pfn(&self) -> u64 {
        self.max_pfn
    }

    #[must_use]
    pub fn zone_stats(&self, id: ZoneId) -> ZoneStats {
        self.zone(id).stats()
    }

    #[must_use]
    pub fn stats(&self) -> PmmStats {
        PmmStats {
            managed_pages: self.managed,
            free_pages: self.free_page_count(),
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            frees: self.counters.frees.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            under_pressure: self.under_pressure(),
            zones: core::array::from_fn(|i| self.zones[i].stats()),
        }
    }

    /// Check every zone's free lists.
    ///
    /// # Errors
    /// [`MmError::Corruption`] describing the first inconsistency.
    pub fn verify(&self) -> Result<(), MmError> {
        self.zones.iter().try_for_each(Zone::verify)
    }
}

impl<M: PhysMapper> ReleasePages for PhysicalMemoryManager<'_, M> {
    fn free_pages(&self, addr: PhysicalAddress, order: usize) -> Result<(), MmError> {
        Self::free_pages(self, addr, order)
    }
}

/// Lowest page-aligned base for `bytes` of descriptors inside an available
/// region that no other region of the map claims.
fn table_placement(map: &[MemoryRegion], bytes: u64) -> Option<u64> {
    map.iter()
        .filter(|r| r.is_available())
        .filter_map(|r| {
            let end = r.end() & !(PAGE_SIZE - 1);
            let mut base = r.base.next_multiple_of(PAGE_SIZE);
            while base.checked_add(bytes).is_some_and(|top| top <= end) {
                let top = base + bytes;
                match map.iter().find(|o| !o.is_available() && o.base < top && o.end() > base) {
                    Some(clash) => base = clash.end().next_multiple_of(PAGE_SIZE),
                    None => return Some(base),
                }
            }
            None
        })
        .min()
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn as_index(n: u64) -> usize {
    n as usize
}
