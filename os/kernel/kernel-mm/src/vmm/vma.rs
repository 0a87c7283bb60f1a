//! # Virtual Memory Areas
//!
//! A [`Vma`] is a maximal page-aligned range `[start, end)` of one address
//! space with uniform kind, protection and mapping flags. The areas of a space
//! live in a [`VmaSet`], ordered by start address; they never overlap.

use crate::flags::{MapFlags, Protection};
use crate::MmError;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Bound;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// What backs an area.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum VmaKind {
    Anonymous,
    /// File contents; populated with zeroes until a file layer provides pages.
    FileBacked,
    /// MMIO window; frames are not owned by the allocator.
    Device,
    Shared,
    /// Grows downwards.
    Stack,
    /// Grows upwards.
    Heap,
    Code,
}

/// One area of an address space.
#[derive(Debug)]
pub struct Vma {
    start: u64,
    end: u64,
    kind: VmaKind,
    protection: Protection,
    flags: MapFlags,
    /// First frame of a device window.
    phys_base: Option<PhysicalAddress>,
    faults: AtomicU64,
}

/// Copy of an area's attributes; the handle callers get back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmaInfo {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub kind: VmaKind,
    pub protection: Protection,
    pub flags: MapFlags,
    pub faults: u64,
}

impl VmaInfo {
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        (self.end.as_u64().wrapping_sub(self.start.as_u64())) / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }
}

impl Vma {
    #[must_use]
    pub(crate) const fn new(start: u64, end: u64, kind: VmaKind, protection: Protection, flags: MapFlags) -> Self {
        Self {
            start,
            end,
            kind,
            protection,
            // FIXED only steers placement; it is not an attribute of the area.
            flags: flags.difference(MapFlags::FIXED),
            phys_base: None,
            faults: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub(crate) const fn device(start: u64, end: u64, phys: PhysicalAddress) -> Self {
        let mut vma = Self::new(
            start,
            end,
            VmaKind::Device,
            Protection::READ_WRITE,
            MapFlags::SHARED.union(MapFlags::LOCKED),
        );
        vma.phys_base = Some(phys);
        vma
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> VmaKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.protection
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> MapFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn phys_base(&self) -> Option<PhysicalAddress> {
        self.phys_base
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: u64) -> bool {
        va >= self.start && va < self.end
    }

    /// Frames are shared with forks instead of being copied on write.
    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED) || matches!(self.kind, VmaKind::Shared)
    }

    #[inline]
    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn info(&self) -> VmaInfo {
        VmaInfo {
            start: VirtualAddress::canonicalize(self.start),
            end: VirtualAddress::canonicalize(self.end),
            kind: self.kind,
            protection: self.protection,
            flags: self.flags,
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Same attributes, different range. Fault statistics start over.
    fn with_range(&self, start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            kind: self.kind,
            protection: self.protection,
            flags: self.flags,
            phys_base: self
                .phys_base
                .map(|pa| PhysicalAddress::new(pa.as_u64() + (start - self.start))),
            faults: AtomicU64::new(0),
        }
    }

    /// Copy for a forked address space.
    #[must_use]
    pub(crate) fn duplicate(&self) -> Self {
        self.with_range(self.start, self.end)
    }

    /// Split at `at`, keeping `[start, at)` and returning `[at, end)`.
    fn split_off(&mut self, at: u64) -> Self {
        debug_assert!(at > self.start && at < self.end);
        let upper = self.with_range(at, self.end);
        self.end = at;
        upper
    }

    /// `next` directly follows `self` and can be folded into it.
    fn can_merge(&self, next: &Self) -> bool {
        self.end == next.start
            && self.kind == next.kind
            && self.protection == next.protection
            && self.flags == next.flags
            && self.phys_base.is_none()
            && next.phys_base.is_none()
            && !matches!(self.kind, VmaKind::Stack | VmaKind::Heap)
    }
}

/// The areas of one address space, keyed by start address.
#[derive(Debug, Default)]
pub struct VmaSet {
    map: BTreeMap<u64, Vma>,
}

impl VmaSet {
    #[must_use]
    pub const fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find(&self, va: u64) -> Option<&Vma> {
        self.map
            .range(..=va)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(va))
    }

    /// Whether any area intersects `[start, end)`.
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.map
            .range(..end)
            .next_back()
            .is_some_and(|(_, v)| v.end > start)
    }

    /// Areas intersecting `[start, end)`, in address order.
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &Vma> {
        let first = self.find(start).map_or(start, |v| v.start);
        self.map.range(first..end).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.map.values()
    }

    /// Insert an area that overlaps nothing.
    ///
    /// # Errors
    /// [`MmError::VmaConflict`] if it would overlap; the set is unchanged.
    pub fn insert(&mut self, vma: Vma) -> Result<(), MmError> {
        if vma.start >= vma.end {
            return Err(MmError::InvalidArgument("empty memory area"));
        }
        if self.overlaps(vma.start, vma.end) {
            return Err(MmError::VmaConflict);
        }
        self.map.insert(vma.start, vma);
        Ok(())
    }

    /// Make `at` an area boundary if it falls inside an area.
    pub fn split_at(&mut self, at: u64) {
        let Some((_, vma)) = self.map.range_mut(..at).next_back() else {
            return;
        };
        if at > vma.start && at < vma.end {
            let upper = vma.split_off(at);
            self.map.insert(at, upper);
        }
    }

    /// Cut `[start, end)` out of the set. Areas straddling an edge are trimmed.
    ///
    /// Returns the removed pieces.
    pub fn carve(&mut self, start: u64, end: u64) -> Vec<Vma> {
        self.split_at(start);
        self.split_at(end);
        let keys: Vec<u64> = self.map.range(start..end).map(|(&k, _)| k).collect();
        keys.into_iter().filter_map(|k| self.map.remove(&k)).collect()
    }

    /// Apply `f` to every area fully inside `[start, end)`.
    pub fn for_each_in_mut(&mut self, start: u64, end: u64, mut f: impl FnMut(&mut Vma)) {
        for (_, v) in self.map.range_mut(start..end) {
            f(v);
        }
    }

    /// Set the protection of every area inside `[start, end)`.
    pub(crate) fn set_protection(&mut self, start: u64, end: u64, protection: Protection) {
        self.for_each_in_mut(start, end, |v| v.protection = protection);
    }

    /// Whether `[start, end)` is covered by areas without holes.
    #[must_use]
    pub fn covers(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for v in self.overlapping(start, end) {
            if v.start > cursor {
                return false;
            }
            cursor = v.end;
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Fold neighbours with identical attributes in `[start, end]` together.
    pub fn merge_around(&mut self, start: u64, end: u64) {
        let from = self
            .map
            .range(..start)
            .next_back()
            .map_or(start, |(&k, _)| k);
        let mut keys: Vec<u64> = self.map.range(from..=end).map(|(&k, _)| k).collect();

        let mut i = 0;
        while i + 1 < keys.len() {
            let (a, b) = (keys[i], keys[i + 1]);
            let mergeable = match (self.map.get(&a), self.map.get(&b)) {
                (Some(x), Some(y)) => x.can_merge(y),
                _ => false,
            };
            if mergeable {
                if let Some(next) = self.map.remove(&b)
                    && let Some(prev) = self.map.get_mut(&a)
                {
                    prev.end = next.end;
                    prev.faults
                        .fetch_add(next.faults.load(Ordering::Relaxed), Ordering::Relaxed);
                }
                keys.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Move the start or end of the area starting at `key`.
    ///
    /// # Errors
    /// [`MmError::VmaConflict`] if the new range would overlap a neighbour.
    pub(crate) fn resize(&mut self, key: u64, start: u64, end: u64) -> Result<(), MmError> {
        let Some(mut vma) = self.map.remove(&key) else {
            return Err(MmError::NotMapped);
        };
        let old_start = vma.start;
        if self.overlaps(start, end) {
            self.map.insert(key, vma);
            return Err(MmError::VmaConflict);
        }
        if let Some(pa) = vma.phys_base {
            vma.phys_base = Some(PhysicalAddress::new(pa.as_u64() - (old_start - start)));
        }
        vma.start = start;
        vma.end = end;
        self.map.insert(start, vma);
        Ok(())
    }

    /// Remove every area.
    pub fn clear(&mut self) -> Vec<Vma> {
        core::mem::take(&mut self.map).into_values().collect()
    }

    /// First gap of `size` bytes in `[lo, hi)`.
    #[must_use]
    pub fn find_gap(&self, lo: u64, hi: u64, size: u64) -> Option<u64> {
        let mut cursor = self.find(lo).map_or(lo, |v| v.end);
        for v in self
            .map
            .range((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(_, v)| v)
        {
            if v.start >= cursor && v.start - cursor >= size {
                return Some(cursor);
            }
            cursor = cursor.max(v.end);
        }
        (hi.checked_sub(cursor)? >= size).then_some(cursor)
    }
}
