//! # Software Flag Sets
//!
//! Flags callers pass into the memory manager. Hardware entry layouts live in
//! `kernel-vmem`; these are the portable request-side vocabularies.

use bitflags::bitflags;
use kernel_vmem::PageEntry;

bitflags! {
    /// Modifiers for a physical allocation.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Zero-fill the block before returning it.
        const ZERO = 1 << 0;
        /// Must be reachable by ISA DMA (below 16 MiB).
        const DMA = 1 << 1;
        /// Must be reachable by 32-bit DMA (below 4 GiB).
        const DMA32 = 1 << 2;
        /// Owned by the kernel; may dip into the emergency reserve.
        const KERNEL = 1 << 3;
        /// Backs user memory.
        const USER = 1 << 4;
        /// Caller cannot wait: no fallback, no reclaim, fail on contention.
        const ATOMIC = 1 << 5;
        /// May be satisfied from the HIGH zone.
        const HIGHMEM = 1 << 6;
    }
}

bitflags! {
    /// Attributes of a single page mapping.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct PageFlags: u32 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const NO_EXECUTE = 1 << 2;
        /// Mapped read-only; the first write copies the frame.
        const COPY_ON_WRITE = 1 << 3;
        /// Frame is shared between spaces and is never made copy-on-write.
        const SHARED = 1 << 4;
        const NO_CACHE = 1 << 5;
        const WRITE_THROUGH = 1 << 6;
        /// Translation survives address-space switches.
        const GLOBAL = 1 << 7;
    }
}

impl PageFlags {
    /// Leaf entry bits for these flags, without address and `present`.
    ///
    /// `COPY_ON_WRITE` wins over `WRITABLE`.
    #[must_use]
    pub const fn to_entry(self) -> PageEntry {
        let cow = self.contains(Self::COPY_ON_WRITE);
        PageEntry::new()
            .with_writable(self.contains(Self::WRITABLE) && !cow)
            .with_user_access(self.contains(Self::USER))
            .with_no_execute(self.contains(Self::NO_EXECUTE))
            .with_copy_on_write(cow)
            .with_shared(self.contains(Self::SHARED))
            .with_cache_disabled(self.contains(Self::NO_CACHE))
            .with_write_through(self.contains(Self::WRITE_THROUGH))
            .with_global_translation(self.contains(Self::GLOBAL))
    }

    /// Flags described by a leaf entry.
    #[must_use]
    pub fn from_entry(e: PageEntry) -> Self {
        let mut f = Self::empty();
        f.set(Self::WRITABLE, e.writable());
        f.set(Self::USER, e.user_access());
        f.set(Self::NO_EXECUTE, e.no_execute());
        f.set(Self::COPY_ON_WRITE, e.copy_on_write());
        f.set(Self::SHARED, e.shared());
        f.set(Self::NO_CACHE, e.cache_disabled());
        f.set(Self::WRITE_THROUGH, e.write_through());
        f.set(Self::GLOBAL, e.global_translation());
        f
    }
}

bitflags! {
    /// Access rights of a memory area.
    ///
    /// x86-64 cannot express write-only or execute-only pages, so a present
    /// page of an area with `WRITE` or `EXEC` is always readable as well.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const READ_EXEC: Self = Self::READ.union(Self::EXEC);
}

bitflags! {
    /// How a memory area is mapped.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct MapFlags: u8 {
        /// Writes are private to the space; forks copy on write.
        const PRIVATE = 1 << 0;
        /// Frames are shared with forks.
        const SHARED = 1 << 1;
        /// Replace whatever overlaps the requested range.
        const FIXED = 1 << 2;
        /// Huge pages requested; advisory.
        const HUGE = 1 << 3;
        /// Populate every page when the area is created.
        const LOCKED = 1 << 4;
    }
}
