//! # Kernel Boot Information
//!
//! The hand-off component translates the firmware memory map into a slice of
//! [`MemoryRegion`] values before the memory manager is brought up. The slice
//! is consumed exactly once, during physical memory manager initialization.

/// Classification of a physical memory region.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Usable RAM, free for the allocator.
    Available = 0,
    /// Firmware or hardware owned; never handed out.
    Reserved = 1,
    /// ACPI tables; reusable once the tables were parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage; must be preserved.
    AcpiNvs = 3,
    /// Memory reported as defective.
    Bad = 4,
}

/// One entry of the boot memory map.
///
/// Keep this `#[repr(C)]` since it crosses the loader/kernel boundary.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Region type.
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Available)
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Available)
    }
}
