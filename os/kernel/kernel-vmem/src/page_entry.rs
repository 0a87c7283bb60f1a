//! # Page Table Entry

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 64-bit x86-64 page table entry.
///
/// One layout serves all four levels (PML4E, PDPTE, PDE, PTE); the hardware
/// bits are identical and the remaining differences (`PS` validity, `D`/`G`
/// only on leaves) are handled by the walker.
///
/// ### Bit layout
///
/// | Bits      | Name                 | Meaning |
/// |-----------|----------------------|----------|
/// | 0         | `P`                  | Valid entry if set |
/// | 1         | `RW`                 | Writable if set |
/// | 2         | `US`                 | User-mode accessible if set |
/// | 3         | `PWT`                | Write-through caching |
/// | 4         | `PCD`                | Disable caching |
/// | 5         | `A`                  | Accessed |
/// | 6         | `D`                  | Dirty (leaf only) |
/// | 7         | `PS`                 | Large page (PDPTE/PDE only) |
/// | 8         | `G`                  | Global (leaf only) |
/// | 9         | *copy-on-write*      | Software: write must copy first |
/// | 10        | *shared*             | Software: mapping is shared, never COW |
/// | 11        | *swapped*            | Software: contents live in backing store |
/// | 12–51     | `addr`               | Physical frame bits [51:12] |
/// | 52        | *device*             | Software: frame is not allocator-managed |
/// | 53–58     | OS avail             | Unused |
/// | 59–62     | `PKU`                | Protection key |
/// | 63        | `NX`                 | Execute disable |
///
/// The software bits are ignored by the MMU. A copy-on-write entry is always
/// mapped read-only so that the first write traps.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// # use kernel_vmem::PageEntry;
/// let frame = PhysicalPage::<Size4K>::from_pfn(0x1234);
/// let e = PageEntry::leaf(frame).with_writable(true);
/// assert!(e.present());
/// assert_eq!(e.frame(), frame);
/// assert!(!e.is_unused());
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// On a PDPTE or PDE a set bit turns the entry into a 1 GiB or 2 MiB leaf.
    /// Must be clear on PML4 entries. On a PTE this position is PAT and is
    /// kept clear.
    pub large_page: bool,

    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global_translation: bool,

    /// Copy-on-write marker (bit 9, software).
    pub copy_on_write: bool,

    /// Shared-mapping marker (bit 10, software).
    pub shared: bool,

    /// Swapped-out marker (bit 11, software). Only meaningful while not present.
    pub swapped: bool,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// Device/unmanaged frame marker (bit 52, software).
    ///
    /// Set for MMIO windows and other frames that the physical allocator does
    /// not track; unmapping such an entry never touches reference counts.
    pub device: bool,

    #[bits(6)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntry {
    /// Present leaf pointing at `frame`, no further permissions.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_phys_addr_bits_51_12(frame.pfn())
    }

    /// Default flags for an intermediate (non-leaf) entry.
    ///
    /// Permissions of a walk are the intersection of all levels, so
    /// intermediate entries are left permissive and the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table_link(user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, phys: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_51_12(phys.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The 4 KiB frame this entry points at (first frame of a huge leaf).
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_pfn(self.phys_addr_bits_51_12())
    }

    /// Entry is entirely zero: neither mapped nor carrying software state.
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    /// The entry links to a lower-level table.
    #[inline]
    #[must_use]
    pub const fn is_table_link(&self) -> bool {
        self.present() && !self.large_page()
    }

    /// Turns a writable leaf into a copy-on-write leaf.
    #[inline]
    #[must_use]
    pub const fn into_copy_on_write(self) -> Self {
        self.with_writable(false).with_copy_on_write(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_entry() {
        let pa = PhysicalAddress::new(0x000F_FFFF_FFFF_F000);
        let e = PageEntry::new().with_physical_address(pa);
        assert_eq!(e.physical_address(), pa);
        assert!(!e.present());
    }

    #[test]
    fn software_bits_do_not_alias_hardware_bits() {
        let e = PageEntry::new()
            .with_copy_on_write(true)
            .with_shared(true)
            .with_swapped(true)
            .with_device(true);
        assert_eq!(e.into_bits(), (1 << 9) | (1 << 10) | (1 << 11) | (1 << 52));
        assert_eq!(e.physical_address().as_u64(), 0);
    }

    #[test]
    fn copy_on_write_is_read_only() {
        let e = PageEntry::leaf(PhysicalPage::from_pfn(7))
            .with_writable(true)
            .into_copy_on_write();
        assert!(e.copy_on_write());
        assert!(!e.writable());
        assert_eq!(e.frame().pfn(), 7);
    }

    #[test]
    fn nx_is_top_bit() {
        let e = PageEntry::new().with_no_execute(true);
        assert_eq!(e.into_bits(), 1 << 63);
    }
}
