//! # HHDM-based `PhysMapper`
//!
//! The kernel maps all of physical memory at [`HHDM_BASE`]; a physical
//! address `pa` is therefore reachable at `HHDM_BASE + pa`. Page tables,
//! frame descriptors and page contents are all accessed that way.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the higher-half direct map.
///
/// # Safety
/// The direct map must be installed and cover every physical address handed
/// to it. Not usable on the host; tests bring their own mapper.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Direct-map virtual address of `pa`.
    #[inline]
    #[must_use]
    pub const fn virt(pa: PhysicalAddress) -> u64 {
        HHDM_BASE + pa.as_u64()
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virt(pa) as *mut T;
        // SAFETY: caller guarantees `pa` is valid and covered by the direct map.
        unsafe { &mut *va }
    }
}
