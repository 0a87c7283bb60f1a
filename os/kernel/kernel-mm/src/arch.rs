//! # Architecture Hooks
//!
//! The memory manager never executes privileged instructions directly. TLB
//! maintenance, the fault address register and the cycle counter are reached
//! through [`ArchMmu`], with one implementation per target chosen at build
//! time. On x86-64 with the `asm` feature that is [`X86_64Mmu`]; host tests
//! supply their own recording implementation.

use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;

/// Beyond this many pages, a range flush becomes a full flush.
pub const RANGE_FLUSH_LIMIT: u64 = 32;

/// TLB control and fault-time registers of the current CPU.
pub trait ArchMmu: Send + Sync {
    /// Drop every non-global translation.
    fn flush_tlb(&self);

    /// Drop the translation of the page containing `va`.
    fn flush_tlb_page(&self, va: VirtualAddress);

    /// Drop the translations of `pages` pages starting at `start`.
    fn flush_tlb_range(&self, start: VirtualAddress, pages: u64) {
        if pages > RANGE_FLUSH_LIMIT {
            self.flush_tlb();
            return;
        }
        for i in 0..pages {
            self.flush_tlb_page(VirtualAddress::new(start.as_u64().wrapping_add(i * PAGE_SIZE)));
        }
    }

    /// Address that caused the most recent page fault (CR2 on x86-64).
    fn fault_address(&self) -> u64;

    /// Monotonic cycle counter used for fault timing.
    fn timestamp(&self) -> u64;
}

/// x86-64 implementation using `invlpg`, CR3 reloads, CR2 and `rdtsc`.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86_64Mmu;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl ArchMmu for X86_64Mmu {
    fn flush_tlb(&self) {
        // SAFETY: rewriting CR3 with its own value only drops non-global
        // translations; CPL0 is assumed for the whole memory manager.
        unsafe {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn flush_tlb_page(&self, va: VirtualAddress) {
        // SAFETY: `invlpg` has no side effects beyond the TLB.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn fault_address(&self) -> u64 {
        let cr2: u64;
        // SAFETY: reading CR2 is side-effect free at CPL0.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        cr2
    }

    #[inline]
    fn timestamp(&self) -> u64 {
        let lo: u32;
        let hi: u32;
        // SAFETY: `rdtsc` only reads the time-stamp counter.
        unsafe {
            core::arch::asm!(
                "lfence",
                "rdtsc",
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags),
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}
