//! # Page Fault Dispatch
//!
//! The trap handler hands over the faulting address and the error code the
//! CPU pushed; [`MemoryManager::dispatch_page_fault`] picks the address space,
//! lets the VMM resolve the fault and decides what happens to the faulting
//! context when it can't.

use crate::arch::ArchMmu;
use crate::manager::MemoryManager;
use crate::vmm::{AddressSpace, PageFault};
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PhysMapper;
use log::{error, info};

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// What the kernel does about faults the VMM could not resolve.
///
/// Implemented by the scheduler/process layer.
pub trait FaultEscalation {
    /// Kill the user process `pid`; the fault is passed along as the reason.
    fn terminate_process(&self, pid: u64, fault: &PageFault);

    /// Stop the machine after an unresolvable kernel-mode fault.
    fn halt(&self, fault: &PageFault) -> !;
}

/// How the interrupted context continues.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// Return from the exception and retry the access.
    Resume,
    /// The owning process was terminated.
    Terminated,
}

impl<M: PhysMapper, A: ArchMmu> MemoryManager<'_, M, A> {
    /// Handle a page fault at `address` with the CPU's `error_code`.
    ///
    /// Upper-half addresses are resolved in the kernel space, everything else
    /// in `current`, the space of process `pid`. A fault without a current
    /// user space is treated like one outside every area.
    #[must_use]
    pub fn dispatch_page_fault<E: FaultEscalation>(
        &self,
        address: u64,
        error_code: u64,
        pid: u64,
        current: Option<&AddressSpace>,
        escalation: &E,
    ) -> DispatchOutcome {
        let error = PageFaultError::from_bits(error_code);
        let address = VirtualAddress::new(address);
        let mut fault = PageFault::new(address, error, pid, self.mmu().timestamp());

        let space = if address.is_higher_half() {
            Some(self.kernel_space())
        } else {
            current
        };
        let resolved = space.is_some_and(|space| self.handle_page_fault(space, &mut fault).resolved);
        if resolved {
            return DispatchOutcome::Resume;
        }

        if error.user() {
            info!(
                "MM: terminating process {pid}: {:?} at {address} ({})",
                fault.kind,
                error.explain()
            );
            escalation.terminate_process(pid, &fault);
            DispatchOutcome::Terminated
        } else {
            error!(
                "MM: unresolvable kernel page fault at {address}, err={error_code:#x}: {} ({:?}, {:?})",
                error.explain(),
                fault.kind,
                fault.failure
            );
            escalation.halt(&fault)
        }
    }

    /// [`dispatch_page_fault`](Self::dispatch_page_fault) with the address
    /// taken from the CPU's fault address register.
    #[must_use]
    pub fn dispatch_current_fault<E: FaultEscalation>(
        &self,
        error_code: u64,
        pid: u64,
        current: Option<&AddressSpace>,
        escalation: &E,
    ) -> DispatchOutcome {
        let address = self.mmu().fault_address();
        self.dispatch_page_fault(address, error_code, pid, current, escalation)
    }
}
