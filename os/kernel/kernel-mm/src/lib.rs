//! # Kernel Memory Management
//!
//! Physical frame allocation, virtual address spaces and page-fault handling
//! for the kernel, built on the page-table walker in `kernel-vmem`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Page Fault Dispatch ([`dispatch`])       │
//! │    • decodes the CPU error code                     │
//! │    • resume, terminate the process, or halt         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Virtual Memory Manager ([`vmm`])         │
//! │    • address spaces and their areas (VMAs)          │
//! │    • demand paging, copy-on-write, fork             │
//! │    • protection changes, device windows             │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Physical Memory Manager ([`pmm`])          │
//! │    • per-zone buddy allocator, orders 0..=12        │
//! │    • frame descriptors, reference and pin counts    │
//! │    • watermarks, emergency reserve, reclaim hook    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Privileged instructions are reached through [`ArchMmu`] and physical
//! memory through [`PhysMapper`](kernel_vmem::PhysMapper), so everything
//! above runs unchanged in host tests.
//!
//! ## Bring-up
//!
//! ```rust,ignore
//! use kernel_mm::{HhdmPhysMapper, MemoryManager, MmConfig, X86_64Mmu};
//!
//! static MAPPER: HhdmPhysMapper = HhdmPhysMapper;
//! let mm = unsafe {
//!     MemoryManager::with_kernel_root(&MAPPER, X86_64Mmu, &memory_map, MmConfig::default(), current_root)
//! }?;
//! let frame = mm.pmm().alloc_pages(0, AllocFlags::KERNEL | AllocFlags::ZERO)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod dispatch;
mod error;
pub mod flags;
mod manager;
pub mod phys_mapper;
pub mod pmm;
pub mod vmm;

pub use crate::arch::ArchMmu;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::arch::X86_64Mmu;
pub use crate::config::{MmConfig, Watermarks, ZoneLayout};
pub use crate::dispatch::{DispatchOutcome, FaultEscalation, PageFaultError};
pub use crate::error::MmError;
pub use crate::flags::{AllocFlags, MapFlags, PageFlags, Protection};
pub use crate::manager::MemoryManager;
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::pmm::{PhysicalMemoryManager, PmmStats, Reclaim, ReleasePages, ZoneId, ZoneStats};
pub use crate::vmm::{
    AddressSpace, FaultKind, FaultResult, FaultStats, PageFault, SpaceKind, SpaceStats, VmaInfo, VmaKind,
};
