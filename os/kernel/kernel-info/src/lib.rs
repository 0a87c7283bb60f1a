//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and the boot memory-map
//! contract shared by the memory manager and the components around it
//! (the loader hand-off, the kernel start-up code, diagnostics).
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: [`MemoryRegion`](boot::MemoryRegion) entries with a
//!   base, a length and a [`MemoryRegionKind`](boot::MemoryRegionKind).
//! * **ABI Stability**: `#[repr(C)]` so the loader can produce the slice.
//!
//! ### Memory Layout ([`memory`])
//! * **Address Space Split**: user space is the canonical lower half, kernel
//!   space starts at [`KERNEL_SPACE_BASE`](memory::KERNEL_SPACE_BASE).
//! * **Physical Memory Mapping**: HHDM (Higher Half Direct Mapping).
//! * **Kernel Windows**: one PML4 slot each for dynamic mappings and device
//!   (MMIO) windows.
//! * **Zones**: default physical limits for DMA, DMA32 and NORMAL.
//! * **Buddy Geometry**: page size and maximum allocation order.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USER_SPACE_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   (non-canonical hole)          │
//! KERNEL_SPACE_BASE     ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_DYNAMIC_BASE   ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   Kernel dynamic mappings       │
//! DEVICE_WINDOW_BASE    ├─────────────────────────────────┤ 0xffff_c980_0000_0000
//!                       │   Device (MMIO) windows         │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Zones
//!
//! ```text
//! 0          DMA_ZONE_END    DMA32_ZONE_END     NORMAL_ZONE_END
//! ├── DMA ───────┼──── DMA32 ──────┼──── NORMAL ────────┼──── HIGH ──▶
//!              16 MiB            4 GiB               64 TiB
//! ```
//!
//! All values are `const` and checked with compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
