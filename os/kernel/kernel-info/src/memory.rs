//! # Memory Layout

/// Size of a base page / physical frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Largest buddy order; an order-`MAX_ORDER` block spans 16 MiB.
pub const MAX_ORDER: usize = 12;

/// Number of buddy free lists per zone (orders `0..=MAX_ORDER`).
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// First address past the user half (exclusive bound).
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Last address a user mapping may cover.
pub const LAST_USERSPACE_ADDRESS: u64 = USER_SPACE_END - 1;

/// Start of the canonical higher half; everything from here up is kernel space.
pub const KERNEL_SPACE_BASE: u64 = 0xffff_8000_0000_0000;

/// Index of the first top-level (PML4) slot that belongs to the kernel.
pub const KERNEL_PML4_START: usize = 256;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Amount of physical memory the direct map covers (64 TiB, 128 PML4 slots).
pub const HHDM_SIZE: u64 = 64 << 40;

/// One PML4 slot (512 GiB) of kernel-private dynamic mappings.
pub const KERNEL_DYNAMIC_BASE: u64 = 0xffff_c900_0000_0000;

/// Size of the dynamic mapping range.
pub const KERNEL_DYNAMIC_SIZE: u64 = 1 << 39;

/// One PML4 slot (512 GiB) reserved for uncached device (MMIO) windows.
pub const DEVICE_WINDOW_BASE: u64 = 0xffff_c980_0000_0000;

/// Size of the device window range.
pub const DEVICE_WINDOW_SIZE: u64 = 1 << 39;

/// Where the kernel image executes, matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Physical end (exclusive) of the DMA zone: legacy ISA DMA reaches 16 MiB.
pub const DMA_ZONE_END: u64 = 16 << 20;

/// Physical end (exclusive) of the DMA32 zone: 32-bit bus masters reach 4 GiB.
pub const DMA32_ZONE_END: u64 = 4 << 30;

/// Physical end (exclusive) of the NORMAL zone. Frames above it are not
/// permanently reachable through the direct map and form the HIGH zone.
pub const NORMAL_ZONE_END: u64 = HHDM_SIZE;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(KERNEL_SPACE_BASE > LAST_USERSPACE_ADDRESS);
    assert!(HHDM_BASE >= KERNEL_SPACE_BASE);
    assert!(HHDM_BASE + HHDM_SIZE <= KERNEL_DYNAMIC_BASE);
    assert!(KERNEL_DYNAMIC_BASE + KERNEL_DYNAMIC_SIZE <= DEVICE_WINDOW_BASE);
    assert!(DEVICE_WINDOW_BASE + DEVICE_WINDOW_SIZE <= KERNEL_BASE);
    assert!(KERNEL_DYNAMIC_BASE.is_multiple_of(1 << 39));
    assert!(DEVICE_WINDOW_BASE.is_multiple_of(1 << 39));
    assert!(DMA_ZONE_END < DMA32_ZONE_END && DMA32_ZONE_END < NORMAL_ZONE_END);
};
