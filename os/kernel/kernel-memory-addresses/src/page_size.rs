use core::fmt;

mod sealed {
    pub trait Sealed {}
}

/// A translation granule of the x86-64 MMU.
///
/// Sealed: only the three sizes the page walker understands exist.
pub trait PageSize: sealed::Sealed + Copy + Eq + Ord + core::hash::Hash + fmt::Debug {
    /// Bytes covered by one page.
    const SIZE: u64 = 1 << Self::SHIFT;
    /// Low bits selecting the byte inside a page.
    const SHIFT: u32;
    /// Mask of the in-page offset bits.
    const MASK: u64 = Self::SIZE - 1;
    const NAME: &'static str;
}

/// 4 KiB: frames, PTE leaves and everything the buddy allocator hands out.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

/// 2 MiB: a PDE leaf.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;

/// 1 GiB: a PDPTE leaf.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;

impl sealed::Sealed for Size4K {}
impl sealed::Sealed for Size2M {}
impl sealed::Sealed for Size1G {}

impl PageSize for Size4K {
    const SHIFT: u32 = 12;
    const NAME: &'static str = "4K";
}

impl PageSize for Size2M {
    const SHIFT: u32 = 21;
    const NAME: &'static str = "2M";
}

impl PageSize for Size1G {
    const SHIFT: u32 = 30;
    const NAME: &'static str = "1G";
}
