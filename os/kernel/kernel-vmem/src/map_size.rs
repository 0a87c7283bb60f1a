use crate::page_table::Level;
use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K};

mod sealed {
    pub trait Sealed {}
    impl Sealed for kernel_memory_addresses::Size4K {}
    impl Sealed for kernel_memory_addresses::Size2M {}
    impl Sealed for kernel_memory_addresses::Size1G {}
}

/// Page sizes the walker can install as a leaf, and the level they live at.
pub trait MapSize: PageSize + sealed::Sealed {
    /// Table level that holds the leaf entry.
    const LEAF_LEVEL: Level;
    /// Whether the leaf needs the `PS` bit.
    const HUGE: bool;
}

impl MapSize for Size4K {
    const LEAF_LEVEL: Level = Level::PT;
    const HUGE: bool = false;
}

impl MapSize for Size2M {
    const LEAF_LEVEL: Level = Level::PD;
    const HUGE: bool = true;
}

impl MapSize for Size1G {
    const LEAF_LEVEL: Level = Level::PDPT;
    const HUGE: bool = true;
}
