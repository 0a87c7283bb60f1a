use crate::PageSize;
use core::fmt;

/// An address translated by the page tables.
///
/// [`new`](Self::new) stores the value as given. Fault addresses and
/// caller-supplied ranges are checked with [`is_canonical`](Self::is_canonical)
/// before they reach a table walk.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::canonicalize(0x0000_8000_0000_0000);
/// assert_eq!(va.as_u64(), 0xFFFF_8000_0000_0000);
/// assert!(va.is_higher_half());
/// assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    /// Implemented address bits with 4-level paging.
    pub const BITS: u32 = 48;

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Copy bit 47 into bits 63..48.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub const fn canonicalize(v: u64) -> Self {
        const SHIFT: u32 = 64 - VirtualAddress::BITS;
        Self((((v << SHIFT) as i64) >> SHIFT) as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        Self::canonicalize(self.0).0 == self.0
    }

    /// Whether the address is in the kernel half (bits 63..47 set).
    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        self.0 >> (Self::BITS - 1) == u64::MAX >> (Self::BITS - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl core::ops::Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}
