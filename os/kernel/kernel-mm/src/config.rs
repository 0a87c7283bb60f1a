//! # Runtime Memory Policy
//!
//! Compile-time layout lives in [`kernel_info::memory`]; everything a boot
//! configuration or a test may want to tune lives in [`MmConfig`].

use crate::MmError;
use kernel_info::memory::{DMA_ZONE_END, DMA32_ZONE_END, NORMAL_ZONE_END, PAGE_SIZE};

/// Watermarks as percentages of the pages the allocator manages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Watermarks {
    /// Dropping below this sets the memory-pressure flag.
    pub low_percent: u8,
    /// Climbing back to this clears the memory-pressure flag.
    pub high_percent: u8,
    /// Below this, only kernel-owned or atomic requests are served.
    pub emergency_percent: u8,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            low_percent: 10,
            high_percent: 20,
            emergency_percent: 5,
        }
    }
}

/// Physical boundaries between zones, in bytes (exclusive ends).
///
/// Everything at or above `normal_end` is HIGH memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ZoneLayout {
    pub dma_end: u64,
    pub dma32_end: u64,
    pub normal_end: u64,
}

impl Default for ZoneLayout {
    fn default() -> Self {
        Self {
            dma_end: DMA_ZONE_END,
            dma32_end: DMA32_ZONE_END,
            normal_end: NORMAL_ZONE_END,
        }
    }
}

/// Memory manager policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct MmConfig {
    pub watermarks: Watermarks,
    pub zones: ZoneLayout,
    /// Pages populated ahead of a sequential demand fault. `0` disables prefetch.
    pub prefetch_pages: u32,
}

/// Upper bound for [`MmConfig::prefetch_pages`].
pub const MAX_PREFETCH_PAGES: u32 = 64;

impl MmConfig {
    /// Check the configuration for consistency.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] naming the first inconsistent setting.
    pub const fn validate(&self) -> Result<(), MmError> {
        let w = &self.watermarks;
        if w.high_percent > 100 {
            return Err(MmError::InvalidArgument("high watermark above 100 %"));
        }
        if w.low_percent >= w.high_percent {
            return Err(MmError::InvalidArgument("low watermark must be below the high watermark"));
        }
        if w.emergency_percent > w.low_percent {
            return Err(MmError::InvalidArgument("emergency watermark above the low watermark"));
        }

        let z = &self.zones;
        if !z.dma_end.is_multiple_of(PAGE_SIZE)
            || !z.dma32_end.is_multiple_of(PAGE_SIZE)
            || !z.normal_end.is_multiple_of(PAGE_SIZE)
        {
            return Err(MmError::InvalidArgument("zone boundaries must be page aligned"));
        }
        if z.dma_end > z.dma32_end || z.dma32_end > z.normal_end {
            return Err(MmError::InvalidArgument("zone boundaries must ascend"));
        }

        if self.prefetch_pages > MAX_PREFETCH_PAGES {
            return Err(MmError::InvalidArgument("prefetch window too large"));
        }
        Ok(())
    }
}
