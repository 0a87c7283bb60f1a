use kernel_vmem::MapError;

/// Failures of the physical and virtual memory managers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MmError {
    /// No frame available in any permitted zone, or no page table could be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// Misaligned or non-canonical address, order out of range, bad size.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("address is already mapped")]
    AlreadyMapped,
    #[error("address is not mapped")]
    NotMapped,
    /// Protection or ownership mismatch.
    #[error("access violation")]
    AccessViolation,
    /// A frame descriptor failed validation.
    #[error("frame descriptor corruption: {0}")]
    Corruption(&'static str),
    /// The requested range overlaps an existing area.
    #[error("range overlaps an existing memory area")]
    VmaConflict,
}

impl From<MapError> for MmError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfTables => Self::OutOfMemory,
            MapError::AlreadyMapped(_) | MapError::HugePageInPath(_) => Self::AlreadyMapped,
            MapError::Misaligned => Self::InvalidArgument("address is not page aligned"),
            MapError::NonCanonical(_) => Self::InvalidArgument("virtual address is not canonical"),
        }
    }
}
