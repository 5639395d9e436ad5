//! Queue Error Types

use thiserror::Error;

/// Errors reported by the transmit queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Capacity outside the supported range at creation
    #[error("capacity {capacity} is outside the supported range [{min}, {max}]")]
    InvalidCapacity { capacity: u32, min: u32, max: u32 },

    /// Backing allocation failed
    #[error("allocation of {0} bytes failed")]
    AllocFailed(usize),

    /// Caller-supplied region is too small for control block plus ring
    #[error("memory region of {actual} bytes is too small, need at least {required}")]
    RegionTooSmall { required: usize, actual: usize },

    /// Caller-supplied region pointer is not sufficiently aligned
    #[error("memory region must be 8-byte aligned")]
    MisalignedRegion,

    /// Region does not hold a compatible, initialized queue
    #[error("memory region is not an initialized queue or has an incompatible layout")]
    IncompatibleRegion,

    /// Record can never fit, regardless of queue fill state
    #[error("record of {size} bytes exceeds the structural limit of {max}")]
    RecordTooLarge { size: usize, max: usize },

    /// Zero-length records are not representable
    #[error("record size must be non-zero")]
    EmptyRecord,

    /// Not enough free space right now; the sample should be dropped
    #[error("queue full: {needed} bytes needed, {free} free")]
    Full { needed: u32, free: u32 },

    /// Release did not match the oldest pending record
    #[error("release does not match the oldest pending record")]
    ReleaseOutOfOrder,
}
