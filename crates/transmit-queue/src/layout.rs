//! Shared Region Layout
//!
//! The control block lives at the start of the backing region, followed
//! by the ring storage. A queue placed in shared memory is therefore
//! fully self-describing: a second process attaches by mapping the same
//! region, no queue state exists outside it.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::QueueError;
use crate::sync::SpinLock;

/// Identifies an initialized queue region ("XQUE").
pub(crate) const REGION_MAGIC: u32 = 0x5851_5545;

/// Bumped on any change to the control block or record framing.
pub(crate) const LAYOUT_VERSION: u32 = 1;

/// Smallest supported ring capacity in bytes.
pub(crate) const MIN_CAPACITY: u32 = 64;

/// Largest supported ring capacity in bytes.
pub(crate) const MAX_CAPACITY: u32 = 1 << 30;

/// Control block at the start of every queue region.
///
/// Plain fields are written once at creation and read-only afterwards;
/// everything mutable is atomic so the block can be shared across
/// threads and processes.
#[repr(C)]
pub(crate) struct ControlBlock {
    pub magic: u32,
    pub version: u32,
    /// Usable ring bytes following this block
    pub capacity: u32,
    /// Queue level above which `needs_drain` reports true
    pub drain_threshold: u32,
    /// Producer cursor, logical monotonic byte offset
    pub write: AtomicU64,
    /// Consumer cursor, logical monotonic byte offset
    pub read: AtomicU64,
    /// Serializes producer reservations
    pub lock: SpinLock,
    /// Raised by flush commits, lowered when a record is released
    pub flush: AtomicU32,
    /// Reservations rejected for lack of space since the last reset
    pub overruns: AtomicU32,
    _pad: u32,
}

pub(crate) const CONTROL_SIZE: usize = std::mem::size_of::<ControlBlock>();

/// Usable ring capacity for a region of `size` bytes, rounded down to
/// the record alignment.
pub(crate) fn usable_capacity(size: usize) -> Result<u32, QueueError> {
    let required = CONTROL_SIZE + MIN_CAPACITY as usize;
    if size < required {
        return Err(QueueError::RegionTooSmall {
            required,
            actual: size,
        });
    }
    let capacity = ((size - CONTROL_SIZE) as u64 & !1).min(MAX_CAPACITY as u64);
    Ok(capacity as u32)
}

/// Initialize a fresh control block with empty cursors.
///
/// # Safety
/// `ctrl` must be valid for writes of `CONTROL_SIZE` bytes and 8-byte
/// aligned. Any queue state previously held in the region is lost.
pub(crate) unsafe fn create(ctrl: *mut ControlBlock, capacity: u32, drain_threshold: u32) {
    ctrl.write(ControlBlock {
        magic: REGION_MAGIC,
        version: LAYOUT_VERSION,
        capacity,
        drain_threshold,
        write: AtomicU64::new(0),
        read: AtomicU64::new(0),
        lock: SpinLock::new(),
        flush: AtomicU32::new(0),
        overruns: AtomicU32::new(0),
        _pad: 0,
    });
}

/// Check that a region holds a compatible, initialized queue before
/// attaching without clearing.
///
/// # Safety
/// `ctrl` must be valid for reads of `CONTROL_SIZE` bytes and 8-byte
/// aligned.
pub(crate) unsafe fn validate(
    ctrl: *const ControlBlock,
    region_capacity: u32,
) -> Result<(), QueueError> {
    let ctrl = &*ctrl;
    if ctrl.magic != REGION_MAGIC || ctrl.version != LAYOUT_VERSION {
        return Err(QueueError::IncompatibleRegion);
    }
    // The stored ring must fit inside the mapped region; a larger
    // mapping of the same segment is fine.
    if ctrl.capacity < MIN_CAPACITY || ctrl.capacity > region_capacity {
        return Err(QueueError::IncompatibleRegion);
    }
    Ok(())
}
