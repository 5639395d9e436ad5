//! Transmit Queue Core
//!
//! Ring buffer bookkeeping: producer reservation and commit, consumer
//! peek and release, wraparound handling.
//!
//! Producer reservations are serialized under the control block
//! spinlock, so records become visible to the consumer in acquisition
//! order. Commits complete independently per producer; the consumer
//! stops at the first record whose payload is still being written.
//! Payloads never straddle the physical end of the ring: a reservation
//! that does not fit contiguously inserts a wrap marker and starts at
//! physical offset zero, trading a little dead space for single-copy
//! payload writes.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::{QueueConfig, DEFAULT_DRAIN_THRESHOLD};
use crate::error::QueueError;
use crate::layout::{self, ControlBlock, CONTROL_SIZE, MAX_CAPACITY, MIN_CAPACITY};
use crate::record::{self, Header, HDR_RESERVED, HDR_VOID, HDR_WRAP, MAX_RECORD_LEN};

/// Sleep granularity of [`Queue::wait_empty`].
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Who owns the backing region.
enum Storage {
    /// Heap allocation owned by the queue, freed on drop
    Owned { layout: Layout },
    /// Caller-owned region, never freed by the queue
    Borrowed,
}

/// Bounded multi-producer single-consumer queue of variable-length
/// byte records.
///
/// Producers reserve space with [`acquire`](Queue::acquire), fill the
/// returned [`WriteSlot`] and commit it. The (single) consumer borrows
/// the oldest committed record with [`peek`](Queue::peek) and returns
/// its space with [`ReadSlot::release`]. Producers never block beyond
/// a bounded critical section; when space runs out the reservation is
/// rejected and the sample is the producer's to drop.
///
/// All queue state lives in the backing region, so a queue created in
/// shared memory with [`from_memory`](Queue::from_memory) can be
/// driven by handles in different processes.
pub struct Queue {
    /// Region start: control block followed by the ring storage
    region: NonNull<u8>,
    storage: Storage,
}

// SAFETY: all shared state behind `region` is atomic; producer
// reservations are serialized by the control block lock and the
// single-consumer discipline is part of the API contract.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    /// Create a heap-backed queue with `capacity` usable ring bytes
    /// and the default drain threshold.
    pub fn new(capacity: u32) -> Result<Self, QueueError> {
        Self::with_config(&QueueConfig {
            capacity,
            ..QueueConfig::default()
        })
    }

    /// Create a heap-backed queue from a configuration.
    pub fn with_config(config: &QueueConfig) -> Result<Self, QueueError> {
        let capacity = config.capacity & !1;
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(QueueError::InvalidCapacity {
                capacity: config.capacity,
                min: MIN_CAPACITY,
                max: MAX_CAPACITY,
            });
        }

        let total = CONTROL_SIZE + capacity as usize;
        let layout = Layout::from_size_align(total, 8)
            .map_err(|_| QueueError::AllocFailed(total))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let region = NonNull::new(ptr).ok_or(QueueError::AllocFailed(total))?;
        // SAFETY: freshly allocated, 8-aligned, large enough for the
        // control block
        unsafe { layout::create(region.as_ptr() as *mut ControlBlock, capacity, config.drain_threshold) };

        info!(capacity, "transmit queue created");
        Ok(Queue {
            region,
            storage: Storage::Owned { layout },
        })
    }

    /// Place the queue inside a caller-supplied memory region, e.g. a
    /// shared memory segment mapped by several processes.
    ///
    /// With `clear = true` the region is (re)initialized to an empty
    /// queue. With `clear = false` the region must already hold an
    /// initialized queue; cursors and committed records are preserved,
    /// which is how a second process attaches to a live queue. The
    /// usable ring capacity is the region size minus the control
    /// block, reported by [`capacity`](Queue::capacity).
    ///
    /// Dropping the returned queue never frees the region.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes for
    /// the whole lifetime of the returned queue and of every other
    /// queue attached to the same region, and the region must not be
    /// moved, resized or reused for anything else in that time.
    pub unsafe fn from_memory(ptr: *mut u8, size: usize, clear: bool) -> Result<Self, QueueError> {
        let region = NonNull::new(ptr).ok_or(QueueError::RegionTooSmall {
            required: CONTROL_SIZE + MIN_CAPACITY as usize,
            actual: 0,
        })?;
        if (ptr as usize) % 8 != 0 {
            return Err(QueueError::MisalignedRegion);
        }

        let capacity = layout::usable_capacity(size)?;
        let ctrl = ptr as *mut ControlBlock;
        if clear {
            layout::create(ctrl, capacity, DEFAULT_DRAIN_THRESHOLD);
            info!(capacity, "transmit queue created in caller memory");
        } else {
            layout::validate(ctrl, capacity)?;
            info!(capacity = (*ctrl).capacity, "attached to existing queue region");
        }

        Ok(Queue {
            region,
            storage: Storage::Borrowed,
        })
    }

    fn ctrl(&self) -> &ControlBlock {
        // SAFETY: the region starts with an initialized control block
        // and outlives self
        unsafe { &*(self.region.as_ptr() as *const ControlBlock) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: the region is CONTROL_SIZE + capacity bytes
        unsafe { self.region.as_ptr().add(CONTROL_SIZE) }
    }

    /// Header word at an even physical ring offset.
    fn header_at(&self, offset: u32) -> &AtomicU16 {
        debug_assert!(offset % 2 == 0 && offset < self.ctrl().capacity);
        // SAFETY: offset is in bounds and 2-aligned, the region
        // outlives self, and header words are only accessed atomically
        unsafe { &*(self.data().add(offset as usize) as *const AtomicU16) }
    }

    /// Physical ring offset of a logical cursor position.
    fn offset_of(&self, pos: u64) -> u32 {
        (pos % u64::from(self.ctrl().capacity)) as u32
    }

    /// Usable ring capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.ctrl().capacity
    }

    /// Reserve space for a record of `size` payload bytes.
    ///
    /// Fails with [`QueueError::Full`] when the free span cannot hold
    /// the record right now (the sample should be dropped, never
    /// retried in a real-time context) and with
    /// [`QueueError::RecordTooLarge`] when no queue state could ever
    /// hold it. Reservations are serialized, so consumer visibility
    /// follows acquisition order.
    pub fn acquire(&self, size: usize) -> Result<WriteSlot<'_>, QueueError> {
        let ctrl = self.ctrl();
        let capacity = ctrl.capacity;

        if size == 0 {
            return Err(QueueError::EmptyRecord);
        }
        let max = MAX_RECORD_LEN.min((capacity - record::HEADER_SIZE) as usize);
        if size > max {
            return Err(QueueError::RecordTooLarge { size, max });
        }

        let need = record::extent(size as u32);
        let offset;
        {
            let _guard = ctrl.lock.lock();
            let write = ctrl.write.load(Ordering::Relaxed);
            let read = ctrl.read.load(Ordering::Acquire);
            let free = capacity - (write - read) as u32;

            let at = self.offset_of(write);
            let until_end = capacity - at;
            let pad = if need > until_end { until_end } else { 0 };

            if free < need + pad {
                drop(_guard);
                ctrl.overruns.fetch_add(1, Ordering::Relaxed);
                debug!(size, free, "reservation rejected, queue full");
                return Err(QueueError::Full {
                    needed: need + pad,
                    free,
                });
            }

            offset = if pad > 0 {
                self.header_at(at).store(HDR_WRAP, Ordering::Relaxed);
                0
            } else {
                at
            };
            self.header_at(offset).store(HDR_RESERVED, Ordering::Relaxed);
            // Publish the cursor only after the headers are in place;
            // the consumer must never see it ahead of an uninitialized
            // header word.
            ctrl.write
                .store(write + u64::from(need + pad), Ordering::Release);
        }

        trace!(size, offset, "record reserved");
        Ok(WriteSlot {
            queue: self,
            offset,
            len: size as u16,
            committed: false,
        })
    }

    /// Borrow the oldest committed record without removing it.
    ///
    /// Returns `None` when the queue is empty or the oldest record is
    /// still being written. Repeated peeks return the same record
    /// until it is released. Single consumer only; concurrent callers
    /// must be serialized externally.
    pub fn peek(&self) -> Option<ReadSlot<'_>> {
        let ctrl = self.ctrl();
        loop {
            let read = ctrl.read.load(Ordering::Relaxed);
            let write = ctrl.write.load(Ordering::Acquire);
            if read == write {
                return None;
            }

            let offset = self.offset_of(read);
            let word = self.header_at(offset).load(Ordering::Acquire);
            match record::decode(word) {
                Header::Reserved => return None,
                Header::Wrap => {
                    ctrl.read
                        .store(read + u64::from(ctrl.capacity - offset), Ordering::Release);
                }
                Header::Void { len } => {
                    debug!(len, "skipping voided record");
                    ctrl.read
                        .store(read + u64::from(record::extent(u32::from(len))), Ordering::Release);
                }
                Header::Committed { len } => {
                    trace!(len, "peek");
                    return Some(ReadSlot {
                        queue: self,
                        read_pos: read,
                        offset,
                        len,
                    });
                }
            }
        }
    }

    /// Bytes between the consumer and producer cursors: committed
    /// records with their headers, wrap padding and reservations still
    /// being written. Any thread may call this.
    pub fn level(&self) -> u32 {
        let ctrl = self.ctrl();
        let read = ctrl.read.load(Ordering::Acquire);
        let write = ctrl.write.load(Ordering::Acquire);
        (write - read) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.level() == 0
    }

    /// Reservations rejected for lack of space since creation or the
    /// last [`clear`](Queue::clear).
    pub fn overruns(&self) -> u32 {
        self.ctrl().overruns.load(Ordering::Relaxed)
    }

    /// Discard all queued content and reset the flush and overrun
    /// state.
    ///
    /// Must not race an in-flight reservation: a producer still
    /// holding a [`WriteSlot`] would keep writing into space that is
    /// up for reuse. Call from a quiesced state only, e.g. connection
    /// teardown.
    pub fn clear(&self) {
        let ctrl = self.ctrl();
        let _guard = ctrl.lock.lock();
        let write = ctrl.write.load(Ordering::Relaxed);
        ctrl.read.store(write, Ordering::Release);
        ctrl.flush.store(0, Ordering::Relaxed);
        ctrl.overruns.store(0, Ordering::Relaxed);
        debug!("queue cleared");
    }

    /// Mark queued content ready for immediate drain, bypassing the
    /// batching threshold. Pure signal, no data is moved.
    pub fn flush(&self) {
        self.ctrl().flush.store(1, Ordering::Release);
    }

    /// True when the transport should drain now: the flush flag is
    /// raised or the level passed the configured drain threshold.
    pub fn needs_drain(&self) -> bool {
        let level = self.level();
        if level == 0 {
            return false;
        }
        let ctrl = self.ctrl();
        ctrl.flush.load(Ordering::Acquire) != 0 || level > ctrl.drain_threshold
    }

    /// Block until the queue drains or `timeout` elapses, raising the
    /// flush flag each poll round. Consumer-side helper for shutdown
    /// paths; never call from a producer context.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while !self.is_empty() {
            self.flush();
            if start.elapsed() >= timeout {
                debug!(level = self.level(), "timeout waiting for queue to drain");
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        true
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Storage::Owned { layout } = &self.storage {
            // SAFETY: allocated in `with_config` with this layout;
            // borrowed regions are the caller's to free
            unsafe { dealloc(self.region.as_ptr(), *layout) };
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.capacity())
            .field("level", &self.level())
            .field("overruns", &self.overruns())
            .finish()
    }
}

/// Reserved, uncommitted record.
///
/// Write the payload through the `DerefMut` slice view, then
/// [`commit`](WriteSlot::commit). Dropping the slot without committing
/// voids the reservation: the consumer skips the space instead of
/// delivering it, and the queue never stalls on an abandoned write.
pub struct WriteSlot<'a> {
    queue: &'a Queue,
    offset: u32,
    len: u16,
    committed: bool,
}

impl WriteSlot<'_> {
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: the reservation spans
        // offset .. offset + extent(len), inside the ring
        unsafe {
            self.queue
                .data()
                .add(self.offset as usize + record::HEADER_SIZE as usize)
        }
    }

    /// Finalize the record and make it visible to the consumer.
    ///
    /// With `flush` set the queue is additionally marked for immediate
    /// drain. The header store uses release ordering, so the consumer
    /// observes the complete payload or nothing.
    pub fn commit(mut self, flush: bool) {
        let ctrl = self.queue.ctrl();
        if flush {
            ctrl.flush.store(1, Ordering::Release);
        }
        self.queue
            .header_at(self.offset)
            .store(self.len, Ordering::Release);
        self.committed = true;
        trace!(len = self.len, flush, "record committed");
    }
}

impl Deref for WriteSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the reservation grants this slot exclusive access to
        // the payload bytes until commit
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), usize::from(self.len)) }
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(), usize::from(self.len)) }
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            warn!(len = self.len, "write slot dropped without commit, voiding record");
            self.queue
                .header_at(self.offset)
                .store(HDR_VOID | self.len, Ordering::Release);
        }
    }
}

/// Read-only view of the oldest committed record.
///
/// Peeking is non-destructive: the record stays at the front of the
/// queue until [`release`](ReadSlot::release) returns its space.
pub struct ReadSlot<'a> {
    queue: &'a Queue,
    read_pos: u64,
    offset: u32,
    len: u16,
}

impl ReadSlot<'_> {
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free the record's space for new reservations.
    ///
    /// Slots must be released in peek order. A slot that no longer
    /// matches the oldest pending record (released out of order, or
    /// stale after [`Queue::clear`]) is rejected without touching the
    /// cursors.
    pub fn release(self) -> Result<(), QueueError> {
        let ctrl = self.queue.ctrl();
        if ctrl.read.load(Ordering::Relaxed) != self.read_pos {
            warn!("release does not match the oldest pending record");
            return Err(QueueError::ReleaseOutOfOrder);
        }
        let new_read = self.read_pos + u64::from(record::extent(u32::from(self.len)));
        ctrl.read.store(new_read, Ordering::Release);
        // The flush signal is served once the prioritized content has
        // fully drained.
        if new_read == ctrl.write.load(Ordering::Relaxed) {
            ctrl.flush.store(0, Ordering::Relaxed);
        }
        trace!(len = self.len, "record released");
        Ok(())
    }
}

impl Deref for ReadSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the record was committed with release ordering and
        // its space is not reused before release
        unsafe {
            std::slice::from_raw_parts(
                self.queue
                    .data()
                    .add(self.offset as usize + record::HEADER_SIZE as usize),
                usize::from(self.len),
            )
        }
    }
}
