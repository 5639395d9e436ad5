//! XCP Transmit Queue
//!
//! Bounded multi-producer single-consumer queue of variable-length
//! byte records, decoupling real-time measurement sampling from the
//! transport drain loop. Producers reserve, fill and commit records
//! without ever blocking beyond a bounded critical section; a single
//! consumer peeks and releases them in FIFO order. The queue can live
//! on the heap or inside caller-supplied memory, including shared
//! memory mapped by multiple processes.

mod config;
mod error;
mod layout;
mod queue;
mod record;
mod sync;

pub use config::{QueueConfig, DEFAULT_CAPACITY, DEFAULT_DRAIN_THRESHOLD};
pub use error::QueueError;
pub use queue::{Queue, ReadSlot, WriteSlot};
pub use record::MAX_RECORD_LEN;
pub use sync::{OnceFlag, SpinLock, SpinLockGuard};
