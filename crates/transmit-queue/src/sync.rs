//! Process-Shared Synchronization Primitives
//!
//! Word-sized primitives that remain valid when placed inside shared
//! memory mapped by multiple processes: no OS handles, no heap, all
//! state in a single atomic word.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Test-and-set spinlock with an RAII guard.
///
/// Critical sections guarded by this lock must stay bounded to a few
/// cursor updates; producers on real-time paths rely on that bound.
#[repr(transparent)]
pub struct SpinLock(AtomicU32);

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock(AtomicU32::new(UNLOCKED))
    }

    /// Spin until the lock is held.
    pub fn lock(&self) -> SpinLockGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.0.load(Ordering::Relaxed) == LOCKED {
                std::hint::spin_loop();
            }
        }
    }

    /// Take the lock if it is free.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        self.0
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the lock until dropped.
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.store(UNLOCKED, Ordering::Release);
    }
}

const EMPTY: u32 = 0;
const RUNNING: u32 = 1;
const DONE: u32 = 2;

/// One-shot initialization guard.
///
/// The first caller runs the closure, concurrent callers spin until it
/// completes, later calls return immediately. Replaces static
/// registration flags for one-time metadata setup.
///
/// A panicking initializer leaves the flag busy; initializers must not
/// panic.
#[repr(transparent)]
pub struct OnceFlag(AtomicU32);

impl OnceFlag {
    pub const fn new() -> Self {
        OnceFlag(AtomicU32::new(EMPTY))
    }

    /// Run `f` exactly once across all callers of this flag.
    pub fn call_once(&self, f: impl FnOnce()) {
        match self
            .0
            .compare_exchange(EMPTY, RUNNING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                f();
                self.0.store(DONE, Ordering::Release);
            }
            Err(DONE) => {}
            Err(_) => {
                while self.0.load(Ordering::Acquire) != DONE {
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// True once the initializer has completed.
    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire) == DONE
    }
}

impl Default for OnceFlag {
    fn default() -> Self {
        Self::new()
    }
}
