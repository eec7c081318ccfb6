//! Process-wide read/write guard over all record and table state.
//!
//! One lock covers the whole record space. Readers (exists, get, list, table
//! reads) share it; writers (save, delete, table writes) hold it exclusively
//! for their whole read-modify-write-publish section. Guards release on drop,
//! so every exit path of a write, including `?` returns, unlocks.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing lock traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub shared_acquisitions: u64,
    pub exclusive_acquisitions: u64,
}

/// Coarse read/write lock. `parking_lot`'s fair policy keeps a steady stream
/// of readers from starving writers.
#[derive(Default)]
pub struct ConcurrencyGuard {
    lock: RwLock<()>,
    shared: AtomicU64,
    exclusive: AtomicU64,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for read-only operations.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        let guard = self.lock.read();
        self.shared.fetch_add(1, Ordering::Relaxed);
        guard
    }

    /// Exclusive access for mutations.
    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        let guard = self.lock.write();
        self.exclusive.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("exclusive section entered");
        guard
    }

    /// Whether a writer currently holds the lock.
    pub fn is_locked_exclusive(&self) -> bool {
        self.lock.is_locked_exclusive()
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            shared_acquisitions: self.shared.load(Ordering::Relaxed),
            exclusive_acquisitions: self.exclusive.load(Ordering::Relaxed),
        }
    }
}
