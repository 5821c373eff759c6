//! Lock-free pool of host-allocated signals.
//!
//! Device code cannot create signals, so the host allocates a batch up front
//! and seeds the pool with their handles. Acquire and release are lock-free
//! and safe from any number of producers and consumers; the pool is backed by
//! a bounded MPMC queue. When the pool runs dry the acquire returns the null
//! handle; the scheduler treats that as fatal and reports the device lost.

use core::sync::atomic::Ordering;

use crossbeam_queue::ArrayQueue;

use crate::signal::{SignalHandle, SignalTable};
use crate::support::MemoryScope;

/// A pool of transient signals for device-side use.
pub struct SignalPool {
    free: ArrayQueue<SignalHandle>,
}

impl SignalPool {
    /// Creates an empty pool with room for `capacity` signals. The capacity
    /// must be a power of two (the backing ring is sized by mask).
    pub fn with_capacity(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "signal pool capacity must be a power of two");
        Self {
            free: ArrayQueue::new(capacity as usize),
        }
    }

    /// Seeds the pool with host-allocated signal handles. Signals must
    /// remain valid for the lifetime of the pool.
    pub fn initialize(&self, handles: impl IntoIterator<Item = SignalHandle>) {
        for handle in handles {
            // Seeding beyond capacity is a host setup bug.
            self.free.push(handle).expect("signal pool seeded past capacity");
        }
    }

    /// Number of signals currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total capacity of the pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Acquires a signal and stores `initial_value` to it. Returns the null
    /// handle when the pool is exhausted; callers must check with
    /// [`SignalHandle::is_null`].
    pub fn acquire(&self, table: &SignalTable, initial_value: i64) -> SignalHandle {
        match self.free.pop() {
            Some(handle) => {
                // The value is undefined on acquire as the signal may be
                // recycled; the release order makes the reset visible before
                // the handle escapes into any packet.
                table.store(handle, initial_value, Ordering::Release, MemoryScope::System);
                handle
            }
            None => SignalHandle::NULL,
        }
    }

    /// Returns a signal to the pool. Only signals acquired from this pool
    /// may be released; the value is left as-is (usually 0 after use as a
    /// binary completion semaphore, but any value is allowed).
    pub fn release(&self, handle: SignalHandle) {
        if handle.is_null() {
            return;
        }
        self.free.push(handle).expect("released a signal not owned by the pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    #[test]
    fn test_acquire_release_cycle() {
        let table = SignalTable::with_capacity(4);
        let pool = SignalPool::with_capacity(4);
        pool.initialize((0..4).map(|_| table.allocate(SignalKind::User).unwrap()));

        let signal = pool.acquire(&table, 1);
        assert!(!signal.is_null());
        assert_eq!(table.load(signal, Ordering::Acquire, MemoryScope::Device), 1);
        assert_eq!(pool.available(), 3);

        pool.release(signal);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let table = SignalTable::with_capacity(2);
        let pool = SignalPool::with_capacity(2);
        pool.initialize([table.allocate(SignalKind::User).unwrap()]);

        let a = pool.acquire(&table, 1);
        assert!(!a.is_null());
        let b = pool.acquire(&table, 1);
        assert!(b.is_null());
    }

    #[test]
    fn test_release_null_is_noop() {
        let pool = SignalPool::with_capacity(2);
        pool.release(SignalHandle::NULL);
        assert_eq!(pool.available(), 0);
    }
}
