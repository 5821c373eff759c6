//! HSA-style signal primitive.
//!
//! A signal is a 64-byte record holding a 64-bit value that producers mutate
//! atomically and consumers poll with a condition. The interpretation of the
//! value depends on the consuming operation: barrier and dispatch packets
//! treat it as a semaphore where 0 means "set", so an operation gated on N
//! producers initializes the value to N and each producer decrements by one.
//!
//! Signals are opaque to device code: the host allocates all of them up front
//! in a [`SignalTable`] and device code only ever holds a [`SignalHandle`].
//! A handle of 0 is the null signal: waits on it succeed immediately and
//! stores to it are no-ops.
//!
//! Timestamps (`start_ts`/`end_ts`) are written by the agent processing the
//! operation the signal completes: `start_ts` when the packet enters the
//! active phase and `end_ts` when it retires. Both are in the agent tick
//! domain (see [`crate::support::time`]).

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use thiserror::Error;

use crate::support::{MemoryScope, ScopedAtomic, ScopedAtomicArith};

/// Errors raised by signal table management.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SignalError {
    /// The table has no free signal slots left.
    #[error("signal table exhausted ({capacity} signals allocated)")]
    Exhausted {
        /// Total number of signals the table was created with.
        capacity: u32,
    },
}

/// Kind discriminator for a signal record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum SignalKind {
    /// User-defined signal supporting all signal operations.
    User = 1,
    /// Agent-owned doorbell. Only writes are permitted from other agents;
    /// soft queues created by the runtime must use [`SignalKind::User`].
    Doorbell = -1,
}

/// Wait condition comparing a signal's current value with a desired value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalCondition {
    /// The two operands are equal.
    Eq = 0,
    /// The two operands are not equal.
    Ne = 1,
    /// The current value is less than the desired value.
    Lt = 2,
    /// The current value is greater than or equal to the desired value.
    Gte = 3,
}

impl SignalCondition {
    /// Returns true if `current` satisfies the condition against `desired`.
    #[inline]
    pub fn evaluate(self, current: i64, desired: i64) -> bool {
        match self {
            SignalCondition::Eq => current == desired,
            SignalCondition::Ne => current != desired,
            SignalCondition::Lt => current < desired,
            SignalCondition::Gte => current >= desired,
        }
    }
}

/// Opaque reference to a signal in a [`SignalTable`].
///
/// The raw value is what gets embedded in AQL packets; 0 is the null signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SignalHandle(u64);

impl SignalHandle {
    /// The null signal: waits succeed immediately, completions no-op.
    pub const NULL: SignalHandle = SignalHandle(0);

    /// Reconstructs a handle from its packet representation.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        SignalHandle(raw)
    }

    /// Returns the packet representation of the handle.
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns true if this is the null signal.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A single signal record.
///
/// Padded and aligned to a cache line so that signals never share lines; the
/// packet processor and multiple agents hammer these concurrently.
#[repr(C, align(64))]
pub struct Signal {
    kind: AtomicI64,
    value: AtomicI64,
    event_mailbox: AtomicU64,
    event_id: AtomicU32,
    start_ts: AtomicU64,
    end_ts: AtomicU64,
    /// Id of the queue this signal is the doorbell for, 0 otherwise.
    queue_id: AtomicU64,
}

impl Signal {
    fn unassigned() -> Self {
        Self {
            kind: AtomicI64::new(0),
            value: AtomicI64::new(0),
            event_mailbox: AtomicU64::new(0),
            event_id: AtomicU32::new(0),
            start_ts: AtomicU64::new(0),
            end_ts: AtomicU64::new(0),
            queue_id: AtomicU64::new(0),
        }
    }

    /// Kind this signal was allocated as, or `None` if unallocated.
    #[inline]
    pub fn kind(&self) -> Option<SignalKind> {
        match self.kind.load(Ordering::Relaxed) {
            1 => Some(SignalKind::User),
            -1 => Some(SignalKind::Doorbell),
            _ => None,
        }
    }

    /// Platform event mailbox used for host interrupt delivery, 0 if the
    /// signal has no kernel event attached.
    #[inline]
    pub fn event_mailbox(&self) -> u64 {
        self.event_mailbox.load(Ordering::Relaxed)
    }

    /// Platform event id posted to the mailbox on signal.
    #[inline]
    pub fn event_id(&self) -> u32 {
        self.event_id.load(Ordering::Relaxed)
    }

    /// Attaches a platform interrupt event (host side, at signal creation).
    pub fn bind_event(&self, mailbox: u64, id: u32) {
        self.event_mailbox.store(mailbox, Ordering::Relaxed);
        self.event_id.store(id, Ordering::Relaxed);
    }
}

/// Host-owned storage for every signal in the system.
///
/// Device code cannot allocate signals; the host creates the table up front
/// and hands out opaque handles. Handle values are stable for the lifetime of
/// the table and index into it directly, which keeps packet encoding a plain
/// u64 copy.
pub struct SignalTable {
    slots: Box<[Signal]>,
    allocated: AtomicU32,
}

impl SignalTable {
    /// Creates a table with storage for `capacity` signals.
    pub fn with_capacity(capacity: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Signal::unassigned())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            allocated: AtomicU32::new(0),
        }
    }

    /// Total number of signals the table can hold.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Allocates one signal of the given kind.
    pub fn allocate(&self, kind: SignalKind) -> Result<SignalHandle, SignalError> {
        self.allocate_range(kind, 1)
    }

    /// Allocates `count` signals with consecutive handle values, returning
    /// the first. Used by the trace query ring which indexes its signals by
    /// offset from a base handle.
    pub fn allocate_range(&self, kind: SignalKind, count: u32) -> Result<SignalHandle, SignalError> {
        let base = self.allocated.fetch_add(count, Ordering::AcqRel);
        if base + count > self.slots.len() as u32 {
            return Err(SignalError::Exhausted {
                capacity: self.capacity(),
            });
        }
        for slot in &self.slots[base as usize..(base + count) as usize] {
            slot.kind.store(kind as i64, Ordering::Relaxed);
        }
        Ok(SignalHandle(base as u64 + 1))
    }

    /// Resolves a handle to its record. Panics on a handle that was never
    /// allocated from this table; the null signal resolves to `None`.
    #[inline]
    pub fn get(&self, handle: SignalHandle) -> Option<&Signal> {
        if handle.is_null() {
            return None;
        }
        Some(&self.slots[(handle.0 - 1) as usize])
    }

    /// Loads the signal value. The null signal reads as 0 ("signaled").
    #[inline]
    pub fn load(&self, handle: SignalHandle, order: Ordering, scope: MemoryScope) -> i64 {
        match self.get(handle) {
            Some(signal) => signal.value.load_scoped(order, scope),
            None => 0,
        }
    }

    /// Stores a value to the signal. No-op on the null signal.
    #[inline]
    pub fn store(&self, handle: SignalHandle, value: i64, order: Ordering, scope: MemoryScope) {
        if let Some(signal) = self.get(handle) {
            signal.value.store_scoped(value, order, scope);
        }
    }

    /// Atomically adds to the signal value.
    #[inline]
    pub fn add(&self, handle: SignalHandle, value: i64, order: Ordering, scope: MemoryScope) {
        if let Some(signal) = self.get(handle) {
            signal.value.fetch_add_scoped(value, order, scope);
        }
    }

    /// Atomically subtracts from the signal value. This is the completion
    /// operation the packet processor performs when a packet retires.
    #[inline]
    pub fn subtract(&self, handle: SignalHandle, value: i64, order: Ordering, scope: MemoryScope) {
        if let Some(signal) = self.get(handle) {
            signal.value.fetch_sub_scoped(value, order, scope);
        }
    }

    /// Atomically exchanges the signal value, returning the prior value.
    #[inline]
    pub fn exchange(
        &self,
        handle: SignalHandle,
        value: i64,
        order: Ordering,
        scope: MemoryScope,
    ) -> i64 {
        match self.get(handle) {
            Some(signal) => signal.value.swap_scoped(value, order, scope),
            None => 0,
        }
    }

    /// Atomic compare-and-swap on the signal value, returning the observed
    /// prior value.
    #[inline]
    pub fn cas(
        &self,
        handle: SignalHandle,
        expected: i64,
        value: i64,
        order: Ordering,
        scope: MemoryScope,
    ) -> i64 {
        match self.get(handle) {
            Some(signal) => signal
                .value
                .compare_exchange_scoped(expected, value, order, Ordering::Relaxed, scope)
                .unwrap_or_else(|prior| prior),
            None => 0,
        }
    }

    /// Spin-yields until the signal value satisfies `condition` against
    /// `desired`, returning the satisfying value. The null signal returns 0
    /// immediately.
    pub fn wait(
        &self,
        handle: SignalHandle,
        condition: SignalCondition,
        desired: i64,
        scope: MemoryScope,
    ) -> i64 {
        let Some(signal) = self.get(handle) else {
            return 0;
        };
        loop {
            let current = signal.value.load_scoped(Ordering::Acquire, scope);
            if condition.evaluate(current, desired) {
                return current;
            }
            crate::support::yield_now();
        }
    }

    /// Records the start timestamp on a signal (packet entered active phase).
    #[inline]
    pub fn mark_start(&self, handle: SignalHandle, timestamp: u64) {
        if let Some(signal) = self.get(handle) {
            signal
                .start_ts
                .store_scoped(timestamp, Ordering::Relaxed, MemoryScope::System);
        }
    }

    /// Records the end timestamp on a signal (packet retired).
    #[inline]
    pub fn mark_end(&self, handle: SignalHandle, timestamp: u64) {
        if let Some(signal) = self.get(handle) {
            signal
                .end_ts
                .store_scoped(timestamp, Ordering::Relaxed, MemoryScope::System);
        }
    }

    /// Reads the `(start_ts, end_ts)` pair captured on a signal.
    #[inline]
    pub fn timestamps(&self, handle: SignalHandle) -> (u64, u64) {
        match self.get(handle) {
            Some(signal) => (
                signal
                    .start_ts
                    .load_scoped(Ordering::Relaxed, MemoryScope::System),
                signal
                    .end_ts
                    .load_scoped(Ordering::Relaxed, MemoryScope::System),
            ),
            None => (0, 0),
        }
    }

    /// Clears the timestamp pair on a signal (query re-arm).
    #[inline]
    pub fn clear_timestamps(&self, handle: SignalHandle) {
        if let Some(signal) = self.get(handle) {
            signal
                .start_ts
                .store_scoped(0, Ordering::Relaxed, MemoryScope::System);
            signal
                .end_ts
                .store_scoped(0, Ordering::Relaxed, MemoryScope::System);
        }
    }

    /// Binds a doorbell signal to a queue id.
    #[inline]
    pub(crate) fn bind_doorbell(&self, handle: SignalHandle, queue_id: u64) {
        if let Some(signal) = self.get(handle) {
            signal
                .queue_id
                .store_scoped(queue_id, Ordering::Relaxed, MemoryScope::Device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_evaluation() {
        assert!(SignalCondition::Eq.evaluate(0, 0));
        assert!(!SignalCondition::Eq.evaluate(1, 0));
        assert!(SignalCondition::Ne.evaluate(1, 0));
        assert!(SignalCondition::Lt.evaluate(-1, 0));
        assert!(SignalCondition::Gte.evaluate(7, 7));
        assert!(!SignalCondition::Gte.evaluate(6, 7));
    }

    #[test]
    fn test_null_signal_semantics() {
        let table = SignalTable::with_capacity(4);
        // Waits on the null signal succeed immediately.
        assert_eq!(
            table.wait(SignalHandle::NULL, SignalCondition::Eq, 0, MemoryScope::Device),
            0
        );
        // Stores are no-ops.
        table.store(SignalHandle::NULL, 5, Ordering::Release, MemoryScope::Device);
        assert_eq!(
            table.load(SignalHandle::NULL, Ordering::Acquire, MemoryScope::Device),
            0
        );
    }

    #[test]
    fn test_decrement_to_zero() {
        let table = SignalTable::with_capacity(4);
        let signal = table.allocate(SignalKind::User).unwrap();
        table.store(signal, 3, Ordering::Release, MemoryScope::Device);
        for _ in 0..3 {
            table.subtract(signal, 1, Ordering::AcqRel, MemoryScope::Device);
        }
        assert_eq!(table.load(signal, Ordering::Acquire, MemoryScope::Device), 0);
    }

    #[test]
    fn test_allocate_range_is_contiguous() {
        let table = SignalTable::with_capacity(8);
        let base = table.allocate_range(SignalKind::User, 4).unwrap();
        let next = table.allocate(SignalKind::User).unwrap();
        assert_eq!(next.as_raw(), base.as_raw() + 4);
    }

    #[test]
    fn test_exhaustion() {
        let table = SignalTable::with_capacity(2);
        table.allocate(SignalKind::User).unwrap();
        table.allocate(SignalKind::User).unwrap();
        assert_eq!(
            table.allocate(SignalKind::User),
            Err(SignalError::Exhausted { capacity: 2 })
        );
    }

    #[test]
    fn test_cas_returns_prior() {
        let table = SignalTable::with_capacity(1);
        let signal = table.allocate(SignalKind::User).unwrap();
        table.store(signal, 10, Ordering::Release, MemoryScope::Device);
        let prior = table.cas(signal, 10, 20, Ordering::AcqRel, MemoryScope::Device);
        assert_eq!(prior, 10);
        assert_eq!(table.load(signal, Ordering::Acquire, MemoryScope::Device), 20);
        let miss = table.cas(signal, 10, 30, Ordering::AcqRel, MemoryScope::Device);
        assert_eq!(miss, 20);
    }
}
