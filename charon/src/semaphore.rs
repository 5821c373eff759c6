//! Timeline semaphores with direct device-to-device wakes.
//!
//! A semaphore is an HSA signal plus tracking of waiters so that payload
//! advances can wake schedulers without a host round trip. Waiters register
//! the minimum payload that would let them progress; the wake list is kept
//! sorted by that value so signaling pops satisfied waiters from the head.
//!
//! Each scheduler owns a fixed [`WakePool`] of slots. A slot tracks one
//! `(scheduler, semaphore)` pair and carries the minimum of all outstanding
//! required values for that pair, so long pipelines of waits on the same
//! semaphore cost one slot instead of one per queue entry. Slots are shared
//! with the semaphore's wake list; the semaphore holds the slot (and through
//! it a weak scheduler reference), never the scheduler itself, which breaks
//! the scheduler↔semaphore reference cycle.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::scheduler::{Scheduler, TickReason};
use crate::signal::{SignalHandle, SignalTable};
use crate::support::{MemoryScope, ScopedAtomic};

/// Number of wake slots per scheduler. The set of unique semaphores a single
/// queue waits on at once is expected to stay far below this.
pub const WAKE_POOL_CAPACITY: usize = 64;

/// A target of a wake operation.
///
/// Held weakly: a wake racing scheduler teardown is dropped rather than kept
/// alive by the semaphore.
#[derive(Clone)]
pub struct WakeTarget {
    scheduler: Weak<Scheduler>,
}

impl WakeTarget {
    /// A target that wakes `scheduler`.
    pub fn new(scheduler: Weak<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Returns true if both targets wake the same scheduler.
    #[inline]
    pub fn same_as(&self, other: &WakeTarget) -> bool {
        Weak::ptr_eq(&self.scheduler, &other.scheduler)
    }

    /// Wakes the target by enqueuing a scheduler tick. The target may awake
    /// and process before this call returns.
    pub fn wake(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.enqueue_tick(TickReason::WorkAvailable, 0);
        }
    }
}

/// One wake-pool slot: membership record in a semaphore's wake list.
///
/// `minimum_value` and `last_value` are only mutated with the owning
/// semaphore's wake-list lock held while the slot is listed; the owner reads
/// them between ticks, hence atomics.
pub struct WakeSlot {
    /// Which semaphore this slot is reserved for; `None` when free.
    assigned: Mutex<Option<Arc<Semaphore>>>,
    /// Whether the slot is currently linked in the semaphore's wake list.
    in_list: AtomicBool,
    /// Minimum payload that must be reached to wake the target.
    minimum_value: AtomicU64,
    /// Payload last observed on a wake or registration.
    last_value: AtomicU64,
    /// Target to wake.
    target: WakeTarget,
}

impl WakeSlot {
    fn new(target: WakeTarget) -> Self {
        Self {
            assigned: Mutex::new(None),
            in_list: AtomicBool::new(false),
            minimum_value: AtomicU64::new(0),
            last_value: AtomicU64::new(0),
            target,
        }
    }

    /// Payload last observed for this slot's semaphore.
    #[inline]
    pub fn last_value(&self) -> u64 {
        self.last_value.load_scoped(Ordering::Acquire, MemoryScope::Device)
    }

    /// Minimum payload registered for this slot.
    #[inline]
    pub fn minimum_value(&self) -> u64 {
        self.minimum_value.load_scoped(Ordering::Acquire, MemoryScope::Device)
    }

    /// Whether the slot is currently linked in a wake list.
    #[inline]
    pub fn is_listed(&self) -> bool {
        self.in_list.load_scoped(Ordering::Acquire, MemoryScope::Device)
    }
}

/// Per-scheduler table of wake slots.
///
/// Thread-compatible: reserve/release are only called by the owning
/// scheduler's tick. Exhaustion is fatal to the scheduler (reported as a
/// resource-exhausted device loss), sized so that well-formed workloads
/// never approach it.
pub struct WakePool {
    slots: Vec<Arc<WakeSlot>>,
}

impl WakePool {
    /// Creates the pool with every slot routing to `target`.
    pub fn new(target: WakeTarget) -> Self {
        let slots = (0..WAKE_POOL_CAPACITY)
            .map(|_| Arc::new(WakeSlot::new(target.clone())))
            .collect();
        Self { slots }
    }

    /// Capacity in slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently assigned to a semaphore.
    pub fn assigned(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.assigned.lock().is_some())
            .count()
    }

    /// Reserves (or finds) the slot for `semaphore`.
    ///
    /// If the pair is already tracked the existing slot is returned so the
    /// caller's `update_wait` can merge the minimum value. Returns `None`
    /// when the pool is exhausted.
    pub fn reserve(&self, semaphore: &Arc<Semaphore>) -> Option<Arc<WakeSlot>> {
        let mut first_free: Option<&Arc<WakeSlot>> = None;
        for slot in &self.slots {
            let assigned = slot.assigned.lock();
            match assigned.as_ref() {
                Some(existing) if Arc::ptr_eq(existing, semaphore) => {
                    return Some(Arc::clone(slot));
                }
                Some(_) => {}
                None => {
                    if first_free.is_none() {
                        first_free = Some(slot);
                    }
                }
            }
        }
        let slot = first_free?;
        *slot.assigned.lock() = Some(Arc::clone(semaphore));
        Some(Arc::clone(slot))
    }

    /// Releases a slot that turned out not to be needed.
    ///
    /// A slot still linked in a wake list stays assigned: it is tracking an
    /// earlier registration for the same pair and freeing it would strand
    /// the list entry.
    pub fn release(&self, slot: &Arc<WakeSlot>) {
        if slot.is_listed() {
            return;
        }
        *slot.assigned.lock() = None;
    }
}

/// A deduplicating set of wake targets accumulated over one scheduler tick.
///
/// Thread-compatible; owned and exclusively managed by the scheduler that is
/// performing the wakes. Self-wakes are tracked separately since there is no
/// need to post to self.
pub struct WakeSet {
    self_target: Option<WakeTarget>,
    self_wake: u32,
    targets: Vec<WakeTarget>,
}

impl WakeSet {
    /// Creates a set owned by `self_target`.
    pub fn new(self_target: WakeTarget) -> Self {
        Self {
            self_target: Some(self_target),
            self_wake: 0,
            targets: Vec::new(),
        }
    }

    /// Creates a detached set with no owner; every inserted target is woken
    /// on flush. Used by producers advancing a semaphore outside any tick.
    pub fn detached() -> Self {
        Self {
            self_target: None,
            self_wake: 0,
            targets: Vec::new(),
        }
    }

    /// Inserts a wake target, deduplicating against already-recorded ones.
    pub fn insert(&mut self, target: WakeTarget) {
        if let Some(self_target) = &self.self_target {
            if self_target.same_as(&target) {
                self.self_wake += 1;
                return;
            }
        }
        if self.targets.iter().any(|existing| existing.same_as(&target)) {
            return;
        }
        self.targets.push(target);
    }

    /// Wakes every recorded non-self target and clears the set. Returns true
    /// if the self target was requested to wake; the self target is not
    /// woken via posts.
    pub fn flush(&mut self) -> bool {
        for target in self.targets.drain(..) {
            target.wake();
        }
        let woke_self = self.self_wake > 0;
        self.self_wake = 0;
        woke_self
    }
}

//===----------------------------------------------------------------------===//
// Semaphore
//===----------------------------------------------------------------------===//

struct WakeListState {
    /// Last payload signaled; lets new registrations for already-reached
    /// values be dropped without list work.
    last_value: u64,
    /// Wake slots sorted ascending by `minimum_value`.
    list: Vec<Arc<WakeSlot>>,
}

/// A timeline semaphore with an intrusive list of targets to wake.
///
/// Thread-safe; may be signaled and waited from any agent concurrently. The
/// backing signal is stored outside the lock and may be signaled externally;
/// `last_value` only exists to make wake bookkeeping exact.
pub struct Semaphore {
    signal: SignalHandle,
    signals: Arc<SignalTable>,
    state: Mutex<WakeListState>,
}

/// A `(semaphore, payload)` pair; a wait requires the payload be reached, a
/// signal advances the semaphore to it.
#[derive(Clone)]
pub struct SemaphoreOp {
    /// The semaphore operated on.
    pub semaphore: Arc<Semaphore>,
    /// The payload waited for or signaled.
    pub payload: u64,
}

impl Semaphore {
    /// Creates a semaphore backed by a signal allocated from `signals`.
    pub fn new(signals: Arc<SignalTable>) -> Result<Arc<Self>, crate::signal::SignalError> {
        let signal = signals.allocate(crate::signal::SignalKind::User)?;
        Ok(Arc::new(Self {
            signal,
            signals,
            state: Mutex::new(WakeListState {
                last_value: 0,
                list: Vec::new(),
            }),
        }))
    }

    /// Backing signal handle (used to identify the semaphore in host posts).
    #[inline]
    pub fn signal_handle(&self) -> SignalHandle {
        self.signal
    }

    /// Loads the current payload.
    #[inline]
    pub fn current(&self) -> u64 {
        self.signals
            .load(self.signal, Ordering::Acquire, MemoryScope::System) as u64
    }

    /// Number of wake-list entries currently registered.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().list.len()
    }

    fn insert_sorted(list: &mut Vec<Arc<WakeSlot>>, slot: Arc<WakeSlot>) {
        let minimum = slot.minimum_value.load(Ordering::Relaxed);
        let at = list.partition_point(|entry| entry.minimum_value.load(Ordering::Relaxed) <= minimum);
        list.insert(at, slot);
    }

    /// Polls the semaphore and registers `slot` to be woken at
    /// `minimum_value`.
    ///
    /// Returns true if the slot was (or already is) enrolled, meaning the
    /// owner will be woken when the value is reached. Returns false when the
    /// value is already satisfied; the slot was not enrolled and the caller
    /// may treat the wait as resolved (and release the slot if it is not
    /// tracking an earlier registration).
    ///
    /// Re-registering an enrolled slot with a smaller value moves it earlier
    /// in the list; with a larger or equal value the existing registration
    /// already covers it.
    pub fn update_wait(self: &Arc<Self>, slot: &Arc<WakeSlot>, minimum_value: u64) -> bool {
        let mut state = self.state.lock();

        // Latest payload may change right after this load; taking it under
        // the lock orders it against concurrent signals so the cached value
        // never goes backwards relative to list membership.
        let latest = self
            .signals
            .load(self.signal, Ordering::Acquire, MemoryScope::System) as u64;
        state.last_value = state.last_value.max(latest);
        slot.last_value
            .store_scoped(state.last_value, Ordering::Release, MemoryScope::Device);

        if state.last_value >= minimum_value {
            // Already satisfied; never enroll. The slot may remain listed
            // for an earlier registration at a higher minimum.
            return false;
        }

        if slot.is_listed() {
            let current_minimum = slot.minimum_value.load(Ordering::Relaxed);
            if current_minimum > minimum_value {
                // Need to be woken earlier: pull the slot out and reinsert
                // at the new position.
                let position = state
                    .list
                    .iter()
                    .position(|entry| Arc::ptr_eq(entry, slot))
                    .expect("listed slot missing from wake list");
                let slot = state.list.remove(position);
                slot.minimum_value.store(minimum_value, Ordering::Relaxed);
                Self::insert_sorted(&mut state.list, slot);
            }
            return true;
        }

        slot.minimum_value.store(minimum_value, Ordering::Relaxed);
        slot.in_list
            .store_scoped(true, Ordering::Release, MemoryScope::Device);
        Self::insert_sorted(&mut state.list, Arc::clone(slot));
        true
    }

    /// Advances the semaphore payload and records every satisfied waiter's
    /// target in `wake_set`.
    ///
    /// The payload store happens before the list walk so an external
    /// observer polling the signal cannot see the wake before the value.
    pub fn signal(&self, new_value: u64, wake_set: &mut WakeSet) {
        self.signals.store(
            self.signal,
            new_value as i64,
            Ordering::Release,
            MemoryScope::System,
        );

        let mut state = self.state.lock();
        state.last_value = new_value;

        // The list is sorted ascending so satisfied entries form a prefix.
        let satisfied = state
            .list
            .partition_point(|slot| slot.minimum_value.load(Ordering::Relaxed) <= new_value);
        for slot in state.list.drain(..satisfied) {
            slot.last_value
                .store_scoped(new_value, Ordering::Release, MemoryScope::Device);
            slot.in_list
                .store_scoped(false, Ordering::Release, MemoryScope::Device);
            // Slot leaves the wake list; the owning pool frees it on its
            // next reserve/release pass.
            *slot.assigned.lock() = None;
            wake_set.insert(slot.target.clone());
        }
    }

    /// Convenience for producers outside any scheduler tick: advances the
    /// payload and immediately wakes every satisfied waiter.
    pub fn advance(&self, new_value: u64) {
        let mut wake_set = WakeSet::detached();
        self.signal(new_value, &mut wake_set);
        wake_set.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_semaphore() -> Arc<Semaphore> {
        let signals = Arc::new(SignalTable::with_capacity(8));
        Semaphore::new(signals).unwrap()
    }

    fn detached_pool() -> WakePool {
        WakePool::new(WakeTarget::new(Weak::new()))
    }

    #[test]
    fn test_update_wait_satisfied_skips_enrollment() {
        let semaphore = make_semaphore();
        let pool = detached_pool();
        semaphore.advance(5);

        let slot = pool.reserve(&semaphore).unwrap();
        assert!(!semaphore.update_wait(&slot, 5));
        assert_eq!(slot.last_value(), 5);
        assert_eq!(semaphore.waiter_count(), 0);
        pool.release(&slot);
        assert_eq!(pool.assigned(), 0);
    }

    #[test]
    fn test_update_wait_enrolls_until_signaled() {
        let semaphore = make_semaphore();
        let pool = detached_pool();

        let slot = pool.reserve(&semaphore).unwrap();
        assert!(semaphore.update_wait(&slot, 10));
        assert!(slot.is_listed());
        assert_eq!(semaphore.waiter_count(), 1);

        let mut wake_set = WakeSet::detached();
        semaphore.signal(10, &mut wake_set);
        assert!(!slot.is_listed());
        assert_eq!(slot.last_value(), 10);
        assert_eq!(semaphore.waiter_count(), 0);
        assert_eq!(pool.assigned(), 0);
    }

    #[test]
    fn test_signal_wakes_only_satisfied() {
        let semaphore = make_semaphore();
        let pool = detached_pool();

        let slot = pool.reserve(&semaphore).unwrap();
        assert!(semaphore.update_wait(&slot, 10));

        let mut wake_set = WakeSet::detached();
        semaphore.signal(7, &mut wake_set);
        assert!(slot.is_listed());
        assert_eq!(semaphore.waiter_count(), 1);

        semaphore.signal(12, &mut wake_set);
        assert!(!slot.is_listed());
    }

    #[test]
    fn test_pool_merges_per_semaphore() {
        let semaphore = make_semaphore();
        let pool = detached_pool();

        let first = pool.reserve(&semaphore).unwrap();
        assert!(semaphore.update_wait(&first, 10));

        // Second wait on the same semaphore reuses the slot; a smaller
        // minimum moves the registration earlier.
        let second = pool.reserve(&semaphore).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(semaphore.update_wait(&second, 4));
        assert_eq!(second.minimum_value(), 4);
        assert_eq!(semaphore.waiter_count(), 1);
        assert_eq!(pool.assigned(), 1);
    }

    #[test]
    fn test_release_keeps_listed_slot_assigned() {
        let semaphore = make_semaphore();
        let pool = detached_pool();

        let slot = pool.reserve(&semaphore).unwrap();
        assert!(semaphore.update_wait(&slot, 10));

        // A later wait for an already-reached value must not free the slot
        // that still tracks the earlier registration.
        semaphore.advance(0); // no-op payload, slot still listed at 10
        pool.release(&slot);
        assert_eq!(pool.assigned(), 1);
        assert!(slot.is_listed());
    }

    #[test]
    fn test_pool_exhaustion() {
        let signals = Arc::new(SignalTable::with_capacity(WAKE_POOL_CAPACITY as u32 + 8));
        let pool = detached_pool();
        let mut semaphores = Vec::new();
        for _ in 0..WAKE_POOL_CAPACITY {
            let semaphore = Semaphore::new(Arc::clone(&signals)).unwrap();
            let slot = pool.reserve(&semaphore).unwrap();
            assert!(semaphore.update_wait(&slot, 1));
            semaphores.push(semaphore);
        }
        let one_more = Semaphore::new(Arc::clone(&signals)).unwrap();
        assert!(pool.reserve(&one_more).is_none());
    }

    #[test]
    fn test_wake_set_dedup() {
        let mut wake_set = WakeSet::detached();
        let target = WakeTarget::new(Weak::new());
        wake_set.insert(target.clone());
        wake_set.insert(target.clone());
        assert_eq!(wake_set.targets.len(), 1);
        assert!(!wake_set.flush());
    }
}
