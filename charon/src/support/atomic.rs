//! Memory-order/scope wrappers over the std atomics.
//!
//! Every atomic site in the runtime names both a memory order and a memory
//! scope. The scope describes the visibility radius the operation needs on
//! the agent (work-item, work-group, device, or all SVM devices); the host
//! build executes all scopes identically but keeping the parameter at every
//! call site makes the cross-agent operations auditable and lets a device
//! build lower them to the narrowest fence that suffices. Call sites must
//! never rely on a default scope.

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Visibility radius of an atomic operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryScope {
    /// Visible to the issuing work-item only.
    WorkItem,
    /// Visible across the work-group.
    WorkGroup,
    /// Visible to all queues on the same agent.
    Device,
    /// Visible to every agent sharing the SVM address space (host included).
    System,
}

/// Atomic operations that carry an explicit memory scope.
///
/// Mirrors the `atomic_*_explicit(order, scope)` call shape of the device
/// libraries so ports in either direction are mechanical.
pub trait ScopedAtomic {
    /// The value type of the atomic.
    type Value: Copy;

    /// Atomic load.
    fn load_scoped(&self, order: Ordering, scope: MemoryScope) -> Self::Value;
    /// Atomic store.
    fn store_scoped(&self, value: Self::Value, order: Ordering, scope: MemoryScope);
    /// Atomic exchange, returning the prior value.
    fn swap_scoped(&self, value: Self::Value, order: Ordering, scope: MemoryScope) -> Self::Value;
    /// Atomic compare-exchange, returning `Ok(prior)` on success.
    fn compare_exchange_scoped(
        &self,
        current: Self::Value,
        new: Self::Value,
        success: Ordering,
        failure: Ordering,
        scope: MemoryScope,
    ) -> Result<Self::Value, Self::Value>;
}

/// Arithmetic extensions of [`ScopedAtomic`] for integer atomics.
pub trait ScopedAtomicArith: ScopedAtomic {
    /// Atomic add, returning the prior value.
    fn fetch_add_scoped(
        &self,
        value: Self::Value,
        order: Ordering,
        scope: MemoryScope,
    ) -> Self::Value;
    /// Atomic subtract, returning the prior value.
    fn fetch_sub_scoped(
        &self,
        value: Self::Value,
        order: Ordering,
        scope: MemoryScope,
    ) -> Self::Value;
}

macro_rules! impl_scoped_atomic {
    ($atomic:ty, $value:ty) => {
        impl ScopedAtomic for $atomic {
            type Value = $value;

            #[inline]
            fn load_scoped(&self, order: Ordering, _scope: MemoryScope) -> $value {
                self.load(order)
            }

            #[inline]
            fn store_scoped(&self, value: $value, order: Ordering, _scope: MemoryScope) {
                self.store(value, order)
            }

            #[inline]
            fn swap_scoped(&self, value: $value, order: Ordering, _scope: MemoryScope) -> $value {
                self.swap(value, order)
            }

            #[inline]
            fn compare_exchange_scoped(
                &self,
                current: $value,
                new: $value,
                success: Ordering,
                failure: Ordering,
                _scope: MemoryScope,
            ) -> Result<$value, $value> {
                self.compare_exchange(current, new, success, failure)
            }
        }
    };
}

macro_rules! impl_scoped_atomic_arith {
    ($atomic:ty, $value:ty) => {
        impl ScopedAtomicArith for $atomic {
            #[inline]
            fn fetch_add_scoped(
                &self,
                value: $value,
                order: Ordering,
                _scope: MemoryScope,
            ) -> $value {
                self.fetch_add(value, order)
            }

            #[inline]
            fn fetch_sub_scoped(
                &self,
                value: $value,
                order: Ordering,
                _scope: MemoryScope,
            ) -> $value {
                self.fetch_sub(value, order)
            }
        }
    };
}

impl_scoped_atomic!(AtomicBool, bool);
impl_scoped_atomic!(AtomicU8, u8);
impl_scoped_atomic!(AtomicU32, u32);
impl_scoped_atomic!(AtomicU64, u64);
impl_scoped_atomic!(AtomicI64, i64);

impl_scoped_atomic_arith!(AtomicU8, u8);
impl_scoped_atomic_arith!(AtomicU32, u32);
impl_scoped_atomic_arith!(AtomicU64, u64);
impl_scoped_atomic_arith!(AtomicI64, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_ops() {
        let v = AtomicU64::new(5);
        assert_eq!(v.load_scoped(Ordering::Acquire, MemoryScope::Device), 5);
        assert_eq!(
            v.fetch_add_scoped(3, Ordering::Relaxed, MemoryScope::Device),
            5
        );
        assert_eq!(
            v.swap_scoped(0, Ordering::AcqRel, MemoryScope::System),
            8
        );
        assert!(v
            .compare_exchange_scoped(0, 7, Ordering::AcqRel, Ordering::Acquire, MemoryScope::Device)
            .is_ok());
        assert_eq!(v.load_scoped(Ordering::Relaxed, MemoryScope::WorkItem), 7);
    }
}
