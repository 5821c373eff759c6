//! Low-level primitives shared by every subsystem: scoped atomics, the
//! spin-yield pacing hint, and the agent-domain timestamp counter.

pub mod atomic;
pub mod time;

pub use atomic::{MemoryScope, ScopedAtomic, ScopedAtomicArith};
pub use time::timestamp;

/// Short-duration pacing hint used inside spin loops.
///
/// Device code never suspends; all "blocking" is a bounded spin on a memory
/// location. This hint exists to stop the spin from hammering the cache line,
/// not to deschedule the caller.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}
