//! Agent-domain steady timestamp counter.
//!
//! Timestamps are in agent-specific ticks (nanoseconds on the host build) and
//! are only meaningful relative to each other. The host translates them into
//! its own time domain by scaling with the agent's tick frequency; nothing in
//! the device runtime compares them across agents.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Returns the current agent timestamp in ticks.
///
/// Monotonically non-decreasing within the agent domain.
#[inline]
pub fn timestamp() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_monotonic() {
        let a = timestamp();
        let b = timestamp();
        assert!(b >= a);
    }
}
