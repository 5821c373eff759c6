//! Device→host post channel.
//!
//! A unidirectional soft queue of agent-dispatch packets the host thread
//! consumes. Posts carry the conservative SYSTEM/SYSTEM fence scopes so the
//! host observes any prior device writes (including ones made by other
//! agents during multi-device work), and the barrier bit so posts execute
//! back-to-back; a post type that tolerates out-of-order handling may relax
//! that on the host side.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use crate::queue::{make_header, AgentDispatchPacket, AqlQueue, FenceScope, PacketType};
use crate::signal::SignalHandle;
use crate::support::{yield_now, MemoryScope};

/// Agent-dispatch discriminators understood by the host runtime thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum HostCall {
    /// Grow a device pool; args `(pool, block, allocation_size,
    /// allocation_offset | min_alignment << 32)`, return address names the
    /// allocation handle, completion signaled when the pool has grown.
    PoolGrow = 0,
    /// Trim a device pool; advisory, completion signaled when done.
    PoolTrim = 1,
    /// Release up to four retained host resources; completion optional.
    PostRelease = 2,
    /// Mark the device lost with `(code, arg0, arg1)`; no completion. The
    /// device stops making progress after posting this.
    PostError = 3,
    /// Notify listeners that a semaphore reached a payload. Ordering is not
    /// guaranteed; the host must tolerate stale notifications.
    PostSignal = 4,
    /// Flush committed trace events for a trace buffer; completion optional.
    PostTraceFlush = 5,
}

impl HostCall {
    /// Decodes the packet `type` field.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(HostCall::PoolGrow),
            1 => Some(HostCall::PoolTrim),
            2 => Some(HostCall::PostRelease),
            3 => Some(HostCall::PostError),
            4 => Some(HostCall::PostSignal),
            5 => Some(HostCall::PostTraceFlush),
            _ => None,
        }
    }
}

/// Error codes carried by [`HostCall::PostError`].
pub mod error_code {
    /// A fixed device resource (signal pool, wake pool, table) ran out.
    /// arg0 is the resource kind, arg1 its capacity.
    pub const EXHAUSTED: u64 = 1;
    /// The issuer hit a recorder violation (unknown command type, bad block
    /// ordinal, binding slot out of range). arg0/arg1 identify the site.
    pub const MALFORMED: u64 = 2;
}

/// The host runtime thread's receive queue, shared by any number of
/// schedulers posting to it.
#[derive(Clone)]
pub struct HostChannel {
    queue: Arc<AqlQueue>,
}

impl HostChannel {
    /// Wraps the soft queue the host thread consumes.
    pub fn new(queue: Arc<AqlQueue>) -> Self {
        Self { queue }
    }

    /// The underlying soft queue (host/processor side).
    #[inline]
    pub fn queue(&self) -> &Arc<AqlQueue> {
        &self.queue
    }

    /// Posts one agent-dispatch packet.
    ///
    /// Reserves a slot, spins while the host lags a full ring behind,
    /// populates the payload, publishes the header with release order at
    /// system scope, and rings the host doorbell.
    pub fn post(
        &self,
        call: HostCall,
        return_address: u64,
        args: [u64; 4],
        completion_signal: SignalHandle,
    ) {
        let packet_id = self.queue.add_write_index(1, Ordering::Relaxed);
        while packet_id - self.queue.load_read_index(Ordering::Acquire)
            >= self.queue.size() as u64
        {
            yield_now(); // spinning on host queue capacity
        }

        let packet = AgentDispatchPacket {
            ty: call as u16,
            return_address,
            args,
            completion_signal,
        };
        let slot = self.queue.slot(packet_id);
        slot.write_body(&packet.encode());

        // Barrier bit set: posts execute back-to-back on the host thread.
        // SYSTEM scopes so resources touched by any agent are visible.
        slot.publish(
            make_header(
                PacketType::AgentDispatch,
                true,
                FenceScope::System,
                FenceScope::System,
            ),
            call as u16,
            MemoryScope::System,
        );

        // The doorbell store wakes the host (hardware interrupt via the
        // signal's event mailbox); the store act itself is the wake event.
        self.queue.ring_doorbell(packet_id);
    }

    /// Posts a multi-resource release. The host releases each non-zero
    /// resource handle; `completion_signal` (optional) fires when done.
    pub fn post_release(&self, resources: [u64; 4], completion_signal: SignalHandle) {
        self.post(HostCall::PostRelease, 0, resources, completion_signal);
    }

    /// Posts an error code. After this the device is considered lost and no
    /// further progress is made.
    pub fn post_error(&self, code: u64, arg0: u64, arg1: u64) {
        self.post(
            HostCall::PostError,
            0,
            [0, code, arg0, arg1],
            SignalHandle::NULL,
        );
    }

    /// Posts a semaphore payload notification. By the time the host
    /// processes it the semaphore may have advanced further.
    pub fn post_signal(&self, semaphore: u64, payload: u64) {
        self.post(HostCall::PostSignal, 0, [semaphore, payload, 0, 0], SignalHandle::NULL);
    }

    /// Posts a trace flush request for `trace_buffer` (an identifier the
    /// host maps back to the buffer). The host drains up to the committed
    /// write offset, possibly further if commits landed since.
    pub fn post_trace_flush(&self, trace_buffer: u64, completion_signal: SignalHandle) {
        self.post(
            HostCall::PostTraceFlush,
            0,
            [trace_buffer, 0, 0, 0],
            completion_signal,
        );
    }
}
