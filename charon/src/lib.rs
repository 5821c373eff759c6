//! # Charon
//!
//! Device-resident queue scheduler and command-buffer processor for an
//! HSA-style AQL agent.
//!
//! Charon drives an asynchronous stream of queue operations (allocate,
//! deallocate, fill, copy, execute command buffer, barrier), submitted from
//! the host or from peer devices via a software mailbox, to completion on a
//! hardware compute queue, honoring timeline-semaphore dependencies, without
//! the host in the critical dispatch path.
//!
//! ## Architecture
//!
//! ```text
//! producers ──► mailbox ──► scheduler tick ──► run list ──► issue_*
//!                   ▲            │                             │
//!                   │            ▼                             ▼
//!             semaphore      wait list                  execution queue
//!               wakes     (wake-pool slots)            (AQL packet ring)
//!                                                              │
//!              host ◄── post channel ◄── trace/errors ◄────────┘
//! ```
//!
//! - [`scheduler`]: the tick state machine that drains incoming work,
//!   resolves waits, and issues ready entries in submission order.
//! - [`command_buffer`]: immutable recorded blocks and the parallel issuer
//!   that translates them into AQL packets, including the two-packet
//!   indirect-dispatch fixup.
//! - [`queue`]: bit-exact AQL packet formats and the reserve/publish/
//!   doorbell ring protocol (INVALID headers gate the packet processor).
//! - [`signal`], [`signal_pool`]: HSA-style decrement-to-zero signals,
//!   host-allocated and pooled for device use.
//! - [`semaphore`]: timeline semaphores with direct scheduler wakes.
//! - [`trace`]: the variable-length event ring correlating device timing
//!   with host-observable zones.
//! - [`host`]: the device→host agent-dispatch post channel.
//!
//! The crate models the device runtime on the host: "blocking" is always a
//! bounded spin-yield on a memory location, every atomic site names its
//! memory order and scope, and nothing here suspends.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod buffer;
pub mod command_buffer;
pub mod host;
pub mod kernels;
pub mod queue;
pub mod scheduler;
pub mod semaphore;
pub mod signal;
pub mod signal_pool;
pub mod support;
pub mod trace;

pub use buffer::{AllocationHandle, BufferRef, DeviceAllocator};
pub use command_buffer::{Command, CommandBlock, CommandBuffer, ExecutionFlags};
pub use host::{HostCall, HostChannel};
pub use queue::{AqlPacket, AqlQueue, PacketType, QueueType};
pub use scheduler::{QueueEntry, QueueOp, Scheduler, SchedulerOptions, TickReason};
pub use semaphore::Semaphore;
pub use signal::{SignalHandle, SignalTable};
