//! The device-resident queue scheduler.
//!
//! A scheduler drives one logical queue of operations to completion on a
//! hardware execution queue without the host in the dispatch path. Producers
//! (host or peer devices) push [`QueueEntry`]s into the mailbox and enqueue a
//! tick; the tick kernel drains the mailbox, parks entries whose semaphore
//! waits are unsatisfied, and issues everything that can run, in submission
//! (epoch) order.
//!
//! The tick runs as a single-work-item kernel and at most one tick per
//! scheduler is in flight: the `pending` flag coalesces bursts of wake
//! requests into one tick and is cleared first thing inside the tick so a
//! wake arriving mid-tick re-arms the next one. A tick that discovers it has
//! more work to do re-enqueues itself through the scheduler queue rather
//! than looping inline, which keeps the hardware queue breathing and makes
//! stalls observable.
//!
//! Failure policy: exhaustion of any fixed table (signal pool, wake pool,
//! return queue) and recorder violations detected at issue are fatal. The
//! first error posts to the host and latches the device-lost flag; every
//! later tick no-ops.

mod entry;

pub use entry::{EntryList, QueueEntry, QueueEntryFlags, QueueOp};

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use spin::Mutex;
use thiserror::Error;

use crate::buffer::{AllocaOutcome, DeviceAllocator};
use crate::command_buffer::{issue, ExecutionState};
use crate::host::{error_code, HostCall, HostChannel};
use crate::kernels::{KernargArena, Kernels, CONTROL_KERNARG_SIZE};
use crate::queue::{make_header, AqlQueue, FenceScope, KernelDispatchPacket, PacketType};
use crate::semaphore::{SemaphoreOp, WakePool, WakeSet, WakeTarget};
use crate::signal::{SignalHandle, SignalTable};
use crate::signal_pool::SignalPool;
use crate::support::{MemoryScope, ScopedAtomic};
use crate::trace::TraceBuffer;

/// Why a scheduler tick was enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TickReason {
    /// New work may be available (submission, semaphore wake, self-requeue).
    /// By the time the tick runs the work may already be gone; spurious
    /// ticks are harmless.
    WorkAvailable = 0,
    /// A command buffer execution reached its return; the argument is the
    /// execution id to retire.
    CommandBufferReturn = 1,
}

impl TickReason {
    /// Decodes a kernarg-encoded reason.
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(TickReason::WorkAvailable),
            1 => Some(TickReason::CommandBufferReturn),
            _ => None,
        }
    }
}

/// Resource kinds reported with EXHAUSTED errors.
pub mod resource_kind {
    /// The transient signal pool.
    pub const SIGNAL_POOL: u64 = 0;
    /// The semaphore wake pool.
    pub const WAKE_POOL: u64 = 1;
    /// The command-buffer return queue.
    pub const RETURN_QUEUE: u64 = 2;
}

/// Errors surfaced to producers at the submission boundary.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The mailbox is full; the producer may retry after a tick drains it.
    #[error("scheduler mailbox full ({capacity} entries)")]
    MailboxFull {
        /// Mailbox capacity.
        capacity: usize,
    },
    /// The device was declared lost; all submissions fail fast.
    #[error("device lost")]
    DeviceLost,
}

/// Construction parameters for a scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Scheduler id, also the trace executor id.
    pub id: u32,
    /// Mailbox capacity in entries (power of two).
    pub mailbox_capacity: u32,
    /// Signal pool capacity (power of two); seeded by INITIALIZE.
    pub signal_pool_capacity: u32,
    /// Trace ring capacity in bytes (power of two).
    pub trace_capacity: u32,
    /// Trace query ring capacity in signals (power of two).
    pub trace_query_capacity: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            id: 0,
            mailbox_capacity: 256,
            signal_pool_capacity: 64,
            trace_capacity: 64 * 1024,
            trace_query_capacity: 256,
        }
    }
}

/// Per-tick mutable state, touched only with the tick lock held.
struct TickState {
    /// Entries blocked on at least one unsatisfied semaphore wait.
    wait_list: EntryList,
    /// Entries ready to issue, in epoch order. Always drained before the
    /// tick exits.
    run_list: EntryList,
    /// Alloca/dealloca entries parked on a host round trip.
    host_list: EntryList,
    /// Registered semaphore waits for this scheduler.
    wake_pool: WakePool,
    /// Wake targets accumulated while issuing.
    wake_set: WakeSet,
    /// Next submission epoch.
    next_epoch: u32,
}

struct ExecutionRecord {
    state: Arc<ExecutionState>,
    /// Semaphores advanced when the execution retires.
    signals: Vec<SemaphoreOp>,
}

/// The queue scheduler.
///
/// Shared by reference with producers (mailbox side) and the packet
/// processor (tick side); all mutable state is interior.
pub struct Scheduler {
    id: u32,
    signals: Arc<SignalTable>,
    host: HostChannel,
    scheduler_queue: Arc<AqlQueue>,
    execution_queue: Arc<AqlQueue>,
    allocator: Arc<dyn DeviceAllocator>,
    kernels: Kernels,
    signal_pool: SignalPool,
    trace: Arc<TraceBuffer>,
    mailbox: ArrayQueue<Box<QueueEntry>>,
    /// Execution ids whose return barrier has been issued; drained at tick.
    returns: ArrayQueue<u64>,
    /// Coalesces tick requests; cleared first thing inside the tick.
    pending: AtomicBool,
    /// Latched on the first fatal error; ticks no-op afterwards.
    lost: AtomicBool,
    /// Set by INITIALIZE, cleared by DEINITIALIZE.
    active: AtomicBool,
    next_execution_id: AtomicU64,
    /// Kernargs for the tick control packet; one tick packet is pending at
    /// a time so a single arena is reused.
    control_kernargs: KernargArena,
    state: Mutex<TickState>,
    executions: Mutex<BTreeMap<u64, ExecutionRecord>>,
    /// Kernarg arenas of in-flight queue-level fill/copy dispatches; kept
    /// until deinitialize so packet consumers never read freed arguments.
    transfer_kernargs: Mutex<Vec<KernargArena>>,
}

impl Scheduler {
    /// Creates a scheduler bound to its queues and host channel.
    pub fn new(
        options: SchedulerOptions,
        signals: Arc<SignalTable>,
        host: HostChannel,
        scheduler_queue: Arc<AqlQueue>,
        execution_queue: Arc<AqlQueue>,
        allocator: Arc<dyn DeviceAllocator>,
        kernels: Kernels,
    ) -> Result<Arc<Self>, crate::signal::SignalError> {
        let trace = TraceBuffer::new(
            options.id,
            options.trace_capacity,
            options.trace_query_capacity,
            Arc::clone(&signals),
        )?;
        let scheduler = Arc::new_cyclic(|weak| {
            let target = WakeTarget::new(weak.clone());
            Self {
                id: options.id,
                signals,
                host,
                scheduler_queue,
                execution_queue,
                allocator,
                kernels,
                signal_pool: SignalPool::with_capacity(options.signal_pool_capacity),
                trace,
                mailbox: ArrayQueue::new(options.mailbox_capacity as usize),
                returns: ArrayQueue::new(options.mailbox_capacity as usize),
                pending: AtomicBool::new(false),
                lost: AtomicBool::new(false),
                active: AtomicBool::new(false),
                next_execution_id: AtomicU64::new(1),
                control_kernargs: KernargArena::with_size(CONTROL_KERNARG_SIZE),
                state: Mutex::new(TickState {
                    wait_list: EntryList::new(),
                    run_list: EntryList::new(),
                    host_list: EntryList::new(),
                    wake_pool: WakePool::new(target.clone()),
                    wake_set: WakeSet::new(target),
                    next_epoch: 0,
                }),
                executions: Mutex::new(BTreeMap::new()),
                transfer_kernargs: Mutex::new(Vec::new()),
            }
        });
        log::debug!("scheduler {} created", options.id);
        Ok(scheduler)
    }

    /// Scheduler id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The scheduler's trace buffer.
    #[inline]
    pub fn trace(&self) -> &Arc<TraceBuffer> {
        &self.trace
    }

    /// The queue tick packets are enqueued on.
    #[inline]
    pub fn scheduler_queue(&self) -> &Arc<AqlQueue> {
        &self.scheduler_queue
    }

    /// The queue execution packets are emplaced on.
    #[inline]
    pub fn execution_queue(&self) -> &Arc<AqlQueue> {
        &self.execution_queue
    }

    /// The signal table shared with the host.
    #[inline]
    pub fn signals(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    /// The transient signal pool.
    #[inline]
    pub fn signal_pool(&self) -> &SignalPool {
        &self.signal_pool
    }

    /// True once a fatal error latched the device-lost state.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load_scoped(Ordering::Acquire, MemoryScope::System)
    }

    /// True while a tick is pending on the scheduler queue.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load_scoped(Ordering::Acquire, MemoryScope::Device)
    }

    /// True between INITIALIZE and DEINITIALIZE.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load_scoped(Ordering::Acquire, MemoryScope::Device)
    }

    /// Entries currently parked on unsatisfied waits.
    pub fn wait_list_len(&self) -> usize {
        self.state.lock().wait_list.len()
    }

    /// Entries currently ready to run (nonzero only mid-tick).
    pub fn run_list_len(&self) -> usize {
        self.state.lock().run_list.len()
    }

    /// In-flight command buffer executions.
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    //===------------------------------------------------------------------===//
    // Producer side
    //===------------------------------------------------------------------===//

    /// Submits a queue entry and enqueues a tick.
    pub fn enqueue(self: &Arc<Self>, entry: QueueEntry) -> Result<(), SchedulerError> {
        if self.is_lost() {
            return Err(SchedulerError::DeviceLost);
        }
        self.mailbox
            .push(Box::new(entry))
            .map_err(|_| SchedulerError::MailboxFull {
                capacity: self.mailbox.capacity(),
            })?;
        self.enqueue_tick(TickReason::WorkAvailable, 0);
        Ok(())
    }

    /// Requests a tick. Requests are coalesced: if a tick packet is already
    /// pending the reason data is recorded (return ids go to the return
    /// queue) and no second packet is emplaced.
    pub fn enqueue_tick(self: &Arc<Self>, reason: TickReason, reason_arg: u64) {
        if self.is_lost() {
            return;
        }
        if reason == TickReason::CommandBufferReturn && self.returns.push(reason_arg).is_err() {
            self.post_fatal(
                error_code::EXHAUSTED,
                resource_kind::RETURN_QUEUE,
                self.returns.capacity() as u64,
            );
            return;
        }
        if self.pending.swap_scoped(true, Ordering::AcqRel, MemoryScope::Device) {
            return; // a pending tick will observe this work
        }

        // Emplace the tick control packet. The header is written last so
        // the packet processor stalls until the kernargs are in place.
        self.control_kernargs.write_u64(0, self.id as u64);
        self.control_kernargs.write_u64(8, reason as u64);
        self.control_kernargs.write_u64(16, reason_arg);
        let tick = self.kernels.scheduler_tick;
        let packet = KernelDispatchPacket {
            setup: tick.setup,
            workgroup_size: tick.workgroup_size,
            grid_size: [1, 1, 1],
            private_segment_size: tick.private_segment_size,
            group_segment_size: tick.group_segment_size,
            kernel_object: tick.kernel_object,
            kernarg_address: self.control_kernargs.address(0),
            completion_signal: SignalHandle::NULL,
        };
        let index = self.scheduler_queue.reserve(1);
        let slot = self.scheduler_queue.slot(index);
        slot.write_body(&packet.encode());
        slot.publish(
            make_header(PacketType::KernelDispatch, true, FenceScope::None, FenceScope::None),
            packet.setup,
            MemoryScope::Device,
        );
        self.scheduler_queue.ring_doorbell(index + 1);
    }

    //===------------------------------------------------------------------===//
    // The tick
    //===------------------------------------------------------------------===//

    /// One scheduler tick: the body of the single-work-item tick kernel.
    ///
    /// Safe to call spuriously; a tick with nothing to do emits no packets.
    pub fn tick(self: &Arc<Self>) {
        if self.is_lost() {
            return;
        }
        // Clear the pending flag before touching any work so a wake that
        // lands mid-tick re-arms the next tick instead of being lost.
        self.pending
            .store_scoped(false, Ordering::Release, MemoryScope::Device);

        let mut st = self.state.lock();
        let mut self_requeue = false;

        // Retire returned command buffer executions. A return whose
        // completion signal has not landed yet (its queue is still
        // executing) is deferred to the next tick.
        let mut deferred = Vec::new();
        while let Some(execution_id) = self.returns.pop() {
            if self.try_retire_execution(execution_id, &mut st) {
                self_requeue |= st.wake_set.flush();
            } else {
                deferred.push(execution_id);
            }
        }
        for execution_id in deferred {
            // Capacity cannot be exceeded: we only put back what we took.
            let _ = self.returns.push(execution_id);
            self_requeue = true;
        }

        // Accept all incoming entries, assigning submission epochs. Entries
        // with no waits go straight to the run list.
        while let Some(mut entry) = self.mailbox.pop() {
            entry.epoch = st.next_epoch;
            st.next_epoch = st.next_epoch.wrapping_add(1);
            log::trace!(
                "scheduler {}: accepted {} entry (epoch {})",
                self.id,
                entry.op.name(),
                entry.epoch
            );
            if entry.waits.is_empty() {
                st.run_list.insert_by_epoch(entry);
            } else {
                st.wait_list.push_back(entry);
            }
        }

        // Re-check the leading wait of every parked entry. A wait-all only
        // needs one unsatisfied wait to keep an entry parked, so the check
        // stops at the first wait that enrolls in a wake list.
        let parked = st.wait_list.take_all();
        for mut entry in parked {
            match self.resolve_waits(&mut entry, &mut st) {
                Some(true) => st.run_list.insert_by_epoch(entry),
                Some(false) => st.wait_list.push_back(entry),
                None => return, // fatal; device lost already latched
            }
        }

        // Re-check entries parked on a host allocation round trip.
        let host_parked = st.host_list.take_all();
        for entry in host_parked {
            let committed = match &entry.op {
                QueueOp::Alloca { handle, .. } => handle.load() != 0,
                _ => true,
            };
            if committed {
                self.retire_entry(&entry, &mut st);
                self_requeue |= st.wake_set.flush();
            } else {
                st.host_list.push_back(entry);
            }
        }

        // Drain the run list in epoch order. Wake targets accumulated by
        // each issue are flushed before the next so peers start while we
        // continue issuing.
        while let Some(entry) = st.run_list.pop_front() {
            self.issue_entry(entry, &mut st);
            if self.is_lost() {
                return;
            }
            self_requeue |= st.wake_set.flush();
        }

        // Publish any trace events emitted during the tick and ask the host
        // to drain them.
        if self.trace.commit_range() {
            self.host
                .post_trace_flush(self.id as u64, SignalHandle::NULL);
        }

        drop(st);

        // Re-enqueue through the scheduler queue rather than looping
        // inline, preserving fairness with execution packets.
        if self_requeue {
            self.enqueue_tick(TickReason::WorkAvailable, 0);
        }
    }

    /// Resolves the wait list of one entry. Returns `Some(true)` when every
    /// wait is satisfied, `Some(false)` when the entry must stay parked, or
    /// `None` on fatal wake-pool exhaustion.
    fn resolve_waits(self: &Arc<Self>, entry: &mut QueueEntry, st: &mut TickState) -> Option<bool> {
        while let Some(wait) = entry.waits.first().cloned() {
            let Some(slot) = st.wake_pool.reserve(&wait.semaphore) else {
                self.post_fatal(
                    error_code::EXHAUSTED,
                    resource_kind::WAKE_POOL,
                    st.wake_pool.capacity() as u64,
                );
                return None;
            };
            if wait.semaphore.update_wait(&slot, wait.payload) {
                // Enrolled (or already enrolled): this scheduler will be
                // woken when the payload lands. One blocked wait parks the
                // whole entry.
                return Some(false);
            }
            // Satisfied: drop the wake-pool slot unless it still tracks an
            // earlier registration, then retire the wait by swapping in the
            // last one.
            st.wake_pool.release(&slot);
            entry.waits.swap_remove(0);
        }
        Some(true)
    }

    //===------------------------------------------------------------------===//
    // Entry issue
    //===------------------------------------------------------------------===//

    fn issue_entry(self: &Arc<Self>, entry: Box<QueueEntry>, st: &mut TickState) {
        log::trace!(
            "scheduler {}: issuing {} entry (epoch {})",
            self.id,
            entry.op.name(),
            entry.epoch
        );
        match &entry.op {
            QueueOp::Initialize { signals } => {
                self.signal_pool.initialize(signals.iter().copied());
                self.active
                    .store_scoped(true, Ordering::Release, MemoryScope::Device);
                log::debug!(
                    "scheduler {}: initialized with {} pool signals",
                    self.id,
                    signals.len()
                );
                self.retire_entry(&entry, st);
            }
            QueueOp::Deinitialize => {
                self.active
                    .store_scoped(false, Ordering::Release, MemoryScope::Device);
                self.transfer_kernargs.lock().clear();
                self.retire_entry(&entry, st);
            }
            QueueOp::Alloca {
                pool,
                min_alignment,
                allocation_size,
                handle,
            } => match self
                .allocator
                .alloca(*pool, *allocation_size, *min_alignment, handle)
            {
                Ok(AllocaOutcome::Committed) => {
                    self.trace
                        .memory_alloc(*pool as u64, handle.load(), *allocation_size);
                    self.retire_entry(&entry, st);
                }
                Ok(AllocaOutcome::Grow {
                    pool,
                    allocation_size,
                    allocation_offset,
                    min_alignment,
                }) => {
                    // The host grows the pool and commits the handle; the
                    // entry parks until the commit is visible and the
                    // host's wake tick re-checks it.
                    self.host.post(
                        HostCall::PoolGrow,
                        Arc::as_ptr(handle) as u64,
                        [
                            pool as u64,
                            0,
                            allocation_size,
                            allocation_offset as u64 | ((min_alignment as u64) << 32),
                        ],
                        SignalHandle::NULL,
                    );
                    st.host_list.push_back(entry);
                }
                Ok(AllocaOutcome::Trim { .. }) => {
                    // An alloca can only commit or grow; a trim here is an
                    // allocator bug.
                    self.post_fatal(error_code::MALFORMED, *pool as u64, *allocation_size);
                }
                Err(error) => {
                    log::error!("scheduler {}: alloca failed: {error}", self.id);
                    self.post_fatal(error_code::EXHAUSTED, *pool as u64, *allocation_size);
                }
            },
            QueueOp::Dealloca { handle } => {
                let ptr = handle.load();
                match self.allocator.dealloca(handle) {
                    Ok(AllocaOutcome::Trim { pool }) => {
                        self.trace.memory_free(ptr);
                        self.host.post(
                            HostCall::PoolTrim,
                            0,
                            [pool as u64, 0, 0, 0],
                            SignalHandle::NULL,
                        );
                        self.retire_entry(&entry, st);
                    }
                    Ok(_) => {
                        self.trace.memory_free(ptr);
                        self.retire_entry(&entry, st);
                    }
                    Err(_) => {
                        self.post_fatal(error_code::MALFORMED, ptr, 0);
                    }
                }
            }
            QueueOp::Fill {
                target,
                pattern,
                pattern_length,
            } => {
                let resolved = match target.resolve(&[]) {
                    Ok(resolved) => resolved,
                    Err(_) => {
                        self.post_fatal(error_code::MALFORMED, entry.epoch as u64, 0);
                        return;
                    }
                };
                let kernargs = KernargArena::with_size(24);
                let index = self.execution_queue.reserve(1);
                let result = crate::buffer::emplace_fill(
                    &self.execution_queue,
                    index,
                    &self.kernels,
                    &kernargs,
                    0,
                    resolved.0,
                    resolved.1,
                    *pattern,
                    *pattern_length,
                    true,
                    FenceScope::Agent,
                    FenceScope::Agent,
                    SignalHandle::NULL,
                );
                self.execution_queue.ring_doorbell(index + 1);
                self.transfer_kernargs.lock().push(kernargs);
                match result {
                    Ok(()) => self.retire_entry(&entry, st),
                    Err(_) => {
                        self.post_fatal(error_code::MALFORMED, *pattern_length as u64, 0)
                    }
                }
            }
            QueueOp::Copy { source, target } => {
                let (source_addr, _) = match source.resolve(&[]) {
                    Ok(resolved) => resolved,
                    Err(_) => {
                        self.post_fatal(error_code::MALFORMED, entry.epoch as u64, 0);
                        return;
                    }
                };
                let (target_addr, length) = match target.resolve(&[]) {
                    Ok(resolved) => resolved,
                    Err(_) => {
                        self.post_fatal(error_code::MALFORMED, entry.epoch as u64, 1);
                        return;
                    }
                };
                let kernargs = KernargArena::with_size(24);
                let index = self.execution_queue.reserve(1);
                crate::buffer::emplace_copy(
                    &self.execution_queue,
                    index,
                    &self.kernels,
                    &kernargs,
                    0,
                    source_addr,
                    target_addr,
                    length,
                    true,
                    FenceScope::Agent,
                    FenceScope::Agent,
                    SignalHandle::NULL,
                );
                self.execution_queue.ring_doorbell(index + 1);
                self.transfer_kernargs.lock().push(kernargs);
                self.retire_entry(&entry, st);
            }
            QueueOp::Barrier => {
                // One no-op barrier packet orders everything before against
                // everything after on the execution queue.
                let index = self.execution_queue.reserve(1);
                let packet = crate::queue::BarrierPacket::default();
                let slot = self.execution_queue.slot(index);
                slot.write_body(&packet.encode());
                slot.publish(
                    make_header(PacketType::BarrierAnd, true, FenceScope::None, FenceScope::None),
                    0,
                    MemoryScope::Device,
                );
                self.execution_queue.ring_doorbell(index + 1);
                self.retire_entry(&entry, st);
            }
            QueueOp::Execute { .. } => {
                self.issue_execute(entry);
            }
        }
    }

    /// Builds the execution state for an EXECUTE entry and launches its
    /// entry block. The entry's signal semaphores advance when the
    /// execution's return retires, not at issue.
    fn issue_execute(self: &Arc<Self>, entry: Box<QueueEntry>) {
        let QueueEntry { signals, op, .. } = *entry;
        let QueueOp::Execute {
            command_buffer,
            flags,
            bindings,
            resources,
        } = op
        else {
            unreachable!("issue_execute called with a non-execute op");
        };

        let completion_signal = self.signal_pool.acquire(&self.signals, 1);
        if completion_signal.is_null() {
            self.post_fatal(
                error_code::EXHAUSTED,
                resource_kind::SIGNAL_POOL,
                self.signal_pool.capacity() as u64,
            );
            return;
        }
        let mut event_signals = Vec::with_capacity(command_buffer.event_capacity() as usize);
        for _ in 0..command_buffer.event_capacity() {
            // Events arm at 1; a signal-event packet decrements to 0.
            let signal = self.signal_pool.acquire(&self.signals, 1);
            if signal.is_null() {
                self.post_fatal(
                    error_code::EXHAUSTED,
                    resource_kind::SIGNAL_POOL,
                    self.signal_pool.capacity() as u64,
                );
                return;
            }
            event_signals.push(signal);
        }

        let execution_id = self
            .next_execution_id
            .fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ExecutionState {
            id: execution_id,
            flags,
            command_buffer: Arc::clone(&command_buffer),
            scheduler: Arc::downgrade(self),
            kernels: self.kernels,
            control_kernargs: KernargArena::with_size(CONTROL_KERNARG_SIZE),
            execution_kernargs: KernargArena::with_size(
                command_buffer.max_kernarg_capacity().max(8),
            ),
            execution_queue: Arc::clone(&self.execution_queue),
            trace: Arc::clone(&self.trace),
            trace_block_query_base_id: AtomicU64::new(0),
            queries_acquired: AtomicU64::new(0),
            bindings: bindings.into_boxed_slice(),
            completion_signal,
            event_signals: event_signals.into_boxed_slice(),
            resources,
        });
        self.executions.lock().insert(
            execution_id,
            ExecutionRecord {
                state: Arc::clone(&state),
                signals,
            },
        );
        log::debug!(
            "scheduler {}: execution {} launched ({} blocks)",
            self.id,
            execution_id,
            command_buffer.blocks().len()
        );
        self.enqueue_issue_block(&state, 0);
    }

    /// Reserves execution-queue space and query ids for one block, then
    /// enqueues the parallel issuer for it on the scheduler queue.
    ///
    /// Also used by branch issue as the tail-enqueue continuation; never
    /// recurses into the issuer inline.
    pub fn enqueue_issue_block(self: &Arc<Self>, state: &ExecutionState, block_ordinal: u32) {
        let Some(block) = state.command_buffer.blocks().get(block_ordinal as usize) else {
            self.post_fatal(error_code::MALFORMED, state.id, block_ordinal as u64);
            return;
        };

        // Reserve the block's whole packet span; the slots stay INVALID
        // (stalling the packet processor) until the issuer publishes them.
        let base_queue_index = self.execution_queue.reserve(block.max_packet_count() as u64);
        self.execution_queue
            .ring_doorbell(base_queue_index + block.max_packet_count() as u64);

        // Acquire the block's query range for the active tracing mode.
        let query_count = block.query_count(state.flags);
        if query_count > 0 {
            let base_id = self.trace.query_ring().acquire(query_count);
            state
                .trace_block_query_base_id
                .store(base_id, Ordering::Relaxed);
            state
                .queries_acquired
                .fetch_add(query_count as u64, Ordering::Relaxed);
        }

        // Issue-block control packet: kernargs are written before the
        // header swap publishes the packet. The owning scheduler id rides
        // along so a shared packet processor can route the kernel.
        state.control_kernargs.write_u64(0, state.id);
        state.control_kernargs.write_u64(8, block_ordinal as u64);
        state.control_kernargs.write_u64(16, base_queue_index);
        state.control_kernargs.write_u64(24, self.id as u64);
        let issue_kernel = self.kernels.issue_block;
        let packet = KernelDispatchPacket {
            setup: issue_kernel.setup,
            workgroup_size: issue_kernel.workgroup_size,
            // One work-item per command.
            grid_size: [block.commands().len() as u32, 1, 1],
            private_segment_size: issue_kernel.private_segment_size,
            group_segment_size: issue_kernel.group_segment_size,
            kernel_object: issue_kernel.kernel_object,
            kernarg_address: state.control_kernargs.address(0),
            completion_signal: SignalHandle::NULL,
        };
        let index = self.scheduler_queue.reserve(1);
        let slot = self.scheduler_queue.slot(index);
        slot.write_body(&packet.encode());
        // Barrier bit: blocks of one command buffer execute strictly in
        // sequence.
        slot.publish(
            make_header(PacketType::KernelDispatch, true, FenceScope::None, FenceScope::None),
            packet.setup,
            MemoryScope::Device,
        );
        self.scheduler_queue.ring_doorbell(index + 1);
    }

    /// Runs the block issuer for an execution (the body of the issue_block
    /// kernel). Recorder violations are fatal.
    pub fn issue_block_by_id(
        self: &Arc<Self>,
        execution_id: u64,
        block_ordinal: u32,
        base_queue_index: u64,
    ) {
        let state = {
            let executions = self.executions.lock();
            match executions.get(&execution_id) {
                Some(record) => Arc::clone(&record.state),
                None => {
                    self.post_fatal(error_code::MALFORMED, execution_id, block_ordinal as u64);
                    return;
                }
            }
        };
        if let Err(error) = issue::issue_block(&state, block_ordinal, base_queue_index) {
            log::error!(
                "scheduler {}: issue of block {} failed: {error}",
                self.id,
                block_ordinal
            );
            self.post_fatal(error_code::MALFORMED, execution_id, block_ordinal as u64);
        }
    }

    /// Attempts to retire a returned execution. Returns false when its
    /// completion signal has not reached zero yet.
    fn try_retire_execution(self: &Arc<Self>, execution_id: u64, st: &mut TickState) -> bool {
        let mut executions = self.executions.lock();
        let Some(record) = executions.get(&execution_id) else {
            return true; // already retired
        };
        if self.signals.load(
            record.state.completion_signal,
            Ordering::Acquire,
            MemoryScope::System,
        ) != 0
        {
            return false;
        }
        let record = executions.remove(&execution_id).expect("record just observed");
        drop(executions);

        // Release per-execution resources back to their pools.
        let queries = record.state.queries_acquired.load(Ordering::Relaxed);
        if queries > 0 {
            self.trace.query_ring().release(queries as u16);
        }
        self.signal_pool.release(record.state.completion_signal);
        for event_signal in record.state.event_signals.iter() {
            self.signal_pool.release(*event_signal);
        }

        // Advance the submission's signal semaphores and notify the host.
        for op in &record.signals {
            op.semaphore.signal(op.payload, &mut st.wake_set);
            self.host
                .post_signal(op.semaphore.signal_handle().as_raw(), op.payload);
        }

        // Hand retained resources back to the host.
        if record.state.resources.iter().any(|resource| *resource != 0) {
            self.host
                .post_release(record.state.resources, SignalHandle::NULL);
        }
        log::debug!("scheduler {}: execution {} retired", self.id, execution_id);
        true
    }

    /// Advances an entry's signal semaphores and posts host notifications.
    fn retire_entry(&self, entry: &QueueEntry, st: &mut TickState) {
        for op in &entry.signals {
            op.semaphore.signal(op.payload, &mut st.wake_set);
            self.host
                .post_signal(op.semaphore.signal_handle().as_raw(), op.payload);
        }
    }

    /// Posts a fatal error once and latches the device-lost state. No
    /// allocation failure is recovered on device; in-flight waits are left
    /// for the host to tear down.
    fn post_fatal(&self, code: u64, arg0: u64, arg1: u64) {
        if !self.lost.swap_scoped(true, Ordering::AcqRel, MemoryScope::System) {
            log::error!(
                "scheduler {}: fatal error code={code} arg0={arg0} arg1={arg1}; device lost",
                self.id
            );
            self.host.post_error(code, arg0, arg1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_reason_roundtrip() {
        assert_eq!(TickReason::from_raw(0), Some(TickReason::WorkAvailable));
        assert_eq!(TickReason::from_raw(1), Some(TickReason::CommandBufferReturn));
        assert_eq!(TickReason::from_raw(2), None);
        assert_eq!(TickReason::CommandBufferReturn as u64, 1);
    }

    #[test]
    fn test_default_options_geometry() {
        let options = SchedulerOptions::default();
        assert!(options.mailbox_capacity.is_power_of_two());
        assert!(options.signal_pool_capacity.is_power_of_two());
        assert!(options.trace_capacity.is_power_of_two());
        assert!(options.trace_query_capacity.is_power_of_two());
    }
}
