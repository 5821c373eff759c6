//! Parallel translation of a command block into AQL packets.
//!
//! One logical work-item issues each command: it computes its packet slot
//! from the block's base queue index plus the command's recorded offset,
//! writes kernargs into its disjoint slice of the execution's scratch, fills
//! the packet body, and publishes by swapping the header from INVALID. The
//! parent reserved the whole block span and rang the doorbell up front; the
//! packet processor stalls on the first INVALID header it reaches, so no
//! ordering between issuers is required for correctness; lower offsets
//! finishing first just lets the processor start sooner.
//!
//! Every issuer observes the publication ordering invariant: kernargs and
//! the full packet body are written before the header swap, and the swap is
//! release-ordered (system scope when the work is observable across agents,
//! agent scope otherwise).

use core::sync::atomic::Ordering;

use thiserror::Error;

use crate::buffer::{emplace_copy, emplace_fill, BufferError};
use crate::command_buffer::{
    Command, CommandBlock, CommandFlags, DispatchConfig, DispatchFlags, ExecutionFlags,
    ExecutionState, WAIT_EVENTS_PER_PACKET,
};
use crate::kernels::WORKGROUP_COUNT_UPDATE_KERNARG_SIZE;
use crate::queue::{
    make_header, AqlQueue, BarrierPacket, FenceScope, KernelDispatchPacket, PacketType,
};
use crate::signal::SignalHandle;
use crate::support::MemoryScope;
use crate::trace::INVALID_QUERY_ID;

/// Trace zone type for kernel dispatch commands.
pub const ZONE_TYPE_DISPATCH: u8 = 0;
/// Trace zone type for fill commands.
pub const ZONE_TYPE_FILL: u8 = 1;
/// Trace zone type for copy commands.
pub const ZONE_TYPE_COPY: u8 = 2;

/// Errors detected while issuing a block. All of these are recorder
/// violations; the scheduler reports them to the host and declares the
/// device lost.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IssueError {
    /// The block ordinal does not exist in the command buffer.
    #[error("block ordinal {0} out of range")]
    UnknownBlock(u32),
    /// A buffer reference failed to resolve.
    #[error("command {command}: {source}")]
    BadBufferRef {
        /// Offending command ordinal.
        command: u32,
        /// Underlying resolution failure.
        source: BufferError,
    },
    /// An indirect dispatch carried no workgroup count reference.
    #[error("command {command}: indirect dispatch without workgroup count buffer")]
    MissingWorkgroups {
        /// Offending command ordinal.
        command: u32,
    },
    /// The managing scheduler was torn down mid-execution.
    #[error("scheduler dropped during execution")]
    SchedulerGone,
}

/// Fence scopes for a command under the execution's flags: agent scope by
/// default, widened to system by the command's fence flags or the uncached
/// execution mode.
fn dispatch_scopes(flags: ExecutionFlags, cmd_flags: CommandFlags) -> (FenceScope, FenceScope) {
    let uncached = flags.contains(ExecutionFlags::UNCACHED);
    let acquire = if uncached || cmd_flags.contains(CommandFlags::FENCE_ACQUIRE_SYSTEM) {
        FenceScope::System
    } else {
        FenceScope::Agent
    };
    let release = if uncached || cmd_flags.contains(CommandFlags::FENCE_RELEASE_SYSTEM) {
        FenceScope::System
    } else {
        FenceScope::Agent
    };
    (acquire, release)
}

/// Fence scopes for no-op barrier packets: none unless explicitly widened.
fn barrier_scopes(flags: ExecutionFlags, cmd_flags: CommandFlags) -> (FenceScope, FenceScope) {
    let uncached = flags.contains(ExecutionFlags::UNCACHED);
    let acquire = if uncached || cmd_flags.contains(CommandFlags::FENCE_ACQUIRE_SYSTEM) {
        FenceScope::System
    } else {
        FenceScope::None
    };
    let release = if uncached || cmd_flags.contains(CommandFlags::FENCE_RELEASE_SYSTEM) {
        FenceScope::System
    } else {
        FenceScope::None
    };
    (acquire, release)
}

fn command_barrier_bit(state: &ExecutionState, cmd_flags: CommandFlags) -> bool {
    cmd_flags.contains(CommandFlags::QUEUE_AWAIT_BARRIER)
        || state.flags.contains(ExecutionFlags::SERIALIZE)
}

/// Emplaces a lightweight no-op barrier packet and associates the optional
/// completion signal; the packet processor populates the signal's
/// timestamps when the packet retires.
fn emplace_marker(
    queue: &AqlQueue,
    queue_index: u64,
    barrier: bool,
    acquire_scope: FenceScope,
    release_scope: FenceScope,
    completion_signal: SignalHandle,
) {
    let packet = BarrierPacket {
        dep_signals: [SignalHandle::NULL; 5],
        completion_signal,
    };
    let slot = queue.slot(queue_index);
    slot.write_body(&packet.encode());
    slot.publish(
        make_header(PacketType::BarrierAnd, barrier, acquire_scope, release_scope),
        0,
        MemoryScope::Device,
    );
}

/// Reads a `u32[3]` workgroup count from device memory.
///
/// # Safety
///
/// `addr` must be the address of a live, 4-byte-aligned `u32[3]` for the
/// duration of the call. The recorder/binding contract guarantees workgroup
/// count buffers stay committed until the commands reading them complete.
unsafe fn read_workgroup_counts(addr: u64) -> [u32; 3] {
    let ptr = addr as *const u32;
    // SAFETY: caller contract above.
    unsafe { [ptr.read(), ptr.add(1).read(), ptr.add(2).read()] }
}

/// Single-work-item fixup builtin for indirect-dynamic dispatches.
///
/// Reads the current workgroup counts and patches `grid_size` of the
/// still-INVALID dispatch packet at `packet_index`, then publishes it by
/// storing `header_word` (the final `header | setup << 16`). The hardware
/// processor, blocked on the INVALID header, resumes with current counts.
///
/// # Safety
///
/// `workgroups_ptr` must satisfy the contract of a workgroup count buffer
/// (live `u32[3]` until the dispatch completes).
pub unsafe fn workgroup_count_update(
    queue: &AqlQueue,
    packet_index: u64,
    workgroups_ptr: u64,
    header_word: u32,
) {
    // SAFETY: forwarded caller contract.
    let counts = unsafe { read_workgroup_counts(workgroups_ptr) };
    let slot = queue.slot(packet_index);
    let mut image = slot.load(MemoryScope::Device);
    image[3] = counts[0];
    image[4] = counts[1];
    image[5] = counts[2];
    slot.write_body(&image);
    slot.publish(header_word as u16, (header_word >> 16) as u16, MemoryScope::Device);
}

/// Issues every command of `block_ordinal`, publishing packets into the
/// execution queue span starting at `base_queue_index`.
///
/// The span (`block.max_packet_count` slots) must already be reserved with
/// all headers INVALID. Commands are independent: the loop body is the
/// per-work-item kernel and may run in any order.
pub fn issue_block(
    state: &ExecutionState,
    block_ordinal: u32,
    base_queue_index: u64,
) -> Result<(), IssueError> {
    let block = state
        .command_buffer
        .blocks()
        .get(block_ordinal as usize)
        .ok_or(IssueError::UnknownBlock(block_ordinal))?;

    for (ordinal, cmd) in block.commands().iter().enumerate() {
        issue_command(state, block, cmd, ordinal as u32, base_queue_index)?;
    }

    // Publish no-op packets into any reserved slots no command claimed so
    // the packet processor never stalls on a hole in the span.
    let mut claimed = vec![false; block.max_packet_count() as usize];
    for cmd in block.commands() {
        let start = cmd.header().packet_offset as usize;
        for slot in claimed.iter_mut().skip(start).take(cmd.aql_packet_count() as usize) {
            *slot = true;
        }
    }
    for (offset, _) in claimed.iter().enumerate().filter(|(_, claimed)| !**claimed) {
        emplace_marker(
            &state.execution_queue,
            base_queue_index + offset as u64,
            false,
            FenceScope::None,
            FenceScope::None,
            SignalHandle::NULL,
        );
    }

    Ok(())
}

/// Resolves the query signal for one command under the execution's tracing
/// mode, or null when the command is untraced.
fn execution_query_id(state: &ExecutionState, block: &CommandBlock, ordinal: u32) -> u16 {
    let map = block.query_map();
    let Some(ids) = map.query_ids.get(ordinal as usize) else {
        return INVALID_QUERY_ID;
    };
    let base = state.trace_block_query_base_id.load(Ordering::Relaxed);
    if state.flags.contains(ExecutionFlags::TRACE_DISPATCH) && ids.dispatch_id != INVALID_QUERY_ID {
        state.trace.query_ring().query_id(base + ids.dispatch_id as u64)
    } else if state.flags.contains(ExecutionFlags::TRACE_CONTROL)
        && ids.control_id != INVALID_QUERY_ID
    {
        state.trace.query_ring().query_id(base + ids.control_id as u64)
    } else {
        INVALID_QUERY_ID
    }
}

fn issue_command(
    state: &ExecutionState,
    block: &CommandBlock,
    cmd: &Command,
    ordinal: u32,
    base_queue_index: u64,
) -> Result<(), IssueError> {
    let queue_index = base_queue_index + cmd.header().packet_offset as u64;
    let query_id = execution_query_id(state, block, ordinal);
    let barrier = command_barrier_bit(state, cmd.header().flags);
    let queue = &state.execution_queue;

    match cmd {
        Command::DebugGroupBegin { header, src_loc, .. } => {
            // With control tracing the marker's completion signal captures
            // the group's entry timestamps; without it the marker still
            // executes so timing-sensitive behavior does not change between
            // traced and untraced runs.
            let completion_signal = if query_id != INVALID_QUERY_ID {
                state.trace.execution_zone_begin(query_id, *src_loc)
            } else {
                SignalHandle::NULL
            };
            let (acquire, release) = barrier_scopes(state.flags, header.flags);
            emplace_marker(queue, queue_index, barrier, acquire, release, completion_signal);
        }
        Command::DebugGroupEnd { header } => {
            let completion_signal = if query_id != INVALID_QUERY_ID {
                state.trace.execution_zone_end(query_id)
            } else {
                SignalHandle::NULL
            };
            let (acquire, release) = barrier_scopes(state.flags, header.flags);
            emplace_marker(queue, queue_index, barrier, acquire, release, completion_signal);
        }
        Command::Barrier { header } => {
            let (acquire, release) = barrier_scopes(state.flags, header.flags);
            emplace_marker(queue, queue_index, true, acquire, release, SignalHandle::NULL);
        }
        Command::SignalEvent { event, .. } => {
            // The event signal is armed at 1; the packet's completion
            // decrement takes it to 0 ("signaled") once prior packets are
            // done.
            emplace_marker(
                queue,
                queue_index,
                true,
                FenceScope::None,
                FenceScope::None,
                state.event_signal(*event),
            );
        }
        Command::ResetEvent { event, .. } => {
            // Re-arming stores an absolute value, which no barrier packet
            // can do; a single-work-item builtin performs the store in
            // queue order. The builtin takes the raw signal handle in place
            // of a kernarg pointer.
            let kernel = state.kernels.event_reset;
            let packet = KernelDispatchPacket {
                setup: kernel.setup,
                workgroup_size: kernel.workgroup_size,
                grid_size: [1, 1, 1],
                private_segment_size: kernel.private_segment_size,
                group_segment_size: kernel.group_segment_size,
                kernel_object: kernel.kernel_object,
                kernarg_address: state.event_signal(*event).as_raw(),
                completion_signal: SignalHandle::NULL,
            };
            let slot = queue.slot(queue_index);
            slot.write_body(&packet.encode());
            slot.publish(
                make_header(PacketType::KernelDispatch, true, FenceScope::None, FenceScope::None),
                packet.setup,
                MemoryScope::Device,
            );
        }
        Command::WaitEvents { header, events } => {
            // ⌈n/5⌉ consecutive barrier-AND packets. The first takes the
            // command's own barrier bit; the rest chain on their
            // predecessor so the wait is satisfied only when every packet's
            // dependencies are.
            for (chunk_ordinal, chunk) in events.chunks(WAIT_EVENTS_PER_PACKET).enumerate() {
                let mut packet = BarrierPacket::default();
                for (dep, event) in packet.dep_signals.iter_mut().zip(chunk.iter()) {
                    *dep = state.event_signal(*event);
                }
                let chunk_barrier = if chunk_ordinal == 0 { barrier } else { true };
                let (acquire, release) = barrier_scopes(state.flags, header.flags);
                let slot = queue.slot(queue_index + chunk_ordinal as u64);
                slot.write_body(&packet.encode());
                slot.publish(
                    make_header(PacketType::BarrierAnd, chunk_barrier, acquire, release),
                    0,
                    MemoryScope::Device,
                );
            }
        }
        Command::FillBuffer {
            header,
            kernarg_offset,
            target,
            pattern,
            pattern_length,
        } => {
            let (target_addr, length) = target
                .resolve(&state.bindings)
                .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;
            let completion_signal = if query_id != INVALID_QUERY_ID {
                state
                    .trace
                    .execution_zone_dispatch(ZONE_TYPE_FILL, query_id, 0, ordinal)
            } else {
                SignalHandle::NULL
            };
            let (acquire, release) = dispatch_scopes(state.flags, header.flags);
            emplace_fill(
                queue,
                queue_index,
                &state.kernels,
                &state.execution_kernargs,
                *kernarg_offset,
                target_addr,
                length,
                *pattern,
                *pattern_length,
                barrier,
                acquire,
                release,
                completion_signal,
            )
            .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;
        }
        Command::CopyBuffer {
            header,
            kernarg_offset,
            source,
            target,
        } => {
            let (source_addr, _) = source
                .resolve(&state.bindings)
                .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;
            let (target_addr, length) = target
                .resolve(&state.bindings)
                .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;
            let completion_signal = if query_id != INVALID_QUERY_ID {
                state
                    .trace
                    .execution_zone_dispatch(ZONE_TYPE_COPY, query_id, 0, ordinal)
            } else {
                SignalHandle::NULL
            };
            let (acquire, release) = dispatch_scopes(state.flags, header.flags);
            emplace_copy(
                queue,
                queue_index,
                &state.kernels,
                &state.execution_kernargs,
                *kernarg_offset,
                source_addr,
                target_addr,
                length,
                barrier,
                acquire,
                release,
                completion_signal,
            );
        }
        Command::Dispatch {
            header,
            kernarg_offset,
            config,
        } => {
            if config.flags.contains(DispatchFlags::INDIRECT_DYNAMIC) {
                issue_dispatch_indirect_dynamic(
                    state,
                    config,
                    *kernarg_offset,
                    ordinal,
                    queue_index,
                    query_id,
                    barrier,
                    header.flags,
                )?;
            } else {
                issue_dispatch(
                    state,
                    config,
                    *kernarg_offset,
                    ordinal,
                    queue_index,
                    query_id,
                    barrier,
                    header.flags,
                )?;
            }
        }
        Command::Branch { header, target_block } => {
            // Publish the branch's reserved slot as a marker so the span
            // stays dense, then tail-enqueue the next block's issue on the
            // scheduler queue. Never recurse into the issuer inline.
            let (acquire, release) = barrier_scopes(state.flags, header.flags);
            emplace_marker(queue, queue_index, true, acquire, release, SignalHandle::NULL);
            let scheduler = state.scheduler.upgrade().ok_or(IssueError::SchedulerGone)?;
            scheduler.enqueue_issue_block(state, *target_block);
        }
        Command::Return { .. } => {
            // The return barrier carries the execution's completion signal
            // and releases to system scope so every agent observes the
            // command buffer's writes before the completion is visible.
            emplace_marker(
                queue,
                queue_index,
                true,
                FenceScope::None,
                FenceScope::System,
                state.completion_signal,
            );
            let scheduler = state.scheduler.upgrade().ok_or(IssueError::SchedulerGone)?;
            scheduler.enqueue_tick(
                crate::scheduler::TickReason::CommandBufferReturn,
                state.id,
            );
        }
    }
    Ok(())
}

/// Builds the kernargs and packet for a direct or indirect-static dispatch
/// and publishes it.
#[allow(clippy::too_many_arguments)]
fn issue_dispatch(
    state: &ExecutionState,
    config: &DispatchConfig,
    kernarg_offset: u32,
    ordinal: u32,
    queue_index: u64,
    query_id: u16,
    barrier: bool,
    cmd_flags: CommandFlags,
) -> Result<(), IssueError> {
    let kernarg_base = write_dispatch_kernargs(state, config, kernarg_offset, ordinal)?;

    let grid_size = if config.flags.contains(DispatchFlags::INDIRECT_STATIC) {
        // Constant-before-execution workgroup counts resolve at issue time,
        // avoiding the fixup dispatch entirely.
        let workgroups = config
            .workgroups
            .as_ref()
            .ok_or(IssueError::MissingWorkgroups { command: ordinal })?;
        let addr = workgroups
            .resolve(&state.bindings)
            .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;
        // SAFETY: workgroup count buffers are committed for the lifetime of
        // the execution per the binding contract.
        unsafe { read_workgroup_counts(addr) }
    } else {
        config.grid_size
    };

    let completion_signal = if query_id != INVALID_QUERY_ID {
        state.trace.execution_zone_dispatch(
            ZONE_TYPE_DISPATCH,
            query_id,
            config.export_loc,
            ordinal,
        )
    } else {
        SignalHandle::NULL
    };

    let packet = KernelDispatchPacket {
        setup: config.kernel.setup,
        workgroup_size: config.kernel.workgroup_size,
        grid_size,
        private_segment_size: config.kernel.private_segment_size,
        group_segment_size: config.kernel.group_segment_size,
        kernel_object: config.kernel.kernel_object,
        kernarg_address: kernarg_base,
        completion_signal,
    };
    let (acquire, release) = dispatch_scopes(state.flags, cmd_flags);
    let slot = state.execution_queue.slot(queue_index);
    slot.write_body(&packet.encode());
    slot.publish(
        make_header(PacketType::KernelDispatch, barrier, acquire, release),
        packet.setup,
        MemoryScope::Device,
    );
    Ok(())
}

/// Emits the two-packet indirect-dynamic protocol: a fixup dispatch at
/// `queue_index` followed by the real dispatch left INVALID at
/// `queue_index + 1`. The fixup patches the grid size and publishes the
/// second packet; the hardware processor, reaching it and finding INVALID,
/// blocks until that transition and then executes with current counts.
#[allow(clippy::too_many_arguments)]
fn issue_dispatch_indirect_dynamic(
    state: &ExecutionState,
    config: &DispatchConfig,
    kernarg_offset: u32,
    ordinal: u32,
    queue_index: u64,
    query_id: u16,
    barrier: bool,
    cmd_flags: CommandFlags,
) -> Result<(), IssueError> {
    let update_index = queue_index;
    let dispatch_index = queue_index + 1;

    // Emplace the dispatch packet body first (grid size still zero) so the
    // fixup has valid data to patch even if it starts executing while this
    // work-item is still running. Its own kernargs live after the fixup's
    // kernarg prefix.
    let dispatch_kernarg_offset = kernarg_offset + WORKGROUP_COUNT_UPDATE_KERNARG_SIZE;
    let kernarg_base =
        write_dispatch_kernargs(state, config, dispatch_kernarg_offset, ordinal)?;
    let completion_signal = if query_id != INVALID_QUERY_ID {
        state.trace.execution_zone_dispatch(
            ZONE_TYPE_DISPATCH,
            query_id,
            config.export_loc,
            ordinal,
        )
    } else {
        SignalHandle::NULL
    };
    let dispatch_packet = KernelDispatchPacket {
        setup: config.kernel.setup,
        workgroup_size: config.kernel.workgroup_size,
        grid_size: [0, 0, 0],
        private_segment_size: config.kernel.private_segment_size,
        group_segment_size: config.kernel.group_segment_size,
        kernel_object: config.kernel.kernel_object,
        kernarg_address: kernarg_base,
        completion_signal,
    };
    state
        .execution_queue
        .slot(dispatch_index)
        .write_body(&dispatch_packet.encode());
    // NOTE: the dispatch packet header stays INVALID here.

    // The final header word the fixup will store once the grid is patched.
    let (acquire, release) = dispatch_scopes(state.flags, cmd_flags);
    let dispatch_header =
        make_header(PacketType::KernelDispatch, barrier, acquire, release) as u32
            | ((config.kernel.setup as u32) << 16);

    let workgroups = config
        .workgroups
        .as_ref()
        .ok_or(IssueError::MissingWorkgroups { command: ordinal })?;
    let workgroups_addr = workgroups
        .resolve(&state.bindings)
        .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;

    // Fixup kernargs: the workgroup count buffer, the target packet, and
    // the header word that publishes it.
    state.execution_kernargs.write_u64(kernarg_offset, workgroups_addr);
    state
        .execution_kernargs
        .write_u64(kernarg_offset + 8, dispatch_index);
    state
        .execution_kernargs
        .write_u64(kernarg_offset + 16, dispatch_header as u64);

    let update_kernel = state.kernels.workgroup_count_update;
    let update_packet = KernelDispatchPacket {
        setup: update_kernel.setup,
        workgroup_size: update_kernel.workgroup_size,
        grid_size: [1, 1, 1],
        private_segment_size: update_kernel.private_segment_size,
        group_segment_size: update_kernel.group_segment_size,
        kernel_object: update_kernel.kernel_object,
        kernarg_address: state.execution_kernargs.address(kernarg_offset),
        completion_signal: SignalHandle::NULL,
    };
    let update_slot = state.execution_queue.slot(update_index);
    update_slot.write_body(&update_packet.encode());
    update_slot.publish(
        make_header(PacketType::KernelDispatch, barrier, FenceScope::None, FenceScope::None),
        update_packet.setup,
        MemoryScope::Device,
    );
    Ok(())
}

/// Resolves bindings and appends constants into the dispatch's kernarg
/// range, returning the range's device address.
fn write_dispatch_kernargs(
    state: &ExecutionState,
    config: &DispatchConfig,
    kernarg_offset: u32,
    ordinal: u32,
) -> Result<u64, IssueError> {
    for (index, binding) in config.bindings.iter().enumerate() {
        let (addr, _) = binding
            .resolve(&state.bindings)
            .map_err(|source| IssueError::BadBufferRef { command: ordinal, source })?;
        state
            .execution_kernargs
            .write_u64(kernarg_offset + index as u32 * 8, addr);
    }
    let constants_base = kernarg_offset + config.bindings.len() as u32 * 8;
    for (index, constant) in config.constants.iter().enumerate() {
        state
            .execution_kernargs
            .write_u32(constants_base + index as u32 * 4, *constant);
    }
    Ok(state.execution_kernargs.address(kernarg_offset))
}
