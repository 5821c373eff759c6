//! Recorded command buffers.
//!
//! A command buffer is immutable once recorded and lives in read-only device
//! memory. It is partitioned into blocks; each block is a span of fixed-size
//! command records that is issued to the execution queue in a single
//! parallelized step, with control commands (branch/return) at the tail
//! transferring execution between blocks. Because all mutable per-execution
//! state (kernarg scratch, binding table, completion and event signals)
//! lives in [`ExecutionState`], the same recording may execute concurrently
//! any number of times.
//!
//! Commands are 64-byte records discriminated by a type byte; here they are
//! a tagged enum whose variants mirror the record layouts, with out-of-band
//! payload (bindings, constants, overflow event lists) carried inline by the
//! variant the way the recorder's embedded-data region carries it.

pub mod issue;

use core::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use thiserror::Error;

use crate::buffer::{BufferRef, WorkgroupCountRef};
use crate::kernels::{KernargArena, KernelArgs, Kernels, WORKGROUP_COUNT_UPDATE_KERNARG_SIZE};
use crate::queue::AqlQueue;
use crate::signal::SignalHandle;
use crate::trace::{SrcLoc, StringLiteral, TraceBuffer, TraceColor, INVALID_QUERY_ID};

/// Fixed size of one recorded command record.
pub const COMMAND_SIZE: usize = 64;
/// Number of event ordinals a wait-events record holds inline; larger waits
/// spill to an out-of-band list. Matches the dependency capacity of one
/// barrier-AND packet.
pub const WAIT_EVENTS_INLINE_CAPACITY: usize = 5;
/// Events consumed per barrier-AND packet when expanding a wait.
pub const WAIT_EVENTS_PER_PACKET: usize = 5;

/// Errors raised while validating a recording.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CommandBufferError {
    /// A block contained no commands.
    #[error("block {block} is empty")]
    EmptyBlock {
        /// Offending block ordinal.
        block: u32,
    },
    /// A command's packets exceed the block's declared packet span.
    #[error("command {command} in block {block} places packets {end} past the block packet count {max}")]
    PacketOffsetOutOfRange {
        /// Offending block ordinal.
        block: u32,
        /// Offending command ordinal.
        command: u32,
        /// One past the last packet index the command writes.
        end: u32,
        /// Declared block packet span.
        max: u32,
    },
    /// Two commands in a block write the same packet slot.
    #[error("command {command} in block {block} overlaps the packets of a prior command")]
    OverlappingPackets {
        /// Offending block ordinal.
        block: u32,
        /// Offending command ordinal.
        command: u32,
    },
    /// A block does not end in a control command.
    #[error("block {block} does not terminate with a branch or return")]
    MissingTerminator {
        /// Offending block ordinal.
        block: u32,
    },
    /// A control command appears before the end of its block.
    #[error("command {command} in block {block} is a control command before the block tail")]
    EarlyTerminator {
        /// Offending block ordinal.
        block: u32,
        /// Offending command ordinal.
        command: u32,
    },
    /// A branch targets a block ordinal that does not exist.
    #[error("branch in block {block} targets missing block {target}")]
    BranchTargetOutOfRange {
        /// Offending block ordinal.
        block: u32,
        /// Requested target ordinal.
        target: u32,
    },
    /// A wait-events command listed no events.
    #[error("wait-events command {command} in block {block} has no events")]
    EmptyWaitList {
        /// Offending block ordinal.
        block: u32,
        /// Offending command ordinal.
        command: u32,
    },
    /// A command's kernargs exceed the declared kernarg capacity.
    #[error("command {command} in block {block} needs kernargs {end} past the declared capacity {max}")]
    KernargCapacityExceeded {
        /// Offending block ordinal.
        block: u32,
        /// Offending command ordinal.
        command: u32,
        /// One past the last kernarg byte the command writes.
        end: u32,
        /// Declared kernarg capacity.
        max: u32,
    },
    /// The query map does not cover every command.
    #[error("block {block} query map covers {have} commands, block has {need}")]
    QueryMapLength {
        /// Offending block ordinal.
        block: u32,
        /// Entries present.
        have: u32,
        /// Entries required.
        need: u32,
    },
}

bitflags! {
    /// Flags controlling how a single command is issued.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        /// Set the AQL barrier bit on the command's first packet, forcing
        /// all prior packets in the queue to complete first. Much lighter
        /// than barrier packets for straight-line ordering.
        const QUEUE_AWAIT_BARRIER = 1 << 0;
        /// Widen the packet acquire fence to system scope.
        const FENCE_ACQUIRE_SYSTEM = 1 << 1;
        /// Widen the packet release fence to system scope.
        const FENCE_RELEASE_SYSTEM = 1 << 2;
    }
}

bitflags! {
    /// Flags controlling a dispatch operation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DispatchFlags: u16 {
        /// Workgroup count is indirect but constant before execution; the
        /// issuer dereferences it while building the packet.
        const INDIRECT_STATIC = 1 << 0;
        /// Workgroup count may change up to the moment the dispatch
        /// executes; the issuer emits a fixup dispatch that patches the
        /// packet in place.
        const INDIRECT_DYNAMIC = 1 << 1;
    }
}

bitflags! {
    /// Flags controlling command buffer execution behavior.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ExecutionFlags: u8 {
        /// Force the barrier bit on every packet so only one command
        /// executes at a time.
        const SERIALIZE = 1 << 0;
        /// Force cache invalidation/flush between every command.
        const UNCACHED = 1 << 1;
        /// Trace control logic (block issue, debug groups). Implies
        /// serialized execution so zones nest.
        const TRACE_CONTROL = (1 << 2) | (1 << 0);
        /// Trace every dispatch with hardware timestamps. Implies control
        /// tracing.
        const TRACE_DISPATCH = (1 << 3) | (1 << 2) | (1 << 0);
    }
}

/// Ordinal of an event within one execution's event table.
pub type EventOrdinal = u32;

/// Header shared by every command record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandHeader {
    /// Issue-behavior flags.
    pub flags: CommandFlags,
    /// Offset into the block's reserved packet span where this command's
    /// packets are placed; multiple packets are contiguous from here.
    pub packet_offset: u16,
}

impl CommandHeader {
    /// A header placing packets at `packet_offset` with no flags.
    pub fn at(packet_offset: u16) -> Self {
        Self {
            flags: CommandFlags::empty(),
            packet_offset,
        }
    }

    /// A header placing packets at `packet_offset` with the queue-await
    /// barrier bit.
    pub fn barrier_at(packet_offset: u16) -> Self {
        Self {
            flags: CommandFlags::QUEUE_AWAIT_BARRIER,
            packet_offset,
        }
    }
}

/// Recorded dispatch parameters.
///
/// Everything needed to build the AQL packet is embedded so the issuer
/// performs no further indirection beyond binding resolution.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Direct/indirect selection.
    pub flags: DispatchFlags,
    /// Launch description of the target kernel.
    pub kernel: KernelArgs,
    /// Grid size in work-items for direct dispatches; ignored when either
    /// indirect flag is set.
    pub grid_size: [u32; 3],
    /// Workgroup count buffer for indirect dispatches.
    pub workgroups: Option<WorkgroupCountRef>,
    /// Binding references resolved into the kernarg scratch at issue.
    pub bindings: Vec<BufferRef>,
    /// 4-byte constants appended after the bindings.
    pub constants: Vec<u32>,
    /// Export/source ordinal used in dispatch trace events.
    pub export_loc: u32,
}

/// One recorded command.
#[derive(Clone, Debug)]
pub enum Command {
    /// Pushes a debug group; pairs with [`Command::DebugGroupEnd`].
    DebugGroupBegin {
        /// Record header.
        header: CommandHeader,
        /// Source location pointer (host address space).
        src_loc: SrcLoc,
        /// Group label literal (host address space).
        label: StringLiteral,
        /// Group color; 0 for default.
        color: TraceColor,
    },
    /// Pops the current debug group.
    DebugGroupEnd {
        /// Record header.
        header: CommandHeader,
    },
    /// Full queue barrier: subsequent packets wait for all prior packets.
    Barrier {
        /// Record header.
        header: CommandHeader,
    },
    /// Signals an event (decrements its signal from 1 to 0) after prior
    /// commands complete.
    SignalEvent {
        /// Record header.
        header: CommandHeader,
        /// Event to signal.
        event: EventOrdinal,
    },
    /// Re-arms an event to the unsignaled state (value 1) in queue order.
    ResetEvent {
        /// Record header.
        header: CommandHeader,
        /// Event to reset.
        event: EventOrdinal,
    },
    /// Waits until all listed events are signaled.
    WaitEvents {
        /// Record header.
        header: CommandHeader,
        /// Events to wait on; expands to ⌈n/5⌉ barrier packets.
        events: Vec<EventOrdinal>,
    },
    /// Fills a buffer with a 1/2/4/8-byte pattern via a blit kernel.
    FillBuffer {
        /// Record header.
        header: CommandHeader,
        /// Block-relative kernarg offset.
        kernarg_offset: u32,
        /// Target range.
        target: BufferRef,
        /// Pattern bytes, little-endian in the low `pattern_length` bytes.
        pattern: u64,
        /// Pattern length in bytes.
        pattern_length: u8,
    },
    /// Copies between buffers via a blit kernel.
    CopyBuffer {
        /// Record header.
        header: CommandHeader,
        /// Block-relative kernarg offset.
        kernarg_offset: u32,
        /// Source range.
        source: BufferRef,
        /// Target range.
        target: BufferRef,
    },
    /// Dispatches a kernel, directly or indirectly.
    Dispatch {
        /// Record header.
        header: CommandHeader,
        /// Block-relative kernarg offset. Indirect-dynamic dispatches carry
        /// a fixup kernarg prefix here with their own kernargs after it.
        kernarg_offset: u32,
        /// Dispatch parameters.
        config: DispatchConfig,
    },
    /// Unconditionally continues execution at another block.
    Branch {
        /// Record header.
        header: CommandHeader,
        /// Target block ordinal within the same command buffer.
        target_block: u32,
    },
    /// Finishes the command buffer and resumes the scheduler.
    Return {
        /// Record header.
        header: CommandHeader,
    },
}

impl Command {
    /// The record header.
    pub fn header(&self) -> &CommandHeader {
        match self {
            Command::DebugGroupBegin { header, .. }
            | Command::DebugGroupEnd { header }
            | Command::Barrier { header }
            | Command::SignalEvent { header, .. }
            | Command::ResetEvent { header, .. }
            | Command::WaitEvents { header, .. }
            | Command::FillBuffer { header, .. }
            | Command::CopyBuffer { header, .. }
            | Command::Dispatch { header, .. }
            | Command::Branch { header, .. }
            | Command::Return { header } => header,
        }
    }

    /// Number of AQL packets this command emplaces when issued.
    pub fn aql_packet_count(&self) -> u32 {
        match self {
            Command::DebugGroupBegin { .. } | Command::DebugGroupEnd { .. } => 1,
            Command::Barrier { .. } => 1,
            Command::SignalEvent { .. } | Command::ResetEvent { .. } => 1,
            Command::WaitEvents { events, .. } => {
                events.len().div_ceil(WAIT_EVENTS_PER_PACKET) as u32
            }
            Command::FillBuffer { .. } | Command::CopyBuffer { .. } => 1,
            Command::Dispatch { config, .. } => {
                if config.flags.contains(DispatchFlags::INDIRECT_DYNAMIC) {
                    2
                } else {
                    1
                }
            }
            Command::Branch { .. } => 1,
            Command::Return { .. } => 1,
        }
    }

    /// Bytes of kernarg scratch the command writes, or 0.
    fn kernarg_size(&self) -> u32 {
        match self {
            Command::FillBuffer { .. } | Command::CopyBuffer { .. } => 3 * 8,
            Command::Dispatch { config, .. } => {
                let own = config.bindings.len() as u32 * 8
                    + (config.constants.len() as u32 * 4).next_multiple_of(8);
                if config.flags.contains(DispatchFlags::INDIRECT_DYNAMIC) {
                    WORKGROUP_COUNT_UPDATE_KERNARG_SIZE + own
                } else {
                    own
                }
            }
            _ => 0,
        }
    }

    fn kernarg_offset(&self) -> Option<u32> {
        match self {
            Command::FillBuffer { kernarg_offset, .. }
            | Command::CopyBuffer { kernarg_offset, .. }
            | Command::Dispatch { kernarg_offset, .. } => Some(*kernarg_offset),
            _ => None,
        }
    }

    /// Largest event ordinal referenced, if any.
    fn max_event(&self) -> Option<EventOrdinal> {
        match self {
            Command::SignalEvent { event, .. } | Command::ResetEvent { event, .. } => Some(*event),
            Command::WaitEvents { events, .. } => events.iter().copied().max(),
            _ => None,
        }
    }

    fn is_terminator(&self) -> bool {
        matches!(self, Command::Branch { .. } | Command::Return { .. })
    }
}

//===----------------------------------------------------------------------===//
// Query map
//===----------------------------------------------------------------------===//

/// Per-command relative query ids, by tracing mode.
///
/// Ids are relative to the block's acquired query range; `INVALID_QUERY_ID`
/// means the command takes no query in that mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandQueryId {
    /// Relative id used in control-tracing mode.
    pub control_id: u16,
    /// Relative id used in dispatch-tracing mode.
    pub dispatch_id: u16,
}

impl CommandQueryId {
    /// No query in either mode.
    pub const NONE: CommandQueryId = CommandQueryId {
        control_id: INVALID_QUERY_ID,
        dispatch_id: INVALID_QUERY_ID,
    };
}

/// Query allocation requirements and per-command id map for one block.
#[derive(Clone, Debug, Default)]
pub struct QueryMap {
    /// Queries needed when control tracing is enabled.
    pub max_control_query_count: u16,
    /// Queries needed when dispatch tracing is enabled.
    pub max_dispatch_query_count: u16,
    /// One entry per command; empty when the recording carries no queries.
    pub query_ids: Vec<CommandQueryId>,
}

//===----------------------------------------------------------------------===//
// Blocks and buffers
//===----------------------------------------------------------------------===//

/// A contiguous immutable span of commands issued as one parallel step.
#[derive(Debug)]
pub struct CommandBlock {
    max_packet_count: u32,
    commands: Vec<Command>,
    query_map: QueryMap,
}

impl CommandBlock {
    /// Validates and seals a recorded block, deriving the packet span from
    /// the densest command.
    pub fn new(commands: Vec<Command>, query_map: QueryMap) -> Result<Self, CommandBufferError> {
        let max_packet_count = commands
            .iter()
            .map(|cmd| cmd.header().packet_offset as u32 + cmd.aql_packet_count())
            .max()
            .unwrap_or(0);
        Self::with_packet_count(commands, query_map, max_packet_count)
    }

    /// Validates and seals a recorded block against a recorder-declared
    /// packet span.
    ///
    /// Checks that every command's packets fit the span without overlap,
    /// that exactly the final command is a control command, and that the
    /// query map (if present) covers every command. Unclaimed slots within
    /// the span are published as no-ops at issue.
    pub fn with_packet_count(
        commands: Vec<Command>,
        query_map: QueryMap,
        max_packet_count: u32,
    ) -> Result<Self, CommandBufferError> {
        Self::validate(&commands, &query_map, 0, max_packet_count)?;
        Ok(Self {
            max_packet_count,
            commands,
            query_map,
        })
    }

    fn validate(
        commands: &[Command],
        query_map: &QueryMap,
        block: u32,
        max: u32,
    ) -> Result<(), CommandBufferError> {
        if commands.is_empty() {
            return Err(CommandBufferError::EmptyBlock { block });
        }
        let mut claimed = vec![false; max as usize];
        for (ordinal, cmd) in commands.iter().enumerate() {
            let command = ordinal as u32;
            let start = cmd.header().packet_offset as u32;
            let end = start + cmd.aql_packet_count();
            if end > max {
                return Err(CommandBufferError::PacketOffsetOutOfRange {
                    block,
                    command,
                    end,
                    max,
                });
            }
            for slot in claimed.iter_mut().take(end as usize).skip(start as usize) {
                if *slot {
                    return Err(CommandBufferError::OverlappingPackets { block, command });
                }
                *slot = true;
            }
            if let Command::WaitEvents { events, .. } = cmd {
                if events.is_empty() {
                    return Err(CommandBufferError::EmptyWaitList { block, command });
                }
            }
            if cmd.is_terminator() && ordinal != commands.len() - 1 {
                return Err(CommandBufferError::EarlyTerminator { block, command });
            }
        }
        if !commands[commands.len() - 1].is_terminator() {
            return Err(CommandBufferError::MissingTerminator { block });
        }
        if !query_map.query_ids.is_empty() && query_map.query_ids.len() != commands.len() {
            return Err(CommandBufferError::QueryMapLength {
                block,
                have: query_map.query_ids.len() as u32,
                need: commands.len() as u32,
            });
        }
        Ok(())
    }

    /// Maximum number of AQL packets one issue of this block emplaces.
    /// Unused reserved packets are still published as no-ops so the packet
    /// processor always makes forward progress.
    #[inline]
    pub fn max_packet_count(&self) -> u32 {
        self.max_packet_count
    }

    /// The recorded commands.
    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The block's query map.
    #[inline]
    pub fn query_map(&self) -> &QueryMap {
        &self.query_map
    }

    /// Queries this block acquires under the given execution flags.
    pub fn query_count(&self, flags: ExecutionFlags) -> u16 {
        if flags.contains(ExecutionFlags::TRACE_DISPATCH) {
            self.query_map.max_dispatch_query_count
        } else if flags.contains(ExecutionFlags::TRACE_CONTROL) {
            self.query_map.max_control_query_count
        } else {
            0
        }
    }
}

/// An immutable program of command blocks.
///
/// Execution starts at block 0 and follows branch commands until a return.
#[derive(Debug)]
pub struct CommandBuffer {
    max_kernarg_capacity: u32,
    event_capacity: u32,
    blocks: Vec<CommandBlock>,
}

impl CommandBuffer {
    /// Validates and seals a recording.
    ///
    /// `max_kernarg_capacity` is the kernarg scratch one execution needs; a
    /// command writing past it is a recorder error caught here.
    pub fn new(
        blocks: Vec<CommandBlock>,
        max_kernarg_capacity: u32,
    ) -> Result<Arc<Self>, CommandBufferError> {
        let mut event_capacity = 0u32;
        for (ordinal, block) in blocks.iter().enumerate() {
            let block_ordinal = ordinal as u32;
            for (command, cmd) in block.commands.iter().enumerate() {
                if let (Some(offset), size) = (cmd.kernarg_offset(), cmd.kernarg_size()) {
                    let end = offset + size;
                    if end > max_kernarg_capacity {
                        return Err(CommandBufferError::KernargCapacityExceeded {
                            block: block_ordinal,
                            command: command as u32,
                            end,
                            max: max_kernarg_capacity,
                        });
                    }
                }
                if let Command::Branch { target_block, .. } = cmd {
                    if *target_block as usize >= blocks.len() {
                        return Err(CommandBufferError::BranchTargetOutOfRange {
                            block: block_ordinal,
                            target: *target_block,
                        });
                    }
                }
                if let Some(event) = cmd.max_event() {
                    event_capacity = event_capacity.max(event + 1);
                }
            }
        }
        Ok(Arc::new(Self {
            max_kernarg_capacity,
            event_capacity,
            blocks,
        }))
    }

    /// Minimum kernarg scratch capacity an execution must reserve. Only one
    /// block runs at a time so the scratch is reused across blocks.
    #[inline]
    pub fn max_kernarg_capacity(&self) -> u32 {
        self.max_kernarg_capacity
    }

    /// Number of distinct events an execution must provide signals for.
    #[inline]
    pub fn event_capacity(&self) -> u32 {
        self.event_capacity
    }

    /// The recorded blocks; block 0 is the entry point.
    #[inline]
    pub fn blocks(&self) -> &[CommandBlock] {
        &self.blocks
    }
}

//===----------------------------------------------------------------------===//
// Execution state
//===----------------------------------------------------------------------===//

/// Mutable state for one in-flight execution of a command buffer.
///
/// Created when the scheduler issues an EXECUTE entry, reused across the
/// blocks of that execution (only one block runs at a time), and torn down
/// when the terminating return reaches the scheduler.
pub struct ExecutionState {
    /// Execution id, unique per scheduler.
    pub id: u64,
    /// Execution behavior flags.
    pub flags: ExecutionFlags,
    /// The recording being executed.
    pub command_buffer: Arc<CommandBuffer>,
    /// Scheduler managing this execution's lifetime.
    pub scheduler: Weak<crate::scheduler::Scheduler>,
    /// Builtin kernel table.
    pub kernels: Kernels,
    /// Storage for control packet kernargs (issue_block / tick); one control
    /// packet is in flight at a time so a single arena is reused.
    pub control_kernargs: KernargArena,
    /// Kernarg scratch of at least the recording's declared capacity.
    pub execution_kernargs: KernargArena,
    /// Queue the execution's packets are emplaced on.
    pub execution_queue: Arc<AqlQueue>,
    /// Trace buffer owned by the managing scheduler.
    pub trace: Arc<TraceBuffer>,
    /// Base query index acquired for the currently-issuing block.
    pub trace_block_query_base_id: AtomicU64,
    /// Total queries acquired by this execution (released at teardown).
    pub queries_acquired: AtomicU64,
    /// Binding table resolving slot buffer references.
    pub bindings: Box<[BufferRef]>,
    /// Signal decremented when the final block's return barrier retires.
    pub completion_signal: SignalHandle,
    /// Per-execution event signals indexed by event ordinal.
    pub event_signals: Box<[SignalHandle]>,
    /// Host resource handles released when the execution retires.
    pub resources: [u64; 4],
}

impl ExecutionState {
    /// Resolves an event ordinal to its signal.
    #[inline]
    pub fn event_signal(&self, event: EventOrdinal) -> SignalHandle {
        self.event_signals[event as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_dispatch(offset: u16, kernarg_offset: u32) -> Command {
        Command::Dispatch {
            header: CommandHeader::at(offset),
            kernarg_offset,
            config: DispatchConfig {
                flags: DispatchFlags::empty(),
                kernel: KernelArgs::default(),
                grid_size: [1, 1, 1],
                workgroups: None,
                bindings: Vec::new(),
                constants: Vec::new(),
                export_loc: 0,
            },
        }
    }

    #[test]
    fn test_block_packet_span() {
        let block = CommandBlock::new(
            vec![
                direct_dispatch(0, 0),
                Command::Barrier {
                    header: CommandHeader::barrier_at(1),
                },
                direct_dispatch(2, 0),
                Command::Return {
                    header: CommandHeader::barrier_at(3),
                },
            ],
            QueryMap::default(),
        )
        .unwrap();
        assert_eq!(block.max_packet_count(), 4);
    }

    #[test]
    fn test_wait_events_packet_expansion() {
        let wait = Command::WaitEvents {
            header: CommandHeader::at(0),
            events: (0..12).collect(),
        };
        assert_eq!(wait.aql_packet_count(), 3);
        let wait_small = Command::WaitEvents {
            header: CommandHeader::at(0),
            events: vec![0, 1],
        };
        assert_eq!(wait_small.aql_packet_count(), 1);
    }

    #[test]
    fn test_indirect_dynamic_takes_two_packets() {
        let cmd = Command::Dispatch {
            header: CommandHeader::at(0),
            kernarg_offset: 0,
            config: DispatchConfig {
                flags: DispatchFlags::INDIRECT_DYNAMIC,
                kernel: KernelArgs::default(),
                grid_size: [0, 0, 0],
                workgroups: Some(WorkgroupCountRef {
                    offset: 0,
                    value: crate::buffer::BufferRefValue::Ptr(0x1000),
                }),
                bindings: Vec::new(),
                constants: Vec::new(),
                export_loc: 0,
            },
        };
        assert_eq!(cmd.aql_packet_count(), 2);
    }

    #[test]
    fn test_declared_packet_span_validated() {
        let result = CommandBlock::with_packet_count(
            vec![
                direct_dispatch(0, 0),
                Command::Return {
                    header: CommandHeader::barrier_at(3),
                },
            ],
            QueryMap::default(),
            2,
        );
        assert!(matches!(
            result,
            Err(CommandBufferError::PacketOffsetOutOfRange { end: 4, max: 2, .. })
        ));
    }

    #[test]
    fn test_overlapping_packets_rejected() {
        let result = CommandBlock::new(
            vec![
                direct_dispatch(0, 0),
                direct_dispatch(0, 64),
                Command::Return {
                    header: CommandHeader::barrier_at(1),
                },
            ],
            QueryMap::default(),
        );
        assert!(matches!(
            result,
            Err(CommandBufferError::OverlappingPackets { command: 1, .. })
        ));
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let result = CommandBlock::new(vec![direct_dispatch(0, 0)], QueryMap::default());
        assert!(matches!(
            result,
            Err(CommandBufferError::MissingTerminator { .. })
        ));
    }

    #[test]
    fn test_branch_target_validated() {
        let block = CommandBlock::new(
            vec![Command::Branch {
                header: CommandHeader::barrier_at(0),
                target_block: 3,
            }],
            QueryMap::default(),
        )
        .unwrap();
        let result = CommandBuffer::new(vec![block], 0);
        assert!(matches!(
            result,
            Err(CommandBufferError::BranchTargetOutOfRange { target: 3, .. })
        ));
    }

    #[test]
    fn test_event_capacity_derived() {
        let block = CommandBlock::new(
            vec![
                Command::SignalEvent {
                    header: CommandHeader::at(0),
                    event: 2,
                },
                Command::WaitEvents {
                    header: CommandHeader::at(1),
                    events: vec![0, 5],
                },
                Command::Return {
                    header: CommandHeader::barrier_at(2),
                },
            ],
            QueryMap::default(),
        )
        .unwrap();
        let buffer = CommandBuffer::new(vec![block], 0).unwrap();
        assert_eq!(buffer.event_capacity(), 6);
    }

    #[test]
    fn test_kernarg_capacity_validated() {
        let block = CommandBlock::new(
            vec![
                direct_dispatch(0, 8),
                Command::Return {
                    header: CommandHeader::barrier_at(1),
                },
            ],
            QueryMap::default(),
        )
        .unwrap();
        // A dispatch with no bindings or constants still writes nothing, so
        // offset 8 with zero size fits any capacity.
        assert!(CommandBuffer::new(vec![block], 0).is_ok());

        let fill_block = CommandBlock::new(
            vec![
                Command::FillBuffer {
                    header: CommandHeader::at(0),
                    kernarg_offset: 16,
                    target: BufferRef::ptr(0x1000, 64),
                    pattern: 0,
                    pattern_length: 4,
                },
                Command::Return {
                    header: CommandHeader::barrier_at(1),
                },
            ],
            QueryMap::default(),
        )
        .unwrap();
        let result = CommandBuffer::new(vec![fill_block], 32);
        assert!(matches!(
            result,
            Err(CommandBufferError::KernargCapacityExceeded { end: 40, max: 32, .. })
        ));
    }

    #[test]
    fn test_execution_flag_containment() {
        assert!(ExecutionFlags::TRACE_CONTROL.contains(ExecutionFlags::SERIALIZE));
        assert!(ExecutionFlags::TRACE_DISPATCH.contains(ExecutionFlags::TRACE_CONTROL));
    }
}
