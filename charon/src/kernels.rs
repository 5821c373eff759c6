//! Builtin kernel descriptors and kernel argument storage.
//!
//! The runtime dispatches a handful of builtin kernels (the scheduler tick,
//! the block issuer, the indirect-dispatch fixup, and the blit family). Each
//! is described by a [`KernelArgs`] record holding the opaque kernel object
//! handle and the launch parameters it was compiled for. The host resolves
//! real kernel objects at load time; [`Kernels::builtin`] provides the
//! well-known handles the software processor understands.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::support::{MemoryScope, ScopedAtomic};

/// Launch description for a fixed-function kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelArgs {
    /// Opaque handle to the kernel object to execute.
    pub kernel_object: u64,
    /// Grid dimension count (1, 2, or 3).
    pub setup: u16,
    /// Work-group size in work-items; unused dimensions must be 1.
    pub workgroup_size: [u16; 3],
    /// Per-work-item private memory bytes.
    pub private_segment_size: u32,
    /// Per-work-group group memory bytes.
    pub group_segment_size: u32,
}

impl KernelArgs {
    fn single_work_item(kernel_object: u64) -> Self {
        Self {
            kernel_object,
            setup: 1,
            workgroup_size: [1, 1, 1],
            private_segment_size: 0,
            group_segment_size: 0,
        }
    }

    fn blit(kernel_object: u64) -> Self {
        Self {
            kernel_object,
            setup: 1,
            workgroup_size: [64, 1, 1],
            private_segment_size: 0,
            group_segment_size: 0,
        }
    }
}

/// Well-known kernel object handles for the builtin kernels.
///
/// On hardware these are the symbol addresses resolved from the loaded code
/// object; the software packet processor keys its dispatch table off the same
/// values.
pub mod kernel_object {
    /// Scheduler tick kernel.
    pub const SCHEDULER_TICK: u64 = 0x6368_0001;
    /// Command block issuer kernel.
    pub const ISSUE_BLOCK: u64 = 0x6368_0002;
    /// Indirect-dispatch workgroup count fixup kernel.
    pub const WORKGROUP_COUNT_UPDATE: u64 = 0x6368_0003;
    /// Event re-arm kernel (stores 1 to an event signal in queue order).
    pub const EVENT_RESET: u64 = 0x6368_0004;
    /// Fill kernels by element width.
    pub const FILL_X1: u64 = 0x6368_0010;
    /// 2-byte fill.
    pub const FILL_X2: u64 = 0x6368_0011;
    /// 4-byte fill.
    pub const FILL_X4: u64 = 0x6368_0012;
    /// 8-byte fill.
    pub const FILL_X8: u64 = 0x6368_0013;
    /// Copy kernels by element width.
    pub const COPY_X1: u64 = 0x6368_0020;
    /// 2-byte copy.
    pub const COPY_X2: u64 = 0x6368_0021;
    /// 4-byte copy.
    pub const COPY_X4: u64 = 0x6368_0022;
    /// 8-byte copy.
    pub const COPY_X8: u64 = 0x6368_0023;
    /// Wide copy for 64-byte-aligned bulk transfers.
    pub const COPY_X64: u64 = 0x6368_0024;
}

/// Kernels used to implement DMA-like operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlitKernels {
    /// 1-byte pattern fill.
    pub fill_x1: KernelArgs,
    /// 2-byte pattern fill.
    pub fill_x2: KernelArgs,
    /// 4-byte pattern fill.
    pub fill_x4: KernelArgs,
    /// 8-byte pattern fill.
    pub fill_x8: KernelArgs,
    /// Byte copy.
    pub copy_x1: KernelArgs,
    /// 2-byte copy.
    pub copy_x2: KernelArgs,
    /// 4-byte copy.
    pub copy_x4: KernelArgs,
    /// 8-byte copy.
    pub copy_x8: KernelArgs,
    /// 64-byte bulk copy.
    pub copy_x64: KernelArgs,
}

/// Opaque handles used to launch builtin kernels.
///
/// Constant for the lifetime of the program; stored by value wherever they
/// are needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Kernels {
    /// `scheduler_tick` kernel (single work-item).
    pub scheduler_tick: KernelArgs,
    /// `issue_block` kernel (one work-item per command).
    pub issue_block: KernelArgs,
    /// `workgroup_count_update` fixup kernel (single work-item).
    pub workgroup_count_update: KernelArgs,
    /// `event_reset` kernel (single work-item).
    pub event_reset: KernelArgs,
    /// Blit kernel family.
    pub blit: BlitKernels,
}

impl Kernels {
    /// The builtin kernel table with well-known object handles.
    pub fn builtin() -> Self {
        Self {
            scheduler_tick: KernelArgs::single_work_item(kernel_object::SCHEDULER_TICK),
            issue_block: KernelArgs::single_work_item(kernel_object::ISSUE_BLOCK),
            workgroup_count_update: KernelArgs::single_work_item(
                kernel_object::WORKGROUP_COUNT_UPDATE,
            ),
            event_reset: KernelArgs::single_work_item(kernel_object::EVENT_RESET),
            blit: BlitKernels {
                fill_x1: KernelArgs::blit(kernel_object::FILL_X1),
                fill_x2: KernelArgs::blit(kernel_object::FILL_X2),
                fill_x4: KernelArgs::blit(kernel_object::FILL_X4),
                fill_x8: KernelArgs::blit(kernel_object::FILL_X8),
                copy_x1: KernelArgs::blit(kernel_object::COPY_X1),
                copy_x2: KernelArgs::blit(kernel_object::COPY_X2),
                copy_x4: KernelArgs::blit(kernel_object::COPY_X4),
                copy_x8: KernelArgs::blit(kernel_object::COPY_X8),
                copy_x64: KernelArgs::blit(kernel_object::COPY_X64),
            },
        }
    }
}

//===----------------------------------------------------------------------===//
// Kernarg storage
//===----------------------------------------------------------------------===//

/// Size in bytes reserved for control kernel arguments (tick / issue_block).
pub const CONTROL_KERNARG_SIZE: u32 = 8 * 8;
/// Size in bytes of the workgroup-count-update kernarg prefix that precedes
/// an indirect-dynamic dispatch's own kernargs.
pub const WORKGROUP_COUNT_UPDATE_KERNARG_SIZE: u32 = 3 * 8;

/// A kernel argument arena of atomic 64-bit words.
///
/// Parallel issuers write disjoint byte ranges of the same arena, so storage
/// is atomic words with relaxed stores; the dispatch packet publication
/// provides the release edge that makes the arguments visible to the
/// consuming agent. Addresses handed to packets are real addresses of the
/// arena words and remain valid until the owning execution tears down.
pub struct KernargArena {
    words: Box<[AtomicU64]>,
}

impl KernargArena {
    /// Creates an arena with at least `size_bytes` bytes of storage.
    pub fn with_size(size_bytes: u32) -> Self {
        let word_count = (size_bytes as usize).div_ceil(8).max(1);
        let words = (0..word_count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words }
    }

    /// Arena capacity in bytes.
    #[inline]
    pub fn size_bytes(&self) -> u32 {
        (self.words.len() * 8) as u32
    }

    /// Writes a 64-bit argument at an 8-byte-aligned byte offset.
    #[inline]
    pub fn write_u64(&self, byte_offset: u32, value: u64) {
        debug_assert_eq!(byte_offset % 8, 0);
        self.words[(byte_offset / 8) as usize].store_scoped(
            value,
            Ordering::Relaxed,
            MemoryScope::Device,
        );
    }

    /// Writes a 32-bit argument at a 4-byte-aligned byte offset. The
    /// containing word is read-modify-written; constants within one dispatch
    /// are written by the single work-item that owns the range.
    #[inline]
    pub fn write_u32(&self, byte_offset: u32, value: u32) {
        debug_assert_eq!(byte_offset % 4, 0);
        let word = &self.words[(byte_offset / 8) as usize];
        let current = word.load_scoped(Ordering::Relaxed, MemoryScope::Device);
        let merged = if byte_offset % 8 == 0 {
            (current & 0xffff_ffff_0000_0000) | value as u64
        } else {
            (current & 0x0000_0000_ffff_ffff) | ((value as u64) << 32)
        };
        word.store_scoped(merged, Ordering::Relaxed, MemoryScope::Device);
    }

    /// Reads back a 64-bit argument (host/processor side).
    #[inline]
    pub fn read_u64(&self, byte_offset: u32) -> u64 {
        debug_assert_eq!(byte_offset % 8, 0);
        self.words[(byte_offset / 8) as usize].load_scoped(Ordering::Relaxed, MemoryScope::Device)
    }

    /// Address of the argument at `byte_offset` as embedded in packets.
    #[inline]
    pub fn address(&self, byte_offset: u32) -> u64 {
        self.words.as_ptr() as u64 + byte_offset as u64
    }
}
