//! Buffer references, queue-ordered allocation handles, and the blit
//! emplacement helpers.
//!
//! Commands never embed raw pointers to transient resources. A
//! [`BufferRef`] names its target indirectly: an absolute device address, a
//! queue-ordered allocation handle that is only valid between the
//! corresponding alloca/dealloca, or a slot in the binding table supplied
//! with an execution. References are resolved at issue time.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::kernels::{KernargArena, KernelArgs, Kernels};
use crate::queue::{
    make_header, AqlQueue, FenceScope, KernelDispatchPacket, PacketType,
};
use crate::signal::SignalHandle;
use crate::support::{MemoryScope, ScopedAtomic};

/// Length value meaning "the remainder of the bound range".
pub const WHOLE_LENGTH: u64 = u64::MAX;

/// Errors raised while resolving buffer references.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BufferError {
    /// A slot reference named a binding-table index that does not exist.
    #[error("binding table slot {slot} out of range ({capacity} slots)")]
    SlotOutOfRange {
        /// The requested slot ordinal.
        slot: u32,
        /// Number of slots in the binding table.
        capacity: u32,
    },
    /// A binding-table entry itself referenced another slot; only one level
    /// of indirection is allowed.
    #[error("binding table slot {slot} contains a nested slot reference")]
    NestedSlot {
        /// The offending slot ordinal.
        slot: u32,
    },
    /// An allocation handle was resolved outside its alloca/dealloca window.
    #[error("allocation handle is not committed")]
    Uncommitted,
    /// A fill pattern length other than 1, 2, 4, or 8 bytes.
    #[error("unsupported fill pattern length {0}")]
    BadPatternLength(u8),
}

/// A queue-ordered allocation handle.
///
/// The host (or the device allocator) populates the address when the
/// allocation commits and clears it at dealloca; resolving the handle
/// outside that window is a recorder error.
#[derive(Debug, Default)]
pub struct AllocationHandle {
    ptr: AtomicU64,
}

impl AllocationHandle {
    /// Creates an uncommitted handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commits the handle to a device address.
    #[inline]
    pub fn commit(&self, addr: u64) {
        self.ptr.store_scoped(addr, Ordering::Release, MemoryScope::System);
    }

    /// Clears the handle at dealloca.
    #[inline]
    pub fn clear(&self) {
        self.ptr.store_scoped(0, Ordering::Release, MemoryScope::System);
    }

    /// Loads the committed address, 0 if uncommitted.
    #[inline]
    pub fn load(&self) -> u64 {
        self.ptr.load_scoped(Ordering::Acquire, MemoryScope::System)
    }
}

/// How a buffer reference names its target.
#[derive(Clone, Debug)]
pub enum BufferRefValue {
    /// Absolute device address.
    Ptr(u64),
    /// Queue-ordered allocation handle.
    Handle(Arc<AllocationHandle>),
    /// Slot ordinal in the execution's binding table.
    Slot(u32),
}

/// A subrange of a buffer, resolvable against a binding table.
#[derive(Clone, Debug)]
pub struct BufferRef {
    /// Offset in bytes added to the resolved base (and to the slot's own
    /// offset when indirect).
    pub offset: u64,
    /// Length in bytes, or [`WHOLE_LENGTH`] for the remainder of the
    /// binding.
    pub length: u64,
    /// Target naming.
    pub value: BufferRefValue,
}

impl BufferRef {
    /// A direct reference to `length` bytes at `addr`.
    pub fn ptr(addr: u64, length: u64) -> Self {
        Self {
            offset: 0,
            length,
            value: BufferRefValue::Ptr(addr),
        }
    }

    /// A reference through an allocation handle.
    pub fn handle(handle: Arc<AllocationHandle>, offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            value: BufferRefValue::Handle(handle),
        }
    }

    /// A reference to a binding-table slot.
    pub fn slot(slot: u32, offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            value: BufferRefValue::Slot(slot),
        }
    }

    /// Resolves to an absolute `(address, length)` pair.
    ///
    /// Slot references fold their offset into the binding's and inherit the
    /// binding's remaining length when this reference uses
    /// [`WHOLE_LENGTH`]. Bindings may not themselves be slot references.
    pub fn resolve(&self, binding_table: &[BufferRef]) -> Result<(u64, u64), BufferError> {
        match &self.value {
            BufferRefValue::Ptr(addr) => Ok((addr + self.offset, self.length)),
            BufferRefValue::Handle(handle) => {
                let base = handle.load();
                if base == 0 {
                    return Err(BufferError::Uncommitted);
                }
                Ok((base + self.offset, self.length))
            }
            BufferRefValue::Slot(slot) => {
                let binding = binding_table.get(*slot as usize).ok_or(
                    BufferError::SlotOutOfRange {
                        slot: *slot,
                        capacity: binding_table.len() as u32,
                    },
                )?;
                let length = if self.length == WHOLE_LENGTH {
                    binding.length.saturating_sub(self.offset)
                } else {
                    self.length
                };
                let (base, _) = match &binding.value {
                    BufferRefValue::Slot(_) => {
                        return Err(BufferError::NestedSlot { slot: *slot })
                    }
                    _ => binding.resolve(&[])?,
                };
                Ok((base + self.offset, length))
            }
        }
    }
}

/// Size-optimized reference to a `u32[3]` workgroup count buffer. The length
/// is a constant 12 bytes so only offset and target naming are carried.
#[derive(Clone, Debug)]
pub struct WorkgroupCountRef {
    /// Offset in bytes into the referenced buffer.
    pub offset: u64,
    /// Target naming.
    pub value: BufferRefValue,
}

impl WorkgroupCountRef {
    /// Resolves to the absolute address of the `u32[3]`.
    pub fn resolve(&self, binding_table: &[BufferRef]) -> Result<u64, BufferError> {
        let as_ref = BufferRef {
            offset: self.offset,
            length: 12,
            value: self.value.clone(),
        };
        as_ref.resolve(binding_table).map(|(addr, _)| addr)
    }
}

//===----------------------------------------------------------------------===//
// Device allocator interface
//===----------------------------------------------------------------------===//

/// Outcome of an alloca/dealloca request against the device allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocaOutcome {
    /// The request completed device-locally; the handle is up to date.
    Committed,
    /// The device pool needs the host: the scheduler posts a POOL_GROW with
    /// these arguments and parks the entry until the handle commits.
    Grow {
        /// Pool ordinal to grow.
        pool: u32,
        /// Bytes the grown block must cover.
        allocation_size: u64,
        /// Offset into the grown block reserved for this allocation.
        allocation_offset: u32,
        /// Minimum alignment of the allocation.
        min_alignment: u32,
    },
    /// The device pool can release backing storage: the scheduler posts an
    /// advisory POOL_TRIM.
    Trim {
        /// Pool ordinal to trim.
        pool: u32,
    },
}

/// Errors raised by the device allocator.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocatorError {
    /// The pool cannot satisfy the request even with host growth.
    #[error("device pool {pool} exhausted ({requested} bytes requested)")]
    Exhausted {
        /// Pool ordinal.
        pool: u32,
        /// Requested size in bytes.
        requested: u64,
    },
    /// The pool ordinal does not exist.
    #[error("unknown device pool {0}")]
    UnknownPool(u32),
}

/// The alloca/dealloca interface the scheduler consumes.
///
/// Pool bookkeeping lives behind this trait; growth and trimming are
/// delegated to the host via the post channel using the outcomes above.
pub trait DeviceAllocator: Send + Sync {
    /// Services an alloca request, committing `handle` on success.
    fn alloca(
        &self,
        pool: u32,
        allocation_size: u64,
        min_alignment: u32,
        handle: &Arc<AllocationHandle>,
    ) -> Result<AllocaOutcome, AllocatorError>;

    /// Services a dealloca request, clearing `handle`.
    fn dealloca(&self, handle: &Arc<AllocationHandle>) -> Result<AllocaOutcome, AllocatorError>;
}

//===----------------------------------------------------------------------===//
// Blit emplacement
//===----------------------------------------------------------------------===//

/// Selects the fill kernel for a pattern length.
pub fn select_fill_kernel(kernels: &Kernels, pattern_length: u8) -> Result<KernelArgs, BufferError> {
    match pattern_length {
        1 => Ok(kernels.blit.fill_x1),
        2 => Ok(kernels.blit.fill_x2),
        4 => Ok(kernels.blit.fill_x4),
        8 => Ok(kernels.blit.fill_x8),
        other => Err(BufferError::BadPatternLength(other)),
    }
}

/// Selects the copy kernel for the common alignment of source, target, and
/// length, and returns it with the element width it moves per work-item.
pub fn select_copy_kernel(kernels: &Kernels, source: u64, target: u64, length: u64) -> (KernelArgs, u64) {
    let alignment = source | target | length;
    if alignment % 64 == 0 {
        (kernels.blit.copy_x64, 64)
    } else if alignment % 8 == 0 {
        (kernels.blit.copy_x8, 8)
    } else if alignment % 4 == 0 {
        (kernels.blit.copy_x4, 4)
    } else if alignment % 2 == 0 {
        (kernels.blit.copy_x2, 2)
    } else {
        (kernels.blit.copy_x1, 1)
    }
}

fn grid_for(elements: u64, workgroup_size: u16) -> [u32; 3] {
    let rounded = elements.div_ceil(workgroup_size as u64) * workgroup_size as u64;
    [rounded.min(u32::MAX as u64) as u32, 1, 1]
}

/// Emplaces a fill dispatch packet at `queue_index` without ringing the
/// doorbell. Kernargs `(target, length, pattern)` are written at
/// `kernarg_offset` of `kernargs`; the packet is published with `header`.
#[allow(clippy::too_many_arguments)]
pub fn emplace_fill(
    queue: &AqlQueue,
    queue_index: u64,
    kernels: &Kernels,
    kernargs: &KernargArena,
    kernarg_offset: u32,
    target: u64,
    length: u64,
    pattern: u64,
    pattern_length: u8,
    barrier: bool,
    acquire_scope: FenceScope,
    release_scope: FenceScope,
    completion_signal: SignalHandle,
) -> Result<(), BufferError> {
    let kernel = select_fill_kernel(kernels, pattern_length)?;

    kernargs.write_u64(kernarg_offset, target);
    kernargs.write_u64(kernarg_offset + 8, length);
    kernargs.write_u64(kernarg_offset + 16, pattern);

    let packet = KernelDispatchPacket {
        setup: kernel.setup,
        workgroup_size: kernel.workgroup_size,
        grid_size: grid_for(length / pattern_length.max(1) as u64, kernel.workgroup_size[0]),
        private_segment_size: kernel.private_segment_size,
        group_segment_size: kernel.group_segment_size,
        kernel_object: kernel.kernel_object,
        kernarg_address: kernargs.address(kernarg_offset),
        completion_signal,
    };
    let slot = queue.slot(queue_index);
    slot.write_body(&packet.encode());
    slot.publish(
        make_header(PacketType::KernelDispatch, barrier, acquire_scope, release_scope),
        packet.setup,
        MemoryScope::Device,
    );
    Ok(())
}

/// Emplaces a copy dispatch packet at `queue_index` without ringing the
/// doorbell. Kernargs are `(source, target, length)`.
#[allow(clippy::too_many_arguments)]
pub fn emplace_copy(
    queue: &AqlQueue,
    queue_index: u64,
    kernels: &Kernels,
    kernargs: &KernargArena,
    kernarg_offset: u32,
    source: u64,
    target: u64,
    length: u64,
    barrier: bool,
    acquire_scope: FenceScope,
    release_scope: FenceScope,
    completion_signal: SignalHandle,
) {
    let (kernel, element_size) = select_copy_kernel(kernels, source, target, length);

    kernargs.write_u64(kernarg_offset, source);
    kernargs.write_u64(kernarg_offset + 8, target);
    kernargs.write_u64(kernarg_offset + 16, length);

    let packet = KernelDispatchPacket {
        setup: kernel.setup,
        workgroup_size: kernel.workgroup_size,
        grid_size: grid_for(length.div_ceil(element_size), kernel.workgroup_size[0]),
        private_segment_size: kernel.private_segment_size,
        group_segment_size: kernel.group_segment_size,
        kernel_object: kernel.kernel_object,
        kernarg_address: kernargs.address(kernarg_offset),
        completion_signal,
    };
    let slot = queue.slot(queue_index);
    slot.write_body(&packet.encode());
    slot.publish(
        make_header(PacketType::KernelDispatch, barrier, acquire_scope, release_scope),
        packet.setup,
        MemoryScope::Device,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::kernel_object;

    #[test]
    fn test_resolve_ptr() {
        let buffer_ref = BufferRef::ptr(0x1000, 256);
        assert_eq!(buffer_ref.resolve(&[]), Ok((0x1000, 256)));
    }

    #[test]
    fn test_resolve_handle() {
        let handle = AllocationHandle::new();
        let buffer_ref = BufferRef::handle(Arc::clone(&handle), 0x10, 64);
        assert_eq!(buffer_ref.resolve(&[]), Err(BufferError::Uncommitted));
        handle.commit(0x2000);
        assert_eq!(buffer_ref.resolve(&[]), Ok((0x2010, 64)));
        handle.clear();
        assert_eq!(buffer_ref.resolve(&[]), Err(BufferError::Uncommitted));
    }

    #[test]
    fn test_resolve_slot_folds_offsets() {
        let table = [BufferRef::ptr(0x4000, 1024)];
        let buffer_ref = BufferRef::slot(0, 0x100, WHOLE_LENGTH);
        let (addr, length) = buffer_ref.resolve(&table).unwrap();
        assert_eq!(addr, 0x4100);
        assert_eq!(length, 1024 - 0x100);
    }

    #[test]
    fn test_resolve_slot_out_of_range() {
        let buffer_ref = BufferRef::slot(3, 0, 16);
        assert_eq!(
            buffer_ref.resolve(&[]),
            Err(BufferError::SlotOutOfRange { slot: 3, capacity: 0 })
        );
    }

    #[test]
    fn test_copy_kernel_selection() {
        let kernels = Kernels::builtin();
        let (k, n) = select_copy_kernel(&kernels, 0x1000, 0x2000, 4096);
        assert_eq!((k.kernel_object, n), (kernel_object::COPY_X64, 64));
        let (k, n) = select_copy_kernel(&kernels, 0x1008, 0x2008, 24);
        assert_eq!((k.kernel_object, n), (kernel_object::COPY_X8, 8));
        let (k, n) = select_copy_kernel(&kernels, 0x1001, 0x2000, 7);
        assert_eq!((k.kernel_object, n), (kernel_object::COPY_X1, 1));
    }

    #[test]
    fn test_fill_kernel_selection() {
        let kernels = Kernels::builtin();
        assert_eq!(
            select_fill_kernel(&kernels, 4).unwrap().kernel_object,
            kernel_object::FILL_X4
        );
        assert_eq!(
            select_fill_kernel(&kernels, 3),
            Err(BufferError::BadPatternLength(3))
        );
    }
}
