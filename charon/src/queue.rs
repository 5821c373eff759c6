//! AQL packet formats and the hardware packet ring.
//!
//! Packets are 64 bytes. The first 16 bits are the header:
//!
//! ```text
//! type[7:0] | barrier[8] | acquire_scope[10:9] | release_scope[12:11] | reserved[15:13]
//! ```
//!
//! A packet whose type is INVALID stalls the packet processor; transitioning
//! the header from INVALID to a typed value is the publication primitive.
//! Producers reserve a range of slots by bumping the write index, write every
//! packet body word, and only then swap the header word with release order.
//! The smallest atomic width on the agent is 32 bits so any header update
//! includes the following 16 bits of the packet (the dispatch `setup` field
//! or the agent-dispatch `type`), which is why the slot API publishes the
//! full first word.
//!
//! The layouts here are bit-exact with the hardware format and must not be
//! rearranged.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::signal::{SignalHandle, SignalTable};
use crate::support::{yield_now, MemoryScope, ScopedAtomic, ScopedAtomicArith};

/// Size in bytes of one AQL packet.
pub const PACKET_SIZE: usize = 64;
/// Number of 32-bit words in one AQL packet.
pub const PACKET_WORDS: usize = PACKET_SIZE / 4;
/// Number of dependent signals a barrier-AND/OR packet can hold.
pub const BARRIER_DEP_COUNT: usize = 5;

/// Errors raised by queue construction and packet decoding.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue sizes must be powers of two so index masking works.
    #[error("queue size {0} is not a power of two")]
    SizeNotPowerOfTwo(u32),
}

//===----------------------------------------------------------------------===//
// Packet header
//===----------------------------------------------------------------------===//

/// Packet type discriminator as processed by the packet processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Handled entirely by the packet processor; varies agent to agent.
    VendorSpecific = 0,
    /// Not yet populated; stalls the packet processor.
    Invalid = 1,
    /// [`KernelDispatchPacket`].
    KernelDispatch = 2,
    /// [`BarrierPacket`] waiting on all dependencies.
    BarrierAnd = 3,
    /// [`AgentDispatchPacket`].
    AgentDispatch = 4,
    /// [`BarrierPacket`] waiting on any dependency.
    BarrierOr = 5,
}

impl PacketType {
    /// Decodes the type from its header field value.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PacketType::VendorSpecific),
            1 => Some(PacketType::Invalid),
            2 => Some(PacketType::KernelDispatch),
            3 => Some(PacketType::BarrierAnd),
            4 => Some(PacketType::AgentDispatch),
            5 => Some(PacketType::BarrierOr),
            _ => None,
        }
    }
}

/// Cache management scope applied by a packet fence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FenceScope {
    /// No cache management; rely on surrounding fences.
    #[default]
    None = 0,
    /// Invalidates I/K/L1. Visible to queues on the same agent only.
    Agent = 1,
    /// Invalidates L1/L2 and flushes L2. Visible to all agents.
    System = 2,
}

impl FenceScope {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => FenceScope::Agent,
            2 => FenceScope::System,
            _ => FenceScope::None,
        }
    }
}

/// Bit offset of the type field within the header.
pub const HEADER_TYPE_SHIFT: u32 = 0;
/// Bit offset of the barrier bit within the header.
pub const HEADER_BARRIER_SHIFT: u32 = 8;
/// Bit offset of the acquire fence scope within the header.
pub const HEADER_ACQUIRE_SCOPE_SHIFT: u32 = 9;
/// Bit offset of the release fence scope within the header.
pub const HEADER_RELEASE_SCOPE_SHIFT: u32 = 11;

/// Forms a 16-bit AQL packet header.
#[inline]
pub fn make_header(
    ty: PacketType,
    barrier: bool,
    acquire_scope: FenceScope,
    release_scope: FenceScope,
) -> u16 {
    ((ty as u16) << HEADER_TYPE_SHIFT)
        | ((barrier as u16) << HEADER_BARRIER_SHIFT)
        | ((acquire_scope as u16) << HEADER_ACQUIRE_SCOPE_SHIFT)
        | ((release_scope as u16) << HEADER_RELEASE_SCOPE_SHIFT)
}

/// The header every slot is initialized to and reset to after consumption.
#[inline]
pub fn invalid_header() -> u16 {
    make_header(PacketType::Invalid, false, FenceScope::None, FenceScope::None)
}

/// Decoded view of a 16-bit packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw packet type field.
    pub ty: u8,
    /// Launch waits for all prior packets in the queue to complete.
    pub barrier: bool,
    /// Memory acquire fence scope.
    pub acquire_scope: FenceScope,
    /// Memory release fence scope.
    pub release_scope: FenceScope,
}

impl PacketHeader {
    /// Decodes a raw 16-bit header.
    #[inline]
    pub fn from_raw(raw: u16) -> Self {
        Self {
            ty: (raw >> HEADER_TYPE_SHIFT) as u8,
            barrier: (raw >> HEADER_BARRIER_SHIFT) & 1 != 0,
            acquire_scope: FenceScope::from_raw(((raw >> HEADER_ACQUIRE_SCOPE_SHIFT) & 0x3) as u8),
            release_scope: FenceScope::from_raw(((raw >> HEADER_RELEASE_SCOPE_SHIFT) & 0x3) as u8),
        }
    }

    /// Packet type, if the raw field holds a known discriminator.
    #[inline]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_raw(self.ty)
    }
}

//===----------------------------------------------------------------------===//
// Packet bodies
//===----------------------------------------------------------------------===//

/// Kernel dispatch packet (64 B).
///
/// The processor launches `grid_size` work-items in `workgroup_size` groups
/// running `kernel_object` with `kernarg_address`, then decrements
/// `completion_signal` by one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelDispatchPacket {
    /// Grid dimension count (1, 2, or 3).
    pub setup: u16,
    /// Work-group size in work-items.
    pub workgroup_size: [u16; 3],
    /// Grid size in work-items.
    pub grid_size: [u32; 3],
    /// Per-work-item private memory bytes.
    pub private_segment_size: u32,
    /// Per-work-group group memory bytes.
    pub group_segment_size: u32,
    /// Opaque kernel object handle.
    pub kernel_object: u64,
    /// Kernel argument buffer address; 16-byte aligned, live until retire.
    pub kernarg_address: u64,
    /// Optional signal decremented when all work-groups complete.
    pub completion_signal: SignalHandle,
}

impl KernelDispatchPacket {
    /// Encodes the packet body into the 16-word slot image. Word 0 carries
    /// only the `setup` field; the header half is written at publish.
    pub fn encode(&self) -> [u32; PACKET_WORDS] {
        let mut w = [0u32; PACKET_WORDS];
        w[0] = (self.setup as u32) << 16;
        w[1] = self.workgroup_size[0] as u32 | ((self.workgroup_size[1] as u32) << 16);
        w[2] = self.workgroup_size[2] as u32; // reserved0 in the high half
        w[3] = self.grid_size[0];
        w[4] = self.grid_size[1];
        w[5] = self.grid_size[2];
        w[6] = self.private_segment_size;
        w[7] = self.group_segment_size;
        w[8] = self.kernel_object as u32;
        w[9] = (self.kernel_object >> 32) as u32;
        w[10] = self.kernarg_address as u32;
        w[11] = (self.kernarg_address >> 32) as u32;
        // w[12..14) reserved2
        w[14] = self.completion_signal.as_raw() as u32;
        w[15] = (self.completion_signal.as_raw() >> 32) as u32;
        w
    }

    /// Decodes a packet body from a slot image.
    pub fn decode(w: &[u32; PACKET_WORDS]) -> Self {
        Self {
            setup: (w[0] >> 16) as u16,
            workgroup_size: [w[1] as u16, (w[1] >> 16) as u16, w[2] as u16],
            grid_size: [w[3], w[4], w[5]],
            private_segment_size: w[6],
            group_segment_size: w[7],
            kernel_object: w[8] as u64 | ((w[9] as u64) << 32),
            kernarg_address: w[10] as u64 | ((w[11] as u64) << 32),
            completion_signal: SignalHandle::from_raw(w[14] as u64 | ((w[15] as u64) << 32)),
        }
    }
}

/// Agent dispatch packet (64 B).
///
/// The consuming agent performs `fns[ty](args)`, stores any result through
/// `return_address`, and decrements `completion_signal` by one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentDispatchPacket {
    /// Agent-defined function discriminator.
    pub ty: u16,
    /// Where the agent stores the return value(s); layout defined by `ty`.
    pub return_address: u64,
    /// Arguments to the dispatch as defined by `ty`.
    pub args: [u64; 4],
    /// Optional signal decremented when the dispatch completes.
    pub completion_signal: SignalHandle,
}

impl AgentDispatchPacket {
    /// Encodes the packet body into the 16-word slot image. Word 0 carries
    /// only the `ty` field; the header half is written at publish.
    pub fn encode(&self) -> [u32; PACKET_WORDS] {
        let mut w = [0u32; PACKET_WORDS];
        w[0] = (self.ty as u32) << 16;
        // w[1] reserved0
        w[2] = self.return_address as u32;
        w[3] = (self.return_address >> 32) as u32;
        for (i, arg) in self.args.iter().enumerate() {
            w[4 + i * 2] = *arg as u32;
            w[5 + i * 2] = (*arg >> 32) as u32;
        }
        // w[12..14) reserved2
        w[14] = self.completion_signal.as_raw() as u32;
        w[15] = (self.completion_signal.as_raw() >> 32) as u32;
        w
    }

    /// Decodes a packet body from a slot image.
    pub fn decode(w: &[u32; PACKET_WORDS]) -> Self {
        let mut args = [0u64; 4];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = w[4 + i * 2] as u64 | ((w[5 + i * 2] as u64) << 32);
        }
        Self {
            ty: (w[0] >> 16) as u16,
            return_address: w[2] as u64 | ((w[3] as u64) << 32),
            args,
            completion_signal: SignalHandle::from_raw(w[14] as u64 | ((w[15] as u64) << 32)),
        }
    }
}

/// Barrier-AND/OR packet body (64 B). The AND form waits until every
/// non-null dependent signal reaches 0; the OR form waits for any one. Both
/// then decrement `completion_signal`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BarrierPacket {
    /// Dependent signals; null handles are ignored.
    pub dep_signals: [SignalHandle; BARRIER_DEP_COUNT],
    /// Optional signal decremented when the barrier is satisfied.
    pub completion_signal: SignalHandle,
}

impl BarrierPacket {
    /// Encodes the packet body into the 16-word slot image.
    pub fn encode(&self) -> [u32; PACKET_WORDS] {
        let mut w = [0u32; PACKET_WORDS];
        for (i, dep) in self.dep_signals.iter().enumerate() {
            w[2 + i * 2] = dep.as_raw() as u32;
            w[3 + i * 2] = (dep.as_raw() >> 32) as u32;
        }
        // w[12..14) reserved2
        w[14] = self.completion_signal.as_raw() as u32;
        w[15] = (self.completion_signal.as_raw() >> 32) as u32;
        w
    }

    /// Decodes a packet body from a slot image.
    pub fn decode(w: &[u32; PACKET_WORDS]) -> Self {
        let mut dep_signals = [SignalHandle::NULL; BARRIER_DEP_COUNT];
        for (i, dep) in dep_signals.iter_mut().enumerate() {
            *dep = SignalHandle::from_raw(w[2 + i * 2] as u64 | ((w[3 + i * 2] as u64) << 32));
        }
        Self {
            dep_signals,
            completion_signal: SignalHandle::from_raw(w[14] as u64 | ((w[15] as u64) << 32)),
        }
    }
}

/// A decoded packet: header plus typed body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AqlPacket {
    /// Packet not yet published.
    Invalid,
    /// Vendor-specific packet; opaque to this runtime.
    VendorSpecific,
    /// Kernel dispatch.
    KernelDispatch(PacketHeader, KernelDispatchPacket),
    /// Agent dispatch.
    AgentDispatch(PacketHeader, AgentDispatchPacket),
    /// Barrier waiting on all dependencies.
    BarrierAnd(PacketHeader, BarrierPacket),
    /// Barrier waiting on any dependency.
    BarrierOr(PacketHeader, BarrierPacket),
}

impl AqlPacket {
    /// Decodes a slot image.
    pub fn decode(w: &[u32; PACKET_WORDS]) -> Self {
        let header = PacketHeader::from_raw(w[0] as u16);
        match header.packet_type() {
            Some(PacketType::KernelDispatch) => {
                AqlPacket::KernelDispatch(header, KernelDispatchPacket::decode(w))
            }
            Some(PacketType::AgentDispatch) => {
                AqlPacket::AgentDispatch(header, AgentDispatchPacket::decode(w))
            }
            Some(PacketType::BarrierAnd) => AqlPacket::BarrierAnd(header, BarrierPacket::decode(w)),
            Some(PacketType::BarrierOr) => AqlPacket::BarrierOr(header, BarrierPacket::decode(w)),
            Some(PacketType::VendorSpecific) => AqlPacket::VendorSpecific,
            _ => AqlPacket::Invalid,
        }
    }
}

//===----------------------------------------------------------------------===//
// Packet slots
//===----------------------------------------------------------------------===//

/// Storage for one packet in a queue ring: sixteen atomic 32-bit words.
///
/// Body words are written with relaxed stores; word 0 (header + the adjacent
/// 16 bits) is only ever written with release order so that a consumer that
/// observes a typed header also observes the complete body.
#[repr(C, align(64))]
pub struct PacketSlot {
    words: [AtomicU32; PACKET_WORDS],
}

impl PacketSlot {
    fn new() -> Self {
        let words = core::array::from_fn(|i| {
            AtomicU32::new(if i == 0 { invalid_header() as u32 } else { 0 })
        });
        Self { words }
    }

    /// Loads the 16-bit header.
    #[inline]
    pub fn header(&self, order: Ordering, scope: MemoryScope) -> PacketHeader {
        PacketHeader::from_raw(self.words[0].load_scoped(order, scope) as u16)
    }

    /// Writes all body words (1..16) of the packet image. Word 0 of the
    /// image contributes only its upper 16 bits, which are stored at publish
    /// alongside the header.
    pub fn write_body(&self, image: &[u32; PACKET_WORDS]) {
        for (word, value) in self.words.iter().zip(image.iter()).skip(1) {
            word.store_scoped(*value, Ordering::Relaxed, MemoryScope::Device);
        }
    }

    /// Publishes the packet: atomically replaces the full first word with
    /// `header` in the low half and `upper` (dispatch `setup` or agent
    /// dispatch `ty`) in the high half, with release order so the processor
    /// observes the body. After this the packet may execute immediately.
    #[inline]
    pub fn publish(&self, header: u16, upper: u16, scope: MemoryScope) {
        let word = header as u32 | ((upper as u32) << 16);
        self.words[0].store_scoped(word, Ordering::Release, scope);
    }

    /// Snapshots the slot image. The header word is loaded with acquire
    /// order first so a typed header implies a coherent body.
    pub fn load(&self, scope: MemoryScope) -> [u32; PACKET_WORDS] {
        let mut image = [0u32; PACKET_WORDS];
        image[0] = self.words[0].load_scoped(Ordering::Acquire, scope);
        for (value, word) in image.iter_mut().zip(self.words.iter()).skip(1) {
            *value = word.load_scoped(Ordering::Relaxed, scope);
        }
        image
    }

    /// Resets the slot to INVALID. Performed by the consumer after the
    /// packet retires and before the read index advances past it.
    pub fn reset(&self) {
        for word in self.words.iter().skip(1) {
            word.store_scoped(0, Ordering::Relaxed, MemoryScope::Device);
        }
        self.words[0].store_scoped(
            invalid_header() as u32,
            Ordering::Release,
            MemoryScope::Device,
        );
    }
}

//===----------------------------------------------------------------------===//
// AQL queue
//===----------------------------------------------------------------------===//

/// Producer model for a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueType {
    /// Multiple producers; doorbell writes of any value wake the processor.
    Multi = 0,
    /// Single producer; doorbell values must increase monotonically.
    Single = 1,
}

/// A power-of-two ring of AQL packets with monotonic read/write indices.
///
/// The write index may exceed the read index by at most `size`; producers
/// spin on capacity. Reserving slots and publishing packets are separate
/// steps: every slot in a reserved range carries an INVALID header until its
/// producer publishes it, and the packet processor stalls on the first
/// INVALID header it reaches. A reservation therefore must always be
/// followed by publication of every reserved slot (invariant: no failure
/// path may interleave them).
pub struct AqlQueue {
    ty: QueueType,
    features: u32,
    id: u64,
    size: u32,
    slots: Box<[PacketSlot]>,
    write_index: CachePadded<AtomicU64>,
    read_index: CachePadded<AtomicU64>,
    doorbell: SignalHandle,
    signals: Arc<SignalTable>,
}

impl AqlQueue {
    /// Creates a queue with `size` packet slots (must be a power of two).
    /// The doorbell signal is allocated from `signals` and bound to the
    /// queue id.
    pub fn new(
        ty: QueueType,
        id: u64,
        size: u32,
        signals: Arc<SignalTable>,
    ) -> Result<Arc<Self>, QueueError> {
        if !size.is_power_of_two() {
            return Err(QueueError::SizeNotPowerOfTwo(size));
        }
        // The host sizes the signal table to cover every queue it creates, so
        // a missing doorbell slot is a setup bug rather than a recoverable
        // condition.
        let doorbell = signals
            .allocate(crate::signal::SignalKind::Doorbell)
            .expect("signal table must cover queue doorbells");
        signals.bind_doorbell(doorbell, id);
        let slots = (0..size).map(|_| PacketSlot::new()).collect::<Vec<_>>();
        Ok(Arc::new(Self {
            ty,
            features: 0,
            id,
            size,
            slots: slots.into_boxed_slice(),
            write_index: CachePadded::new(AtomicU64::new(0)),
            read_index: CachePadded::new(AtomicU64::new(0)),
            doorbell,
            signals,
        }))
    }

    /// Queue identifier, unique for the lifetime of the process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Producer model of the queue.
    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.ty
    }

    /// Feature bits; unknown bits must be ignored.
    #[inline]
    pub fn features(&self) -> u32 {
        self.features
    }

    /// Maximum number of packets the queue can hold.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Index mask (`size - 1`).
    #[inline]
    pub fn mask(&self) -> u64 {
        self.size as u64 - 1
    }

    /// Doorbell signal handle for this queue.
    #[inline]
    pub fn doorbell(&self) -> SignalHandle {
        self.doorbell
    }

    /// Signal table this queue's doorbell lives in.
    #[inline]
    pub fn signals(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    /// Loads the read index (first packet not yet retired).
    #[inline]
    pub fn load_read_index(&self, order: Ordering) -> u64 {
        self.read_index.load_scoped(order, MemoryScope::Device)
    }

    /// Loads the write index (first unreserved slot).
    #[inline]
    pub fn load_write_index(&self, order: Ordering) -> u64 {
        self.write_index.load_scoped(order, MemoryScope::Device)
    }

    /// Reserves `n` slots, returning the prior write index.
    #[inline]
    pub fn add_write_index(&self, n: u64, order: Ordering) -> u64 {
        self.write_index.fetch_add_scoped(n, order, MemoryScope::Device)
    }

    /// Compare-and-swap on the write index, returning the observed value.
    #[inline]
    pub fn cas_write_index(&self, expected: u64, value: u64, order: Ordering) -> u64 {
        self.write_index
            .compare_exchange_scoped(expected, value, order, Ordering::Relaxed, MemoryScope::Device)
            .unwrap_or_else(|prior| prior)
    }

    /// Stores the write index.
    #[inline]
    pub fn store_write_index(&self, value: u64, order: Ordering) {
        self.write_index.store_scoped(value, order, MemoryScope::Device)
    }

    /// Reserves a contiguous range of `n` packet slots, spinning while the
    /// ring lacks capacity. Returns the absolute base index of the range.
    /// Every reserved slot reads INVALID until its producer publishes it.
    pub fn reserve(&self, n: u64) -> u64 {
        debug_assert!(n <= self.size as u64);
        let base = self.add_write_index(n, Ordering::Relaxed);
        while base + n - self.load_read_index(Ordering::Acquire) > self.size as u64 {
            yield_now(); // spinning on ring capacity
        }
        base
    }

    /// Resolves an absolute packet index to its slot.
    #[inline]
    pub fn slot(&self, index: u64) -> &PacketSlot {
        &self.slots[(index & self.mask()) as usize]
    }

    /// Stores `index` to the doorbell signal to wake the packet processor.
    /// The store itself is the wake event, so relaxed order suffices.
    #[inline]
    pub fn ring_doorbell(&self, index: u64) {
        self.signals
            .store(self.doorbell, index as i64, Ordering::Relaxed, MemoryScope::System);
    }

    /// Consumer side: resets the slot at the current read index to INVALID
    /// and advances the read index by one, releasing the capacity to
    /// producers.
    pub fn retire(&self, index: u64) {
        self.slot(index).reset();
        self.read_index
            .store_scoped(index + 1, Ordering::Release, MemoryScope::Device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    fn make_queue(size: u32) -> Arc<AqlQueue> {
        let signals = Arc::new(SignalTable::with_capacity(8));
        AqlQueue::new(QueueType::Multi, 1, size, signals).unwrap()
    }

    #[test]
    fn test_header_bit_layout() {
        let header = make_header(
            PacketType::KernelDispatch,
            true,
            FenceScope::Agent,
            FenceScope::System,
        );
        assert_eq!(header & 0xff, 2);
        assert_eq!((header >> 8) & 1, 1);
        assert_eq!((header >> 9) & 0x3, 1);
        assert_eq!((header >> 11) & 0x3, 2);
        let decoded = PacketHeader::from_raw(header);
        assert_eq!(decoded.packet_type(), Some(PacketType::KernelDispatch));
        assert!(decoded.barrier);
        assert_eq!(decoded.acquire_scope, FenceScope::Agent);
        assert_eq!(decoded.release_scope, FenceScope::System);
    }

    #[test]
    fn test_kernel_dispatch_roundtrip() {
        let packet = KernelDispatchPacket {
            setup: 3,
            workgroup_size: [64, 2, 1],
            grid_size: [1024, 8, 4],
            private_segment_size: 128,
            group_segment_size: 4096,
            kernel_object: 0xdead_beef_cafe_f00d,
            kernarg_address: 0x1000_2000_3000_4000,
            completion_signal: SignalHandle::from_raw(42),
        };
        let image = packet.encode();
        assert_eq!(KernelDispatchPacket::decode(&image), packet);
        // setup occupies the upper half of word 0.
        assert_eq!(image[0] >> 16, 3);
    }

    #[test]
    fn test_agent_dispatch_roundtrip() {
        let packet = AgentDispatchPacket {
            ty: 4,
            return_address: 0x8000_0000,
            args: [1, 2, 3, u64::MAX],
            completion_signal: SignalHandle::NULL,
        };
        assert_eq!(AgentDispatchPacket::decode(&packet.encode()), packet);
    }

    #[test]
    fn test_barrier_roundtrip() {
        let mut packet = BarrierPacket::default();
        packet.dep_signals[0] = SignalHandle::from_raw(7);
        packet.dep_signals[4] = SignalHandle::from_raw(9);
        packet.completion_signal = SignalHandle::from_raw(11);
        assert_eq!(BarrierPacket::decode(&packet.encode()), packet);
    }

    #[test]
    fn test_publish_transitions_invalid_to_typed() {
        let queue = make_queue(4);
        let base = queue.reserve(1);
        let slot = queue.slot(base);
        assert_eq!(
            slot.header(Ordering::Acquire, MemoryScope::Device).packet_type(),
            Some(PacketType::Invalid)
        );
        let packet = BarrierPacket::default();
        slot.write_body(&packet.encode());
        slot.publish(
            make_header(PacketType::BarrierAnd, true, FenceScope::None, FenceScope::None),
            0,
            MemoryScope::Device,
        );
        let image = slot.load(MemoryScope::Device);
        match AqlPacket::decode(&image) {
            AqlPacket::BarrierAnd(header, _) => assert!(header.barrier),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_reserve_wraps_and_respects_capacity() {
        let queue = make_queue(2);
        let a = queue.reserve(1);
        let b = queue.reserve(1);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(queue.load_write_index(Ordering::Relaxed), 2);
        // Retire the first packet on another thread while the producer spins
        // for capacity.
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                queue.retire(0);
            })
        };
        let c = queue.reserve(1);
        assert_eq!(c, 2);
        assert_eq!((c & queue.mask()) as usize, 0); // wrapped to slot 0
        consumer.join().unwrap();
    }

    #[test]
    fn test_cas_write_index() {
        let queue = make_queue(4);
        assert_eq!(queue.cas_write_index(0, 5, Ordering::AcqRel), 0);
        assert_eq!(queue.load_write_index(Ordering::Relaxed), 5);
        // A stale expected value fails and reports the current index.
        assert_eq!(queue.cas_write_index(0, 9, Ordering::AcqRel), 5);
        assert_eq!(queue.load_write_index(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_doorbell_carries_write_index() {
        let queue = make_queue(4);
        let base = queue.reserve(1);
        queue.ring_doorbell(base + 1);
        let value = queue
            .signals()
            .load(queue.doorbell(), Ordering::Acquire, MemoryScope::System);
        assert_eq!(value, 1);
        assert_eq!(
            queue.signals().get(queue.doorbell()).unwrap().kind(),
            Some(SignalKind::Doorbell)
        );
    }
}
