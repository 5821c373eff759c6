//! Trace ring buffer and dispatch query ring.
//!
//! The trace buffer is a power-of-two byte ring in shared memory. Device
//! writers reserve ranges with a monotonic offset, fill them, and commit in
//! batches; the host drains committed bytes and advances its read offset.
//! Offsets never wrap; addressing masks them against the capacity, and a
//! record straddling the wrap point is written byte-wise so it lands
//! contiguously in the masked image.
//!
//! Offset discipline: `write_reserve_offset >= write_commit_offset >=
//! read_commit_offset`, and the first never outruns the third by more than
//! the capacity.
//!
//! Event records are variable-length with a leading 8-bit discriminator. All
//! timestamps are in the agent tick domain; string literals and source
//! locations travel as host-space pointers that the host translator resolves.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::signal::{SignalHandle, SignalKind, SignalTable};
use crate::support::{yield_now, MemoryScope, ScopedAtomic, ScopedAtomicArith};

/// Query id meaning "no query attached".
pub const INVALID_QUERY_ID: u16 = 0xffff;

/// Pointer into host memory naming an interned string literal.
pub type StringLiteral = u64;
/// Pointer into host memory naming a source location record.
pub type SrcLoc = u64;
/// 0xBBGGRR color for zones and plots; 0 means unspecified.
pub type TraceColor = u32;

//===----------------------------------------------------------------------===//
// Query ring
//===----------------------------------------------------------------------===//

/// Ring of pre-allocated USER signals used to capture dispatch timestamps.
///
/// Blocks acquire a contiguous range of query ids before issue; each command
/// derives its signal from the base id plus a recorded relative id. Released
/// ranges re-arm their signals. Indices are monotonic; the id presented to
/// packets is the masked 16-bit ring position.
pub struct QueryRing {
    signals: Box<[SignalHandle]>,
    table: Arc<SignalTable>,
    write_index: AtomicU64,
    read_index: AtomicU64,
}

impl QueryRing {
    /// Creates a ring of `capacity` (power of two) query signals.
    pub fn new(table: Arc<SignalTable>, capacity: u32) -> Result<Self, crate::signal::SignalError> {
        assert!(capacity.is_power_of_two(), "query ring capacity must be a power of two");
        let base = table.allocate_range(SignalKind::User, capacity)?;
        let signals = (0..capacity as u64)
            .map(|i| SignalHandle::from_raw(base.as_raw() + i))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        for handle in signals.iter() {
            table.store(*handle, 1, Ordering::Relaxed, MemoryScope::System);
        }
        Ok(Self {
            signals,
            table,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
        })
    }

    /// Ring capacity in signals.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.signals.len() as u32
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.signals.len() as u64 - 1
    }

    /// Acquires a contiguous range of `count` queries, returning the base
    /// index. Only the owning scheduler acquires, so a plain bump suffices.
    pub fn acquire(&self, count: u16) -> u64 {
        self.write_index
            .fetch_add_scoped(count as u64, Ordering::Relaxed, MemoryScope::Device)
    }

    /// The 16-bit query id for an absolute index.
    #[inline]
    pub fn query_id(&self, index: u64) -> u16 {
        (index & self.mask()) as u16
    }

    /// The signal capturing timestamps for a query id.
    #[inline]
    pub fn signal_for_id(&self, query_id: u16) -> SignalHandle {
        self.signals[(query_id as u64 & self.mask()) as usize]
    }

    /// Releases `count` queries from the oldest acquired range, re-arming
    /// their signals and clearing captured timestamps.
    pub fn release(&self, count: u16) {
        let base = self
            .read_index
            .fetch_add_scoped(count as u64, Ordering::Relaxed, MemoryScope::Device);
        for i in 0..count as u64 {
            let handle = self.signals[((base + i) & self.mask()) as usize];
            self.table.store(handle, 1, Ordering::Relaxed, MemoryScope::System);
            self.table.clear_timestamps(handle);
        }
    }
}

//===----------------------------------------------------------------------===//
// Event records
//===----------------------------------------------------------------------===//

/// Event discriminator values (first byte of every record).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Begin a nested CPU-side zone.
    ZoneBegin = 0,
    /// End the current zone.
    ZoneEnd = 1,
    /// Attach an i64 value to the current zone.
    ZoneValueI64 = 2,
    /// Attach an interned string to the current zone.
    ZoneValueTextLiteral = 3,
    /// Attach inline text to the current zone.
    ZoneValueTextDynamic = 4,
    /// Configure a plot series.
    PlotConfig = 5,
    /// Append an i64 plot sample.
    PlotValueI64 = 6,
    /// Begin an execution (GPU) zone tied to a query.
    ExecutionZoneBegin = 7,
    /// End an execution zone.
    ExecutionZoneEnd = 8,
    /// Resolve one execution query's captured timestamp.
    ExecutionZoneNotify = 9,
    /// Resolve a batch of execution query timestamps.
    ExecutionZoneNotifyBatch = 10,
    /// Record a dispatch within an execution zone.
    ExecutionZoneDispatch = 11,
    /// Record a device memory allocation.
    MemoryAlloc = 12,
    /// Record a device memory free.
    MemoryFree = 13,
    /// Log an interned message.
    MessageLiteral = 14,
    /// Log inline message text.
    MessageDynamic = 15,
}

impl EventType {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(EventType::ZoneBegin),
            1 => Some(EventType::ZoneEnd),
            2 => Some(EventType::ZoneValueI64),
            3 => Some(EventType::ZoneValueTextLiteral),
            4 => Some(EventType::ZoneValueTextDynamic),
            5 => Some(EventType::PlotConfig),
            6 => Some(EventType::PlotValueI64),
            7 => Some(EventType::ExecutionZoneBegin),
            8 => Some(EventType::ExecutionZoneEnd),
            9 => Some(EventType::ExecutionZoneNotify),
            10 => Some(EventType::ExecutionZoneNotifyBatch),
            11 => Some(EventType::ExecutionZoneDispatch),
            12 => Some(EventType::MemoryAlloc),
            13 => Some(EventType::MemoryFree),
            14 => Some(EventType::MessageLiteral),
            15 => Some(EventType::MessageDynamic),
            _ => None,
        }
    }
}

/// A decoded trace event, as reconstructed by the host translator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// Begin a nested zone.
    ZoneBegin {
        /// Agent timestamp of the begin.
        timestamp: u64,
        /// Source location pointer.
        src_loc: SrcLoc,
    },
    /// End the current zone.
    ZoneEnd {
        /// Agent timestamp of the end.
        timestamp: u64,
    },
    /// Attach an i64 value to the current zone.
    ZoneValueI64 {
        /// The attached value.
        value: i64,
    },
    /// Attach an interned string to the current zone.
    ZoneValueTextLiteral {
        /// Literal pointer.
        literal: StringLiteral,
    },
    /// Attach inline text to the current zone.
    ZoneValueTextDynamic {
        /// The attached bytes.
        text: Vec<u8>,
    },
    /// Configure a plot series.
    PlotConfig {
        /// Plot display type.
        plot_type: u8,
        /// Plot flags.
        flags: u8,
        /// Series color.
        color: TraceColor,
        /// Series name literal.
        name: StringLiteral,
    },
    /// Append an i64 plot sample.
    PlotValueI64 {
        /// Series name literal.
        name: StringLiteral,
        /// Sample timestamp.
        timestamp: u64,
        /// Sample value.
        value: i64,
    },
    /// Begin an execution zone tied to a query.
    ExecutionZoneBegin {
        /// Executor that issued the zone.
        executor_id: u32,
        /// Query capturing the zone timestamps.
        query_id: u16,
        /// Agent timestamp at issue.
        issue_timestamp: u64,
        /// Source location pointer.
        src_loc: SrcLoc,
    },
    /// End an execution zone.
    ExecutionZoneEnd {
        /// Executor that issued the zone.
        executor_id: u32,
        /// Query capturing the zone timestamps.
        query_id: u16,
        /// Agent timestamp at issue.
        issue_timestamp: u64,
    },
    /// Resolve one execution query's captured timestamp.
    ExecutionZoneNotify {
        /// Executor the query belongs to.
        executor_id: u32,
        /// The resolved query.
        query_id: u16,
        /// Captured agent timestamp.
        execution_timestamp: u64,
    },
    /// Resolve a batch of execution query timestamps.
    ExecutionZoneNotifyBatch {
        /// Executor the queries belong to.
        executor_id: u32,
        /// First query id of the batch.
        query_id_base: u16,
        /// Captured `(start_ts, end_ts)` per query.
        timestamps: Vec<(u64, u64)>,
    },
    /// Record a dispatch within an execution zone.
    ExecutionZoneDispatch {
        /// Zone type discriminator (dispatch, fill, copy, ...).
        zone_type: u8,
        /// Executor that issued the dispatch.
        executor_id: u32,
        /// Query capturing the dispatch timestamps.
        query_id: u16,
        /// Export/source location ordinal of the dispatched kernel.
        export_loc: u32,
        /// Issue ordinal within the block.
        issue_ordinal: u32,
    },
    /// Record a device memory allocation.
    MemoryAlloc {
        /// Pool name literal.
        pool: StringLiteral,
        /// Allocation timestamp.
        timestamp: u64,
        /// Allocated address.
        ptr: u64,
        /// Allocated size in bytes.
        size: u64,
    },
    /// Record a device memory free.
    MemoryFree {
        /// Free timestamp.
        timestamp: u64,
        /// Freed address.
        ptr: u64,
    },
    /// Log an interned message.
    MessageLiteral {
        /// Message timestamp.
        timestamp: u64,
        /// Message literal pointer.
        literal: StringLiteral,
    },
    /// Log inline message text.
    MessageDynamic {
        /// Message timestamp.
        timestamp: u64,
        /// Message bytes.
        text: Vec<u8>,
    },
}

//===----------------------------------------------------------------------===//
// Trace buffer
//===----------------------------------------------------------------------===//

/// Writer cursor for one reserved range.
struct Cursor<'a> {
    buffer: &'a TraceBuffer,
    offset: u64,
}

impl Cursor<'_> {
    #[inline]
    fn put_u8(&mut self, value: u8) {
        self.buffer.put_byte(self.offset, value);
        self.offset += 1;
    }

    #[inline]
    fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_le_bytes());
    }

    #[inline]
    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    #[inline]
    fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    #[inline]
    fn put_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.put_u8(*byte);
        }
    }
}

/// Reader cursor over drained committed bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take_u8(&mut self) -> u8 {
        let value = self.bytes[self.offset];
        self.offset += 1;
        value
    }

    fn take_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take_array())
    }

    fn take_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take_array())
    }

    fn take_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take_array())
    }

    fn take_array<const N: usize>(&mut self) -> [u8; N] {
        let mut array = [0u8; N];
        array.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        array
    }

    fn take_vec(&mut self, len: usize) -> Vec<u8> {
        let vec = self.bytes[self.offset..self.offset + len].to_vec();
        self.offset += len;
        vec
    }
}

/// The per-scheduler trace ring buffer.
///
/// Only the owning scheduler writes; only the host reads. A commit makes
/// every reservation made so far visible to the host in one step.
pub struct TraceBuffer {
    data: Box<[AtomicU8]>,
    executor_id: u32,
    write_reserve_offset: CachePadded<AtomicU64>,
    write_commit_offset: CachePadded<AtomicU64>,
    read_commit_offset: CachePadded<AtomicU64>,
    /// Times the reserve path had to spin on a full ring; a growing value
    /// means the host is not draining fast enough.
    overrun_spins: AtomicU64,
    query_ring: QueryRing,
}

impl TraceBuffer {
    /// Creates a trace buffer of `capacity` bytes (power of two) with a
    /// query ring of `query_capacity` signals.
    pub fn new(
        executor_id: u32,
        capacity: u32,
        query_capacity: u32,
        table: Arc<SignalTable>,
    ) -> Result<Arc<Self>, crate::signal::SignalError> {
        assert!(capacity.is_power_of_two(), "trace capacity must be a power of two");
        let data = (0..capacity)
            .map(|_| AtomicU8::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Arc::new(Self {
            data,
            executor_id,
            write_reserve_offset: CachePadded::new(AtomicU64::new(0)),
            write_commit_offset: CachePadded::new(AtomicU64::new(0)),
            read_commit_offset: CachePadded::new(AtomicU64::new(0)),
            overrun_spins: AtomicU64::new(0),
            query_ring: QueryRing::new(table, query_capacity)?,
        }))
    }

    /// Executor id stamped into execution events.
    #[inline]
    pub fn executor_id(&self) -> u32 {
        self.executor_id
    }

    /// The dispatch query ring.
    #[inline]
    pub fn query_ring(&self) -> &QueryRing {
        &self.query_ring
    }

    /// Ring capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.capacity() - 1
    }

    /// Current reserve offset (diagnostics).
    #[inline]
    pub fn write_reserve_offset(&self) -> u64 {
        self.write_reserve_offset
            .load_scoped(Ordering::Relaxed, MemoryScope::Device)
    }

    /// Times the reserve path spun waiting for the host to drain.
    #[inline]
    pub fn trace_overrun_spins(&self) -> u64 {
        self.overrun_spins.load_scoped(Ordering::Relaxed, MemoryScope::Device)
    }

    #[inline]
    fn put_byte(&self, offset: u64, value: u8) {
        self.data[(offset & self.mask()) as usize].store_scoped(
            value,
            Ordering::Relaxed,
            MemoryScope::Device,
        );
    }

    /// Reserves `len` bytes, spinning while the host has not drained enough
    /// of the ring. Only the owning scheduler reserves, so the offset bump
    /// needs device scope only; the drain check is against the host's
    /// system-scope read offset.
    fn reserve_range(&self, len: u64) -> Cursor<'_> {
        let offset = self.write_reserve_offset.fetch_add_scoped(
            len,
            Ordering::Relaxed,
            MemoryScope::Device,
        );
        // WARNING: spins forever if the host never drains. Overrun policy is
        // an open area; see trace_overrun_spins for detection.
        while offset + len
            - self
                .read_commit_offset
                .load_scoped(Ordering::Acquire, MemoryScope::System)
            >= self.capacity()
        {
            self.overrun_spins
                .fetch_add_scoped(1, Ordering::Relaxed, MemoryScope::Device);
            yield_now();
        }
        Cursor { buffer: self, offset }
    }

    /// Publishes all reservations made so far to the host. Returns true if
    /// anything new was committed, in which case the caller posts a trace
    /// flush to the host.
    pub fn commit_range(&self) -> bool {
        let last_reserve_offset = self
            .write_reserve_offset
            .load_scoped(Ordering::Acquire, MemoryScope::Device);
        let last_commit_offset = self.write_commit_offset.swap_scoped(
            last_reserve_offset,
            Ordering::Release,
            MemoryScope::System,
        );
        last_reserve_offset != last_commit_offset
    }

    //===------------------------------------------------------------------===//
    // Instrumentation events
    //===------------------------------------------------------------------===//

    /// Begins a nested zone.
    pub fn zone_begin(&self, src_loc: SrcLoc) {
        let mut cursor = self.reserve_range(17);
        cursor.put_u8(EventType::ZoneBegin as u8);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_u64(src_loc);
    }

    /// Ends the current zone.
    pub fn zone_end(&self) {
        let mut cursor = self.reserve_range(9);
        cursor.put_u8(EventType::ZoneEnd as u8);
        cursor.put_u64(crate::support::timestamp());
    }

    /// Attaches an i64 value to the current zone.
    pub fn zone_value_i64(&self, value: i64) {
        let mut cursor = self.reserve_range(9);
        cursor.put_u8(EventType::ZoneValueI64 as u8);
        cursor.put_u64(value as u64);
    }

    /// Attaches an interned string to the current zone.
    pub fn zone_value_text_literal(&self, literal: StringLiteral) {
        let mut cursor = self.reserve_range(9);
        cursor.put_u8(EventType::ZoneValueTextLiteral as u8);
        cursor.put_u64(literal);
    }

    /// Attaches inline text to the current zone.
    pub fn zone_value_text_dynamic(&self, text: &[u8]) {
        let mut cursor = self.reserve_range(5 + text.len() as u64);
        cursor.put_u8(EventType::ZoneValueTextDynamic as u8);
        cursor.put_u32(text.len() as u32);
        cursor.put_bytes(text);
    }

    /// Configures a plot series.
    pub fn plot_config(&self, name: StringLiteral, plot_type: u8, flags: u8, color: TraceColor) {
        let mut cursor = self.reserve_range(15);
        cursor.put_u8(EventType::PlotConfig as u8);
        cursor.put_u8(plot_type);
        cursor.put_u8(flags);
        cursor.put_u32(color);
        cursor.put_u64(name);
    }

    /// Appends an i64 plot sample.
    pub fn plot_value_i64(&self, name: StringLiteral, value: i64) {
        let mut cursor = self.reserve_range(25);
        cursor.put_u8(EventType::PlotValueI64 as u8);
        cursor.put_u64(name);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_u64(value as u64);
    }

    /// Begins an execution zone; returns the query signal to attach to the
    /// zone's packet so the processor captures its timestamps.
    pub fn execution_zone_begin(&self, query_id: u16, src_loc: SrcLoc) -> SignalHandle {
        let mut cursor = self.reserve_range(23);
        cursor.put_u8(EventType::ExecutionZoneBegin as u8);
        cursor.put_u32(self.executor_id);
        cursor.put_u16(query_id);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_u64(src_loc);
        self.query_ring.signal_for_id(query_id)
    }

    /// Ends an execution zone; returns the query signal for the end packet.
    pub fn execution_zone_end(&self, query_id: u16) -> SignalHandle {
        let mut cursor = self.reserve_range(15);
        cursor.put_u8(EventType::ExecutionZoneEnd as u8);
        cursor.put_u32(self.executor_id);
        cursor.put_u16(query_id);
        cursor.put_u64(crate::support::timestamp());
        self.query_ring.signal_for_id(query_id)
    }

    /// Resolves one execution query's captured timestamp.
    pub fn execution_zone_notify(&self, query_id: u16, execution_timestamp: u64) {
        let mut cursor = self.reserve_range(15);
        cursor.put_u8(EventType::ExecutionZoneNotify as u8);
        cursor.put_u32(self.executor_id);
        cursor.put_u16(query_id);
        cursor.put_u64(execution_timestamp);
    }

    /// Resolves a batch of execution query timestamps read back from the
    /// query signals.
    pub fn execution_zone_notify_batch(&self, query_id_base: u16, timestamps: &[(u64, u64)]) {
        let mut cursor = self.reserve_range(9 + timestamps.len() as u64 * 16);
        cursor.put_u8(EventType::ExecutionZoneNotifyBatch as u8);
        cursor.put_u32(self.executor_id);
        cursor.put_u16(query_id_base);
        cursor.put_u16(timestamps.len() as u16);
        for (start_ts, end_ts) in timestamps {
            cursor.put_u64(*start_ts);
            cursor.put_u64(*end_ts);
        }
    }

    /// Records a dispatch within an execution zone; returns the query
    /// signal for the dispatch packet.
    pub fn execution_zone_dispatch(
        &self,
        zone_type: u8,
        query_id: u16,
        export_loc: u32,
        issue_ordinal: u32,
    ) -> SignalHandle {
        let mut cursor = self.reserve_range(16);
        cursor.put_u8(EventType::ExecutionZoneDispatch as u8);
        cursor.put_u8(zone_type);
        cursor.put_u32(self.executor_id);
        cursor.put_u16(query_id);
        cursor.put_u32(export_loc);
        cursor.put_u32(issue_ordinal);
        self.query_ring.signal_for_id(query_id)
    }

    /// Records a device memory allocation.
    pub fn memory_alloc(&self, pool: StringLiteral, ptr: u64, size: u64) {
        let mut cursor = self.reserve_range(33);
        cursor.put_u8(EventType::MemoryAlloc as u8);
        cursor.put_u64(pool);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_u64(ptr);
        cursor.put_u64(size);
    }

    /// Records a device memory free.
    pub fn memory_free(&self, ptr: u64) {
        let mut cursor = self.reserve_range(17);
        cursor.put_u8(EventType::MemoryFree as u8);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_u64(ptr);
    }

    /// Logs an interned message.
    pub fn message_literal(&self, literal: StringLiteral) {
        let mut cursor = self.reserve_range(17);
        cursor.put_u8(EventType::MessageLiteral as u8);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_u64(literal);
    }

    /// Logs inline message text.
    pub fn message_dynamic(&self, text: &[u8]) {
        let mut cursor = self.reserve_range(13 + text.len() as u64);
        cursor.put_u8(EventType::MessageDynamic as u8);
        cursor.put_u32(text.len() as u32);
        cursor.put_u64(crate::support::timestamp());
        cursor.put_bytes(text);
    }

    //===------------------------------------------------------------------===//
    // Host-side drain
    //===------------------------------------------------------------------===//

    /// Drains all committed-but-unread bytes, advancing the read offset.
    /// Host/translator side only.
    pub fn drain_committed(&self) -> Vec<u8> {
        let committed = self
            .write_commit_offset
            .load_scoped(Ordering::Acquire, MemoryScope::System);
        let read = self
            .read_commit_offset
            .load_scoped(Ordering::Relaxed, MemoryScope::System);
        let mut bytes = Vec::with_capacity((committed - read) as usize);
        for offset in read..committed {
            bytes.push(
                self.data[(offset & self.mask()) as usize]
                    .load_scoped(Ordering::Relaxed, MemoryScope::System),
            );
        }
        self.read_commit_offset
            .store_scoped(committed, Ordering::Release, MemoryScope::System);
        bytes
    }

    /// Drains and decodes all committed events. Host/translator side only.
    pub fn drain_events(&self) -> Vec<TraceEvent> {
        Self::decode_events(&self.drain_committed())
    }

    /// Decodes a drained byte stream into events.
    pub fn decode_events(bytes: &[u8]) -> Vec<TraceEvent> {
        let mut reader = Reader { bytes, offset: 0 };
        let mut events = Vec::new();
        while reader.remaining() > 0 {
            let Some(event_type) = EventType::from_raw(reader.take_u8()) else {
                break; // corrupt stream; host reports and resyncs
            };
            events.push(match event_type {
                EventType::ZoneBegin => TraceEvent::ZoneBegin {
                    timestamp: reader.take_u64(),
                    src_loc: reader.take_u64(),
                },
                EventType::ZoneEnd => TraceEvent::ZoneEnd {
                    timestamp: reader.take_u64(),
                },
                EventType::ZoneValueI64 => TraceEvent::ZoneValueI64 {
                    value: reader.take_u64() as i64,
                },
                EventType::ZoneValueTextLiteral => TraceEvent::ZoneValueTextLiteral {
                    literal: reader.take_u64(),
                },
                EventType::ZoneValueTextDynamic => {
                    let len = reader.take_u32() as usize;
                    TraceEvent::ZoneValueTextDynamic {
                        text: reader.take_vec(len),
                    }
                }
                EventType::PlotConfig => TraceEvent::PlotConfig {
                    plot_type: reader.take_u8(),
                    flags: reader.take_u8(),
                    color: reader.take_u32(),
                    name: reader.take_u64(),
                },
                EventType::PlotValueI64 => TraceEvent::PlotValueI64 {
                    name: reader.take_u64(),
                    timestamp: reader.take_u64(),
                    value: reader.take_u64() as i64,
                },
                EventType::ExecutionZoneBegin => TraceEvent::ExecutionZoneBegin {
                    executor_id: reader.take_u32(),
                    query_id: reader.take_u16(),
                    issue_timestamp: reader.take_u64(),
                    src_loc: reader.take_u64(),
                },
                EventType::ExecutionZoneEnd => TraceEvent::ExecutionZoneEnd {
                    executor_id: reader.take_u32(),
                    query_id: reader.take_u16(),
                    issue_timestamp: reader.take_u64(),
                },
                EventType::ExecutionZoneNotify => TraceEvent::ExecutionZoneNotify {
                    executor_id: reader.take_u32(),
                    query_id: reader.take_u16(),
                    execution_timestamp: reader.take_u64(),
                },
                EventType::ExecutionZoneNotifyBatch => {
                    let executor_id = reader.take_u32();
                    let query_id_base = reader.take_u16();
                    let count = reader.take_u16() as usize;
                    let timestamps = (0..count)
                        .map(|_| (reader.take_u64(), reader.take_u64()))
                        .collect();
                    TraceEvent::ExecutionZoneNotifyBatch {
                        executor_id,
                        query_id_base,
                        timestamps,
                    }
                }
                EventType::ExecutionZoneDispatch => TraceEvent::ExecutionZoneDispatch {
                    zone_type: reader.take_u8(),
                    executor_id: reader.take_u32(),
                    query_id: reader.take_u16(),
                    export_loc: reader.take_u32(),
                    issue_ordinal: reader.take_u32(),
                },
                EventType::MemoryAlloc => TraceEvent::MemoryAlloc {
                    pool: reader.take_u64(),
                    timestamp: reader.take_u64(),
                    ptr: reader.take_u64(),
                    size: reader.take_u64(),
                },
                EventType::MemoryFree => TraceEvent::MemoryFree {
                    timestamp: reader.take_u64(),
                    ptr: reader.take_u64(),
                },
                EventType::MessageLiteral => TraceEvent::MessageLiteral {
                    timestamp: reader.take_u64(),
                    literal: reader.take_u64(),
                },
                EventType::MessageDynamic => {
                    let len = reader.take_u32() as usize;
                    let timestamp = reader.take_u64();
                    TraceEvent::MessageDynamic {
                        timestamp,
                        text: reader.take_vec(len),
                    }
                }
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trace(capacity: u32) -> Arc<TraceBuffer> {
        let table = Arc::new(SignalTable::with_capacity(64));
        TraceBuffer::new(7, capacity, 16, table).unwrap()
    }

    #[test]
    fn test_commit_reports_new_data_once() {
        let trace = make_trace(4096);
        assert!(!trace.commit_range());
        trace.zone_begin(0x1234);
        trace.zone_end();
        assert!(trace.commit_range());
        assert!(!trace.commit_range());
    }

    #[test]
    fn test_event_decode_roundtrip() {
        let trace = make_trace(4096);
        trace.zone_begin(0xaaaa);
        trace.zone_value_i64(-5);
        trace.zone_value_text_dynamic(b"charon");
        trace.zone_end();
        trace.plot_config(0xbbbb, 1, 0, 0xff00ff);
        trace.memory_alloc(0xcccc, 0x1000, 256);
        trace.message_literal(0xdddd);
        trace.commit_range();

        let events = trace.drain_events();
        assert_eq!(events.len(), 7);
        assert!(matches!(events[0], TraceEvent::ZoneBegin { src_loc: 0xaaaa, .. }));
        assert_eq!(events[1], TraceEvent::ZoneValueI64 { value: -5 });
        assert_eq!(
            events[2],
            TraceEvent::ZoneValueTextDynamic { text: b"charon".to_vec() }
        );
        assert!(matches!(events[4], TraceEvent::PlotConfig { name: 0xbbbb, .. }));
        assert!(matches!(
            events[5],
            TraceEvent::MemoryAlloc { pool: 0xcccc, ptr: 0x1000, size: 256, .. }
        ));
    }

    #[test]
    fn test_wrap_preserves_payloads() {
        // Capacity 4096 with repeated 320-byte events: after 13+ events the
        // reserve offset passes the capacity but masked reads still
        // reconstruct every payload contiguously.
        let trace = make_trace(4096);
        let payload = [0x5au8; 315];
        for round in 0..20 {
            trace.message_dynamic(&payload); // 13 + 315 = 328 bytes
            assert!(trace.commit_range());
            let events = trace.drain_events();
            assert_eq!(events.len(), 1, "round {round}");
            match &events[0] {
                TraceEvent::MessageDynamic { text, .. } => assert_eq!(text[..], payload[..]),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(trace.write_reserve_offset() > trace.capacity());
    }

    #[test]
    fn test_offset_discipline() {
        let trace = make_trace(4096);
        trace.zone_end();
        trace.commit_range();
        trace.zone_end();
        let reserve = trace.write_reserve_offset();
        let commit = trace
            .write_commit_offset
            .load_scoped(Ordering::Acquire, MemoryScope::System);
        let read = trace
            .read_commit_offset
            .load_scoped(Ordering::Acquire, MemoryScope::System);
        assert!(reserve >= commit);
        assert!(commit >= read);
        assert!(reserve - read <= trace.capacity());
    }

    #[test]
    fn test_query_ring_acquire_release() {
        let table = Arc::new(SignalTable::with_capacity(64));
        let ring = QueryRing::new(Arc::clone(&table), 8).unwrap();
        let base = ring.acquire(4);
        assert_eq!(base, 0);
        let second = ring.acquire(2);
        assert_eq!(second, 4);

        let id = ring.query_id(base + 3);
        let signal = ring.signal_for_id(id);
        assert_eq!(table.load(signal, Ordering::Acquire, MemoryScope::Device), 1);
        table.subtract(signal, 1, Ordering::AcqRel, MemoryScope::Device);
        table.mark_start(signal, 100);
        table.mark_end(signal, 200);

        ring.release(4);
        assert_eq!(table.load(signal, Ordering::Acquire, MemoryScope::Device), 1);
        assert_eq!(table.timestamps(signal), (0, 0));
    }

    #[test]
    fn test_notify_batch_roundtrip() {
        let trace = make_trace(4096);
        trace.execution_zone_notify_batch(3, &[(10, 20), (30, 40)]);
        trace.commit_range();
        let events = trace.drain_events();
        assert_eq!(
            events[0],
            TraceEvent::ExecutionZoneNotifyBatch {
                executor_id: 7,
                query_id_base: 3,
                timestamps: vec![(10, 20), (30, 40)],
            }
        );
    }
}
