//! Queue entries and the epoch-ordered entry lists.
//!
//! An entry is one queue operation submitted by the host or another device.
//! Entries move between the mailbox, the wait list, and the run list; each
//! entry is owned by exactly one list at a time (ownership transfer is the
//! membership model, so the single-list invariant holds by construction).

use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::{AllocationHandle, BufferRef};
use crate::command_buffer::{CommandBuffer, ExecutionFlags};
use crate::semaphore::{Semaphore, SemaphoreOp};
use crate::signal::SignalHandle;

bitflags! {
    /// Flags indicating how queue entries are to be processed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueueEntryFlags: u16 {}
}

/// The operation a queue entry performs.
pub enum QueueOp {
    /// Seeds the scheduler's signal pool with host-allocated signals and
    /// marks the scheduler active. Must be the first entry submitted.
    Initialize {
        /// Handles of the host-allocated signals; must stay valid for the
        /// scheduler's lifetime.
        signals: Vec<SignalHandle>,
    },
    /// Marks the scheduler inactive and releases transient issue storage.
    Deinitialize,
    /// Queue-ordered allocation through the device allocator.
    Alloca {
        /// Pool ordinal to allocate from.
        pool: u32,
        /// Minimum alignment in bytes.
        min_alignment: u32,
        /// Allocation size in bytes.
        allocation_size: u64,
        /// Handle committed when the allocation lands.
        handle: Arc<AllocationHandle>,
    },
    /// Queue-ordered deallocation.
    Dealloca {
        /// Handle cleared by the deallocation.
        handle: Arc<AllocationHandle>,
    },
    /// Fills a buffer with a repeating 1/2/4/8-byte pattern.
    Fill {
        /// Target range.
        target: BufferRef,
        /// Pattern bytes, little-endian.
        pattern: u64,
        /// Pattern length in bytes.
        pattern_length: u8,
    },
    /// Copies between buffers.
    Copy {
        /// Source range.
        source: BufferRef,
        /// Target range.
        target: BufferRef,
    },
    /// Executes a recorded command buffer.
    Execute {
        /// The recording to execute.
        command_buffer: Arc<CommandBuffer>,
        /// Execution behavior flags.
        flags: ExecutionFlags,
        /// Binding table for slot buffer references.
        bindings: Vec<BufferRef>,
        /// Host resource handles released when the execution retires.
        resources: [u64; 4],
    },
    /// Orders prior entries before later ones and advances its signal
    /// semaphores when reached.
    Barrier,
}

impl QueueOp {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            QueueOp::Initialize { .. } => "initialize",
            QueueOp::Deinitialize => "deinitialize",
            QueueOp::Alloca { .. } => "alloca",
            QueueOp::Dealloca { .. } => "dealloca",
            QueueOp::Fill { .. } => "fill",
            QueueOp::Copy { .. } => "copy",
            QueueOp::Execute { .. } => "execute",
            QueueOp::Barrier => "barrier",
        }
    }
}

/// A submitted queue operation with its dependency and completion lists.
pub struct QueueEntry {
    /// Processing flags.
    pub flags: QueueEntryFlags,
    /// Monotonic submission counter assigned when the scheduler drains the
    /// entry from its mailbox; lower epochs issue first.
    pub epoch: u32,
    /// Semaphore payloads that must be reached before the entry may issue.
    pub waits: Vec<SemaphoreOp>,
    /// Semaphore payloads advanced when the entry retires.
    pub signals: Vec<SemaphoreOp>,
    /// The operation itself.
    pub op: QueueOp,
}

impl QueueEntry {
    /// Creates an entry with no dependencies.
    pub fn new(op: QueueOp) -> Self {
        Self {
            flags: QueueEntryFlags::empty(),
            epoch: 0,
            waits: Vec::new(),
            signals: Vec::new(),
            op,
        }
    }

    /// Adds a wait on `semaphore` reaching `payload`.
    pub fn wait_on(mut self, semaphore: &Arc<Semaphore>, payload: u64) -> Self {
        self.waits.push(SemaphoreOp {
            semaphore: Arc::clone(semaphore),
            payload,
        });
        self
    }

    /// Adds a signal advancing `semaphore` to `payload` at retire.
    pub fn signal_to(mut self, semaphore: &Arc<Semaphore>, payload: u64) -> Self {
        self.signals.push(SemaphoreOp {
            semaphore: Arc::clone(semaphore),
            payload,
        });
        self
    }
}

/// A list of queue entries ordered by insertion policy.
///
/// `push_back` treats the list as a plain queue (wait list); `insert_by_epoch`
/// keeps FIFO submission order (run list), placing each entry before the
/// first entry with a greater epoch.
#[derive(Default)]
pub struct EntryList {
    entries: VecDeque<Box<QueueEntry>>,
}

impl EntryList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the list holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends to the tail.
    pub fn push_back(&mut self, entry: Box<QueueEntry>) {
        self.entries.push_back(entry);
    }

    /// Inserts in epoch order, before the first entry with a greater epoch.
    pub fn insert_by_epoch(&mut self, entry: Box<QueueEntry>) {
        let at = self
            .entries
            .iter()
            .position(|existing| existing.epoch > entry.epoch)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
    }

    /// Removes and returns the head entry.
    pub fn pop_front(&mut self) -> Option<Box<QueueEntry>> {
        self.entries.pop_front()
    }

    /// Takes the whole list, leaving it empty.
    pub fn take_all(&mut self) -> VecDeque<Box<QueueEntry>> {
        core::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_epoch(epoch: u32) -> Box<QueueEntry> {
        let mut entry = QueueEntry::new(QueueOp::Barrier);
        entry.epoch = epoch;
        Box::new(entry)
    }

    #[test]
    fn test_insert_by_epoch_keeps_fifo() {
        let mut list = EntryList::new();
        list.insert_by_epoch(entry_with_epoch(5));
        list.insert_by_epoch(entry_with_epoch(1));
        list.insert_by_epoch(entry_with_epoch(3));
        let order: Vec<u32> = core::iter::from_fn(|| list.pop_front())
            .map(|entry| entry.epoch)
            .collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[test]
    fn test_equal_epochs_preserve_insertion_order() {
        // Entries resolved in the same tick share the relative order they
        // were appended in.
        let mut list = EntryList::new();
        let mut first = entry_with_epoch(2);
        first.waits = Vec::new();
        list.insert_by_epoch(first);
        list.insert_by_epoch(entry_with_epoch(2));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_push_back_is_queue_order() {
        let mut list = EntryList::new();
        list.push_back(entry_with_epoch(9));
        list.push_back(entry_with_epoch(1));
        assert_eq!(list.pop_front().unwrap().epoch, 9);
    }
}
