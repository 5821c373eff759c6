//! Test harness: a software packet processor standing in for the hardware
//! command processor, and a host agent draining the post channel.
//!
//! The processor consumes packets in queue order, stalls on INVALID headers,
//! honors the barrier bit trivially (execution is synchronous and in-order),
//! records `start_ts`/`end_ts` on completion signals, decrements them when a
//! packet retires, and executes builtin kernels by their well-known object
//! handles.

#![allow(dead_code)] // each test binary uses a subset of the harness

use std::sync::atomic::Ordering;
use std::sync::Arc;

use charon::buffer::{AllocaOutcome, AllocationHandle, AllocatorError, DeviceAllocator};
use charon::command_buffer::issue::workgroup_count_update;
use charon::host::HostChannel;
use charon::kernels::{kernel_object, Kernels};
use charon::queue::{AqlPacket, AqlQueue, BarrierPacket, KernelDispatchPacket, QueueType};
use charon::scheduler::{QueueEntry, QueueOp, Scheduler, SchedulerOptions};
use charon::signal::{SignalHandle, SignalKind, SignalTable};
use charon::support::{timestamp, MemoryScope};

/// Spin budget before a blocked barrier dependency is declared a deadlock.
const DEP_SPIN_BUDGET: u32 = 1_000_000;

/// Outcome of one processor step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A packet was executed and retired.
    Executed,
    /// The head packet is INVALID; its producer has not published yet.
    Stalled,
    /// The queue is drained.
    Empty,
}

/// Reads `N` u64 kernargs from a packet's kernarg address.
///
/// # Safety contract (test-only)
///
/// Kernarg addresses emplaced by the runtime point at live kernarg arenas
/// owned by the scheduler or an execution state; the publish/acquire pair on
/// the packet header orders the writes before this read.
unsafe fn read_kernargs<const N: usize>(addr: u64) -> [u64; N] {
    let ptr = addr as *const u64;
    let mut args = [0u64; N];
    for (i, arg) in args.iter_mut().enumerate() {
        *arg = unsafe { ptr.add(i).read() };
    }
    args
}

/// A software AQL packet processor for one queue.
pub struct Processor {
    queue: Arc<AqlQueue>,
    signals: Arc<SignalTable>,
    schedulers: Vec<Arc<Scheduler>>,
    /// Every packet processed, in order.
    pub processed: Vec<AqlPacket>,
}

impl Processor {
    pub fn new(
        queue: Arc<AqlQueue>,
        signals: Arc<SignalTable>,
        schedulers: Vec<Arc<Scheduler>>,
    ) -> Self {
        Self {
            queue,
            signals,
            schedulers,
            processed: Vec::new(),
        }
    }

    fn scheduler(&self, id: u64) -> &Arc<Scheduler> {
        self.schedulers
            .iter()
            .find(|scheduler| scheduler.id() as u64 == id)
            .expect("tick kernargs name an unknown scheduler")
    }

    /// Processes the head packet if one is published.
    pub fn step(&mut self) -> Step {
        let read_index = self.queue.load_read_index(Ordering::Acquire);
        let write_index = self.queue.load_write_index(Ordering::Acquire);
        if read_index == write_index {
            return Step::Empty;
        }
        let image = self.queue.slot(read_index).load(MemoryScope::System);
        let packet = AqlPacket::decode(&image);
        match packet {
            AqlPacket::Invalid => return Step::Stalled,
            AqlPacket::BarrierAnd(_, barrier) => self.execute_barrier_and(&barrier),
            AqlPacket::BarrierOr(_, barrier) => self.execute_barrier_or(&barrier),
            AqlPacket::KernelDispatch(_, dispatch) => self.execute_dispatch(&dispatch),
            AqlPacket::AgentDispatch(..) => {
                panic!("agent dispatch on a kernel queue")
            }
            AqlPacket::VendorSpecific => {}
        }
        self.processed.push(packet);
        self.queue.retire(read_index);
        Step::Executed
    }

    /// Drains the backlog present when the call starts, stopping at a
    /// stall. Packets published while draining (a tick re-enqueueing
    /// itself, a branch continuing) wait for the next round so the other
    /// queues get processor time in between. Returns packets executed.
    pub fn run(&mut self) -> usize {
        let limit = self.queue.load_write_index(Ordering::Acquire);
        let mut executed = 0;
        while self.queue.load_read_index(Ordering::Acquire) < limit {
            if self.step() != Step::Executed {
                break;
            }
            executed += 1;
        }
        executed
    }

    fn wait_dep(&self, dep: SignalHandle) {
        let mut budget = DEP_SPIN_BUDGET;
        while self.signals.load(dep, Ordering::Acquire, MemoryScope::System) != 0 {
            budget -= 1;
            assert!(budget > 0, "barrier dependency never satisfied");
            std::thread::yield_now();
        }
    }

    fn complete(&self, signal: SignalHandle) {
        self.signals.mark_end(signal, timestamp());
        self.signals
            .subtract(signal, 1, Ordering::AcqRel, MemoryScope::System);
    }

    fn execute_barrier_and(&self, barrier: &BarrierPacket) {
        self.signals.mark_start(barrier.completion_signal, timestamp());
        for dep in barrier.dep_signals {
            self.wait_dep(dep);
        }
        self.complete(barrier.completion_signal);
    }

    fn execute_barrier_or(&self, barrier: &BarrierPacket) {
        self.signals.mark_start(barrier.completion_signal, timestamp());
        let mut budget = DEP_SPIN_BUDGET;
        loop {
            let satisfied = barrier.dep_signals.iter().any(|dep| {
                dep.is_null()
                    || self.signals.load(*dep, Ordering::Acquire, MemoryScope::System) == 0
            });
            if satisfied {
                break;
            }
            budget -= 1;
            assert!(budget > 0, "barrier-or never satisfied");
            std::thread::yield_now();
        }
        self.complete(barrier.completion_signal);
    }

    fn execute_dispatch(&mut self, dispatch: &KernelDispatchPacket) {
        self.signals.mark_start(dispatch.completion_signal, timestamp());
        match dispatch.kernel_object {
            kernel_object::SCHEDULER_TICK => {
                let [scheduler_id, _reason, _arg] =
                    unsafe { read_kernargs::<3>(dispatch.kernarg_address) };
                self.scheduler(scheduler_id).clone().tick();
            }
            kernel_object::ISSUE_BLOCK => {
                let [execution_id, block_ordinal, base_queue_index, scheduler_id] =
                    unsafe { read_kernargs::<4>(dispatch.kernarg_address) };
                self.scheduler(scheduler_id).clone().issue_block_by_id(
                    execution_id,
                    block_ordinal as u32,
                    base_queue_index,
                );
            }
            kernel_object::WORKGROUP_COUNT_UPDATE => {
                let [workgroups_ptr, packet_index, header_word] =
                    unsafe { read_kernargs::<3>(dispatch.kernarg_address) };
                unsafe {
                    workgroup_count_update(
                        &self.queue,
                        packet_index,
                        workgroups_ptr,
                        header_word as u32,
                    );
                }
            }
            kernel_object::EVENT_RESET => {
                // The raw event signal handle rides in the kernarg field.
                let signal = SignalHandle::from_raw(dispatch.kernarg_address);
                self.signals
                    .store(signal, 1, Ordering::Release, MemoryScope::System);
            }
            _ => {
                // Blit and application kernels have no observable side
                // effects in the harness beyond their completion signal.
            }
        }
        self.complete(dispatch.completion_signal);
    }
}

/// A recorded device→host post.
#[derive(Clone, Debug)]
pub struct HostPost {
    pub call: u16,
    pub return_address: u64,
    pub args: [u64; 4],
}

/// The host runtime thread draining the post channel.
pub struct HostAgent {
    queue: Arc<AqlQueue>,
    signals: Arc<SignalTable>,
    pub posts: Vec<HostPost>,
}

impl HostAgent {
    pub fn new(queue: Arc<AqlQueue>, signals: Arc<SignalTable>) -> Self {
        Self {
            queue,
            signals,
            posts: Vec::new(),
        }
    }

    /// Drains pending posts. Returns the number consumed.
    pub fn run(&mut self) -> usize {
        let mut consumed = 0;
        loop {
            let read_index = self.queue.load_read_index(Ordering::Acquire);
            let write_index = self.queue.load_write_index(Ordering::Acquire);
            if read_index == write_index {
                return consumed;
            }
            let image = self.queue.slot(read_index).load(MemoryScope::System);
            match AqlPacket::decode(&image) {
                AqlPacket::Invalid => return consumed,
                AqlPacket::AgentDispatch(_, packet) => {
                    self.posts.push(HostPost {
                        call: packet.ty,
                        return_address: packet.return_address,
                        args: packet.args,
                    });
                    self.signals.subtract(
                        packet.completion_signal,
                        1,
                        Ordering::AcqRel,
                        MemoryScope::System,
                    );
                }
                other => panic!("unexpected packet on host queue: {other:?}"),
            }
            self.queue.retire(read_index);
            consumed += 1;
        }
    }

    /// Posts recorded for a given call type.
    pub fn posts_of(&self, call: u16) -> Vec<&HostPost> {
        self.posts.iter().filter(|post| post.call == call).collect()
    }
}

//===----------------------------------------------------------------------===//
// Allocator stub
//===----------------------------------------------------------------------===//

/// Minimal device allocator: bump-allocates from a fake address range and
/// optionally forces host growth for every request.
pub struct TestAllocator {
    next: std::sync::atomic::AtomicU64,
    pub force_grow: std::sync::atomic::AtomicBool,
}

impl TestAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: std::sync::atomic::AtomicU64::new(0x1000_0000),
            force_grow: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

impl DeviceAllocator for TestAllocator {
    fn alloca(
        &self,
        pool: u32,
        allocation_size: u64,
        min_alignment: u32,
        handle: &Arc<AllocationHandle>,
    ) -> Result<AllocaOutcome, AllocatorError> {
        if self.force_grow.load(Ordering::Relaxed) {
            return Ok(AllocaOutcome::Grow {
                pool,
                allocation_size,
                allocation_offset: 0,
                min_alignment,
            });
        }
        let align = min_alignment.max(1) as u64;
        let addr = self
            .next
            .fetch_add(allocation_size + align, Ordering::Relaxed)
            .next_multiple_of(align);
        handle.commit(addr);
        Ok(AllocaOutcome::Committed)
    }

    fn dealloca(&self, handle: &Arc<AllocationHandle>) -> Result<AllocaOutcome, AllocatorError> {
        handle.clear();
        Ok(AllocaOutcome::Committed)
    }
}

//===----------------------------------------------------------------------===//
// System harness
//===----------------------------------------------------------------------===//

/// A single-scheduler device with software processors on every queue.
pub struct TestSystem {
    pub signals: Arc<SignalTable>,
    pub scheduler: Arc<Scheduler>,
    pub allocator: Arc<TestAllocator>,
    pub scheduler_processor: Processor,
    pub execution_processor: Processor,
    pub host_agent: HostAgent,
}

impl TestSystem {
    /// Builds and initializes a device: queues, scheduler, and a seeded
    /// signal pool.
    pub fn new() -> Self {
        Self::with_options(SchedulerOptions::default())
    }

    pub fn with_options(options: SchedulerOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let signals = Arc::new(SignalTable::with_capacity(1024));
        let host_queue = AqlQueue::new(QueueType::Multi, 100, 64, Arc::clone(&signals)).unwrap();
        let scheduler_queue =
            AqlQueue::new(QueueType::Single, 101, 64, Arc::clone(&signals)).unwrap();
        let execution_queue =
            AqlQueue::new(QueueType::Single, 102, 256, Arc::clone(&signals)).unwrap();
        let allocator = TestAllocator::new();
        let allocator_dyn: Arc<dyn DeviceAllocator> = allocator.clone();
        let pool_signals: Vec<SignalHandle> = (0..options.signal_pool_capacity)
            .map(|_| signals.allocate(SignalKind::User).unwrap())
            .collect();
        let scheduler = Scheduler::new(
            options,
            Arc::clone(&signals),
            HostChannel::new(Arc::clone(&host_queue)),
            Arc::clone(&scheduler_queue),
            Arc::clone(&execution_queue),
            allocator_dyn,
            Kernels::builtin(),
        )
        .unwrap();

        let mut system = Self {
            scheduler_processor: Processor::new(
                scheduler_queue,
                Arc::clone(&signals),
                vec![Arc::clone(&scheduler)],
            ),
            execution_processor: Processor::new(
                execution_queue,
                Arc::clone(&signals),
                vec![Arc::clone(&scheduler)],
            ),
            host_agent: HostAgent::new(host_queue, Arc::clone(&signals)),
            signals,
            scheduler,
            allocator,
        };
        system
            .scheduler
            .enqueue(QueueEntry::new(QueueOp::Initialize {
                signals: pool_signals,
            }))
            .unwrap();
        system.pump();
        system
    }

    /// Processes every queue until the whole system quiesces.
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let progress = self.execution_processor.run()
                + self.scheduler_processor.run()
                + self.host_agent.run();
            if progress == 0 {
                return;
            }
        }
        panic!("system failed to quiesce");
    }

    /// Packets executed on the execution queue, in order.
    pub fn executed(&self) -> &[AqlPacket] {
        &self.execution_processor.processed
    }
}
