//! Dispatcher Objects (DISPATCHER_HEADER) and the dispatcher database
//!
//! All waitable kernel objects (event, semaphore, mutant, queue, gate,
//! timer, thread, process) share a common [`DispatcherHeader`] so the wait
//! engine can handle them uniformly.
//!
//! Every object, thread, wait block and APC lives in one
//! [`DispatcherDatabase`]. The database is only reachable through a
//! [`DispatcherGuard`], which is returned by `Kernel::lock_dispatcher` and
//! holds both the dispatcher lock and the raised IRQL. Functions that
//! mutate dispatcher state take `&mut DispatcherDatabase`, so they cannot
//! be called without the lock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use spin::MutexGuard;

use super::apc::KApc;
use super::arena::{Arena, Handle};
use super::bugcheck::codes;
use super::kernel::Kernel;
use super::kpcr::{irql, Kirql};
use super::list::{ListEntry, ListHead};
use super::mutex::KMutant;
use super::prcb::KPrcb;
use super::process::{KProcess, ProcessId};
use super::queue::KQueue;
use super::thread::{KThread, ThreadId};
use super::timer::KTimer;
use crate::config::KernelConfig;

/// Handle to any dispatcher object
pub type ObjectId = Handle<DispatcherObject>;

/// Handle to a wait block
pub type WaitBlockId = Handle<KWaitBlock>;

/// Maximum number of objects in a single wait
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

/// Wait blocks built into every thread; larger waits draw from the pool
pub const THREAD_WAIT_OBJECTS: usize = 3;

/// Processor mode (KPROCESSOR_MODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProcessorMode {
    /// Most privileged mode
    KernelMode = 0,
    /// Least privileged mode
    UserMode = 1,
}

impl ProcessorMode {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Object types for dispatcher objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherType {
    /// Manual-reset event
    NotificationEvent = 0,
    /// Auto-reset event
    SynchronizationEvent = 1,
    /// Mutant (recursive mutex with abandonment)
    Mutant = 2,
    /// Counting semaphore
    Semaphore = 3,
    /// Bounded-concurrency work queue
    Queue = 4,
    /// Two-state rendezvous gate
    Gate = 5,
    /// Manual-reset timer
    NotificationTimer = 6,
    /// Auto-reset timer
    SynchronizationTimer = 7,
    /// Thread (signaled at termination)
    Thread = 8,
    /// Process (signaled when its last thread terminates)
    Process = 9,
}

impl DispatcherType {
    /// Does satisfying a wait reset the signal state
    pub const fn is_synchronization(self) -> bool {
        matches!(
            self,
            DispatcherType::SynchronizationEvent | DispatcherType::SynchronizationTimer | DispatcherType::Gate
        )
    }
}

/// Dispatcher object header
///
/// Signal state meaning depends on the type:
/// - events, gates, timers, threads, processes: 0 or 1
/// - semaphores: available count
/// - queues: number of queued entries
/// - mutants: 1 when free, `1 - depth` while owned
pub struct DispatcherHeader {
    pub object_type: DispatcherType,
    pub signal_state: i32,
    /// Wait blocks of threads waiting on this object, FIFO
    pub wait_list_head: ListHead<KWaitBlock>,
}

impl DispatcherHeader {
    pub const fn new(object_type: DispatcherType, signal_state: i32) -> Self {
        Self {
            object_type,
            signal_state,
            wait_list_head: ListHead::new(),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signal_state > 0
    }
}

/// Type-specific part of a dispatcher object
pub enum ObjectBody {
    /// Events and gates carry nothing beyond the header
    Basic,
    Semaphore { limit: i32 },
    Mutant(KMutant),
    Queue(KQueue),
    Timer(KTimer),
    /// Waitable side of a thread
    Thread(ThreadId),
    /// Waitable side of a process
    Process(ProcessId),
}

/// A waitable object: header plus type-specific body
pub struct DispatcherObject {
    pub header: DispatcherHeader,
    pub body: ObjectBody,
    /// Link on the owning thread's mutant list
    pub mutant_list_entry: ListEntry<DispatcherObject>,
}

impl DispatcherObject {
    pub fn new(object_type: DispatcherType, signal_state: i32, body: ObjectBody) -> Self {
        Self {
            header: DispatcherHeader::new(object_type, signal_state),
            body,
            mutant_list_entry: ListEntry::new(),
        }
    }

    pub fn mutant(&self) -> &KMutant {
        match &self.body {
            ObjectBody::Mutant(mutant) => mutant,
            _ => type_mismatch(self.header.object_type),
        }
    }

    pub fn mutant_mut(&mut self) -> &mut KMutant {
        let object_type = self.header.object_type;
        match &mut self.body {
            ObjectBody::Mutant(mutant) => mutant,
            _ => type_mismatch(object_type),
        }
    }

    pub fn queue(&self) -> &KQueue {
        match &self.body {
            ObjectBody::Queue(queue) => queue,
            _ => type_mismatch(self.header.object_type),
        }
    }

    pub fn queue_mut(&mut self) -> &mut KQueue {
        let object_type = self.header.object_type;
        match &mut self.body {
            ObjectBody::Queue(queue) => queue,
            _ => type_mismatch(object_type),
        }
    }

    pub fn timer(&self) -> &KTimer {
        match &self.body {
            ObjectBody::Timer(timer) => timer,
            _ => type_mismatch(self.header.object_type),
        }
    }

    pub fn timer_mut(&mut self) -> &mut KTimer {
        let object_type = self.header.object_type;
        match &mut self.body {
            ObjectBody::Timer(timer) => timer,
            _ => type_mismatch(object_type),
        }
    }

    pub fn semaphore_limit(&self) -> i32 {
        match self.body {
            ObjectBody::Semaphore { limit } => limit,
            _ => type_mismatch(self.header.object_type),
        }
    }

    pub fn expect_type(&self, object_type: DispatcherType) {
        if self.header.object_type != object_type {
            type_mismatch(self.header.object_type)
        }
    }
}

#[cold]
fn type_mismatch(object_type: DispatcherType) -> ! {
    crate::bugcheck!(codes::INVALID_KERNEL_HANDLE, object_type as u8, 0xff)
}

/// Wait type for multiple object waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitType {
    /// Satisfied when every object is available at once
    WaitAll = 0,
    /// Satisfied by the first available object
    WaitAny = 1,
}

/// What a satisfied wait block reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKey {
    /// Index of the object in the caller's array
    Index(u32),
    /// The thread's timeout timer fired
    Timeout,
}

/// Wait block (KWAIT_BLOCK)
///
/// Links one thread to one object for the duration of a wait.
pub struct KWaitBlock {
    /// Link in the object's wait list
    pub wait_list_entry: ListEntry<KWaitBlock>,
    pub thread: ThreadId,
    pub object: ObjectId,
    pub wait_key: WaitKey,
    pub wait_type: WaitType,
    /// Linked by a consumer dequeuing from a queue object
    pub dequeue: bool,
}

impl KWaitBlock {
    pub fn new(thread: ThreadId, object: ObjectId) -> Self {
        Self {
            wait_list_entry: ListEntry::new(),
            thread,
            object,
            wait_key: WaitKey::Index(0),
            wait_type: WaitType::WaitAny,
            dequeue: false,
        }
    }
}

/// Outcome of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Object at this index satisfied the wait (`Object(0)` is success)
    Object(u32),
    /// Acquired an abandoned mutant at this index
    Abandoned(u32),
    /// The timeout expired
    Timeout,
    /// The wait was alerted
    Alerted,
    /// A user APC is pending delivery
    UserApc,
    /// Woken to run a kernel APC; the wait restarts and callers never see it
    KernelApc,
}

impl WaitStatus {
    pub const SUCCESS: WaitStatus = WaitStatus::Object(0);

    pub fn is_success(self) -> bool {
        matches!(self, WaitStatus::Object(_) | WaitStatus::Abandoned(_))
    }

    /// NTSTATUS encoding
    pub fn status(self) -> i32 {
        match self {
            WaitStatus::Object(index) => index as i32,
            WaitStatus::Abandoned(index) => 0x80 + index as i32,
            WaitStatus::Timeout => 0x102,
            WaitStatus::Alerted => 0x101,
            WaitStatus::UserApc => 0xC0,
            WaitStatus::KernelApc => 0x100,
        }
    }
}

/// Why a thread is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitReason {
    /// Executive wait (general purpose)
    Executive = 0,
    /// Waiting for free page
    FreePage = 1,
    /// Waiting for page in
    PageIn = 2,
    /// Waiting on pool allocation
    PoolAllocation = 3,
    /// Waiting for executive resource
    ExecutiveResource = 4,
    /// Suspended
    Suspended = 5,
    /// User request
    UserRequest = 6,
    /// LPC receive
    LpcReceive = 9,
    /// LPC reply
    LpcReply = 10,
    /// Virtual memory
    VirtualMemory = 11,
    /// Page out
    PageOut = 12,
    /// Removing an entry from a queue object
    Queue = 13,
    /// Delay execution
    DelayExecution = 14,
    /// Voluntary yield
    YieldExecution = 15,
    /// Gate wait
    Gate = 16,
}

/// Timeout for a blocking call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Point in system time (100ns units since 1601); follows time changes
    Absolute(u64),
    /// Interval in 100ns units measured on interrupt time; zero polls
    Relative(u64),
}

impl Timeout {
    /// Relative timeout in milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Timeout::Relative(ms * 10_000)
    }

    pub const fn is_zero(self) -> bool {
        matches!(self, Timeout::Relative(0))
    }
}

/// All dispatcher state. Reachable only through [`DispatcherGuard`].
pub struct DispatcherDatabase {
    pub(crate) objects: Arena<DispatcherObject>,
    pub(crate) threads: Arena<KThread>,
    pub(crate) processes: Arena<KProcess>,
    pub(crate) wait_blocks: Arena<KWaitBlock>,
    pub(crate) apcs: Arena<KApc>,
    pub(crate) prcbs: Vec<KPrcb>,
    /// Processors currently running their idle thread
    pub(crate) idle_summary: u64,
    pub(crate) active_processors: u64,
    /// Inserted timers keyed by (interrupt-time due, insertion sequence)
    pub(crate) timer_table: BTreeMap<(u64, u64), ObjectId>,
    pub(crate) timer_sequence: u64,
    /// System time minus interrupt time
    pub(crate) time_bias: i64,
    /// Terminated threads awaiting the reaper
    pub(crate) reaper_list_head: ListHead<KThread>,
    /// Wait blocks allocated beyond the per-thread built-ins
    pub(crate) pool_wait_blocks: usize,
    pub(crate) next_client_id: u32,
    pub(crate) config: KernelConfig,
}

impl DispatcherDatabase {
    pub(crate) fn new(config: KernelConfig, processors: u32) -> Self {
        let active_processors = if processors >= 64 {
            u64::MAX
        } else {
            (1u64 << processors) - 1
        };

        Self {
            objects: Arena::new(),
            threads: Arena::new(),
            processes: Arena::new(),
            wait_blocks: Arena::new(),
            apcs: Arena::new(),
            prcbs: Vec::with_capacity(processors as usize),
            idle_summary: 0,
            active_processors,
            timer_table: BTreeMap::new(),
            timer_sequence: 0,
            time_bias: config.initial_system_time as i64,
            reaper_list_head: ListHead::new(),
            pool_wait_blocks: 0,
            next_client_id: 4,
            config,
        }
    }

    pub fn thread(&self, thread: ThreadId) -> &KThread {
        &self.threads[thread]
    }

    pub fn object(&self, object: ObjectId) -> &DispatcherObject {
        &self.objects[object]
    }

    pub fn process(&self, process: ProcessId) -> &KProcess {
        &self.processes[process]
    }

    pub fn prcb(&self, processor: u32) -> &KPrcb {
        &self.prcbs[processor as usize]
    }

    pub fn processor_count(&self) -> u32 {
        self.prcbs.len() as u32
    }

    /// Threads blocked on an object, in wait list order
    pub fn waiters(&self, object: ObjectId) -> Vec<ThreadId> {
        self.objects[object]
            .header
            .wait_list_head
            .iter(&self.wait_blocks, crate::link!(KWaitBlock, wait_list_entry))
            .map(|block| self.wait_blocks[block].thread)
            .collect()
    }

    pub(crate) fn allocate_client_id(&mut self) -> u32 {
        let id = self.next_client_id;
        self.next_client_id += 4;
        id
    }
}

/// Proof that the dispatcher lock is held
///
/// Dropping the guard releases the lock and lowers IRQL back to where
/// `lock_dispatcher` found it, which is when pending software interrupts
/// (dispatch, APC) get serviced.
pub struct DispatcherGuard<'a> {
    kernel: &'a Kernel,
    guard: Option<MutexGuard<'a, DispatcherDatabase>>,
    lower_to: Option<Kirql>,
    entry_irql: Kirql,
}

impl<'a> DispatcherGuard<'a> {
    pub(crate) fn new(
        kernel: &'a Kernel,
        guard: MutexGuard<'a, DispatcherDatabase>,
        lower_to: Option<Kirql>,
        entry_irql: Kirql,
    ) -> Self {
        Self {
            kernel,
            guard: Some(guard),
            lower_to,
            entry_irql,
        }
    }

    /// IRQL the caller was at before the lock was taken
    pub fn entry_irql(&self) -> Kirql {
        self.entry_irql
    }

    /// Release the lock but stay at SYNCH_LEVEL
    pub fn release_at_synch_level(mut self) {
        self.lower_to = None;
        drop(self.guard.take());
    }
}

impl Deref for DispatcherGuard<'_> {
    type Target = DispatcherDatabase;

    fn deref(&self) -> &DispatcherDatabase {
        match &self.guard {
            Some(guard) => guard,
            None => crate::bugcheck!(codes::IRQL_NOT_LESS_OR_EQUAL, irql::SYNCH_LEVEL),
        }
    }
}

impl DerefMut for DispatcherGuard<'_> {
    fn deref_mut(&mut self) -> &mut DispatcherDatabase {
        match &mut self.guard {
            Some(guard) => guard,
            None => crate::bugcheck!(codes::IRQL_NOT_LESS_OR_EQUAL, irql::SYNCH_LEVEL),
        }
    }
}

impl Drop for DispatcherGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(irql) = self.lower_to.take() {
            self.kernel.lower_irql(irql);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_status_encoding() {
        assert_eq!(WaitStatus::SUCCESS.status(), 0);
        assert_eq!(WaitStatus::Object(2).status(), 2);
        assert_eq!(WaitStatus::Abandoned(1).status(), 0x81);
        assert_eq!(WaitStatus::Timeout.status(), 0x102);
        assert_eq!(WaitStatus::UserApc.status(), 0xC0);
        assert!(WaitStatus::Abandoned(0).is_success());
        assert!(!WaitStatus::Alerted.is_success());
    }

    #[test]
    fn test_synchronization_types() {
        assert!(DispatcherType::SynchronizationEvent.is_synchronization());
        assert!(DispatcherType::Gate.is_synchronization());
        assert!(!DispatcherType::NotificationEvent.is_synchronization());
        assert!(!DispatcherType::Semaphore.is_synchronization());
    }

    #[test]
    fn test_timeout_helpers() {
        assert_eq!(Timeout::from_millis(5), Timeout::Relative(50_000));
        assert!(Timeout::Relative(0).is_zero());
        assert!(!Timeout::Absolute(0).is_zero());
    }

    #[test]
    #[should_panic(expected = "INVALID_KERNEL_HANDLE")]
    fn test_body_type_mismatch() {
        let object = DispatcherObject::new(DispatcherType::NotificationEvent, 0, ObjectBody::Basic);
        let _ = object.queue();
    }
}
