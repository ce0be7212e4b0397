//! Kernel Thread (KTHREAD) implementation
//!
//! KTHREAD is the kernel's representation of a thread. It contains:
//! - Scheduling state (priority, quantum, affinity, state)
//! - Wait state (wait blocks, timeout timer, wait status)
//! - APC state for the original and attached process environments
//! - Suspend and freeze counts with the suspend APC and semaphore
//! - Links onto the process thread list, a ready queue or the reaper
//!   list, and an associated queue object
//!
//! Threads live in the dispatcher database and are named by [`ThreadId`].
//! The waitable side of a thread is a separate dispatcher object
//! ([`KThread::header`]) that is signaled when the thread terminates.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::apc::{ApcId, KApcState};
use super::arena::Handle;
use super::bugcheck::codes;
use super::dispatcher::{
    DispatcherDatabase, DispatcherObject, DispatcherType, KWaitBlock, ObjectBody, ObjectId, ProcessorMode, WaitBlockId,
    WaitKey, WaitReason, WaitStatus, THREAD_WAIT_OBJECTS,
};
use super::error::KeError;
use super::kernel::Kernel;
use super::kpcr::{irql, Kirql};
use super::list::{ListEntry, ListHead};
use super::process::ProcessId;
use super::queue::QueueEntry;
use super::timer::KTimer;
use crate::hal::TrapFrame;

/// Handle to a thread
pub type ThreadId = Handle<KThread>;

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread is initialized but not yet started
    Initialized = 0,
    /// Thread is in a ready queue waiting to run
    Ready = 1,
    /// Thread is currently running on a processor
    Running = 2,
    /// Thread is selected to run next on a processor
    Standby = 3,
    /// Thread has terminated
    Terminated = 4,
    /// Thread is waiting for one or more dispatcher objects
    Waiting = 5,
    /// Ready, but the kernel stack is not resident
    Transition = 6,
    /// Thread is waiting on a gate
    GateWait = 7,
}

/// Scheduling constants (NT compatible)
pub mod constants {
    /// Number of priority levels (0-31)
    pub const MAXIMUM_PRIORITY: usize = 32;
    /// Lowest priority (idle threads only)
    pub const LOW_PRIORITY: i8 = 0;
    /// Start of the real-time band
    pub const LOW_REALTIME_PRIORITY: i8 = 16;
    /// Highest priority
    pub const HIGH_PRIORITY: i8 = 31;
    /// Base priority at or above which waits do not charge quantum
    pub const TIME_CRITICAL_PRIORITY_BOUND: i8 = 14;
    /// Default thread quantum (clock ticks times 3)
    pub const THREAD_QUANTUM: i8 = 6;

    /// Boost for the waiter of a set event
    pub const EVENT_INCREMENT: i8 = 1;
    /// Boost for the waiter of a released semaphore
    pub const SEMAPHORE_INCREMENT: i8 = 1;
    /// Boost for the waiter of a released mutant
    pub const MUTANT_INCREMENT: i8 = 1;
    /// Boost for an alerted thread
    pub const ALERT_INCREMENT: i8 = 2;
    /// Boost for a resumed thread
    pub const RESUME_INCREMENT: i8 = 0;
    /// Boost for the waiter of an expired timer
    pub const TIMER_EXPIRE_INCREMENT: i8 = 0;
    /// Boost for a thread released through a gate
    pub const GATE_INCREMENT: i8 = 1;
}

use constants::*;

/// Kind of I/O operation charged to a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Read = 0,
    Write = 1,
    Other = 2,
}

/// Kernel Thread structure
///
/// This is modeled after Windows NT's KTHREAD structure.
pub struct KThread {
    /// Waitable side of the thread, signaled at termination
    pub header: ObjectId,
    /// Owning process
    pub process: ProcessId,
    /// Client thread id (multiple of 4)
    pub client_id: u32,

    // Scheduling fields
    /// Current thread state
    pub state: ThreadState,
    /// Current priority (0-31, higher = more important)
    pub priority: i8,
    /// Base priority (restored after priority boost expires)
    pub base_priority: i8,
    /// Boost still to be decayed at quantum end
    pub priority_decrement: i8,
    /// Sign of a saturating base priority increment, or 0
    pub saturation: i8,
    /// Remaining quantum
    pub quantum: i8,
    /// Quantum restored at quantum end
    pub quantum_reset: i8,
    /// Processors the thread may run on
    pub affinity: u64,
    /// Affinity last set explicitly
    pub user_affinity: u64,
    /// Preferred processor
    pub ideal_processor: u32,
    /// Processor the thread last ran on or was readied for
    pub next_processor: u32,
    /// Preempted while running; requeued at the head
    pub preempted: bool,

    // Wait support
    /// IRQL the wait was entered at
    pub wait_irql: Kirql,
    /// Processor mode of the wait
    pub wait_mode: ProcessorMode,
    pub wait_reason: WaitReason,
    /// Whether the thread is in an alertable wait
    pub alertable: bool,
    /// Status returned from the last wait
    pub wait_status: WaitStatus,
    /// Entry handed over by a queue insert
    pub wait_entry: Option<QueueEntry>,
    /// Entries claimed by ordinary waits on queue objects, handed out by
    /// the next `remove_queue` on the same queue
    pub claimed_entries: Vec<(ObjectId, QueueEntry)>,
    /// Interrupt time the current wait began
    pub wait_time: u64,
    /// Wait blocks linked for the current wait (timer block excluded)
    pub wait_block_list: Vec<WaitBlockId>,
    /// Built-in wait blocks for waits on up to three objects
    pub wait_blocks: [WaitBlockId; THREAD_WAIT_OBJECTS],
    /// Timeout timer
    pub timer: ObjectId,
    /// Wait block linking the thread to its own timer
    pub timer_wait_block: WaitBlockId,
    /// Gate the thread is blocked on
    pub gate_object: Option<ObjectId>,
    /// Processor whose stack swap list holds this thread
    pub swap_list_processor: Option<u32>,

    // List entries
    /// Entry in a ready queue, a processor swap list or the reaper list
    pub wait_list_entry: ListEntry<KThread>,
    /// Entry in the process's thread list
    pub thread_list_entry: ListEntry<KThread>,
    /// Queue object the thread is associated with
    pub queue: Option<ObjectId>,
    /// Entry in the queue's thread list
    pub queue_list_entry: ListEntry<KThread>,
    /// Mutants owned by the thread
    pub mutant_list_head: ListHead<DispatcherObject>,

    // APC support
    /// APC state of the current environment
    pub apc_state: KApcState,
    /// APC state of the original environment while attached
    pub saved_apc_state: KApcState,
    /// 0 when running in the owning process, 1 while attached
    pub apc_state_index: u8,
    /// Whether APCs may be queued (cleared at termination)
    pub apc_queueable: bool,
    /// Normal kernel APCs held off when non-zero (critical regions)
    pub kernel_apc_disable: u32,
    /// All kernel APCs held off when non-zero (guarded regions)
    pub special_apc_disable: u32,
    /// Pending alert per processor mode
    pub alerted: [bool; 2],

    // Suspend support
    pub suspend_count: u8,
    pub freeze_count: u8,
    /// Special kernel APC that blocks the thread while suspended
    pub suspend_apc: ApcId,
    /// Semaphore the suspend APC waits on
    pub suspend_semaphore: ObjectId,

    /// Trap frame handed to APC delivery
    pub trap_frame: Option<TrapFrame>,
    pub kernel_stack_resident: bool,
    /// Context is being saved by a switch in progress
    pub swap_busy: bool,
    /// Stack released by the reaper
    pub reaped: bool,

    // Accounting
    /// Clock ticks charged in kernel mode
    pub kernel_time: u64,
    /// Clock ticks charged in user mode
    pub user_time: u64,
    /// Read, write and other I/O operation counts
    pub io_operations: [u64; 3],
    pub context_switches: u64,
}

impl KThread {
    /// Check if this is a realtime priority thread
    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.priority >= LOW_REALTIME_PRIORITY
    }

    /// APC state for an environment index (0 original, 1 attached)
    pub fn apc_state_for(&self, index: u8) -> &KApcState {
        if index == self.apc_state_index {
            &self.apc_state
        } else {
            &self.saved_apc_state
        }
    }

    pub fn apc_state_for_mut(&mut self, index: u8) -> &mut KApcState {
        if index == self.apc_state_index {
            &mut self.apc_state
        } else {
            &mut self.saved_apc_state
        }
    }

    /// Blocked in a wait or on a gate
    pub fn is_waiting(&self) -> bool {
        matches!(self.state, ThreadState::Waiting | ThreadState::GateWait)
    }
}

impl DispatcherDatabase {
    /// Allocate a thread in `process` with all of its per-thread objects.
    /// The thread is `Initialized` and not yet on the process list.
    pub(crate) fn initialize_thread(&mut self, process: ProcessId) -> ThreadId {
        let client_id = self.allocate_client_id();
        let (base_priority, affinity, quantum, ideal_processor) = {
            let process_record = &mut self.processes[process];
            (
                process_record.base_priority,
                process_record.affinity,
                process_record.quantum_reset,
                process_record.next_ideal_processor(),
            )
        };

        let objects = &mut self.objects;
        let wait_blocks = &mut self.wait_blocks;
        let apcs = &mut self.apcs;

        self.threads.insert_with(|thread| {
            let header = objects.insert(DispatcherObject::new(DispatcherType::Thread, 0, ObjectBody::Thread(thread)));
            let timer = objects.insert(DispatcherObject::new(
                DispatcherType::NotificationTimer,
                0,
                ObjectBody::Timer(KTimer::new()),
            ));
            let suspend_semaphore = objects.insert(DispatcherObject::new(
                DispatcherType::Semaphore,
                0,
                ObjectBody::Semaphore { limit: 2 },
            ));

            let built_in = core::array::from_fn(|_| wait_blocks.insert(KWaitBlock::new(thread, header)));
            let mut timer_block = KWaitBlock::new(thread, timer);
            timer_block.wait_key = WaitKey::Timeout;
            let timer_wait_block = wait_blocks.insert(timer_block);

            let suspend_apc = apcs.insert(super::suspend::suspend_apc(thread));

            KThread {
                header,
                process,
                client_id,
                state: ThreadState::Initialized,
                priority: base_priority,
                base_priority,
                priority_decrement: 0,
                saturation: 0,
                quantum,
                quantum_reset: quantum,
                affinity,
                user_affinity: affinity,
                ideal_processor,
                next_processor: ideal_processor,
                preempted: false,
                wait_irql: irql::PASSIVE_LEVEL,
                wait_mode: ProcessorMode::KernelMode,
                wait_reason: WaitReason::Executive,
                alertable: false,
                wait_status: WaitStatus::SUCCESS,
                wait_entry: None,
                claimed_entries: Vec::new(),
                wait_time: 0,
                wait_block_list: Vec::new(),
                wait_blocks: built_in,
                timer,
                timer_wait_block,
                gate_object: None,
                swap_list_processor: None,
                wait_list_entry: ListEntry::new(),
                thread_list_entry: ListEntry::new(),
                queue: None,
                queue_list_entry: ListEntry::new(),
                mutant_list_head: ListHead::new(),
                apc_state: KApcState::new(process),
                saved_apc_state: KApcState::new(process),
                apc_state_index: 0,
                apc_queueable: true,
                kernel_apc_disable: 0,
                special_apc_disable: 0,
                alerted: [false; 2],
                suspend_count: 0,
                freeze_count: 0,
                suspend_apc,
                suspend_semaphore,
                trap_frame: None,
                kernel_stack_resident: true,
                swap_busy: false,
                reaped: false,
                kernel_time: 0,
                user_time: 0,
                io_operations: [0; 3],
                context_switches: 0,
            }
        })
    }

    /// Link an initialized thread onto its process (KeStartThread)
    pub(crate) fn start_thread(&mut self, thread: ThreadId) {
        let process = self.threads[thread].process;
        let process_record = &mut self.processes[process];
        process_record
            .thread_list_head
            .insert_tail(&mut self.threads, thread, crate::link!(KThread, thread_list_entry));
        process_record.stack_count += 1;
    }
}

impl Kernel {
    /// Create a thread in `process` that runs `start` and then terminates.
    ///
    /// `priority` defaults to the process base priority and `affinity` to
    /// the process affinity. A suspended thread has a suspend count of one
    /// and blocks in its first APC delivery until resumed.
    pub fn create_thread<F>(
        self: &Arc<Self>,
        process: ProcessId,
        start: F,
        priority: Option<i8>,
        affinity: Option<u64>,
        suspended: bool,
    ) -> Result<ThreadId, KeError>
    where
        F: FnOnce(&Arc<Kernel>) + Send + 'static,
    {
        let thread = {
            let mut guard = self.lock_dispatcher();
            let db = &mut *guard;

            let process_affinity = db.processes[process].affinity;
            let affinity = affinity.unwrap_or(process_affinity);
            if affinity == 0 || affinity & !process_affinity != 0 {
                return Err(KeError::InvalidParameter);
            }
            if let Some(priority) = priority {
                if !(1..=HIGH_PRIORITY).contains(&priority) {
                    return Err(KeError::InvalidParameter);
                }
            }

            let thread = db.initialize_thread(process);
            let record = &mut db.threads[thread];
            record.affinity = affinity;
            record.user_affinity = affinity;
            if affinity & (1 << record.ideal_processor) == 0 {
                record.ideal_processor = affinity.trailing_zeros();
                record.next_processor = record.ideal_processor;
            }
            if let Some(priority) = priority {
                record.priority = priority;
                record.base_priority = priority;
            }
            thread
        };

        let kernel = Arc::clone(self);
        self.hal.initialize_context(
            thread,
            alloc::boxed::Box::new(move || {
                kernel.thread_startup();
                start(&kernel);
                kernel.terminate_thread();
            }),
        );

        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        db.start_thread(thread);
        if suspended {
            let record = &mut db.threads[thread];
            record.suspend_count = 1;
            let apc = record.suspend_apc;
            self.ki_insert_queue_apc(db, apc, RESUME_INCREMENT);
        }
        self.ki_ready_thread(db, thread);

        log::debug!("[KE] thread {:?} created in process {:?}", thread, process);
        Ok(thread)
    }

    /// First code on a new thread's context
    pub(crate) fn thread_startup(&self) {
        self.ki_finish_switch();
        self.lower_irql(irql::PASSIVE_LEVEL);
    }

    /// Dispatcher object to wait on to join a thread
    pub fn thread_object(&self, thread: ThreadId) -> ObjectId {
        self.lock_dispatcher().threads[thread].header
    }

    /// Process of the current thread's current APC environment
    pub fn current_process(&self) -> ProcessId {
        let thread = self.current_thread();
        self.lock_dispatcher().threads[thread].apc_state.process
    }

    /// Alert a thread (KeAlertThread). Returns the previous alert state for
    /// `mode`; an alertable wait of `mode` or a more privileged mode is
    /// ended with `Alerted`.
    pub fn alert_thread(&self, thread: ThreadId, mode: ProcessorMode) -> bool {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        self.ki_alert_thread(db, thread, mode)
    }

    pub(crate) fn ki_alert_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId, mode: ProcessorMode) -> bool {
        let record = &mut db.threads[thread];
        let old = record.alerted[mode.index()];
        if !old {
            if record.state == ThreadState::Waiting && record.alertable && mode <= record.wait_mode {
                self.ki_unwait_thread(db, thread, WaitStatus::Alerted, ALERT_INCREMENT);
            } else {
                record.alerted[mode.index()] = true;
            }
        }
        old
    }

    /// Test and clear the current thread's alert for `mode`
    /// (KeTestAlertThread). A user-mode test with user APCs queued marks
    /// user APC delivery pending.
    pub fn test_alert(&self, mode: ProcessorMode) -> bool {
        let thread = self.current_thread();
        let mut guard = self.lock_dispatcher();
        let record = &mut guard.threads[thread];

        if record.alerted[mode.index()] {
            record.alerted[mode.index()] = false;
            true
        } else {
            if mode == ProcessorMode::UserMode && !record.apc_state.apc_list_head[mode.index()].is_empty() {
                record.apc_state.user_apc_pending = true;
            }
            false
        }
    }

    /// Charge an I/O operation to the current thread
    pub fn record_io_operation(&self, operation: IoOperation) {
        let thread = self.current_thread();
        self.lock_dispatcher().threads[thread].io_operations[operation as usize] += 1;
    }

    /// Terminate the current thread (KeTerminateThread). Never returns.
    ///
    /// Queued user APCs are run down, pending kernel APCs delivered, owned
    /// mutants abandoned, and the thread object signaled before the thread
    /// switches away for the last time.
    pub fn terminate_thread(&self) -> ! {
        let thread = self.current_thread();

        let user_apcs = {
            let mut guard = self.lock_dispatcher();
            let db = &mut *guard;
            db.threads[thread].apc_queueable = false;
            self.ki_flush_queue_apc(db, thread, ProcessorMode::UserMode)
        };
        self.ki_rundown_apcs(user_apcs);

        if self.current_irql() == irql::PASSIVE_LEVEL {
            self.request_kernel_apc_delivery();
        }

        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        if let Some(apc) = db.threads[thread].apc_state.apc_list_head[ProcessorMode::KernelMode.index()].first() {
            crate::bugcheck!(
                codes::KERNEL_APC_PENDING_DURING_EXIT,
                apc.to_raw(),
                db.threads[thread].kernel_apc_disable,
                db.threads[thread].special_apc_disable
            );
        }

        self.ki_abandon_mutants(db, thread);

        let process = db.threads[thread].process;
        {
            let record = &db.threads[thread];
            let (kernel_time, user_time, io) = (record.kernel_time, record.user_time, record.io_operations);
            let process_record = &mut db.processes[process];
            process_record.kernel_time += kernel_time;
            process_record.user_time += user_time;
            for (total, count) in process_record.io_operations.iter_mut().zip(io) {
                *total += count;
            }
        }

        if db.reaper_list_head.is_empty() {
            self.hal.queue_reaper_work();
        }
        db.reaper_list_head
            .insert_tail(&mut db.threads, thread, crate::link!(KThread, wait_list_entry));

        if let Some(queue) = db.threads[thread].queue.take() {
            db.objects[queue]
                .queue_mut()
                .thread_list_head
                .remove_entry(&mut db.threads, thread, crate::link!(KThread, queue_list_entry));
            self.ki_activate_waiter_queue(db, queue);
        }

        let header = db.threads[thread].header;
        db.objects[header].header.signal_state = 1;
        self.ki_wait_test(db, header, 0);

        let process_record = &mut db.processes[process];
        process_record
            .thread_list_head
            .remove_entry(&mut db.threads, thread, crate::link!(KThread, thread_list_entry));
        if process_record.thread_list_head.is_empty() {
            let process_header = process_record.header;
            db.objects[process_header].header.signal_state = 1;
            self.ki_wait_test(db, process_header, 0);
        }

        let record = &mut db.threads[thread];
        record.state = ThreadState::Terminated;
        record.swap_busy = true;

        let process_record = &mut db.processes[process];
        process_record.stack_count -= 1;
        if process_record.stack_count == 0 && !process_record.thread_list_head.is_empty() {
            self.hal.schedule_process_outswap(process);
        }

        log::debug!("[KE] thread {:?} terminated", thread);

        let processor = self.current_processor();
        let next = self.ki_select_next_thread(db, processor);
        self.ki_context_switch(guard, next);

        crate::bugcheck!(codes::TERMINATED_THREAD_RESUMED, thread.to_raw())
    }

    /// Release the stacks of terminated threads whose final context switch
    /// has completed. Returns the threads reaped in this pass.
    pub fn reap_terminated_threads(&self) -> Vec<ThreadId> {
        let mut reaped = Vec::new();
        {
            let mut guard = self.lock_dispatcher();
            let db = &mut *guard;
            let link = crate::link!(KThread, wait_list_entry);
            let batch = db.config.reaper_batch_size.max(1);

            let mut next = db.reaper_list_head.first();
            while let Some(thread) = next {
                if reaped.len() == batch {
                    break;
                }
                next = ListHead::next(&db.threads, thread, link);
                if db.threads[thread].swap_busy {
                    continue;
                }
                db.reaper_list_head.remove_entry(&mut db.threads, thread, link);
                db.threads[thread].reaped = true;
                reaped.push(thread);
            }

            if !db.reaper_list_head.is_empty() {
                self.hal.queue_reaper_work();
            }
        }

        for &thread in &reaped {
            self.hal.free_kernel_stack(thread);
            log::trace!("[KE] reaped thread {:?}", thread);
        }
        reaped
    }

    /// Remove a reaped thread and its per-thread objects from the
    /// database. Handles to it become stale.
    pub fn delete_thread(&self, thread: ThreadId) -> Result<(), KeError> {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        match db.threads.get(thread) {
            Some(record) if record.state == ThreadState::Terminated && record.reaped => {}
            Some(_) => return Err(KeError::InvalidParameter),
            None => return Err(KeError::InvalidParameter),
        }

        if let Some(record) = db.threads.remove(thread) {
            db.objects.remove(record.header);
            db.objects.remove(record.timer);
            db.objects.remove(record.suspend_semaphore);
            for block in record.wait_blocks {
                db.wait_blocks.remove(block);
            }
            db.wait_blocks.remove(record.timer_wait_block);
            db.apcs.remove(record.suspend_apc);
        }
        Ok(())
    }
}
