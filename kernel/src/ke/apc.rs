//! Asynchronous Procedure Calls (APC)
//!
//! APCs allow code to execute asynchronously in the context of a specific thread.
//! They are queued to a thread and delivered when certain conditions are met.
//!
//! # APC Types
//!
//! - **Kernel APC**: Executes at APC_LEVEL in kernel mode
//!   - Special kernel APCs (no normal routine): run whenever IRQL drops
//!     below APC_LEVEL, unless the thread is in a guarded region
//!   - Normal kernel APCs: kernel routine at APC_LEVEL, then the normal
//!     routine at PASSIVE_LEVEL; held off in critical regions and while
//!     another normal APC is in progress
//!
//! - **User APC**: Delivered one at a time on the way back to user mode,
//!   after an alertable user-mode wait was ended with `UserApc`
//!
//! # Queue order
//!
//! Special APCs queue behind the leading run of special APCs, so they all
//! run before any normal APC; normal APCs queue at the tail. A thread-exit
//! user APC jumps to the head of the user queue.
//!
//! # NT Compatibility
//! Equivalent to NT's KAPC / KeInitializeApc / KeInsertQueueApc /
//! KeRemoveQueueApc / KeFlushQueueApc / KiDeliverApc

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use super::arena::Handle;
use super::bugcheck::{codes, CORRUPT_LIST_ENTRY};
use super::dispatcher::{DispatcherDatabase, ProcessorMode, WaitStatus};
use super::kernel::Kernel;
use super::kpcr::irql;
use super::list::{ListEntry, ListHead};
use super::process::ProcessId;
use super::thread::{ThreadId, ThreadState};
use crate::hal::TrapFrame;

/// Handle to an APC object
pub type ApcId = Handle<KApc>;

/// APC environment (which APC state of the thread an APC targets)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcEnvironment {
    /// The thread's own process
    Original = 0,
    /// The process the thread is attached to
    Attached = 1,
    /// Whichever environment is current when the APC is initialized
    Current = 2,
    /// Whichever environment is current when the APC is inserted
    Insert = 3,
}

/// Kernel routine, called at APC_LEVEL when the APC is delivered.
///
/// It decides whether the normal routine runs, and with what arguments.
pub type KernelRoutine = Arc<dyn Fn(&Kernel, &ApcCall) -> ApcDisposition + Send + Sync>;

/// Normal routine: `(kernel, normal_context, system_argument1, system_argument2)`
pub type NormalRoutine = Arc<dyn Fn(&Kernel, usize, usize, usize) + Send + Sync>;

/// Called instead of delivery for an APC flushed from a terminating thread
pub type RundownRoutine = Arc<dyn Fn(&Kernel, ApcId) + Send + Sync>;

/// What a kernel routine sees of the APC being delivered
pub struct ApcCall {
    pub apc: ApcId,
    pub normal_routine: Option<NormalRoutine>,
    pub normal_context: usize,
    pub system_argument1: usize,
    pub system_argument2: usize,
}

impl ApcCall {
    /// Run the normal routine as queued, if there is one
    pub fn proceed(&self) -> ApcDisposition {
        match &self.normal_routine {
            Some(routine) => ApcDisposition::RunNormal {
                routine: Arc::clone(routine),
                context: self.normal_context,
                argument1: self.system_argument1,
                argument2: self.system_argument2,
            },
            None => ApcDisposition::Suppress,
        }
    }
}

/// Kernel routine verdict
pub enum ApcDisposition {
    /// Call `routine` with these arguments
    RunNormal {
        routine: NormalRoutine,
        context: usize,
        argument1: usize,
        argument2: usize,
    },
    /// Do not call a normal routine
    Suppress,
}

/// Kernel APC object
///
/// Equivalent to NT's KAPC structure
pub struct KApc {
    /// Target thread for this APC
    pub thread: ThreadId,
    /// Entry in the thread's APC queue
    pub apc_list_entry: ListEntry<KApc>,
    pub environment: ApcEnvironment,
    /// APC state the APC is (or will be) queued in
    pub apc_state_index: u8,
    pub apc_mode: ProcessorMode,
    pub kernel_routine: KernelRoutine,
    pub rundown_routine: Option<RundownRoutine>,
    pub normal_routine: Option<NormalRoutine>,
    pub normal_context: usize,
    pub system_argument1: usize,
    pub system_argument2: usize,
    /// Whether this APC is currently inserted in a queue
    pub inserted: bool,
    /// User-mode thread-exit APC, queued ahead of everything else
    pub thread_exit: bool,
}

impl KApc {
    /// Build an APC for `thread` (KeInitializeApc)
    ///
    /// An APC without a normal routine is a special kernel APC whatever
    /// `mode` says. `Current` resolves to the original environment here;
    /// `Kernel::initialize_apc` resolves it against the thread.
    pub fn new(
        thread: ThreadId,
        environment: ApcEnvironment,
        mode: ProcessorMode,
        kernel_routine: KernelRoutine,
        rundown_routine: Option<RundownRoutine>,
        normal_routine: Option<NormalRoutine>,
        normal_context: usize,
    ) -> Self {
        let (apc_mode, normal_context) = match normal_routine {
            Some(_) => (mode, normal_context),
            None => (ProcessorMode::KernelMode, 0),
        };

        Self {
            thread,
            apc_list_entry: ListEntry::new(),
            environment,
            apc_state_index: if environment == ApcEnvironment::Attached { 1 } else { 0 },
            apc_mode,
            kernel_routine,
            rundown_routine,
            normal_routine,
            normal_context,
            system_argument1: 0,
            system_argument2: 0,
            inserted: false,
            thread_exit: false,
        }
    }

    /// Check if this is a special kernel APC (no normal routine)
    #[inline]
    pub fn is_special(&self) -> bool {
        self.normal_routine.is_none()
    }
}

/// APC state stored in each thread, one per environment
pub struct KApcState {
    /// Queued APCs, indexed by processor mode
    pub apc_list_head: [ListHead<KApc>; 2],
    /// Process associated with this APC state
    pub process: ProcessId,
    /// A normal kernel APC's normal routine is running
    pub kernel_apc_in_progress: bool,
    pub kernel_apc_pending: bool,
    pub user_apc_pending: bool,
}

impl KApcState {
    pub const fn new(process: ProcessId) -> Self {
        Self {
            apc_list_head: [ListHead::new(), ListHead::new()],
            process,
            kernel_apc_in_progress: false,
            kernel_apc_pending: false,
            user_apc_pending: false,
        }
    }
}

impl Kernel {
    /// Allocate an APC targeting `thread` (KeInitializeApc)
    pub fn initialize_apc(
        &self,
        thread: ThreadId,
        environment: ApcEnvironment,
        mode: ProcessorMode,
        kernel_routine: KernelRoutine,
        rundown_routine: Option<RundownRoutine>,
        normal_routine: Option<NormalRoutine>,
        normal_context: usize,
    ) -> ApcId {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let mut apc = KApc::new(
            thread,
            environment,
            mode,
            kernel_routine,
            rundown_routine,
            normal_routine,
            normal_context,
        );
        if environment == ApcEnvironment::Current {
            apc.apc_state_index = db.threads[thread].apc_state_index;
        }
        db.apcs.insert(apc)
    }

    /// Mark a user APC as the thread-exit APC
    pub fn set_thread_exit_apc(&self, apc: ApcId) {
        self.lock_dispatcher().apcs[apc].thread_exit = true;
    }

    /// Release an APC that is not queued. Returns false if it is.
    pub fn free_apc(&self, apc: ApcId) -> bool {
        let mut guard = self.lock_dispatcher();
        if guard.apcs[apc].inserted {
            return false;
        }
        guard.apcs.remove(apc);
        true
    }

    /// Queue an APC to its thread (KeInsertQueueApc)
    ///
    /// Returns false if the thread no longer accepts APCs. Inserting an APC
    /// that is already queued bugchecks.
    pub fn insert_queue_apc(&self, apc: ApcId, argument1: usize, argument2: usize, increment: i8) -> bool {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let entry = &mut db.apcs[apc];
        if entry.inserted {
            crate::bugcheck!(
                codes::KERNEL_SECURITY_CHECK_FAILURE,
                CORRUPT_LIST_ENTRY,
                apc.to_raw(),
                entry.thread.to_raw()
            );
        }
        entry.system_argument1 = argument1;
        entry.system_argument2 = argument2;

        self.ki_insert_queue_apc(db, apc, increment)
    }

    /// Link an APC into its thread's queue and arrange delivery
    /// (KiInsertQueueApc). Returns false if it is already queued or the
    /// thread does not accept APCs.
    pub(crate) fn ki_insert_queue_apc(&self, db: &mut DispatcherDatabase, apc: ApcId, increment: i8) -> bool {
        let link = crate::link!(KApc, apc_list_entry);
        let (thread, mode, special, thread_exit) = {
            let entry = &db.apcs[apc];
            (entry.thread, entry.apc_mode, entry.is_special(), entry.thread_exit)
        };

        let record = &db.threads[thread];
        if db.apcs[apc].inserted || !record.apc_queueable {
            return false;
        }
        let index = match db.apcs[apc].environment {
            ApcEnvironment::Insert => record.apc_state_index,
            _ => db.apcs[apc].apc_state_index,
        };
        let entry = &mut db.apcs[apc];
        entry.apc_state_index = index;
        entry.inserted = true;

        let state = db.threads[thread].apc_state_for_mut(index);
        let queue = &mut state.apc_list_head[mode.index()];
        if mode == ProcessorMode::UserMode && thread_exit {
            queue.insert_head(&mut db.apcs, apc, link);
            state.user_apc_pending = true;
        } else if !special {
            queue.insert_tail(&mut db.apcs, apc, link);
        } else {
            let mut last_special = None;
            let mut cursor = queue.first();
            while let Some(queued) = cursor {
                if !db.apcs[queued].is_special() {
                    break;
                }
                last_special = Some(queued);
                cursor = ListHead::next(&db.apcs, queued, link);
            }
            match last_special {
                Some(after) => queue.insert_after(&mut db.apcs, after, apc, link),
                None => queue.insert_head(&mut db.apcs, apc, link),
            }
        }
        ktrace!("[APC] queued {:?} {:?} apc {:?} to {:?}", mode, index, apc, thread);

        // An APC for the other environment waits for attach or detach
        if index != db.threads[thread].apc_state_index {
            return true;
        }

        if mode == ProcessorMode::KernelMode {
            let record = &mut db.threads[thread];
            record.apc_state.kernel_apc_pending = true;

            match record.state {
                ThreadState::Running => {
                    if thread == self.current_thread() {
                        if record.special_apc_disable == 0 {
                            self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
                        }
                    } else {
                        self.request_software_interrupt(irql::APC_LEVEL, record.next_processor);
                    }
                }
                ThreadState::Waiting | ThreadState::GateWait => {
                    let interruptible = record.wait_irql == irql::PASSIVE_LEVEL
                        && record.special_apc_disable == 0
                        && (special || (record.kernel_apc_disable == 0 && !record.apc_state.kernel_apc_in_progress));
                    if interruptible {
                        self.ki_unwait_thread(db, thread, WaitStatus::KernelApc, increment);
                    }
                }
                _ => {}
            }
        } else {
            let record = &mut db.threads[thread];
            if record.state == ThreadState::Waiting
                && record.wait_mode == ProcessorMode::UserMode
                && (record.alertable || record.apc_state.user_apc_pending)
            {
                record.apc_state.user_apc_pending = true;
                self.ki_unwait_thread(db, thread, WaitStatus::UserApc, increment);
            }
        }
        true
    }

    /// Take a queued APC back out (KeRemoveQueueApc). Returns false if it
    /// was not queued.
    pub fn remove_queue_apc(&self, apc: ApcId) -> bool {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let entry = &mut db.apcs[apc];
        if !entry.inserted {
            return false;
        }
        entry.inserted = false;
        let (thread, index, mode) = (entry.thread, entry.apc_state_index, entry.apc_mode);

        let state = db.threads[thread].apc_state_for_mut(index);
        let queue = &mut state.apc_list_head[mode.index()];
        queue.remove_entry(&mut db.apcs, apc, crate::link!(KApc, apc_list_entry));
        if queue.is_empty() {
            match mode {
                ProcessorMode::KernelMode => state.kernel_apc_pending = false,
                ProcessorMode::UserMode => state.user_apc_pending = false,
            }
        }
        true
    }

    /// Empty a thread's APC queue for `mode` in its current environment
    /// (KeFlushQueueApc). The APCs are returned unqueued, in queue order.
    pub fn flush_queue_apc(&self, thread: ThreadId, mode: ProcessorMode) -> Vec<ApcId> {
        let mut guard = self.lock_dispatcher();
        self.ki_flush_queue_apc(&mut guard, thread, mode)
    }

    pub(crate) fn ki_flush_queue_apc(&self, db: &mut DispatcherDatabase, thread: ThreadId, mode: ProcessorMode) -> Vec<ApcId> {
        let link = crate::link!(KApc, apc_list_entry);
        let state = &mut db.threads[thread].apc_state;
        if mode == ProcessorMode::UserMode {
            state.user_apc_pending = false;
        }

        let mut flushed = Vec::new();
        while let Some(apc) = state.apc_list_head[mode.index()].remove_head(&mut db.apcs, link) {
            db.apcs[apc].inserted = false;
            flushed.push(apc);
        }
        flushed
    }

    /// Dispose of flushed APCs: call each rundown routine, or free the APC
    /// when it has none
    pub(crate) fn ki_rundown_apcs(&self, apcs: Vec<ApcId>) {
        for apc in apcs {
            let rundown = self.lock_dispatcher().apcs[apc].rundown_routine.clone();
            match rundown {
                Some(routine) => routine(self, apc),
                None => {
                    self.lock_dispatcher().apcs.remove(apc);
                }
            }
            log::trace!("[APC] ran down {:?}", apc);
        }
    }

    /// Deliver what the current thread may run now (KiDeliverApc)
    ///
    /// Kernel APCs first, as long as the thread is outside a guarded region:
    /// every special APC, and normal APCs while none is in progress and
    /// the thread is outside a critical region. Then, when returning to
    /// user mode, one user APC.
    pub fn deliver_apc(&self, previous_mode: ProcessorMode, trap_frame: Option<TrapFrame>) {
        let thread = self.current_thread();
        let entry_irql = self.raise_irql(irql::APC_LEVEL);
        let link = crate::link!(KApc, apc_list_entry);

        let (process, saved_trap_frame) = {
            let mut guard = self.lock_dispatcher();
            let record = &mut guard.threads[thread];
            record.apc_state.kernel_apc_pending = false;
            (record.apc_state.process, mem::replace(&mut record.trap_frame, trap_frame))
        };

        loop {
            let mut guard = self.lock_dispatcher();
            let db = &mut *guard;

            let record = &db.threads[thread];
            if record.special_apc_disable != 0 {
                break;
            }
            let Some(apc) = record.apc_state.apc_list_head[ProcessorMode::KernelMode.index()].first() else {
                break;
            };
            let special = db.apcs[apc].is_special();
            if !special && (record.apc_state.kernel_apc_in_progress || record.kernel_apc_disable != 0) {
                break;
            }

            db.threads[thread].apc_state.apc_list_head[ProcessorMode::KernelMode.index()].remove_entry(
                &mut db.apcs,
                apc,
                link,
            );
            let (routine, call) = take_call(db, apc);
            drop(guard);

            ktrace!("[APC] delivering kernel apc {:?} to {:?}", apc, thread);
            let disposition = routine(self, &call);
            if special {
                continue;
            }

            if let ApcDisposition::RunNormal {
                routine,
                context,
                argument1,
                argument2,
            } = disposition
            {
                self.lock_dispatcher().threads[thread].apc_state.kernel_apc_in_progress = true;
                self.lower_irql(irql::PASSIVE_LEVEL);
                routine(self, context, argument1, argument2);
                self.raise_irql(irql::APC_LEVEL);
                self.lock_dispatcher().threads[thread].apc_state.kernel_apc_in_progress = false;
            }
        }

        if previous_mode == ProcessorMode::UserMode {
            let user = ProcessorMode::UserMode.index();
            let next = {
                let mut guard = self.lock_dispatcher();
                let db = &mut *guard;
                let state = &mut db.threads[thread].apc_state;
                if state.user_apc_pending {
                    state.user_apc_pending = false;
                    let apc = state.apc_list_head[user].remove_head(&mut db.apcs, link);
                    apc.map(|apc| take_call(db, apc))
                } else {
                    None
                }
            };

            if let Some((routine, call)) = next {
                ktrace!("[APC] delivering user apc {:?} to {:?}", call.apc, thread);
                match routine(self, &call) {
                    ApcDisposition::RunNormal {
                        routine,
                        context,
                        argument1,
                        argument2,
                    } => self
                        .hal
                        .initialize_user_apc(thread, trap_frame, routine, context, argument1, argument2),
                    ApcDisposition::Suppress => {
                        self.test_alert(ProcessorMode::UserMode);
                    }
                }
            }
        }

        {
            let mut guard = self.lock_dispatcher();
            let record = &mut guard.threads[thread];
            record.trap_frame = saved_trap_frame;
            if record.apc_state.process != process {
                crate::bugcheck!(
                    codes::INVALID_PROCESS_ATTACH_ATTEMPT,
                    process.to_raw(),
                    record.apc_state.process.to_raw(),
                    record.apc_state_index,
                    entry_irql
                );
            }
        }
        self.lower_irql(entry_irql);
    }

    /// Run pending kernel APCs now if IRQL allows, otherwise leave them for
    /// the next drop below APC_LEVEL
    pub fn request_kernel_apc_delivery(&self) {
        if self.current_irql() == irql::PASSIVE_LEVEL {
            self.deliver_apc(ProcessorMode::KernelMode, None);
            return;
        }

        let thread = self.current_thread();
        self.lock_dispatcher().threads[thread].apc_state.kernel_apc_pending = true;
        self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
    }

    /// Hold off normal kernel APCs (KeEnterCriticalRegion)
    pub fn enter_critical_region(&self) {
        let thread = self.current_thread();
        self.lock_dispatcher().threads[thread].kernel_apc_disable += 1;
    }

    /// KeLeaveCriticalRegion
    pub fn leave_critical_region(&self) {
        self.leave_apc_region(false);
    }

    /// Hold off all kernel APCs (KeEnterGuardedRegion)
    pub fn enter_guarded_region(&self) {
        let thread = self.current_thread();
        self.lock_dispatcher().threads[thread].special_apc_disable += 1;
    }

    /// KeLeaveGuardedRegion
    pub fn leave_guarded_region(&self) {
        self.leave_apc_region(true);
    }

    fn leave_apc_region(&self, guarded: bool) {
        let thread = self.current_thread();
        let mut guard = self.lock_dispatcher();
        let record = &mut guard.threads[thread];

        let count = if guarded {
            &mut record.special_apc_disable
        } else {
            &mut record.kernel_apc_disable
        };
        if *count == 0 {
            crate::bugcheck!(codes::APC_INDEX_MISMATCH, thread.to_raw(), guarded, record.kernel_apc_disable);
        }
        *count -= 1;

        let deliverable = record.special_apc_disable == 0
            && (guarded || record.kernel_apc_disable == 0)
            && !record.apc_state.apc_list_head[ProcessorMode::KernelMode.index()].is_empty();
        if deliverable {
            record.apc_state.kernel_apc_pending = true;
            self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
        }
    }
}

/// Unqueue bookkeeping shared by kernel and user delivery: clear the
/// inserted flag and snapshot what the kernel routine gets to see
fn take_call(db: &mut DispatcherDatabase, apc: ApcId) -> (KernelRoutine, ApcCall) {
    let entry = &mut db.apcs[apc];
    entry.inserted = false;
    let call = ApcCall {
        apc,
        normal_routine: entry.normal_routine.clone(),
        normal_context: entry.normal_context,
        system_argument1: entry.system_argument1,
        system_argument2: entry.system_argument2,
    };
    (Arc::clone(&entry.kernel_routine), call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::HostedHal;
    use crate::ke::dispatcher::WaitReason;
    use crate::ke::event::EventType;
    use alloc::string::String;
    use alloc::vec;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn special_routine(log: &Log, name: &'static str) -> KernelRoutine {
        let log = Arc::clone(log);
        Arc::new(move |_: &Kernel, _: &ApcCall| {
            log.lock().unwrap().push(name.into());
            ApcDisposition::Suppress
        })
    }

    fn proceed_routine() -> KernelRoutine {
        Arc::new(|_: &Kernel, call: &ApcCall| call.proceed())
    }

    fn normal_routine(log: &Log, name: &'static str) -> NormalRoutine {
        let log = Arc::clone(log);
        Arc::new(move |_: &Kernel, context: usize, _: usize, _: usize| {
            log.lock().unwrap().push(alloc::format!("{}:{}", name, context));
        })
    }

    fn spawn(kernel: &Arc<Kernel>, start: impl FnOnce(&Arc<Kernel>) + Send + 'static) -> ThreadId {
        kernel
            .create_thread(kernel.system_process(), start, None, None, false)
            .unwrap()
    }

    fn join(kernel: &Kernel, thread: ThreadId) {
        let object = kernel.thread_object(thread);
        kernel.wait_for_single_object(object, WaitReason::Executive, ProcessorMode::KernelMode, false, None);
    }

    #[test]
    fn test_special_apc_interrupts_waiting_thread() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let event = kernel.create_event(EventType::Notification, false);

        let worker = spawn(&kernel, move |kernel| {
            kernel.wait_for_single_object(event, WaitReason::Executive, ProcessorMode::KernelMode, true, None);
        });
        kernel.yield_execution();
        assert_eq!(kernel.lock_dispatcher().thread(worker).state, ThreadState::Waiting);

        let apc = kernel.initialize_apc(
            worker,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            special_routine(&log, "special"),
            None,
            None,
            0,
        );
        assert!(kernel.insert_queue_apc(apc, 0, 0, 0));
        {
            let db = kernel.lock_dispatcher();
            assert_eq!(db.thread(worker).state, ThreadState::Ready);
            assert_eq!(db.thread(worker).wait_status, WaitStatus::KernelApc);
            assert!(db.waiters(event).is_empty());
        }

        // The worker runs the APC and goes back to waiting
        kernel.yield_execution();
        assert_eq!(*log.lock().unwrap(), ["special"]);
        assert_eq!(kernel.lock_dispatcher().waiters(event), [worker]);

        kernel.set_event(event, 0);
        join(&kernel, worker);
    }

    #[test]
    #[should_panic(expected = "KERNEL_SECURITY_CHECK_FAILURE")]
    fn test_double_insert_bugchecks() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let worker = spawn(&kernel, |_| {});

        let apc = kernel.initialize_apc(
            worker,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            special_routine(&log, "special"),
            None,
            None,
            0,
        );
        assert!(kernel.insert_queue_apc(apc, 0, 0, 0));
        kernel.insert_queue_apc(apc, 0, 0, 0);
    }

    #[test]
    fn test_special_apcs_run_before_normal_apcs() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let current = kernel.current_thread();

        let special = |name| {
            kernel.initialize_apc(
                current,
                ApcEnvironment::Current,
                ProcessorMode::KernelMode,
                special_routine(&log, name),
                None,
                None,
                0,
            )
        };
        let normal = |context| {
            kernel.initialize_apc(
                current,
                ApcEnvironment::Current,
                ProcessorMode::KernelMode,
                proceed_routine(),
                None,
                Some(normal_routine(&log, "normal")),
                context,
            )
        };

        kernel.enter_guarded_region();
        for apc in [normal(1), special("s1"), normal(2), special("s2")] {
            assert!(kernel.insert_queue_apc(apc, 0, 0, 0));
        }
        assert!(log.lock().unwrap().is_empty());
        kernel.leave_guarded_region();

        assert_eq!(*log.lock().unwrap(), ["s1", "s2", "normal:1", "normal:2"]);
        let db = kernel.lock_dispatcher();
        assert!(db.thread(current).apc_state.apc_list_head[0].is_empty());
        assert!(!db.thread(current).apc_state.kernel_apc_in_progress);
    }

    #[test]
    fn test_critical_region_defers_normal_apcs_only() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let current = kernel.current_thread();

        kernel.enter_critical_region();
        let normal = kernel.initialize_apc(
            current,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            proceed_routine(),
            None,
            Some(normal_routine(&log, "normal")),
            7,
        );
        let special = kernel.initialize_apc(
            current,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            special_routine(&log, "special"),
            None,
            None,
            0,
        );
        kernel.insert_queue_apc(normal, 0, 0, 0);
        kernel.insert_queue_apc(special, 0, 0, 0);
        assert_eq!(*log.lock().unwrap(), ["special"]);

        kernel.leave_critical_region();
        assert_eq!(*log.lock().unwrap(), ["special", "normal:7"]);
    }

    #[test]
    #[should_panic(expected = "APC_INDEX_MISMATCH")]
    fn test_unbalanced_leave_bugchecks() {
        let kernel = HostedHal::kernel();
        kernel.leave_critical_region();
    }

    #[test]
    fn test_user_apc_ends_alertable_user_wait() {
        let (kernel, hosted) = HostedHal::boot(1);
        let log: Log = Arc::default();
        let event = kernel.create_event(EventType::Notification, false);
        let status = Arc::new(Mutex::new(None));
        let observed = Arc::clone(&status);

        let worker = spawn(&kernel, move |kernel| {
            let result = kernel.wait_for_single_object(event, WaitReason::UserRequest, ProcessorMode::UserMode, true, None);
            *observed.lock().unwrap() = Some(result);
            kernel.deliver_apc(ProcessorMode::UserMode, None);
        });
        kernel.yield_execution();

        let apc = kernel.initialize_apc(
            worker,
            ApcEnvironment::Original,
            ProcessorMode::UserMode,
            proceed_routine(),
            None,
            Some(normal_routine(&log, "user")),
            42,
        );
        assert!(kernel.insert_queue_apc(apc, 1, 2, 0));
        assert_eq!(kernel.lock_dispatcher().thread(worker).wait_status, WaitStatus::UserApc);

        join(&kernel, worker);
        assert_eq!(*status.lock().unwrap(), Some(WaitStatus::UserApc));
        assert_eq!(hosted.user_apcs(), [(worker, 42, 1, 2)]);
        // The user-mode frame runs the routine, not the kernel
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_user_apc_does_not_end_kernel_wait() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let event = kernel.create_event(EventType::Notification, false);

        let worker = spawn(&kernel, move |kernel| {
            kernel.wait_for_single_object(event, WaitReason::Executive, ProcessorMode::KernelMode, true, None);
        });
        kernel.yield_execution();

        let apc = kernel.initialize_apc(
            worker,
            ApcEnvironment::Original,
            ProcessorMode::UserMode,
            proceed_routine(),
            None,
            Some(normal_routine(&log, "user")),
            0,
        );
        assert!(kernel.insert_queue_apc(apc, 0, 0, 0));
        assert_eq!(kernel.lock_dispatcher().thread(worker).state, ThreadState::Waiting);

        kernel.set_event(event, 0);
        join(&kernel, worker);
    }

    #[test]
    fn test_thread_exit_apc_queues_first() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let worker = spawn(&kernel, |_| {});

        let user_apc = |context| {
            kernel.initialize_apc(
                worker,
                ApcEnvironment::Original,
                ProcessorMode::UserMode,
                proceed_routine(),
                None,
                Some(normal_routine(&log, "user")),
                context,
            )
        };
        let ordinary = user_apc(1);
        let exit = user_apc(2);
        kernel.set_thread_exit_apc(exit);

        kernel.insert_queue_apc(ordinary, 0, 0, 0);
        assert!(!kernel.lock_dispatcher().thread(worker).apc_state.user_apc_pending);
        kernel.insert_queue_apc(exit, 0, 0, 0);

        let db = kernel.lock_dispatcher();
        let state = &db.thread(worker).apc_state;
        assert!(state.user_apc_pending);
        assert_eq!(
            state.apc_list_head[1].handles(&db.apcs, crate::link!(KApc, apc_list_entry)),
            vec![exit, ordinary]
        );
    }

    #[test]
    fn test_remove_queue_apc() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let worker = spawn(&kernel, |_| {});

        let apc = kernel.initialize_apc(
            worker,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            special_routine(&log, "special"),
            None,
            None,
            0,
        );
        assert!(!kernel.remove_queue_apc(apc));
        kernel.insert_queue_apc(apc, 0, 0, 0);
        assert!(!kernel.free_apc(apc));

        assert!(kernel.remove_queue_apc(apc));
        assert!(!kernel.remove_queue_apc(apc));
        assert!(!kernel.lock_dispatcher().thread(worker).apc_state.kernel_apc_pending);
        assert!(kernel.free_apc(apc));

        join(&kernel, worker);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_termination_runs_down_user_apcs() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let rundowns = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&rundowns);
        let user_log = Arc::clone(&log);

        let worker = spawn(&kernel, move |kernel| {
            let rundown: RundownRoutine = Arc::new(move |_: &Kernel, _: ApcId| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let with_rundown = kernel.initialize_apc(
                kernel.current_thread(),
                ApcEnvironment::Original,
                ProcessorMode::UserMode,
                proceed_routine(),
                Some(rundown),
                Some(normal_routine(&user_log, "user")),
                0,
            );
            kernel.insert_queue_apc(with_rundown, 0, 0, 0);
        });
        join(&kernel, worker);

        assert_eq!(rundowns.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());

        let apc = kernel.initialize_apc(
            worker,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            special_routine(&log, "late"),
            None,
            None,
            0,
        );
        assert!(!kernel.insert_queue_apc(apc, 0, 0, 0));
    }

    #[test]
    fn test_flush_returns_queue_order() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let worker = spawn(&kernel, |_| {});

        let apcs: Vec<_> = (0..3)
            .map(|context| {
                kernel.initialize_apc(
                    worker,
                    ApcEnvironment::Original,
                    ProcessorMode::UserMode,
                    proceed_routine(),
                    None,
                    Some(normal_routine(&log, "user")),
                    context,
                )
            })
            .collect();
        for &apc in &apcs {
            kernel.insert_queue_apc(apc, 0, 0, 0);
        }

        assert_eq!(kernel.flush_queue_apc(worker, ProcessorMode::UserMode), apcs);
        assert!(kernel.flush_queue_apc(worker, ProcessorMode::UserMode).is_empty());
        join(&kernel, worker);
    }

    #[test]
    fn test_original_environment_apc_waits_for_detach() {
        let kernel = HostedHal::kernel();
        let log: Log = Arc::default();
        let current = kernel.current_thread();
        let process = kernel.create_process(8, None, None).unwrap();

        kernel.attach_process(process);
        let apc = kernel.initialize_apc(
            current,
            ApcEnvironment::Original,
            ProcessorMode::KernelMode,
            special_routine(&log, "original"),
            None,
            None,
            0,
        );
        assert!(kernel.insert_queue_apc(apc, 0, 0, 0));
        assert!(log.lock().unwrap().is_empty());
        {
            let db = kernel.lock_dispatcher();
            assert_eq!(db.thread(current).saved_apc_state.apc_list_head[0].len(), 1);
            assert!(db.thread(current).apc_state.apc_list_head[0].is_empty());
        }

        kernel.detach_process();
        assert_eq!(*log.lock().unwrap(), ["original"]);
    }
}
