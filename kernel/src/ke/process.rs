//! Kernel Process (KPROCESS) implementation
//!
//! KPROCESS is the kernel's view of a process:
//! - Default scheduling parameters for its threads (base priority,
//!   quantum, affinity)
//! - The list of threads belonging to the process
//! - The count of threads whose kernel stacks are resident
//! - CPU and I/O counters accumulated from exited threads
//!
//! A thread may temporarily attach to another process. The APC state of
//! its own process is then parked in `saved_apc_state` until it detaches.

use core::mem;

use super::apc::KApcState;
use super::arena::Handle;
use super::bugcheck::codes;
use super::dispatcher::{DispatcherDatabase, DispatcherObject, DispatcherType, ObjectBody, ObjectId, ProcessorMode};
use super::error::KeError;
use super::kernel::Kernel;
use super::kpcr::irql;
use super::list::ListHead;
use super::thread::constants::{HIGH_PRIORITY, LOW_REALTIME_PRIORITY};
use super::thread::KThread;

/// Handle to a process
pub type ProcessId = Handle<KProcess>;

/// Kernel Process structure
///
/// This is modeled after Windows NT's KPROCESS structure.
pub struct KProcess {
    /// Waitable side of the process, signaled when its last thread exits
    pub header: ObjectId,

    /// Threads belonging to this process
    pub thread_list_head: ListHead<KThread>,

    /// Base priority for threads in this process
    pub base_priority: i8,

    /// Quantum for threads in this process
    pub quantum_reset: i8,

    /// Processors threads of this process may run on
    pub affinity: u64,

    /// Threads with a resident kernel stack
    pub stack_count: u32,

    /// Next ideal processor handed to a new thread
    pub thread_seed: u32,

    /// Clock ticks of exited threads
    pub kernel_time: u64,
    pub user_time: u64,
    /// I/O operations of exited threads (read, write, other)
    pub io_operations: [u64; 3],
}

impl KProcess {
    /// Pick the ideal processor for a new thread, rotating through the
    /// process affinity
    pub(crate) fn next_ideal_processor(&mut self) -> u32 {
        if self.affinity == 0 {
            return 0;
        }

        let mut candidate = self.thread_seed % 64;
        while self.affinity & (1 << candidate) == 0 {
            candidate = (candidate + 1) % 64;
        }
        self.thread_seed = candidate + 1;
        candidate
    }
}

impl DispatcherDatabase {
    pub(crate) fn initialize_process(&mut self, base_priority: i8, affinity: u64, quantum: i8) -> ProcessId {
        let objects = &mut self.objects;
        self.processes.insert_with(|process| KProcess {
            header: objects.insert(DispatcherObject::new(DispatcherType::Process, 0, ObjectBody::Process(process))),
            thread_list_head: ListHead::new(),
            base_priority,
            quantum_reset: quantum,
            affinity,
            stack_count: 0,
            thread_seed: 0,
            kernel_time: 0,
            user_time: 0,
            io_operations: [0; 3],
        })
    }
}

impl Kernel {
    /// Create a process (KeInitializeProcess)
    ///
    /// `affinity` defaults to all active processors and `quantum` to the
    /// configured thread quantum.
    pub fn create_process(
        &self,
        base_priority: i8,
        affinity: Option<u64>,
        quantum: Option<i8>,
    ) -> Result<ProcessId, KeError> {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let active = db.active_processors;
        let affinity = affinity.unwrap_or(active);
        if affinity == 0 || affinity & !active != 0 {
            return Err(KeError::InvalidParameter);
        }
        if !(1..=HIGH_PRIORITY).contains(&base_priority) {
            return Err(KeError::InvalidParameter);
        }
        let quantum = quantum.unwrap_or(db.config.thread_quantum);
        if quantum <= 0 {
            return Err(KeError::InvalidParameter);
        }

        let process = db.initialize_process(base_priority, affinity, quantum);
        log::debug!("[KE] process {:?} created, base priority {}", process, base_priority);
        Ok(process)
    }

    /// Dispatcher object to wait on for process exit
    pub fn process_object(&self, process: ProcessId) -> ObjectId {
        self.lock_dispatcher().processes[process].header
    }

    /// Set the base priority of a process (KeSetPriorityProcess) and move
    /// every non-saturated thread by the same delta, clamped to the band
    /// of the new base. Returns the previous base priority.
    pub fn set_process_base_priority(&self, process: ProcessId, base_priority: i8) -> i8 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let old = db.processes[process].base_priority;
        if old == base_priority {
            return old;
        }
        db.processes[process].base_priority = base_priority;
        let delta = base_priority - old;
        let realtime = base_priority >= LOW_REALTIME_PRIORITY;
        let (low, high) = if realtime {
            (LOW_REALTIME_PRIORITY, HIGH_PRIORITY)
        } else {
            (1, LOW_REALTIME_PRIORITY - 1)
        };

        let threads = db.processes[process]
            .thread_list_head
            .handles(&db.threads, crate::link!(KThread, thread_list_entry));

        for thread in threads {
            let record = &mut db.threads[thread];
            if record.saturation != 0 {
                continue;
            }

            let old_base = record.base_priority;
            let new_base = (old_base + delta).clamp(low, high);
            let new_priority = if realtime {
                new_base
            } else {
                (record.priority - record.priority_decrement + (new_base - old_base)).clamp(new_base, high)
            };

            record.base_priority = new_base;
            record.priority_decrement = 0;
            record.quantum = record.quantum_reset;
            self.ki_set_priority_thread(db, thread, new_priority);
        }

        old
    }

    /// Attach the current thread to `process` (KeAttachProcess)
    ///
    /// Attaching to the process already current is a no-op. Nested attach
    /// or attaching at DISPATCH_LEVEL bugchecks.
    pub fn attach_process(&self, process: ProcessId) {
        let thread = self.current_thread();
        let mut guard = self.lock_dispatcher();
        let entry_irql = guard.entry_irql();
        let record = &mut guard.threads[thread];

        if record.apc_state.process == process {
            return;
        }
        if record.apc_state_index != 0 || entry_irql >= irql::DISPATCH_LEVEL {
            crate::bugcheck!(
                codes::INVALID_PROCESS_ATTACH_ATTEMPT,
                process.to_raw(),
                record.apc_state.process.to_raw(),
                record.apc_state_index,
                entry_irql
            );
        }

        record.saved_apc_state = mem::replace(&mut record.apc_state, KApcState::new(process));
        record.apc_state_index = 1;
        log::trace!("[KE] thread {:?} attached to process {:?}", thread, process);
    }

    /// Return the current thread to its own process (KeDetachProcess)
    pub fn detach_process(&self) {
        let thread = self.current_thread();
        let processor = self.current_processor();
        let mut guard = self.lock_dispatcher();
        let record = &mut guard.threads[thread];

        if record.apc_state_index == 0 {
            return;
        }

        let state = &record.apc_state;
        if state.kernel_apc_in_progress
            || !state.apc_list_head[ProcessorMode::KernelMode.index()].is_empty()
            || !state.apc_list_head[ProcessorMode::UserMode.index()].is_empty()
        {
            crate::bugcheck!(
                codes::INVALID_PROCESS_DETACH_ATTEMPT,
                state.process.to_raw(),
                state.kernel_apc_in_progress
            );
        }

        let original = record.saved_apc_state.process;
        record.apc_state = mem::replace(&mut record.saved_apc_state, KApcState::new(original));
        record.apc_state_index = 0;

        if !record.apc_state.apc_list_head[ProcessorMode::KernelMode.index()].is_empty() {
            record.apc_state.kernel_apc_pending = true;
            self.request_software_interrupt(irql::APC_LEVEL, processor);
        }
        log::trace!("[KE] thread {:?} detached", thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::HostedHal;
    use crate::ke::thread::ThreadState;

    #[test]
    fn test_create_process_validation() {
        let kernel = HostedHal::kernel_with_processors(2);
        assert_eq!(kernel.create_process(0, None, None), Err(KeError::InvalidParameter));
        assert_eq!(kernel.create_process(8, Some(0b100), None), Err(KeError::InvalidParameter));
        assert_eq!(kernel.create_process(8, None, Some(0)), Err(KeError::InvalidParameter));

        let process = kernel.create_process(10, Some(0b10), None).unwrap();
        let db = kernel.lock_dispatcher();
        assert_eq!(db.process(process).base_priority, 10);
        assert_eq!(db.process(process).affinity, 0b10);
        assert_eq!(db.process(process).quantum_reset, kernel.config().thread_quantum);
    }

    #[test]
    fn test_ideal_processor_rotation() {
        let kernel = HostedHal::kernel_with_processors(4);
        let process = kernel.create_process(8, Some(0b1010), None).unwrap();
        let mut guard = kernel.lock_dispatcher();

        let a = guard.initialize_thread(process);
        let b = guard.initialize_thread(process);
        let c = guard.initialize_thread(process);
        assert_eq!(guard.thread(a).ideal_processor, 1);
        assert_eq!(guard.thread(b).ideal_processor, 3);
        assert_eq!(guard.thread(c).ideal_processor, 1);
    }

    #[test]
    fn test_base_priority_propagates_except_saturated() {
        let kernel = HostedHal::kernel();
        let process = kernel.create_process(8, None, None).unwrap();
        let (plain, saturated) = {
            let mut guard = kernel.lock_dispatcher();
            let db = &mut *guard;
            let plain = db.initialize_thread(process);
            let saturated = db.initialize_thread(process);
            db.start_thread(plain);
            db.start_thread(saturated);
            db.threads[plain].state = ThreadState::Waiting;
            db.threads[saturated].state = ThreadState::Waiting;
            db.threads[saturated].saturation = 1;
            db.threads[saturated].base_priority = 15;
            db.threads[saturated].priority = 15;
            (plain, saturated)
        };

        assert_eq!(kernel.set_process_base_priority(process, 10), 8);

        let db = kernel.lock_dispatcher();
        assert_eq!(db.thread(plain).base_priority, 10);
        assert_eq!(db.thread(plain).priority, 10);
        assert_eq!(db.thread(saturated).base_priority, 15);
    }

    #[test]
    fn test_base_priority_stays_in_band() {
        let kernel = HostedHal::kernel();
        let process = kernel.create_process(13, None, None).unwrap();
        let thread = {
            let mut guard = kernel.lock_dispatcher();
            let thread = guard.initialize_thread(process);
            guard.start_thread(thread);
            guard.threads[thread].state = ThreadState::Waiting;
            thread
        };

        kernel.set_process_base_priority(process, 14);
        let db = kernel.lock_dispatcher();
        assert_eq!(db.thread(thread).base_priority, 14);
        assert!(db.thread(thread).priority < LOW_REALTIME_PRIORITY);
    }

    #[test]
    fn test_attach_and_detach() {
        let kernel = HostedHal::kernel();
        let other = kernel.create_process(8, None, None).unwrap();
        let home = kernel.current_process();

        kernel.attach_process(other);
        assert_eq!(kernel.current_process(), other);
        {
            let db = kernel.lock_dispatcher();
            let record = db.thread(kernel.current_thread());
            assert_eq!(record.apc_state_index, 1);
            assert_eq!(record.saved_apc_state.process, home);
        }

        kernel.detach_process();
        assert_eq!(kernel.current_process(), home);
        assert_eq!(kernel.lock_dispatcher().thread(kernel.current_thread()).apc_state_index, 0);
    }

    #[test]
    #[should_panic(expected = "INVALID_PROCESS_ATTACH_ATTEMPT")]
    fn test_nested_attach_bugchecks() {
        let kernel = HostedHal::kernel();
        let first = kernel.create_process(8, None, None).unwrap();
        let second = kernel.create_process(8, None, None).unwrap();
        kernel.attach_process(first);
        kernel.attach_process(second);
    }
}
