//! Thread suspension and freezing
//!
//! Two independent hold counts stop a thread: the suspend count
//! (suspend/resume) and the freeze count (freeze/thaw of a whole process,
//! used by debuggers). The thread runs only while both are zero.
//!
//! Holding is done by the thread itself. The first hold queues the
//! thread's built-in suspend APC, a special kernel APC that blocks on the
//! thread's suspend semaphore. Dropping the last hold releases the
//! semaphore once.
//!
//! # NT Compatibility
//! Equivalent to KeSuspendThread / KeResumeThread / KeForceResumeThread /
//! KeAlertResumeThread / KeFreezeAllThreads / KeThawAllThreads

use alloc::sync::Arc;

use super::apc::{ApcCall, ApcDisposition, ApcEnvironment, KApc, KernelRoutine};
use super::bugcheck::ke_raise_status;
use super::dispatcher::{DispatcherDatabase, ProcessorMode, WaitReason};
use super::error::KeError;
use super::kernel::Kernel;
use super::thread::constants::RESUME_INCREMENT;
use super::thread::{KThread, ThreadId};

/// The suspend APC built into every thread
pub(crate) fn suspend_apc(thread: ThreadId) -> KApc {
    let routine: KernelRoutine = Arc::new(|kernel: &Kernel, _: &ApcCall| {
        let current = kernel.current_thread();
        let semaphore = kernel.lock_dispatcher().threads[current].suspend_semaphore;
        log::trace!("[KE] thread {:?} suspended", current);
        kernel.wait_for_single_object(semaphore, WaitReason::Suspended, ProcessorMode::KernelMode, false, None);
        ApcDisposition::Suppress
    });

    KApc::new(
        thread,
        ApcEnvironment::Original,
        ProcessorMode::KernelMode,
        routine,
        None,
        None,
        0,
    )
}

impl Kernel {
    /// Add a suspend hold (KeSuspendThread). Returns the previous suspend
    /// count.
    ///
    /// Suspending past the configured maximum raises `SuspendCountExceeded`
    /// against the caller.
    pub fn suspend_thread(&self, thread: ThreadId) -> Result<u8, KeError> {
        let maximum = self.config.maximum_suspend_count;
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let record = &mut db.threads[thread];
        let old = record.suspend_count;
        if old == maximum {
            drop(guard);
            ke_raise_status(KeError::SuspendCountExceeded);
        }
        if !record.apc_queueable {
            return Err(KeError::ThreadIsTerminating);
        }

        record.suspend_count += 1;
        if old == 0 && record.freeze_count == 0 {
            self.ki_hold_thread(db, thread);
        }
        log::trace!("[KE] suspend {:?}: {} -> {}", thread, old, old + 1);
        Ok(old)
    }

    /// Drop a suspend hold (KeResumeThread). Returns the previous suspend
    /// count; resuming a thread that is not suspended does nothing.
    pub fn resume_thread(&self, thread: ThreadId) -> u8 {
        let mut guard = self.lock_dispatcher();
        self.ki_resume_thread(&mut guard, thread)
    }

    fn ki_resume_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId) -> u8 {
        let record = &mut db.threads[thread];
        let old = record.suspend_count;
        if old != 0 {
            record.suspend_count -= 1;
            if record.suspend_count == 0 && record.freeze_count == 0 {
                self.ki_release_thread(db, thread);
            }
        }
        old
    }

    /// Drop every suspend and freeze hold (KeForceResumeThread). Returns
    /// the previous sum of both counts.
    pub fn force_resume_thread(&self, thread: ThreadId) -> u32 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let record = &mut db.threads[thread];
        let old = u32::from(record.suspend_count) + u32::from(record.freeze_count);
        if old != 0 {
            record.suspend_count = 0;
            record.freeze_count = 0;
            self.ki_release_thread(db, thread);
        }
        old
    }

    /// Alert the thread in kernel mode, then drop a suspend hold
    /// (KeAlertResumeThread). Returns the previous suspend count.
    pub fn alert_resume_thread(&self, thread: ThreadId) -> u8 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        self.ki_alert_thread(db, thread, ProcessorMode::KernelMode);
        self.ki_resume_thread(db, thread)
    }

    /// Freeze every other thread of the current process
    /// (KeFreezeAllThreads)
    ///
    /// The caller stays in a critical region until `thaw_all_threads`.
    pub fn freeze_all_threads(&self) {
        self.enter_critical_region();

        let current = self.current_thread();
        let maximum = self.config.maximum_suspend_count;
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        for thread in process_threads_except(db, current) {
            let record = &mut db.threads[thread];
            if !record.apc_queueable || record.freeze_count == maximum {
                continue;
            }
            let old = record.freeze_count;
            record.freeze_count += 1;
            if old == 0 && record.suspend_count == 0 {
                self.ki_hold_thread(db, thread);
            }
        }
        log::debug!("[KE] froze process {:?}", db.threads[current].process);
    }

    /// Undo `freeze_all_threads` (KeThawAllThreads)
    pub fn thaw_all_threads(&self) {
        let current = self.current_thread();
        {
            let mut guard = self.lock_dispatcher();
            let db = &mut *guard;

            for thread in process_threads_except(db, current) {
                let record = &mut db.threads[thread];
                if record.freeze_count == 0 {
                    continue;
                }
                record.freeze_count -= 1;
                if record.freeze_count == 0 && record.suspend_count == 0 {
                    self.ki_release_thread(db, thread);
                }
            }
            log::debug!("[KE] thawed process {:?}", db.threads[current].process);
        }

        self.leave_critical_region();
    }

    /// First hold on a thread: queue its suspend APC. If the APC is still
    /// queued from an earlier hold whose release it has not yet consumed,
    /// take that release back instead.
    fn ki_hold_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId) {
        let apc = db.threads[thread].suspend_apc;
        if !self.ki_insert_queue_apc(db, apc, RESUME_INCREMENT) {
            let semaphore = db.threads[thread].suspend_semaphore;
            db.objects[semaphore].header.signal_state -= 1;
        }
    }

    /// Last hold dropped: let the suspend APC return
    fn ki_release_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId) {
        let semaphore = db.threads[thread].suspend_semaphore;
        db.objects[semaphore].header.signal_state += 1;
        self.ki_wait_test(db, semaphore, RESUME_INCREMENT);
    }
}

fn process_threads_except(db: &DispatcherDatabase, excluded: ThreadId) -> alloc::vec::Vec<ThreadId> {
    let process = db.threads[excluded].process;
    let mut threads = db.processes[process]
        .thread_list_head
        .handles(&db.threads, crate::link!(KThread, thread_list_entry));
    threads.retain(|&thread| thread != excluded);
    threads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::HostedHal;
    use crate::ke::event::EventType;
    use crate::ke::thread::ThreadState;
    use crate::ke::dispatcher::{ObjectId, WaitStatus};
    use crate::config::KernelConfig;
    use core::sync::atomic::{AtomicBool, Ordering};

    fn blocked_on(kernel: &Arc<Kernel>, event: ObjectId) -> ThreadId {
        kernel
            .create_thread(
                kernel.system_process(),
                move |kernel| {
                    kernel.wait_for_single_object(event, WaitReason::Executive, ProcessorMode::KernelMode, false, None);
                },
                None,
                None,
                false,
            )
            .unwrap()
    }

    fn join(kernel: &Kernel, thread: ThreadId) {
        let object = kernel.thread_object(thread);
        kernel.wait_for_single_object(object, WaitReason::Executive, ProcessorMode::KernelMode, false, None);
    }

    fn is_suspended(kernel: &Kernel, thread: ThreadId) -> bool {
        let db = kernel.lock_dispatcher();
        let record = db.thread(thread);
        record.state == ThreadState::Waiting && record.wait_reason == WaitReason::Suspended
    }

    #[test]
    fn test_nested_suspend_and_resume() {
        let kernel = HostedHal::kernel();
        let event = kernel.create_event(EventType::Notification, false);
        let worker = blocked_on(&kernel, event);
        kernel.yield_execution();

        assert_eq!(kernel.suspend_thread(worker), Ok(0));
        assert_eq!(kernel.suspend_thread(worker), Ok(1));
        // The suspend APC pulled the worker out of its wait
        assert_eq!(kernel.lock_dispatcher().thread(worker).wait_status, WaitStatus::KernelApc);
        kernel.yield_execution();
        assert!(is_suspended(&kernel, worker));

        assert_eq!(kernel.resume_thread(worker), 2);
        assert_eq!(kernel.lock_dispatcher().thread(worker).suspend_count, 1);
        assert!(is_suspended(&kernel, worker));

        assert_eq!(kernel.resume_thread(worker), 1);
        assert_eq!(kernel.lock_dispatcher().thread(worker).state, ThreadState::Ready);
        assert_eq!(kernel.resume_thread(worker), 0);

        // Back in its original wait
        kernel.yield_execution();
        assert_eq!(kernel.lock_dispatcher().waiters(event), [worker]);
        kernel.set_event(event, 0);
        join(&kernel, worker);
    }

    #[test]
    fn test_resume_before_delivery_cancels_hold() {
        let kernel = HostedHal::kernel();
        let event = kernel.create_event(EventType::Notification, false);
        let worker = blocked_on(&kernel, event);

        // Neither hold is seen by the worker before it first runs
        assert_eq!(kernel.suspend_thread(worker), Ok(0));
        assert_eq!(kernel.resume_thread(worker), 1);
        assert_eq!(kernel.suspend_thread(worker), Ok(0));
        let semaphore = kernel.lock_dispatcher().thread(worker).suspend_semaphore;
        assert_eq!(kernel.lock_dispatcher().object(semaphore).header.signal_state, 0);

        kernel.yield_execution();
        assert!(is_suspended(&kernel, worker));
        kernel.resume_thread(worker);
        kernel.yield_execution();
        assert_eq!(kernel.lock_dispatcher().waiters(event), [worker]);

        kernel.set_event(event, 0);
        join(&kernel, worker);
    }

    #[test]
    fn test_create_suspended() {
        let kernel = HostedHal::kernel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let worker = kernel
            .create_thread(
                kernel.system_process(),
                move |_| flag.store(true, Ordering::SeqCst),
                None,
                None,
                true,
            )
            .unwrap();
        kernel.yield_execution();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(is_suspended(&kernel, worker));

        assert_eq!(kernel.resume_thread(worker), 1);
        join(&kernel, worker);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_freeze_and_suspend_are_independent() {
        let kernel = HostedHal::kernel();
        let event = kernel.create_event(EventType::Notification, false);
        let first = blocked_on(&kernel, event);
        let second = blocked_on(&kernel, event);
        kernel.yield_execution();

        kernel.suspend_thread(second).unwrap();
        kernel.freeze_all_threads();
        assert_eq!(kernel.lock_dispatcher().thread(kernel.current_thread()).kernel_apc_disable, 1);
        kernel.yield_execution();
        assert!(is_suspended(&kernel, first));
        assert!(is_suspended(&kernel, second));
        {
            let db = kernel.lock_dispatcher();
            assert_eq!(db.thread(first).freeze_count, 1);
            assert_eq!(db.thread(second).freeze_count, 1);
            assert_eq!(db.thread(kernel.current_thread()).freeze_count, 0);
        }

        kernel.thaw_all_threads();
        assert_eq!(kernel.lock_dispatcher().thread(first).state, ThreadState::Ready);
        assert!(is_suspended(&kernel, second));
        assert_eq!(kernel.lock_dispatcher().thread(kernel.current_thread()).kernel_apc_disable, 0);

        assert_eq!(kernel.force_resume_thread(second), 1);
        kernel.set_event(event, 0);
        join(&kernel, first);
        join(&kernel, second);
    }

    #[test]
    fn test_alert_resume() {
        let kernel = HostedHal::kernel();
        let worker = kernel
            .create_thread(
                kernel.system_process(),
                |kernel| {
                    let status = kernel.delay_execution(
                        ProcessorMode::KernelMode,
                        true,
                        crate::ke::dispatcher::Timeout::Relative(u64::MAX / 2),
                    );
                    assert_eq!(status, WaitStatus::Alerted);
                },
                None,
                None,
                true,
            )
            .unwrap();
        kernel.yield_execution();

        assert_eq!(kernel.alert_resume_thread(worker), 1);
        join(&kernel, worker);
    }

    #[test]
    fn test_terminating_thread_cannot_be_suspended() {
        let kernel = HostedHal::kernel();
        let worker = kernel
            .create_thread(kernel.system_process(), |_| {}, None, None, false)
            .unwrap();
        join(&kernel, worker);
        assert_eq!(kernel.suspend_thread(worker), Err(KeError::ThreadIsTerminating));
    }

    #[test]
    #[should_panic(expected = "suspend count exceeded")]
    fn test_suspend_limit_raises() {
        let mut config = KernelConfig::new();
        config.maximum_suspend_count = 2;
        let (kernel, _hosted) = HostedHal::boot_with_config(config);
        let event = kernel.create_event(EventType::Notification, false);
        let worker = blocked_on(&kernel, event);

        kernel.suspend_thread(worker).unwrap();
        kernel.suspend_thread(worker).unwrap();
        let _ = kernel.suspend_thread(worker);
    }
}
