//! Multi-Object Wait Support
//!
//! The wait/signal engine shared by every dispatcher object.
//!
//! # Waiting
//!
//! A wait first tries to satisfy itself from the objects' signal state
//! without blocking. Failing that it checks, in order, for a kernel APC that
//! slipped in before the lock was taken (retry), a pending alert or user APC
//! (return), and an already expired timeout (return). Only then does the
//! thread link one wait block per object, plus its timer's block, and switch
//! away.
//!
//! A thread woken only to run a kernel APC restarts the whole wait. The
//! timeout is resolved to a due time once, up front, so retries never
//! extend it.
//!
//! # Signaling
//!
//! [`Kernel::ki_wait_test`] walks an object's wait list in FIFO order while
//! the object stays signaled, satisfying WaitAny blocks directly and WaitAll
//! blocks only when every object of that wait is available.
//!
//! # Wait Types
//! - **WaitAny**: satisfied by the first available object in array order
//! - **WaitAll**: satisfied when all objects are available at once
//!
//! # NT Compatibility
//! - `wait_for_single_object` - KeWaitForSingleObject
//! - `wait_for_multiple_objects` - KeWaitForMultipleObjects
//! - `delay_execution` - KeDelayExecutionThread

use alloc::vec::Vec;
use core::mem;

use super::bugcheck::{codes, ke_raise_status};
use super::dispatcher::{
    DispatcherDatabase, DispatcherObject, DispatcherType, KWaitBlock, ObjectId, ProcessorMode, Timeout, WaitKey,
    WaitReason, WaitStatus, WaitType, MAXIMUM_WAIT_OBJECTS, THREAD_WAIT_OBJECTS,
};
use super::error::KeError;
use super::kernel::Kernel;
use super::kpcr::{irql, Kirql};
use super::list::ListHead;
use super::thread::constants::{LOW_REALTIME_PRIORITY, TIME_CRITICAL_PRIORITY_BOUND};
use super::thread::{KThread, ThreadId, ThreadState};
use super::timer::TimerDue;

/// What a pass through a wait loop decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitAction {
    /// A kernel APC is pending; let it run and start over
    Retry,
    /// Done without blocking
    Return(WaitStatus),
    /// Link wait blocks and switch away
    Block,
    /// Caller contract violation
    Raise(KeError),
}

/// A wait's timeout, resolved once when the wait starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitDeadline {
    Infinite,
    /// Zero timeout: never block
    Poll,
    Due(TimerDue),
}

impl WaitDeadline {
    pub(crate) fn resolve(timeout: Option<Timeout>, now: u64) -> Self {
        match timeout {
            None => WaitDeadline::Infinite,
            Some(Timeout::Relative(0)) => WaitDeadline::Poll,
            Some(Timeout::Relative(interval)) => WaitDeadline::Due(TimerDue::Interrupt(now.saturating_add(interval))),
            Some(Timeout::Absolute(time)) => WaitDeadline::Due(TimerDue::System(time)),
        }
    }
}

impl DispatcherDatabase {
    /// Could `thread` acquire `object` right now
    pub(crate) fn object_available(&self, object: ObjectId, thread: ThreadId) -> bool {
        let record = &self.objects[object];
        match record.header.object_type {
            DispatcherType::Mutant => record.header.signal_state > 0 || record.mutant().owner_thread == Some(thread),
            _ => record.header.signal_state > 0,
        }
    }

    /// Acquiring `object` again would overflow its recursion count
    fn mutant_at_limit(&self, object: ObjectId, thread: ThreadId) -> bool {
        let record = &self.objects[object];
        record.header.object_type == DispatcherType::Mutant
            && record.mutant().owner_thread == Some(thread)
            && record.header.signal_state == i32::MIN
    }

    /// Consume one unit of an available object for `thread`
    /// (KiWaitSatisfyAny/Mutant/Other). Returns true if the thread acquired
    /// an abandoned mutant.
    pub(crate) fn wait_satisfy(&mut self, object: ObjectId, thread: ThreadId) -> bool {
        let header = &mut self.objects[object].header;
        match header.object_type {
            DispatcherType::Mutant => {
                header.signal_state -= 1;
                if header.signal_state != 0 {
                    return false;
                }

                let mutant = self.objects[object].mutant_mut();
                mutant.owner_thread = Some(thread);
                let abandoned = mem::take(&mut mutant.abandoned);
                let apc_disable = mutant.apc_disable;

                let owner = &mut self.threads[thread];
                owner.kernel_apc_disable += apc_disable;
                owner.mutant_list_head.insert_head(
                    &mut self.objects,
                    object,
                    crate::link!(DispatcherObject, mutant_list_entry),
                );
                abandoned
            }
            DispatcherType::Semaphore => {
                header.signal_state -= 1;
                false
            }
            DispatcherType::Queue => {
                header.signal_state -= 1;
                if let Some(entry) = self.objects[object].queue_mut().entry_list.pop_front() {
                    self.threads[thread].claimed_entries.push((object, entry));
                }
                false
            }
            object_type if object_type.is_synchronization() => {
                header.signal_state = 0;
                false
            }
            _ => false,
        }
    }
}

impl Kernel {
    /// Wait for one object (KeWaitForSingleObject)
    ///
    /// Returns `Object(0)`, `Abandoned(0)`, `Timeout`, `Alerted` or
    /// `UserApc`.
    pub fn wait_for_single_object(
        &self,
        object: ObjectId,
        reason: WaitReason,
        mode: ProcessorMode,
        alertable: bool,
        timeout: Option<Timeout>,
    ) -> WaitStatus {
        match self.wait_for_multiple_objects(&[object], WaitType::WaitAny, reason, mode, alertable, timeout) {
            Ok(status) => status,
            Err(error) => ke_raise_status(error),
        }
    }

    /// Wait for several objects (KeWaitForMultipleObjects)
    ///
    /// More than [`MAXIMUM_WAIT_OBJECTS`] objects bugchecks and the same
    /// object twice in a WaitAll raises `InvalidParameterMix`. Waits on more
    /// than three objects draw wait blocks from a bounded pool and fail with
    /// `InsufficientResources` when it is exhausted.
    pub fn wait_for_multiple_objects(
        &self,
        objects: &[ObjectId],
        wait_type: WaitType,
        reason: WaitReason,
        mode: ProcessorMode,
        alertable: bool,
        timeout: Option<Timeout>,
    ) -> Result<WaitStatus, KeError> {
        if objects.len() > MAXIMUM_WAIT_OBJECTS {
            crate::bugcheck!(codes::MAXIMUM_WAIT_OBJECTS_EXCEEDED, objects.len(), MAXIMUM_WAIT_OBJECTS);
        }
        if objects.is_empty() {
            return Err(KeError::InvalidParameter);
        }
        if wait_type == WaitType::WaitAll {
            let mut sorted = objects.to_vec();
            sorted.sort_unstable();
            if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
                ke_raise_status(KeError::InvalidParameterMix);
            }
        }

        let thread = self.current_thread();
        let deadline = WaitDeadline::resolve(timeout, self.interrupt_time());

        loop {
            let mut guard = self.lock_dispatcher();
            let entry_irql = guard.entry_irql();
            let db = &mut *guard;

            match self.ki_test_wait(db, thread, objects, wait_type, mode, alertable, entry_irql) {
                WaitAction::Retry => {
                    self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
                    continue;
                }
                WaitAction::Return(status) => {
                    self.ki_adjust_quantum_thread(db, thread);
                    return Ok(status);
                }
                WaitAction::Raise(error) => {
                    drop(guard);
                    ke_raise_status(error);
                }
                WaitAction::Block => {}
            }

            ki_check_wait_irql(entry_irql, thread);

            let pooled = objects.len() > THREAD_WAIT_OBJECTS;
            if pooled && db.pool_wait_blocks + objects.len() > db.config.wait_block_limit {
                log::warn!(
                    "[WAIT] wait block pool exhausted: {} in use, {} requested",
                    db.pool_wait_blocks,
                    objects.len()
                );
                return Err(KeError::InsufficientResources);
            }

            if !self.ki_arm_wait_timer(db, thread, deadline) {
                self.ki_adjust_quantum_thread(db, thread);
                return Ok(WaitStatus::Timeout);
            }

            let link = crate::link!(KWaitBlock, wait_list_entry);
            let mut blocks = Vec::with_capacity(objects.len());
            for (index, &object) in objects.iter().enumerate() {
                let record = KWaitBlock {
                    wait_key: WaitKey::Index(index as u32),
                    wait_type,
                    ..KWaitBlock::new(thread, object)
                };
                let block = if pooled {
                    db.wait_blocks.insert(record)
                } else {
                    let block = db.threads[thread].wait_blocks[index];
                    db.wait_blocks[block] = record;
                    block
                };
                db.objects[object]
                    .header
                    .wait_list_head
                    .insert_tail(&mut db.wait_blocks, block, link);
                blocks.push(block);
            }
            if pooled {
                db.pool_wait_blocks += objects.len();
            }
            db.threads[thread].wait_block_list = blocks;

            self.ki_commit_wait(db, thread, reason, mode, alertable, entry_irql, ThreadState::Waiting, true);
            ktrace!("[WAIT] thread {:?} blocks on {} object(s)", thread, objects.len());

            let status = self.ki_swap_thread(guard);
            if status != WaitStatus::KernelApc {
                return Ok(status);
            }
        }
    }

    /// Delay the current thread (KeDelayExecutionThread)
    ///
    /// A zero interval yields. Returns `Object(0)` when the interval
    /// elapses, or `Alerted`/`UserApc` if an alertable delay is cut short.
    pub fn delay_execution(&self, mode: ProcessorMode, alertable: bool, interval: Timeout) -> WaitStatus {
        let thread = self.current_thread();
        let deadline = WaitDeadline::resolve(Some(interval), self.interrupt_time());

        loop {
            let mut guard = self.lock_dispatcher();
            let entry_irql = guard.entry_irql();
            let db = &mut *guard;

            if self.ki_kernel_apc_retry(db, thread, entry_irql) {
                self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
                continue;
            }
            if let Some(status) = ki_check_alert(db, thread, mode, alertable) {
                self.ki_adjust_quantum_thread(db, thread);
                return status;
            }

            if deadline == WaitDeadline::Poll {
                drop(guard);
                self.yield_execution();
                return WaitStatus::SUCCESS;
            }

            ki_check_wait_irql(entry_irql, thread);
            if !self.ki_arm_wait_timer(db, thread, deadline) {
                self.ki_adjust_quantum_thread(db, thread);
                return WaitStatus::SUCCESS;
            }

            self.ki_commit_wait(
                db,
                thread,
                WaitReason::DelayExecution,
                mode,
                alertable,
                entry_irql,
                ThreadState::Waiting,
                true,
            );

            match self.ki_swap_thread(guard) {
                WaitStatus::KernelApc => continue,
                WaitStatus::Timeout => return WaitStatus::SUCCESS,
                status => return status,
            }
        }
    }

    /// One pass of the non-blocking part of a wait
    fn ki_test_wait(
        &self,
        db: &mut DispatcherDatabase,
        thread: ThreadId,
        objects: &[ObjectId],
        wait_type: WaitType,
        mode: ProcessorMode,
        alertable: bool,
        entry_irql: Kirql,
    ) -> WaitAction {
        match wait_type {
            WaitType::WaitAny => {
                for (index, &object) in objects.iter().enumerate() {
                    if db.mutant_at_limit(object, thread) {
                        return WaitAction::Raise(KeError::MutantLimitExceeded);
                    }
                    if db.object_available(object, thread) {
                        let status = if db.wait_satisfy(object, thread) {
                            WaitStatus::Abandoned(index as u32)
                        } else {
                            WaitStatus::Object(index as u32)
                        };
                        return WaitAction::Return(status);
                    }
                }
            }
            WaitType::WaitAll => {
                if objects.iter().any(|&object| db.mutant_at_limit(object, thread)) {
                    return WaitAction::Raise(KeError::MutantLimitExceeded);
                }
                if objects.iter().all(|&object| db.object_available(object, thread)) {
                    let mut abandoned = false;
                    for &object in objects {
                        abandoned |= db.wait_satisfy(object, thread);
                    }
                    let status = if abandoned {
                        WaitStatus::Abandoned(0)
                    } else {
                        WaitStatus::SUCCESS
                    };
                    return WaitAction::Return(status);
                }
            }
        }

        if self.ki_kernel_apc_retry(db, thread, entry_irql) {
            return WaitAction::Retry;
        }
        match ki_check_alert(db, thread, mode, alertable) {
            Some(status) => WaitAction::Return(status),
            None => WaitAction::Block,
        }
    }

    /// A kernel APC became pending between raising IRQL and taking the lock
    /// and could run if the wait let go
    pub(crate) fn ki_kernel_apc_retry(&self, db: &DispatcherDatabase, thread: ThreadId, entry_irql: Kirql) -> bool {
        let record = &db.threads[thread];
        record.apc_state.kernel_apc_pending && record.special_apc_disable == 0 && entry_irql < irql::APC_LEVEL
    }

    /// Arm the thread's timeout timer and link its wait block. Returns false
    /// if the wait must not block: a zero timeout or a due time already past.
    pub(crate) fn ki_arm_wait_timer(&self, db: &mut DispatcherDatabase, thread: ThreadId, deadline: WaitDeadline) -> bool {
        let due = match deadline {
            WaitDeadline::Infinite => return true,
            WaitDeadline::Poll => return false,
            WaitDeadline::Due(due) => due,
        };

        let (timer, block) = {
            let record = &db.threads[thread];
            (record.timer, record.timer_wait_block)
        };
        db.objects[timer].header.signal_state = 0;
        db.objects[timer].timer_mut().period = 0;
        if !self.ki_insert_timer(db, timer, due) {
            return false;
        }

        db.objects[timer]
            .header
            .wait_list_head
            .insert_tail(&mut db.wait_blocks, block, crate::link!(KWaitBlock, wait_list_entry));
        true
    }

    /// Put the current thread into its wait state, with its wait blocks
    /// already linked
    pub(crate) fn ki_commit_wait(
        &self,
        db: &mut DispatcherDatabase,
        thread: ThreadId,
        reason: WaitReason,
        mode: ProcessorMode,
        alertable: bool,
        wait_irql: Kirql,
        state: ThreadState,
        activate_queue: bool,
    ) {
        let now = self.interrupt_time();
        let swappable = self.hal.is_kernel_stack_swappable(mode, thread);
        let processor = self.current_processor();

        let record = &mut db.threads[thread];
        record.state = state;
        record.swap_busy = true;
        record.wait_irql = wait_irql;
        record.wait_mode = mode;
        record.wait_reason = reason;
        record.alertable = alertable;
        record.wait_time = now;
        record.wait_status = WaitStatus::SUCCESS;
        let queue = record.queue;

        if swappable {
            record.swap_list_processor = Some(processor);
            db.prcbs[processor as usize].wait_list_head.insert_tail(
                &mut db.threads,
                thread,
                crate::link!(KThread, wait_list_entry),
            );
        }

        if activate_queue {
            if let Some(queue) = queue {
                self.ki_activate_waiter_queue(db, queue);
            }
        }
    }

    /// Satisfy waiters of a signaled object (KiWaitTest)
    ///
    /// Walks the wait list in FIFO order while the object stays signaled.
    /// Dequeue wait blocks are served by the queue itself and skipped here.
    pub(crate) fn ki_wait_test(&self, db: &mut DispatcherDatabase, object: ObjectId, increment: i8) {
        let link = crate::link!(KWaitBlock, wait_list_entry);
        let mut cursor = db.objects[object].header.wait_list_head.first();

        while let Some(block) = cursor {
            if !db.objects[object].header.is_signaled() {
                break;
            }
            cursor = ListHead::next(&db.wait_blocks, block, link);

            let (thread, wait_key, wait_type, dequeue) = {
                let record = &db.wait_blocks[block];
                (record.thread, record.wait_key, record.wait_type, record.dequeue)
            };
            if dequeue {
                continue;
            }

            let status = match wait_type {
                WaitType::WaitAny => {
                    let abandoned = db.wait_satisfy(object, thread);
                    match wait_key {
                        WaitKey::Index(index) if abandoned => WaitStatus::Abandoned(index),
                        WaitKey::Index(index) => WaitStatus::Object(index),
                        WaitKey::Timeout => WaitStatus::Timeout,
                    }
                }
                WaitType::WaitAll => {
                    let waited: Vec<ObjectId> = db.threads[thread]
                        .wait_block_list
                        .iter()
                        .map(|&block| db.wait_blocks[block].object)
                        .collect();
                    if !waited.iter().all(|&other| db.object_available(other, thread)) {
                        continue;
                    }
                    let mut abandoned = false;
                    for other in waited {
                        abandoned |= db.wait_satisfy(other, thread);
                    }
                    if abandoned {
                        WaitStatus::Abandoned(0)
                    } else {
                        WaitStatus::SUCCESS
                    }
                }
            };

            self.ki_unwait_thread(db, thread, status, increment);
            cursor = db.objects[object].header.wait_list_head.first();
        }
    }

    /// End a thread's wait with `status` and make it ready (KiUnwaitThread)
    ///
    /// Unlinks every wait block, cancels the timeout timer, returns the
    /// thread's slot to its queue object and applies the wait boost and
    /// quantum charge for dynamic threads.
    pub(crate) fn ki_unwait_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId, status: WaitStatus, increment: i8) {
        let link = crate::link!(KWaitBlock, wait_list_entry);

        let record = &mut db.threads[thread];
        record.wait_status = status;
        record.gate_object = None;
        let blocks = mem::take(&mut record.wait_block_list);
        let built_in = record.wait_blocks;
        let (timer, timer_block) = (record.timer, record.timer_wait_block);
        let swap_list = record.swap_list_processor.take();
        let queue = record.queue;

        for block in blocks {
            let object = db.wait_blocks[block].object;
            db.objects[object]
                .header
                .wait_list_head
                .remove_entry(&mut db.wait_blocks, block, link);
            if !built_in.contains(&block) {
                db.wait_blocks.remove(block);
                db.pool_wait_blocks -= 1;
            }
        }

        if db.wait_blocks[timer_block].wait_list_entry.is_linked() {
            db.objects[timer]
                .header
                .wait_list_head
                .remove_entry(&mut db.wait_blocks, timer_block, link);
            self.ki_remove_timer(db, timer);
        }

        if let Some(processor) = swap_list {
            db.prcbs[processor as usize].wait_list_head.remove_entry(
                &mut db.threads,
                thread,
                crate::link!(KThread, wait_list_entry),
            );
        }

        if let Some(queue) = queue {
            db.objects[queue].queue_mut().current_count += 1;
        }

        let wait_decrement = db.config.wait_quantum_decrement;
        let record = &mut db.threads[thread];
        if record.priority < LOW_REALTIME_PRIORITY {
            if record.priority_decrement == 0 {
                let boosted = (record.base_priority + increment).min(LOW_REALTIME_PRIORITY - 1);
                if boosted > record.priority {
                    record.priority = boosted;
                }
            }

            if record.base_priority >= TIME_CRITICAL_PRIORITY_BOUND {
                record.quantum = record.quantum_reset;
            } else {
                record.quantum -= wait_decrement;
                if record.quantum <= 0 {
                    record.quantum = record.quantum_reset;
                    record.priority = super::scheduler::ki_compute_new_priority(record, 1);
                }
            }
        } else {
            record.quantum = record.quantum_reset;
        }

        ktrace!("[WAIT] unwait {:?} with {:?}", thread, status);
        self.ki_ready_thread(db, thread);
    }
}

/// Blocking at DISPATCH_LEVEL or above would deadlock the processor
pub(crate) fn ki_check_wait_irql(entry_irql: Kirql, thread: ThreadId) {
    if entry_irql >= irql::DISPATCH_LEVEL {
        crate::bugcheck!(codes::IRQL_NOT_LESS_OR_EQUAL, entry_irql, thread.to_raw());
    }
}

/// Alert and user APC checks made before blocking (KiCheckAlertability)
///
/// In order: an alert for the wait mode, a queued user APC for an
/// alertable user-mode wait, a kernel-mode alert for an alertable user-mode
/// wait, and a user APC already pending for a user-mode wait.
pub(crate) fn ki_check_alert(
    db: &mut DispatcherDatabase,
    thread: ThreadId,
    mode: ProcessorMode,
    alertable: bool,
) -> Option<WaitStatus> {
    let record = &mut db.threads[thread];
    let user = ProcessorMode::UserMode;

    if alertable {
        if record.alerted[mode.index()] {
            record.alerted[mode.index()] = false;
            return Some(WaitStatus::Alerted);
        }
        if mode == user && !record.apc_state.apc_list_head[user.index()].is_empty() {
            record.apc_state.user_apc_pending = true;
            return Some(WaitStatus::UserApc);
        }
        if record.alerted[ProcessorMode::KernelMode.index()] {
            record.alerted[ProcessorMode::KernelMode.index()] = false;
            return Some(WaitStatus::Alerted);
        }
    } else if mode == user && record.apc_state.user_apc_pending {
        return Some(WaitStatus::UserApc);
    }
    None
}
