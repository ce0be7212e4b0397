//! NT-style Priority Scheduler
//!
//! Implements a 32-level priority scheduler with:
//! - O(1) thread selection using a ready summary bitmap per processor
//! - Processor selection by idle summary, ideal and last processor
//! - Standby (`next_thread`) selection and preemption through the
//!   dispatch software interrupt
//! - Quantum-based round robin with priority decay for dynamic threads
//!
//! Priority levels:
//! - 0-15: Dynamic (variable) priority threads
//! - 16-31: Realtime (fixed) priority threads
//!
//! # Context switch hand-off
//!
//! A thread leaving a processor is marked `swap_busy` before anyone can
//! see it as ready. The incoming thread clears the flag in
//! [`Kernel::ki_finish_switch`] once the old context is saved, and a
//! processor about to resume a thread spins until its flag is clear.

use super::bugcheck::codes;
use super::dispatcher::{DispatcherDatabase, DispatcherGuard, ProcessorMode, WaitStatus};
use super::error::KeError;
use super::kernel::Kernel;
use super::kpcr::{irql, SoftwareInterrupts};
use super::thread::constants::{HIGH_PRIORITY, LOW_PRIORITY, LOW_REALTIME_PRIORITY, TIME_CRITICAL_PRIORITY_BOUND};
use super::thread::{KThread, ThreadId, ThreadState};

/// Result of a voluntary yield
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldStatus {
    /// Another thread ran
    Success,
    /// Nothing of equal or higher priority was ready
    NoYieldPerformed,
}

/// Priority after one quantum of decay
///
/// Realtime threads are never decayed. A dynamic thread loses its
/// remaining boost plus `adjustment`, but never drops below its base.
pub(crate) fn ki_compute_new_priority(thread: &mut KThread, adjustment: i8) -> i8 {
    let mut priority = thread.priority;
    if priority < LOW_REALTIME_PRIORITY {
        priority = (priority - thread.priority_decrement - adjustment).max(thread.base_priority);
        thread.priority_decrement = 0;
    }
    priority
}

/// Pick a processor from `affinity`, preferring the ideal then the last one
fn select_processor(thread: &KThread, affinity: u64) -> u32 {
    if affinity & (1 << thread.ideal_processor) != 0 {
        thread.ideal_processor
    } else if affinity & (1 << thread.next_processor) != 0 {
        thread.next_processor
    } else {
        affinity.trailing_zeros()
    }
}

impl Kernel {
    /// Insert a thread into a ready queue of `processor`
    ///
    /// Preempted threads go to the head of their priority queue so they
    /// finish their quantum first; everything else round-robins at the tail.
    pub(crate) fn ki_insert_ready(&self, db: &mut DispatcherDatabase, processor: u32, thread: ThreadId, at_head: bool) {
        let record = &mut db.threads[thread];
        record.state = ThreadState::Ready;
        record.next_processor = processor;
        record.preempted = false;
        let priority = record.priority as usize;

        let prcb = &mut db.prcbs[processor as usize];
        let link = crate::link!(KThread, wait_list_entry);
        if at_head {
            prcb.ready_queues[priority].insert_head(&mut db.threads, thread, link);
        } else {
            prcb.ready_queues[priority].insert_tail(&mut db.threads, thread, link);
        }
        prcb.set_ready_bit(priority);
        self.pcr(processor).set_ready_summary(prcb.ready_summary);
    }

    /// Take a Ready thread off its ready queue
    pub(crate) fn ki_remove_ready(&self, db: &mut DispatcherDatabase, thread: ThreadId) {
        let record = &db.threads[thread];
        let processor = record.next_processor;
        let priority = record.priority as usize;

        let prcb = &mut db.prcbs[processor as usize];
        prcb.ready_queues[priority].remove_entry(&mut db.threads, thread, crate::link!(KThread, wait_list_entry));
        if prcb.ready_queues[priority].is_empty() {
            prcb.clear_ready_bit(priority);
        }
        self.pcr(processor).set_ready_summary(prcb.ready_summary);
    }

    /// Find and dequeue the highest priority ready thread, at or above
    /// `low_priority`, that may run on `processor`.
    ///
    /// The processor's own queues win ties; other processors' queues are
    /// searched for threads whose affinity includes it.
    pub(crate) fn ki_find_ready_thread(
        &self,
        db: &mut DispatcherDatabase,
        processor: u32,
        low_priority: i8,
    ) -> Option<ThreadId> {
        let mask = 1u64 << processor;
        let link = crate::link!(KThread, wait_list_entry);
        let low = low_priority.max(LOW_PRIORITY) as usize;

        for priority in (low..=HIGH_PRIORITY as usize).rev() {
            if let Some(thread) = db.prcbs[processor as usize].ready_queues[priority].first() {
                self.ki_remove_ready(db, thread);
                return Some(thread);
            }

            for other in 0..db.processor_count() {
                if other == processor || db.prcbs[other as usize].ready_summary & (1 << priority) == 0 {
                    continue;
                }
                let found = db.prcbs[other as usize].ready_queues[priority]
                    .iter(&db.threads, link)
                    .find(|&thread| db.threads[thread].affinity & mask != 0);
                if let Some(thread) = found {
                    self.ki_remove_ready(db, thread);
                    return Some(thread);
                }
            }
        }
        None
    }

    /// Thread `processor` should run next: its standby thread, the best
    /// ready thread, or its idle thread
    pub(crate) fn ki_select_next_thread(&self, db: &mut DispatcherDatabase, processor: u32) -> ThreadId {
        if let Some(next) = db.prcbs[processor as usize].next_thread.take() {
            return next;
        }
        match self.ki_find_ready_thread(db, processor, LOW_PRIORITY) {
            Some(thread) => thread,
            None => db.prcbs[processor as usize].idle_thread,
        }
    }

    /// Make a thread runnable (KiReadyThread)
    ///
    /// An idle processor in the thread's affinity gets it as standby.
    /// Otherwise the thread preempts the standby or running thread of its
    /// chosen processor if it has higher priority, or is queued there.
    pub(crate) fn ki_ready_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId) {
        let record = &mut db.threads[thread];
        if !record.kernel_stack_resident {
            record.state = ThreadState::Transition;
            self.hal.schedule_stack_inswap(thread);
            ktrace!("[SCHED] thread {:?} in transition", thread);
            return;
        }

        let affinity = record.affinity;
        let priority = record.priority;
        let at_head = record.preempted;

        let idle = db.idle_summary & affinity;
        if idle != 0 {
            let processor = select_processor(record, idle);
            record.state = ThreadState::Standby;
            record.next_processor = processor;
            db.idle_summary &= !(1 << processor);
            db.prcbs[processor as usize].next_thread = Some(thread);
            self.request_software_interrupt(irql::DISPATCH_LEVEL, processor);
            ktrace!("[SCHED] thread {:?} standby on idle processor {}", thread, processor);
            return;
        }

        let processor = select_processor(record, affinity);
        let prcb = &db.prcbs[processor as usize];
        match prcb.next_thread {
            Some(standby) => {
                if priority > db.threads[standby].priority {
                    db.prcbs[processor as usize].next_thread = Some(thread);
                    let record = &mut db.threads[thread];
                    record.state = ThreadState::Standby;
                    record.next_processor = processor;
                    self.ki_insert_ready(db, processor, standby, true);
                    ktrace!("[SCHED] thread {:?} replaces standby {:?}", thread, standby);
                    return;
                }
            }
            None => {
                let current = prcb.current_thread;
                if current != thread && priority > db.threads[current].priority {
                    db.threads[current].preempted = true;
                    db.prcbs[processor as usize].next_thread = Some(thread);
                    let record = &mut db.threads[thread];
                    record.state = ThreadState::Standby;
                    record.next_processor = processor;
                    self.request_software_interrupt(irql::DISPATCH_LEVEL, processor);
                    ktrace!("[SCHED] thread {:?} preempts {:?} on {}", thread, current, processor);
                    return;
                }
            }
        }

        self.ki_insert_ready(db, processor, thread, at_head);
        ktrace!("[SCHED] thread {:?} ready on {}", thread, processor);
    }

    /// Switch this processor from its current thread to `new`.
    ///
    /// The caller has already set the old thread's state and `swap_busy`.
    /// Returns the old thread's wait status when it next runs.
    pub(crate) fn ki_context_switch(&self, mut guard: DispatcherGuard<'_>, new: ThreadId) -> WaitStatus {
        let processor = self.current_processor();
        let old = {
            let db = &mut *guard;
            let prcb = &mut db.prcbs[processor as usize];
            let old = prcb.current_thread;
            debug_assert_ne!(old, new, "switch to the running thread");

            prcb.current_thread = new;
            prcb.switching_from = Some(old);
            prcb.context_switches += 1;
            if new == prcb.idle_thread {
                db.idle_summary |= 1 << processor;
            } else {
                db.idle_summary &= !(1 << processor);
            }

            let record = &mut db.threads[new];
            record.state = ThreadState::Running;
            record.next_processor = processor;
            record.context_switches += 1;
            self.pcr(processor).set_current_thread(new);
            old
        };
        ktrace!("[SCHED] processor {} switch {:?} -> {:?}", processor, old, new);

        guard.release_at_synch_level();

        // The thread may still be saving its context on another processor
        while self.dispatcher.lock().threads[new].swap_busy {
            core::hint::spin_loop();
        }

        self.hal.swap_context(old, new);
        self.ki_finish_switch()
    }

    /// First thing a thread does after being switched to: release the
    /// thread it replaced and pick up a pending kernel APC. Returns the
    /// thread's wait status.
    pub(crate) fn ki_finish_switch(&self) -> WaitStatus {
        let processor = self.current_processor();
        let mut guard = self.lock_dispatcher_at_synch_level();
        let db = &mut *guard;

        if let Some(previous) = db.prcbs[processor as usize].switching_from.take() {
            if let Some(record) = db.threads.get_mut(previous) {
                record.swap_busy = false;
            }
        }

        let current = db.prcbs[processor as usize].current_thread;
        let record = &db.threads[current];
        if record.apc_state.kernel_apc_pending && record.special_apc_disable == 0 {
            self.pcr(processor).request(SoftwareInterrupts::APC);
        }
        record.wait_status
    }

    /// Block the current thread, whose wait state is already set up, and
    /// run the next thread. Returns the wait status once resumed, back at
    /// the IRQL the wait was entered at.
    pub(crate) fn ki_swap_thread(&self, mut guard: DispatcherGuard<'_>) -> WaitStatus {
        let processor = self.current_processor();
        let (next, wait_irql) = {
            let db = &mut *guard;
            let current = db.prcbs[processor as usize].current_thread;
            let wait_irql = db.threads[current].wait_irql;
            (self.ki_select_next_thread(db, processor), wait_irql)
        };

        let status = self.ki_context_switch(guard, next);
        self.lower_irql(wait_irql);
        status
    }

    /// Dispatch software interrupt handler (KiDispatchInterrupt)
    ///
    /// Runs at DISPATCH_LEVEL. Handles a pending quantum end, then switches
    /// to the standby thread if one was selected.
    pub fn dispatch_interrupt(&self) {
        let processor = self.current_processor();
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        if core::mem::take(&mut db.prcbs[processor as usize].quantum_end) {
            self.ki_quantum_end(db, processor);
        }

        let Some(next) = db.prcbs[processor as usize].next_thread.take() else {
            return;
        };

        let prcb = &db.prcbs[processor as usize];
        let current = prcb.current_thread;
        if current != prcb.idle_thread {
            db.threads[current].swap_busy = true;
            self.ki_ready_thread(db, current);
        }

        self.ki_context_switch(guard, next);
        self.lower_irql(irql::DISPATCH_LEVEL);
    }

    /// Quantum end for the running thread (KiQuantumEnd)
    fn ki_quantum_end(&self, db: &mut DispatcherDatabase, processor: u32) {
        let prcb = &db.prcbs[processor as usize];
        let current = prcb.current_thread;
        if current == prcb.idle_thread {
            return;
        }

        let record = &mut db.threads[current];
        record.quantum = record.quantum_reset;
        record.priority = ki_compute_new_priority(record, 1);
        let priority = record.priority;

        if db.prcbs[processor as usize].next_thread.is_none() {
            if let Some(next) = self.ki_find_ready_thread(db, processor, priority) {
                db.threads[next].state = ThreadState::Standby;
                db.threads[next].next_processor = processor;
                db.prcbs[processor as usize].next_thread = Some(next);
            }
        }
        ktrace!("[SCHED] quantum end for {:?}, priority {}", current, priority);
    }

    /// Charge a wait that did not block (KiAdjustQuantumThread)
    ///
    /// Dynamic threads below the time-critical bound lose the wait quantum
    /// decrement; at quantum end they decay like a clock-driven quantum end
    /// and yield to a ready thread of at least equal priority.
    pub(crate) fn ki_adjust_quantum_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId) {
        let decrement = db.config.wait_quantum_decrement;
        let record = &mut db.threads[thread];
        if record.priority >= LOW_REALTIME_PRIORITY || record.base_priority >= TIME_CRITICAL_PRIORITY_BOUND {
            return;
        }

        record.quantum -= decrement;
        if record.quantum > 0 {
            return;
        }

        record.quantum = record.quantum_reset;
        record.priority = ki_compute_new_priority(record, 1);
        let priority = record.priority;

        let processor = self.current_processor();
        if db.prcbs[processor as usize].next_thread.is_none() {
            if let Some(next) = self.ki_find_ready_thread(db, processor, priority) {
                db.threads[next].state = ThreadState::Standby;
                db.threads[next].next_processor = processor;
                db.prcbs[processor as usize].next_thread = Some(next);
                self.request_software_interrupt(irql::DISPATCH_LEVEL, processor);
            }
        }
    }

    /// Clock interrupt (KeUpdateRunTime plus timer expiration)
    ///
    /// Expires due timers, charges the tick to the running thread and
    /// requests a quantum end when its quantum runs out.
    pub fn clock_tick(&self, previous_mode: ProcessorMode) {
        let processor = self.current_processor();
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        self.ki_expire_timers(db);

        let decrement = db.config.clock_quantum_decrement;
        let prcb = &db.prcbs[processor as usize];
        let current = prcb.current_thread;
        let idle = current == prcb.idle_thread;

        let record = &mut db.threads[current];
        match previous_mode {
            ProcessorMode::KernelMode => record.kernel_time += 1,
            ProcessorMode::UserMode => record.user_time += 1,
        }

        if !idle {
            record.quantum -= decrement;
            if record.quantum <= 0 {
                db.prcbs[processor as usize].quantum_end = true;
                self.request_software_interrupt(irql::DISPATCH_LEVEL, processor);
            }
        }
    }

    /// Give up the rest of the quantum (NtYieldExecution)
    ///
    /// Returns without taking the lock when this processor has nothing
    /// ready. Otherwise the thread is charged a full quantum and switches
    /// to a ready thread of at least equal priority, if there is one.
    pub fn yield_execution(&self) -> YieldStatus {
        let processor = self.current_processor();
        if self.pcr(processor).ready_summary() == 0 {
            return YieldStatus::NoYieldPerformed;
        }

        let mut guard = self.lock_dispatcher();
        let entry_irql = guard.entry_irql();
        let db = &mut *guard;

        let current = db.prcbs[processor as usize].current_thread;
        let record = &mut db.threads[current];
        record.quantum = record.quantum_reset;
        record.priority = ki_compute_new_priority(record, 1);
        let priority = record.priority;

        let next = match db.prcbs[processor as usize].next_thread.take() {
            Some(next) => Some(next),
            None => self.ki_find_ready_thread(db, processor, priority),
        };
        let Some(next) = next else {
            return YieldStatus::NoYieldPerformed;
        };

        db.threads[current].swap_busy = true;
        self.ki_insert_ready(db, processor, current, false);
        self.ki_context_switch(guard, next);
        self.lower_irql(entry_irql);
        YieldStatus::Success
    }

    /// Set the current priority of a thread (KeSetPriorityThread).
    /// Returns the previous priority.
    pub fn set_priority(&self, thread: ThreadId, priority: i8) -> Result<i8, KeError> {
        if !(1..=HIGH_PRIORITY).contains(&priority) {
            return Err(KeError::InvalidParameter);
        }

        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        let record = &mut db.threads[thread];
        let old = record.priority;
        record.priority_decrement = 0;
        if priority != old {
            record.quantum = record.quantum_reset;
            self.ki_set_priority_thread(db, thread, priority);
        }
        Ok(old)
    }

    /// Set the base priority of a thread relative to its process
    /// (KeSetBasePriorityThread). Returns the previous increment.
    ///
    /// An increment of magnitude 16 or more saturates the thread: its base
    /// pins to the top or bottom of its band and process base priority
    /// changes stop moving it.
    pub fn set_base_priority(&self, thread: ThreadId, increment: i8) -> i8 {
        const SATURATION_BOUND: i8 = (HIGH_PRIORITY + 1) / 2;

        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let process_base = db.processes[db.threads[thread].process].base_priority;
        let record = &mut db.threads[thread];

        let old_increment = if record.saturation != 0 {
            SATURATION_BOUND * record.saturation
        } else {
            record.base_priority - process_base
        };

        record.saturation = 0;
        if increment.unsigned_abs() >= SATURATION_BOUND as u8 {
            record.saturation = increment.signum();
        }

        let old_base = record.base_priority;
        let mut new_base = process_base.saturating_add(increment);
        let new_priority = if process_base >= LOW_REALTIME_PRIORITY {
            new_base = new_base.clamp(LOW_REALTIME_PRIORITY, HIGH_PRIORITY);
            new_base
        } else {
            new_base = new_base.clamp(1, LOW_REALTIME_PRIORITY - 1);
            if record.saturation != 0 {
                new_base
            } else {
                let current = ki_compute_new_priority(record, 0);
                (current + new_base - old_base).clamp(1, LOW_REALTIME_PRIORITY - 1)
            }
        };

        record.base_priority = new_base;
        record.priority_decrement = 0;
        if new_priority != record.priority {
            record.quantum = record.quantum_reset;
            self.ki_set_priority_thread(db, thread, new_priority);
        }
        old_increment
    }

    /// Change a thread's priority, moving it between ready queues or
    /// rescheduling its processor as its state requires (KiSetPriorityThread)
    pub(crate) fn ki_set_priority_thread(&self, db: &mut DispatcherDatabase, thread: ThreadId, priority: i8) {
        let record = &db.threads[thread];
        let old = record.priority;
        if old == priority {
            return;
        }

        match record.state {
            ThreadState::Ready => {
                self.ki_remove_ready(db, thread);
                db.threads[thread].priority = priority;
                self.ki_ready_thread(db, thread);
            }
            ThreadState::Standby => {
                let processor = record.next_processor;
                db.threads[thread].priority = priority;
                if priority < old {
                    if let Some(next) = self.ki_find_ready_thread(db, processor, priority + 1) {
                        db.threads[next].state = ThreadState::Standby;
                        db.threads[next].next_processor = processor;
                        db.prcbs[processor as usize].next_thread = Some(next);
                        self.ki_ready_thread(db, thread);
                    }
                }
            }
            ThreadState::Running => {
                let processor = record.next_processor;
                db.threads[thread].priority = priority;
                if priority < old && db.prcbs[processor as usize].next_thread.is_none() {
                    if let Some(next) = self.ki_find_ready_thread(db, processor, priority + 1) {
                        db.threads[next].state = ThreadState::Standby;
                        db.threads[next].next_processor = processor;
                        db.prcbs[processor as usize].next_thread = Some(next);
                        self.request_software_interrupt(irql::DISPATCH_LEVEL, processor);
                    }
                }
            }
            _ => db.threads[thread].priority = priority,
        }
        ktrace!("[SCHED] thread {:?} priority {} -> {}", thread, old, priority);
    }

    /// Set the affinity of a thread (KeSetAffinityThread). Returns the
    /// previous affinity. A thread standing by or running on a processor
    /// outside the new set is rescheduled.
    pub fn set_affinity(&self, thread: ThreadId, affinity: u64) -> u64 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let process_affinity = db.processes[db.threads[thread].process].affinity;
        if affinity == 0 || affinity & !process_affinity != 0 {
            crate::bugcheck!(codes::INVALID_AFFINITY_SET, affinity, process_affinity);
        }

        let record = &mut db.threads[thread];
        let old = record.user_affinity;
        record.affinity = affinity;
        record.user_affinity = affinity;
        if affinity & (1 << record.ideal_processor) == 0 {
            record.ideal_processor = affinity.trailing_zeros();
        }

        let processor = record.next_processor;
        if affinity & (1 << processor) != 0 {
            return old;
        }

        match record.state {
            ThreadState::Ready => {
                self.ki_remove_ready(db, thread);
                self.ki_ready_thread(db, thread);
            }
            ThreadState::Standby => {
                let prcb = &mut db.prcbs[processor as usize];
                prcb.next_thread = None;
                if prcb.is_idle() {
                    db.idle_summary |= 1 << processor;
                }
                if let Some(next) = self.ki_find_ready_thread(db, processor, LOW_PRIORITY) {
                    db.threads[next].state = ThreadState::Standby;
                    db.threads[next].next_processor = processor;
                    db.prcbs[processor as usize].next_thread = Some(next);
                    db.idle_summary &= !(1 << processor);
                }
                self.ki_ready_thread(db, thread);
            }
            ThreadState::Running => {
                if db.prcbs[processor as usize].next_thread.is_none() {
                    let next = match self.ki_find_ready_thread(db, processor, LOW_PRIORITY) {
                        Some(next) => {
                            db.threads[next].state = ThreadState::Standby;
                            db.threads[next].next_processor = processor;
                            next
                        }
                        None => db.prcbs[processor as usize].idle_thread,
                    };
                    db.prcbs[processor as usize].next_thread = Some(next);
                    self.request_software_interrupt(irql::DISPATCH_LEVEL, processor);
                }
            }
            _ => {}
        }
        old
    }

    /// Idle thread body
    ///
    /// Entered at SYNCH_LEVEL through the first switch to the idle thread,
    /// or directly by a secondary processor. Runs at DISPATCH_LEVEL, expires
    /// timers, and otherwise hands the processor to the platform until the
    /// next timer is due.
    pub fn idle_loop(&self) -> ! {
        if self.current_irql() < irql::SYNCH_LEVEL {
            self.raise_irql(irql::SYNCH_LEVEL);
        }
        self.ki_finish_switch();
        self.lower_irql(irql::DISPATCH_LEVEL);

        loop {
            let processor = self.current_processor();
            let mut guard = self.lock_dispatcher();
            let db = &mut *guard;

            self.pcr(processor).take(SoftwareInterrupts::DISPATCH);
            self.ki_expire_timers(db);

            let next = match db.prcbs[processor as usize].next_thread.take() {
                Some(next) => Some(next),
                None => self.ki_find_ready_thread(db, processor, LOW_PRIORITY),
            };

            match next {
                Some(next) => {
                    self.ki_context_switch(guard, next);
                    self.lower_irql(irql::DISPATCH_LEVEL);
                }
                None => {
                    let due = db.next_timer_due();
                    drop(guard);
                    self.hal.idle(due);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::HostedHal;
    use crate::ke::dispatcher::{Timeout, WaitReason};
    use crate::ke::event::EventType;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    /// Create a thread in the database and park it in the Waiting state
    fn waiting_thread(kernel: &Kernel, priority: i8) -> ThreadId {
        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        let thread = db.initialize_thread(kernel.system_process());
        db.start_thread(thread);
        let record = &mut db.threads[thread];
        record.priority = priority;
        record.base_priority = priority;
        record.state = ThreadState::Waiting;
        thread
    }

    #[test]
    fn test_compute_new_priority_decays_to_base() {
        let kernel = HostedHal::kernel();
        let thread = waiting_thread(&kernel, 8);
        let mut guard = kernel.lock_dispatcher();
        let record = &mut guard.threads[thread];

        record.priority = 12;
        record.priority_decrement = 2;
        assert_eq!(ki_compute_new_priority(record, 1), 9);
        assert_eq!(record.priority_decrement, 0);

        record.priority = 9;
        assert_eq!(ki_compute_new_priority(record, 1), 8);

        record.priority = 20;
        assert_eq!(ki_compute_new_priority(record, 1), 20);
    }

    #[test]
    fn test_ready_thread_prefers_idle_processor() {
        let kernel = HostedHal::kernel_with_processors(4);
        let thread = waiting_thread(&kernel, 8);

        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        db.threads[thread].ideal_processor = 2;
        kernel.ki_ready_thread(db, thread);

        assert_eq!(db.threads[thread].state, ThreadState::Standby);
        assert_eq!(db.prcbs[2].next_thread, Some(thread));
        assert_eq!(db.idle_summary, 0b1010);
    }

    #[test]
    fn test_ready_thread_queues_equal_priority() {
        let kernel = HostedHal::kernel();
        let thread = waiting_thread(&kernel, 8);

        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        kernel.ki_ready_thread(db, thread);

        assert_eq!(db.threads[thread].state, ThreadState::Ready);
        assert_eq!(db.prcbs[0].ready_summary, 1 << 8);
        assert_eq!(kernel.pcr(0).ready_summary(), 1 << 8);
        assert!(db.prcbs[0].next_thread.is_none());
    }

    #[test]
    fn test_higher_priority_preempts_running_thread() {
        let kernel = HostedHal::kernel();
        let thread = waiting_thread(&kernel, 12);

        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        kernel.ki_ready_thread(db, thread);

        assert_eq!(db.threads[thread].state, ThreadState::Standby);
        assert_eq!(db.prcbs[0].next_thread, Some(thread));
        assert!(db.threads[kernel.current_thread()].preempted);
        assert!(kernel.pcr(0).pending().contains(SoftwareInterrupts::DISPATCH));
    }

    #[test]
    fn test_higher_priority_replaces_standby() {
        let kernel = HostedHal::kernel();
        let low = waiting_thread(&kernel, 10);
        let high = waiting_thread(&kernel, 12);

        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        kernel.ki_ready_thread(db, low);
        kernel.ki_ready_thread(db, high);

        assert_eq!(db.prcbs[0].next_thread, Some(high));
        assert_eq!(db.threads[low].state, ThreadState::Ready);
        assert_eq!(db.prcbs[0].ready_queues[10].first(), Some(low));
    }

    #[test]
    fn test_find_ready_thread_respects_floor_and_affinity() {
        let kernel = HostedHal::kernel_with_processors(2);
        let thread = waiting_thread(&kernel, 6);

        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        db.threads[thread].affinity = 0b10;
        kernel.ki_insert_ready(db, 1, thread, false);
        assert_eq!(db.threads[thread].state, ThreadState::Ready);

        assert_eq!(kernel.ki_find_ready_thread(db, 0, LOW_PRIORITY), None);
        assert_eq!(kernel.ki_find_ready_thread(db, 1, 7), None);
        assert_eq!(kernel.ki_find_ready_thread(db, 1, LOW_PRIORITY), Some(thread));
        assert_eq!(db.prcbs[1].ready_summary, 0);
    }

    #[test]
    fn test_non_resident_stack_enters_transition() {
        let (kernel, hosted) = HostedHal::boot(1);
        let thread = waiting_thread(&kernel, 8);

        let mut guard = kernel.lock_dispatcher();
        let db = &mut *guard;
        db.threads[thread].kernel_stack_resident = false;
        kernel.ki_ready_thread(db, thread);

        assert_eq!(db.threads[thread].state, ThreadState::Transition);
        assert_eq!(hosted.inswap_requests(), [thread]);
    }

    #[test]
    fn test_set_base_priority_saturates() {
        let kernel = HostedHal::kernel();
        let thread = waiting_thread(&kernel, 8);

        assert_eq!(kernel.set_base_priority(thread, 2), 0);
        assert_eq!(kernel.lock_dispatcher().thread(thread).base_priority, 10);
        assert_eq!(kernel.lock_dispatcher().thread(thread).priority, 10);

        assert_eq!(kernel.set_base_priority(thread, 16), 2);
        {
            let db = kernel.lock_dispatcher();
            assert_eq!(db.thread(thread).saturation, 1);
            assert_eq!(db.thread(thread).base_priority, LOW_REALTIME_PRIORITY - 1);
        }

        assert_eq!(kernel.set_base_priority(thread, 0), 16);
        assert_eq!(kernel.lock_dispatcher().thread(thread).saturation, 0);
    }

    #[test]
    fn test_set_priority_moves_ready_thread() {
        let kernel = HostedHal::kernel();
        let thread = waiting_thread(&kernel, 6);
        {
            let mut guard = kernel.lock_dispatcher();
            let db = &mut *guard;
            kernel.ki_ready_thread(db, thread);
        }

        assert_eq!(kernel.set_priority(thread, 7), Ok(6));
        assert_eq!(kernel.set_priority(thread, 0), Err(KeError::InvalidParameter));

        let db = kernel.lock_dispatcher();
        assert_eq!(db.prcb(0).ready_summary, 1 << 7);
        assert_eq!(db.thread(thread).state, ThreadState::Ready);
    }

    #[test]
    #[should_panic(expected = "INVALID_AFFINITY_SET")]
    fn test_set_affinity_outside_process_bugchecks() {
        let kernel = HostedHal::kernel();
        let thread = waiting_thread(&kernel, 8);
        kernel.set_affinity(thread, 0b10);
    }

    #[test]
    fn test_set_affinity_moves_thread_off_processor() {
        let kernel = HostedHal::kernel_with_processors(2);
        let thread = waiting_thread(&kernel, 6);
        {
            let mut guard = kernel.lock_dispatcher();
            let db = &mut *guard;
            db.idle_summary = 0;
            db.threads[thread].ideal_processor = 0;
            kernel.ki_ready_thread(db, thread);
            assert_eq!(db.threads[thread].next_processor, 0);
        }

        // Processor 1 runs its idle thread, so the thread preempts it
        assert_eq!(kernel.set_affinity(thread, 0b10), 0b11);
        let db = kernel.lock_dispatcher();
        assert_eq!(db.thread(thread).state, ThreadState::Standby);
        assert_eq!(db.thread(thread).ideal_processor, 1);
        assert_eq!(db.prcb(1).next_thread, Some(thread));
        assert_eq!(db.prcb(0).ready_summary, 0);
    }

    #[test]
    fn test_yield_without_ready_threads_is_noop() {
        let kernel = HostedHal::kernel();
        assert_eq!(kernel.yield_execution(), YieldStatus::NoYieldPerformed);
    }

    #[test]
    fn test_yield_runs_equal_priority_thread() {
        let kernel = HostedHal::kernel();
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);

        kernel
            .create_thread(kernel.system_process(), move |_| log.lock().unwrap().push("worker"), None, None, false)
            .unwrap();

        assert_eq!(kernel.yield_execution(), YieldStatus::Success);
        order.lock().unwrap().push("initial");
        assert_eq!(*order.lock().unwrap(), ["worker", "initial"]);
    }

    #[test]
    fn test_higher_priority_thread_runs_immediately() {
        let kernel = HostedHal::kernel();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        kernel
            .create_thread(kernel.system_process(), move |_| *flag.lock().unwrap() = true, Some(12), None, false)
            .unwrap();

        // The dispatch interrupt fired when create_thread dropped the lock
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_clock_quantum_end_round_robins() {
        let kernel = HostedHal::kernel();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        kernel
            .create_thread(kernel.system_process(), move |_| *flag.lock().unwrap() = true, None, None, false)
            .unwrap();

        kernel.clock_tick(ProcessorMode::KernelMode);
        assert!(!*ran.lock().unwrap());
        kernel.clock_tick(ProcessorMode::KernelMode);
        assert!(*ran.lock().unwrap());

        let db = kernel.lock_dispatcher();
        let record = db.thread(kernel.current_thread());
        assert_eq!(record.kernel_time, 2);
        assert_eq!(record.quantum, record.quantum_reset);
    }

    #[test]
    fn test_clock_tick_charges_user_time() {
        let kernel = HostedHal::kernel();
        kernel.clock_tick(ProcessorMode::UserMode);
        assert_eq!(kernel.lock_dispatcher().thread(kernel.current_thread()).user_time, 1);
    }

    #[test]
    fn test_fast_path_waits_decay_like_quantum_end() {
        let kernel = HostedHal::kernel();
        let event = kernel.create_event(EventType::Notification, true);
        let current = kernel.current_thread();
        {
            let mut guard = kernel.lock_dispatcher();
            let record = &mut guard.threads[current];
            record.priority = 12;
            record.priority_decrement = 4;
        }

        let quantum = kernel.config().thread_quantum;
        for _ in 0..quantum - 1 {
            let status =
                kernel.wait_for_single_object(event, WaitReason::Executive, ProcessorMode::KernelMode, false, None);
            assert_eq!(status, WaitStatus::SUCCESS);
        }
        assert_eq!(kernel.lock_dispatcher().thread(current).priority, 12);

        kernel.wait_for_single_object(
            event,
            WaitReason::Executive,
            ProcessorMode::KernelMode,
            false,
            Some(Timeout::Relative(0)),
        );
        let db = kernel.lock_dispatcher();
        assert_eq!(db.thread(current).priority, 8);
        assert_eq!(db.thread(current).quantum, quantum);
    }
}
