//! Kernel Queue Object (KQUEUE)
//!
//! A queue distributes work entries to a pool of consumer threads while
//! capping how many of them run at once:
//!
//! - `signal_state` counts queued entries
//! - `current_count` counts associated threads that are active (not
//!   blocked), bounded by `maximum_count`
//! - A thread becomes associated with a queue the first time it removes
//!   from it and stays associated until it removes from another queue,
//!   terminates, or the queue is run down
//!
//! When an associated thread blocks on anything other than its queue, its
//! slot is handed to a waiting consumer (`ki_activate_waiter_queue`), so
//! the concurrency target holds across blocking work items.
//!
//! # Ordering
//!
//! Entries are FIFO (or pushed at the head). Waiting consumers are served
//! LIFO: the most recently blocked thread is the one most likely to still
//! be cache-warm.
//!
//! An ordinary wait satisfied by a queue object takes one unit of its signal
//! state and claims the head entry for the waiting thread. The thread's next
//! [`Kernel::remove_queue`] on that queue returns the claimed entry, so
//! `signal_state` and the entry list stay equal.
//!
//! # NT Compatibility
//! Equivalent to KeInitializeQueue / KeInsertQueue / KeInsertHeadQueue /
//! KeRemoveQueue / KeRundownQueue / KeReadStateQueue

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use super::bugcheck::codes;
use super::dispatcher::{
    DispatcherDatabase, DispatcherObject, DispatcherType, KWaitBlock, ObjectBody, ObjectId, ProcessorMode, Timeout,
    WaitReason, WaitStatus,
};
use super::kernel::Kernel;
use super::kpcr::irql;
use super::list::ListHead;
use super::thread::{KThread, ThreadId, ThreadState};
use super::wait::{ki_check_alert, ki_check_wait_irql, WaitDeadline};

/// A work item handed through a queue. The value is opaque to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueEntry(pub usize);

/// Queue state kept in the object body
#[derive(Debug, Default)]
pub struct KQueue {
    /// Pending entries
    pub entry_list: VecDeque<QueueEntry>,
    /// Associated threads
    pub thread_list_head: ListHead<KThread>,
    /// Associated threads currently active
    pub current_count: u32,
    /// Concurrency target
    pub maximum_count: u32,
}

impl DispatcherDatabase {
    /// Last thread to block dequeuing from `queue`
    fn last_queue_waiter(&self, queue: ObjectId) -> Option<ThreadId> {
        let link = crate::link!(KWaitBlock, wait_list_entry);
        let mut cursor = self.objects[queue].header.wait_list_head.last();
        while let Some(block) = cursor {
            let record = &self.wait_blocks[block];
            if record.dequeue {
                return Some(record.thread);
            }
            cursor = ListHead::prev(&self.wait_blocks, block, link);
        }
        None
    }
}

impl Kernel {
    /// Create a queue (KeInitializeQueue). A `maximum_count` of zero means
    /// one active thread per processor.
    pub fn create_queue(&self, maximum_count: u32) -> ObjectId {
        let maximum_count = if maximum_count == 0 {
            self.processor_count()
        } else {
            maximum_count
        };

        let queue = self.lock_dispatcher().objects.insert(DispatcherObject::new(
            DispatcherType::Queue,
            0,
            ObjectBody::Queue(KQueue {
                maximum_count,
                ..KQueue::default()
            }),
        ));
        log::debug!("[QUEUE] created queue {:?}, maximum count {}", queue, maximum_count);
        queue
    }

    /// Queue an entry at the tail (KeInsertQueue). Returns the previous
    /// signal state.
    pub fn insert_queue(&self, queue: ObjectId, entry: QueueEntry) -> i32 {
        let mut guard = self.lock_dispatcher();
        self.ki_insert_queue(&mut guard, queue, entry, false)
    }

    /// Queue an entry at the head (KeInsertHeadQueue)
    pub fn insert_head_queue(&self, queue: ObjectId, entry: QueueEntry) -> i32 {
        let mut guard = self.lock_dispatcher();
        self.ki_insert_queue(&mut guard, queue, entry, true)
    }

    fn ki_insert_queue(&self, db: &mut DispatcherDatabase, queue: ObjectId, entry: QueueEntry, at_head: bool) -> i32 {
        db.objects[queue].expect_type(DispatcherType::Queue);
        let current = self.current_thread();
        let old = db.objects[queue].header.signal_state;

        // A consumer of this queue queuing more work keeps its own slot
        let current_record = &db.threads[current];
        let own_consumer = current_record.queue == Some(queue) && current_record.wait_reason == WaitReason::Queue;

        let record = db.objects[queue].queue();
        if record.current_count < record.maximum_count && !own_consumer {
            if let Some(waiter) = db.last_queue_waiter(queue) {
                db.threads[waiter].wait_entry = Some(entry);
                self.ki_unwait_thread(db, waiter, WaitStatus::SUCCESS, 0);
                ktrace!("[QUEUE] entry {:?} handed to {:?}", entry, waiter);
                return old;
            }
        }

        let object = &mut db.objects[queue];
        object.header.signal_state += 1;
        let entries = &mut object.queue_mut().entry_list;
        if at_head {
            entries.push_front(entry);
        } else {
            entries.push_back(entry);
        }

        if old == 0 && !object.header.wait_list_head.is_empty() {
            self.ki_wait_test(db, queue, 0);
        }
        old
    }

    /// Dequeue an entry (KeRemoveQueue, non-alertable)
    pub fn remove_queue(
        &self,
        queue: ObjectId,
        mode: ProcessorMode,
        timeout: Option<Timeout>,
    ) -> Result<QueueEntry, WaitStatus> {
        self.remove_queue_ex(queue, mode, false, timeout)
    }

    /// Dequeue an entry, blocking while none is available or the queue is
    /// at its concurrency target.
    ///
    /// The calling thread becomes associated with `queue`, leaving any
    /// previous queue. Fails with `Timeout`, `Alerted` or `UserApc`.
    pub fn remove_queue_ex(
        &self,
        queue: ObjectId,
        mode: ProcessorMode,
        alertable: bool,
        timeout: Option<Timeout>,
    ) -> Result<QueueEntry, WaitStatus> {
        let thread = self.current_thread();
        let deadline = WaitDeadline::resolve(timeout, self.interrupt_time());
        let mut first_pass = true;

        loop {
            let mut guard = self.lock_dispatcher();
            let entry_irql = guard.entry_irql();
            let db = &mut *guard;
            db.objects[queue].expect_type(DispatcherType::Queue);

            if mem::take(&mut first_pass) {
                self.ki_associate_queue(db, thread, queue);

                let claimed = &mut db.threads[thread].claimed_entries;
                if let Some(position) = claimed.iter().position(|&(owner, _)| owner == queue) {
                    let (_, entry) = claimed.remove(position);
                    db.objects[queue].queue_mut().current_count += 1;
                    self.ki_adjust_quantum_thread(db, thread);
                    return Ok(entry);
                }
            } else {
                // The wake that restarted this pass counted the thread active
                let record = db.objects[queue].queue_mut();
                record.current_count = record.current_count.saturating_sub(1);
            }

            let record = db.objects[queue].queue_mut();
            if record.current_count < record.maximum_count {
                if let Some(entry) = record.entry_list.pop_front() {
                    record.current_count += 1;
                    db.objects[queue].header.signal_state -= 1;
                    self.ki_adjust_quantum_thread(db, thread);
                    return Ok(entry);
                }
            }

            if self.ki_kernel_apc_retry(db, thread, entry_irql) {
                db.objects[queue].queue_mut().current_count += 1;
                self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
                continue;
            }
            if let Some(status) = ki_check_alert(db, thread, mode, alertable) {
                db.objects[queue].queue_mut().current_count += 1;
                self.ki_adjust_quantum_thread(db, thread);
                return Err(status);
            }

            ki_check_wait_irql(entry_irql, thread);
            if !self.ki_arm_wait_timer(db, thread, deadline) {
                db.objects[queue].queue_mut().current_count += 1;
                self.ki_adjust_quantum_thread(db, thread);
                return Err(WaitStatus::Timeout);
            }

            let block = db.threads[thread].wait_blocks[0];
            db.wait_blocks[block] = KWaitBlock {
                dequeue: true,
                ..KWaitBlock::new(thread, queue)
            };
            db.objects[queue].header.wait_list_head.insert_tail(
                &mut db.wait_blocks,
                block,
                crate::link!(KWaitBlock, wait_list_entry),
            );
            let record = &mut db.threads[thread];
            record.wait_block_list = vec![block];
            record.wait_entry = None;

            self.ki_commit_wait(
                db,
                thread,
                WaitReason::Queue,
                mode,
                alertable,
                entry_irql,
                ThreadState::Waiting,
                false,
            );

            match self.ki_swap_thread(guard) {
                WaitStatus::KernelApc => continue,
                WaitStatus::Object(0) => {
                    let entry = self.lock_dispatcher().threads[thread].wait_entry.take();
                    return match entry {
                        Some(entry) => Ok(entry),
                        None => crate::bugcheck!(codes::INVALID_WORK_QUEUE_ITEM, queue.to_raw(), thread.to_raw()),
                    };
                }
                status => return Err(status),
            }
        }
    }

    /// Make `thread` a consumer of `queue`, leaving its previous queue
    fn ki_associate_queue(&self, db: &mut DispatcherDatabase, thread: ThreadId, queue: ObjectId) {
        let link = crate::link!(KThread, queue_list_entry);
        match db.threads[thread].queue {
            Some(current) if current == queue => {
                let record = db.objects[queue].queue_mut();
                record.current_count = record.current_count.saturating_sub(1);
                return;
            }
            Some(previous) => {
                db.objects[previous]
                    .queue_mut()
                    .thread_list_head
                    .remove_entry(&mut db.threads, thread, link);
                db.threads[thread].queue = None;
                self.ki_activate_waiter_queue(db, previous);
            }
            None => {}
        }

        db.threads[thread].queue = Some(queue);
        db.objects[queue]
            .queue_mut()
            .thread_list_head
            .insert_tail(&mut db.threads, thread, link);
    }

    /// An associated thread stopped being active: release its slot and
    /// hand the next entry to a waiting consumer if the target allows
    /// (KiActivateWaiterQueue)
    pub(crate) fn ki_activate_waiter_queue(&self, db: &mut DispatcherDatabase, queue: ObjectId) {
        let record = db.objects[queue].queue_mut();
        record.current_count = record.current_count.saturating_sub(1);
        if record.current_count >= record.maximum_count || record.entry_list.is_empty() {
            return;
        }

        let Some(waiter) = db.last_queue_waiter(queue) else {
            return;
        };
        let Some(entry) = db.objects[queue].queue_mut().entry_list.pop_front() else {
            return;
        };
        db.objects[queue].header.signal_state -= 1;
        db.threads[waiter].wait_entry = Some(entry);
        self.ki_unwait_thread(db, waiter, WaitStatus::SUCCESS, 0);
        ktrace!("[QUEUE] activated {:?} on {:?}", waiter, queue);
    }

    /// Tear down a queue (KeRundownQueue): disassociate every thread and
    /// return the pending entries, if any.
    ///
    /// The caller must have stopped new consumers; a thread still blocked
    /// on the queue bugchecks.
    pub fn rundown_queue(&self, queue: ObjectId) -> Option<Vec<QueueEntry>> {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        db.objects[queue].expect_type(DispatcherType::Queue);

        if let Some(block) = db.objects[queue].header.wait_list_head.first() {
            crate::bugcheck!(
                codes::QUEUE_RUNDOWN_WITH_WAITERS,
                queue.to_raw(),
                db.wait_blocks[block].thread.to_raw()
            );
        }

        let link = crate::link!(KThread, queue_list_entry);
        while let Some(thread) = db.objects[queue]
            .queue_mut()
            .thread_list_head
            .remove_head(&mut db.threads, link)
        {
            db.threads[thread].queue = None;
        }

        let object = &mut db.objects[queue];
        object.header.signal_state = 0;
        let entries: Vec<QueueEntry> = mem::take(&mut object.queue_mut().entry_list).into();
        log::debug!("[QUEUE] rundown of {:?}, {} entries pending", queue, entries.len());
        (!entries.is_empty()).then_some(entries)
    }

    /// Number of pending entries (KeReadStateQueue)
    pub fn read_state_queue(&self, queue: ObjectId) -> i32 {
        let guard = self.lock_dispatcher();
        let object = &guard.objects[queue];
        object.expect_type(DispatcherType::Queue);
        object.header.signal_state
    }
}
