//! Kernel Balance Set Manager: kernel stack swapping
//!
//! A thread that blocks in a wait whose stack the platform allows to be
//! paged (see [`Hal::is_kernel_stack_swappable`]) is kept on its
//! processor's swap list, oldest wait first. The balance set manager
//! periodically takes the threads that have waited longer than the stack
//! protect time off that list and marks their stacks non-resident.
//!
//! - When the last resident stack of a process goes, the platform is asked
//!   to outswap the process.
//! - A thread readied with a non-resident stack goes to `Transition` and
//!   the platform is asked to page the stack back in; it reports back
//!   through [`Kernel::stack_inswap_complete`].
//!
//! Based on Windows Server 2003 base/ntos/ke/balmgr.c
//!
//! [`Hal::is_kernel_stack_swappable`]: crate::hal::Hal::is_kernel_stack_swappable

use super::bugcheck::codes;
use super::kernel::Kernel;
use super::thread::{KThread, ThreadId, ThreadState};

/// Maximum number of thread stacks that can be swapped out in one period
pub const MAXIMUM_THREAD_STACKS: usize = 5;

impl Kernel {
    /// Page out the stacks of threads that have been waiting longer than
    /// the configured stack protect time (KiOutSwapKernelStacks). Returns
    /// the number of stacks marked non-resident.
    pub fn outswap_kernel_stacks(&self) -> usize {
        let now = self.interrupt_time();
        let protect_time = self.config.stack_protect_time;
        let link = crate::link!(KThread, wait_list_entry);

        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        let mut swapped = 0;

        for processor in 0..db.prcbs.len() {
            let mut next = db.prcbs[processor].wait_list_head.first();
            while let Some(thread) = next {
                if swapped == MAXIMUM_THREAD_STACKS {
                    break;
                }
                let record = &db.threads[thread];
                if now.saturating_sub(record.wait_time) < protect_time {
                    break;
                }
                next = super::list::ListHead::next(&db.threads, thread, link);
                if record.swap_busy {
                    continue;
                }

                db.prcbs[processor]
                    .wait_list_head
                    .remove_entry(&mut db.threads, thread, link);
                let record = &mut db.threads[thread];
                record.swap_list_processor = None;
                record.kernel_stack_resident = false;
                swapped += 1;

                let process = record.process;
                let process_record = &mut db.processes[process];
                process_record.stack_count -= 1;
                if process_record.stack_count == 0 {
                    self.hal.schedule_process_outswap(process);
                }
                log::trace!("[KE] outswapped kernel stack of {:?}", thread);
            }
        }

        if swapped != 0 {
            log::debug!("[KE] swapped out {} thread stacks", swapped);
        }
        swapped
    }

    /// The platform paged a `Transition` thread's stack back in; make the
    /// thread ready
    pub fn stack_inswap_complete(&self, thread: ThreadId) {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let record = &mut db.threads[thread];
        if record.state != ThreadState::Transition {
            crate::bugcheck!(codes::INVALID_THREAD_STATE, thread.to_raw(), record.state as u8);
        }
        record.kernel_stack_resident = true;
        let process = record.process;
        db.processes[process].stack_count += 1;

        log::trace!("[KE] inswapped kernel stack of {:?}", thread);
        self.ki_ready_thread(db, thread);
    }
}
