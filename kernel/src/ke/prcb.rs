//! Kernel Processor Control Block (KPRCB)
//!
//! The KPRCB contains per-processor scheduling state:
//! - Current, next (standby) and idle thread
//! - Ready queues (32 priority levels) with a summary bitmap
//! - The list of waiting threads whose kernel stacks may be paged out
//!
//! Every field is protected by the dispatcher lock; the lock-free mirror
//! of what other processors need to read lives in
//! [`KPcr`](super::kpcr::KPcr).

use super::list::ListHead;
use super::thread::{constants::MAXIMUM_PRIORITY, KThread, ThreadId};

/// Kernel Processor Control Block
///
/// Modeled after Windows NT's KPRCB structure.
pub struct KPrcb {
    /// Processor number (0 for the boot processor)
    pub number: u32,

    /// Currently running thread
    pub current_thread: ThreadId,

    /// Thread selected to run next (in Standby)
    pub next_thread: Option<ThreadId>,

    /// Idle thread for this processor
    pub idle_thread: ThreadId,

    /// Bitmap of non-empty ready queues
    /// Bit N is set if ready_queues[N] is non-empty
    pub ready_summary: u32,

    /// Ready queues (one per priority level 0-31)
    /// Higher index = higher priority
    pub ready_queues: [ListHead<KThread>; MAXIMUM_PRIORITY],

    /// Waiting threads with pageable kernel stacks, oldest first
    pub wait_list_head: ListHead<KThread>,

    /// Thread whose context is being saved by the switch in progress;
    /// cleared by the incoming thread
    pub switching_from: Option<ThreadId>,

    /// Number of context switches on this processor
    pub context_switches: u64,

    /// Quantum end flag (set by the clock, cleared by the dispatcher)
    pub quantum_end: bool,
}

impl KPrcb {
    pub fn new(number: u32, current_thread: ThreadId, idle_thread: ThreadId) -> Self {
        Self {
            number,
            current_thread,
            next_thread: None,
            idle_thread,
            ready_summary: 0,
            ready_queues: core::array::from_fn(|_| ListHead::new()),
            wait_list_head: ListHead::new(),
            switching_from: None,
            context_switches: 0,
            quantum_end: false,
        }
    }

    /// Find the highest priority non-empty ready queue
    #[inline]
    pub fn find_highest_ready_priority(&self) -> Option<usize> {
        if self.ready_summary == 0 {
            return None;
        }

        let priority = 31 - self.ready_summary.leading_zeros();
        Some(priority as usize)
    }

    #[inline]
    pub fn has_ready_threads(&self) -> bool {
        self.ready_summary != 0
    }

    #[inline]
    pub fn set_ready_bit(&mut self, priority: usize) {
        self.ready_summary |= 1 << priority;
    }

    #[inline]
    pub fn clear_ready_bit(&mut self, priority: usize) {
        self.ready_summary &= !(1 << priority);
    }

    /// Is this processor running its idle thread
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.current_thread == self.idle_thread
    }
}
