//! Kernel Processor Control Region (KPCR)
//!
//! The lock-free half of the per-processor state: which thread is running
//! and which software interrupts are requested. Everything the dispatcher
//! lock protects lives in [`KPrcb`](super::prcb::KPrcb) instead.
//!
//! Software interrupts are latched here and serviced when the processor's
//! IRQL drops below the requested level (see `Kernel::lower_irql`).

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

use super::thread::ThreadId;

/// Interrupt request level
pub type Kirql = u8;

/// IRQL levels
pub mod irql {
    use super::Kirql;

    /// Normal thread execution
    pub const PASSIVE_LEVEL: Kirql = 0;
    /// APC delivery disabled
    pub const APC_LEVEL: Kirql = 1;
    /// Dispatcher, DPC level
    pub const DISPATCH_LEVEL: Kirql = 2;
    /// Clock interrupt
    pub const CLOCK_LEVEL: Kirql = 28;
    /// Inter-processor interrupt
    pub const IPI_LEVEL: Kirql = 29;
    /// Power failure
    pub const POWER_LEVEL: Kirql = 30;
    /// Highest level, all interrupts masked
    pub const HIGH_LEVEL: Kirql = 31;

    /// Level at which the dispatcher lock is held
    pub const SYNCH_LEVEL: Kirql = DISPATCH_LEVEL;
}

bitflags! {
    /// Software interrupts requested on a processor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SoftwareInterrupts: u8 {
        /// Deliver kernel APCs to the current thread
        const APC = 1 << 0;
        /// Run the dispatcher (switch to the standby thread)
        const DISPATCH = 1 << 1;
    }
}

impl SoftwareInterrupts {
    /// Request bit for an IRQL (APC_LEVEL or DISPATCH_LEVEL)
    pub fn for_level(level: Kirql) -> Self {
        match level {
            irql::APC_LEVEL => SoftwareInterrupts::APC,
            irql::DISPATCH_LEVEL => SoftwareInterrupts::DISPATCH,
            _ => SoftwareInterrupts::empty(),
        }
    }
}

/// Per-processor lock-free state
pub struct KPcr {
    /// Processor number
    pub number: u32,
    /// Raw handle of the running thread
    current_thread: AtomicU64,
    /// Pending software interrupt requests
    pending: AtomicU8,
    /// Mirror of the PRCB ready summary, readable without the lock
    ready_summary: AtomicU32,
}

impl KPcr {
    pub fn new(number: u32, current_thread: ThreadId) -> Self {
        Self {
            number,
            current_thread: AtomicU64::new(current_thread.to_raw()),
            pending: AtomicU8::new(0),
            ready_summary: AtomicU32::new(0),
        }
    }

    pub fn current_thread(&self) -> ThreadId {
        ThreadId::from_raw(self.current_thread.load(Ordering::Acquire))
    }

    pub(crate) fn set_current_thread(&self, thread: ThreadId) {
        self.current_thread.store(thread.to_raw(), Ordering::Release);
    }

    /// Latch a software interrupt request
    pub fn request(&self, interrupts: SoftwareInterrupts) {
        self.pending.fetch_or(interrupts.bits(), Ordering::AcqRel);
    }

    /// Consume a request; true if it was pending
    pub fn take(&self, interrupts: SoftwareInterrupts) -> bool {
        let old = self.pending.fetch_and(!interrupts.bits(), Ordering::AcqRel);
        SoftwareInterrupts::from_bits_truncate(old).intersects(interrupts)
    }

    pub fn pending(&self) -> SoftwareInterrupts {
        SoftwareInterrupts::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    pub fn ready_summary(&self) -> u32 {
        self.ready_summary.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready_summary(&self, summary: u32) {
        self.ready_summary.store(summary, Ordering::Release);
    }
}
