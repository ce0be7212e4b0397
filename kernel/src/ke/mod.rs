//! Kernel Executive (ke)
//!
//! The dispatcher core of the NT kernel:
//!
//! - **Scheduler**: 32 priority levels, per-processor ready queues,
//!   standby selection, quantum accounting and preemption
//! - **Dispatcher Objects**: events, semaphores, mutants, queues, gates,
//!   timers, threads and processes sharing one wait/signal engine
//! - **APC**: per-thread callbacks delivered at APC_LEVEL or on return to
//!   user mode
//! - **Thread lifecycle**: create, suspend/resume/freeze, priority and
//!   affinity changes, termination and reaping
//!
//! # IRQL (Interrupt Request Level)
//!
//! The kernel uses IRQL to manage interrupt priority:
//! - PASSIVE_LEVEL (0): Normal thread execution
//! - APC_LEVEL (1): APC delivery
//! - DISPATCH_LEVEL (2): Scheduler runs; SYNCH_LEVEL is the same level
//! - CLOCK_LEVEL (28): Clock interrupt
//! - HIGH_LEVEL (31): Everything masked
//!
//! # Locking
//!
//! All dispatcher state sits behind one lock taken at SYNCH_LEVEL through
//! [`Kernel::lock_dispatcher`]. Functions named `ki_*` take
//! `&mut DispatcherDatabase` and so can only run with the lock held.
//!
//! # Key Structures
//!
//! - `KPRCB`: Per-processor control block
//! - `KTHREAD`: Kernel thread object
//! - `KPROCESS`: Kernel process object
//! - `DISPATCHER_HEADER`: Common header for waitable objects

/// Per-transition tracing, compiled in with the `dispatch-trace` feature
macro_rules! ktrace {
    ($($arg:tt)*) => {
        if cfg!(feature = "dispatch-trace") {
            log::trace!($($arg)*);
        }
    };
}

// Core modules
pub mod arena;
pub mod bugcheck;
pub mod error;
pub mod list;
pub mod kpcr;
pub mod dispatcher;
pub mod kernel;
pub mod prcb;
pub mod thread;
pub mod process;
pub mod scheduler;
pub mod balance;

// Wait support
pub mod wait;

// Dispatcher objects
pub mod event;
pub mod semaphore;
pub mod mutex;
pub mod queue;
pub mod gate;
pub mod timer;

// Asynchronous procedure calls
pub mod apc;
pub mod suspend;

pub use kernel::Kernel;

// Re-export key types
pub use arena::Handle;
pub use error::KeError;
pub use thread::{IoOperation, KThread, ThreadId, ThreadState};
pub use process::{KProcess, ProcessId};
pub use prcb::KPrcb;

// Re-export synchronization types
pub use dispatcher::{
    DispatcherType, ObjectId, ProcessorMode, Timeout, WaitReason, WaitStatus, WaitType, MAXIMUM_WAIT_OBJECTS,
};
pub use event::EventType;
pub use queue::QueueEntry;
pub use scheduler::YieldStatus;
pub use timer::TimerType;

// Re-export APC types
pub use apc::{ApcCall, ApcDisposition, ApcEnvironment, ApcId, KernelRoutine, NormalRoutine, RundownRoutine};
