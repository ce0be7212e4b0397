//! Hardware Abstraction Layer (hal)
//!
//! The dispatcher is architecture-neutral. Everything it needs from the
//! machine goes through the [`Hal`] trait:
//!
//! - **IRQL**: raise/lower the hardware interrupt priority of the current
//!   processor. Pending software interrupts are tracked by the kernel
//!   itself and serviced in `Kernel::lower_irql`.
//! - **Processors**: count, current number, and the transport for
//!   software interrupts targeted at *other* processors.
//! - **Time**: a monotonic interrupt-time source in 100ns units.
//! - **Context**: starting a new thread's context and switching between
//!   two threads. Register save/restore is entirely the platform's.
//! - **Deferred work hooks**: reaper, process outswap, stack inswap,
//!   user-mode APC frame construction.
//!
//! Hooks documented as "called with the dispatcher lock held" must not
//! call back into the kernel.

use alloc::boxed::Box;

use crate::ke::apc::NormalRoutine;
use crate::ke::dispatcher::ProcessorMode;
use crate::ke::kpcr::Kirql;
use crate::ke::process::ProcessId;
use crate::ke::thread::ThreadId;

#[cfg(test)]
pub mod hosted;

/// First code a new thread runs on its own context
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Opaque reference to a platform trap/exception frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame(pub usize);

/// Platform services consumed by the dispatcher
pub trait Hal: Send + Sync {
    /// Number of processors the platform brought up
    fn processor_count(&self) -> u32;

    /// Number of the processor executing the caller
    fn current_processor(&self) -> u32;

    fn current_irql(&self) -> Kirql;

    /// Raise the current processor's IRQL, returning the previous level
    fn raise_irql(&self, new_irql: Kirql) -> Kirql;

    /// Lower the current processor's IRQL
    fn lower_irql(&self, new_irql: Kirql);

    /// Signal another processor that a software interrupt at `level` is
    /// latched for it; its handler calls `Kernel::service_software_interrupts`
    fn request_software_interrupt(&self, level: Kirql, processor: u32);

    /// Monotonic time since boot in 100ns units
    fn interrupt_time(&self) -> u64;

    /// Prepare `thread` to run `entry` the first time it is switched to
    fn initialize_context(&self, thread: ThreadId, entry: ThreadEntry);

    /// Save the current context as `old` and resume `new`. Returns when
    /// `old` is next switched to; never returns for a terminated `old`.
    fn swap_context(&self, old: ThreadId, new: ThreadId);

    /// Release the context and stack of a reaped thread
    fn free_kernel_stack(&self, _thread: ThreadId) {}

    /// May the stack of a thread blocking in `mode` be paged out.
    /// Called with the dispatcher lock held.
    fn is_kernel_stack_swappable(&self, mode: ProcessorMode, _thread: ThreadId) -> bool {
        mode == ProcessorMode::UserMode
    }

    /// Build the user-mode frame that runs `routine` on return to user mode
    fn initialize_user_apc(
        &self,
        thread: ThreadId,
        trap_frame: Option<TrapFrame>,
        routine: NormalRoutine,
        context: usize,
        argument1: usize,
        argument2: usize,
    );

    /// The reaper list went from empty to non-empty; arrange for
    /// `Kernel::reap_terminated_threads` to run. Called with the dispatcher
    /// lock held.
    fn queue_reaper_work(&self) {}

    /// A process has no resident stacks left. Called with the dispatcher
    /// lock held.
    fn schedule_process_outswap(&self, _process: ProcessId) {}

    /// A thread became ready with a non-resident stack; page it in and call
    /// `Kernel::stack_inswap_complete`. Called with the dispatcher lock held.
    fn schedule_stack_inswap(&self, _thread: ThreadId) {}

    /// Nothing is runnable on this processor. Wait for an interrupt, or
    /// until interrupt time reaches `next_timer_due` if there is one.
    fn idle(&self, next_timer_due: Option<u64>) {
        let _ = next_timer_due;
        core::hint::spin_loop();
    }
}
