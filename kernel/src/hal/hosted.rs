//! Hosted HAL for unit tests
//!
//! A deterministic uniprocessor platform on top of std:
//!
//! - Every kernel thread is a host thread. Only the one holding the
//!   processor runs; `swap_context` hands the processor over and parks the
//!   caller until it is switched back to.
//! - IRQL is a single per-processor value carried across the hand-off.
//! - Interrupt time is virtual. It moves only when a test advances it or
//!   when the idle loop sleeps until the next timer is due, so timeouts
//!   expire exactly on time.
//! - Hooks the kernel calls out through (remote software interrupts,
//!   reaper, outswap, inswap, user APC frames) are recorded for tests to
//!   inspect.
//!
//! A test that stops making progress fails: the initial thread panics when
//! the idle loop finds nothing to run, when a kernel thread panics, or
//! after a bounded real-time wait.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use super::{Hal, ThreadEntry, TrapFrame};
use crate::config::KernelConfig;
use crate::ke::apc::NormalRoutine;
use crate::ke::kpcr::{irql, Kirql};
use crate::ke::process::ProcessId;
use crate::ke::thread::ThreadId;
use crate::ke::Kernel;

/// Longest real time the initial thread waits to get the processor back
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Context {
    runnable: Mutex<bool>,
    wake: Condvar,
}

#[derive(Default)]
struct Recorded {
    remote_interrupts: Vec<(Kirql, u32)>,
    reaper_requests: usize,
    outswaps: Vec<ProcessId>,
    inswaps: Vec<ThreadId>,
    user_apcs: Vec<(ThreadId, usize, usize, usize)>,
    freed_stacks: Vec<ThreadId>,
}

struct HostedState {
    processors: u32,
    irql: AtomicU8,
    time: AtomicU64,
    contexts: Mutex<HashMap<ThreadId, Arc<Context>>>,
    pending: Mutex<HashMap<ThreadId, ThreadEntry>>,
    kernel: OnceLock<Weak<Kernel>>,
    initial: OnceLock<ThreadId>,
    /// Set when no thread can make progress again
    stalled: AtomicBool,
    recorded: Mutex<Recorded>,
}

/// Test platform; clones share one machine
#[derive(Clone)]
pub struct HostedHal {
    state: Arc<HostedState>,
}

impl HostedHal {
    pub fn new(processors: u32) -> Self {
        Self {
            state: Arc::new(HostedState {
                processors,
                irql: AtomicU8::new(irql::PASSIVE_LEVEL),
                time: AtomicU64::new(0),
                contexts: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                kernel: OnceLock::new(),
                initial: OnceLock::new(),
                stalled: AtomicBool::new(false),
                recorded: Mutex::new(Recorded::default()),
            }),
        }
    }

    /// Boot a kernel with `processors` processors; the calling test thread
    /// becomes the initial kernel thread on processor 0
    pub fn boot(processors: u32) -> (Arc<Kernel>, HostedHal) {
        Self::boot_with_config(KernelConfig::with_processors(processors))
    }

    pub fn boot_with_config(config: KernelConfig) -> (Arc<Kernel>, HostedHal) {
        let hal = HostedHal::new(config.processor_count.unwrap_or(1));
        let kernel = Kernel::new(Box::new(hal.clone()), config);

        let initial = kernel.current_thread();
        let _ = hal.state.kernel.set(Arc::downgrade(&kernel));
        let _ = hal.state.initial.set(initial);
        *hal.state.context(initial).runnable.lock().unwrap() = true;
        (kernel, hal)
    }

    /// Uniprocessor kernel
    pub fn kernel() -> Arc<Kernel> {
        Self::boot(1).0
    }

    pub fn kernel_with_processors(processors: u32) -> Arc<Kernel> {
        Self::boot(processors).0
    }

    pub fn interrupt_time(&self) -> u64 {
        self.state.time.load(Ordering::SeqCst)
    }

    /// Move virtual time forward; timers are expired by the next clock tick
    /// or idle pass
    pub fn advance_time(&self, delta: u64) {
        self.state.time.fetch_add(delta, Ordering::SeqCst);
    }

    /// Software interrupts sent to processors other than 0
    pub fn remote_interrupts(&self) -> Vec<(Kirql, u32)> {
        self.state.recorded().remote_interrupts.clone()
    }

    pub fn reaper_requests(&self) -> usize {
        self.state.recorded().reaper_requests
    }

    pub fn outswap_requests(&self) -> Vec<ProcessId> {
        self.state.recorded().outswaps.clone()
    }

    pub fn inswap_requests(&self) -> Vec<ThreadId> {
        self.state.recorded().inswaps.clone()
    }

    /// User APC frames built: (thread, context, argument1, argument2)
    pub fn user_apcs(&self) -> Vec<(ThreadId, usize, usize, usize)> {
        self.state.recorded().user_apcs.clone()
    }

    pub fn freed_stacks(&self) -> Vec<ThreadId> {
        self.state.recorded().freed_stacks.clone()
    }
}

impl HostedState {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }

    fn context(&self, thread: ThreadId) -> Arc<Context> {
        Arc::clone(self.contexts.lock().unwrap().entry(thread).or_default())
    }

    fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
        if let Some(&initial) = self.initial.get() {
            self.context(initial).wake.notify_all();
        }
    }

    /// Run `entry` as `thread` on a new host thread
    fn start(self: &Arc<Self>, thread: ThreadId, entry: ThreadEntry) {
        *self.context(thread).runnable.lock().unwrap() = true;
        let state = Arc::clone(self);
        std::thread::Builder::new()
            .name(std::format!("kthread-{}", thread.to_raw()))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                    state.stall();
                }
            })
            .expect("spawn kernel thread");
    }

    /// Block the host thread of `thread` until it holds the processor
    fn park(&self, thread: ThreadId) {
        let context = self.context(thread);
        let is_initial = self.initial.get() == Some(&thread);
        let deadline = Instant::now() + HANDOFF_TIMEOUT;

        let mut runnable = context.runnable.lock().unwrap();
        while !*runnable {
            if is_initial {
                if self.stalled.load(Ordering::SeqCst) {
                    panic!("hosted HAL: no kernel thread can make progress");
                }
                if Instant::now() >= deadline {
                    panic!("hosted HAL: initial thread not resumed within {:?}", HANDOFF_TIMEOUT);
                }
                runnable = context.wake.wait_timeout(runnable, POLL).unwrap().0;
            } else {
                runnable = context.wake.wait(runnable).unwrap();
            }
        }
    }
}

impl Hal for HostedHal {
    fn processor_count(&self) -> u32 {
        self.state.processors
    }

    fn current_processor(&self) -> u32 {
        0
    }

    fn current_irql(&self) -> Kirql {
        self.state.irql.load(Ordering::SeqCst)
    }

    fn raise_irql(&self, new_irql: Kirql) -> Kirql {
        self.state.irql.swap(new_irql, Ordering::SeqCst)
    }

    fn lower_irql(&self, new_irql: Kirql) {
        self.state.irql.store(new_irql, Ordering::SeqCst);
    }

    fn request_software_interrupt(&self, level: Kirql, processor: u32) {
        self.state.recorded().remote_interrupts.push((level, processor));
    }

    fn interrupt_time(&self) -> u64 {
        self.state.time.load(Ordering::SeqCst)
    }

    fn initialize_context(&self, thread: ThreadId, entry: ThreadEntry) {
        self.state.pending.lock().unwrap().insert(thread, entry);
    }

    fn swap_context(&self, old: ThreadId, new: ThreadId) {
        *self.state.context(old).runnable.lock().unwrap() = false;

        let entry = self.state.pending.lock().unwrap().remove(&new);
        let known = self.state.contexts.lock().unwrap().contains_key(&new);
        match entry {
            Some(entry) => self.state.start(new, entry),
            None if known => {
                let context = self.state.context(new);
                *context.runnable.lock().unwrap() = true;
                context.wake.notify_all();
            }
            None => {
                // A thread built directly in the database has no start
                // routine; it runs straight to termination
                let kernel = self.state.kernel.get().and_then(Weak::upgrade);
                let Some(kernel) = kernel else {
                    panic!("hosted HAL: switch to {:?} before boot completed", new);
                };
                self.state.start(
                    new,
                    Box::new(move || {
                        kernel.thread_startup();
                        kernel.terminate_thread();
                    }),
                );
            }
        }

        self.state.park(old);
    }

    fn free_kernel_stack(&self, thread: ThreadId) {
        self.state.recorded().freed_stacks.push(thread);
    }

    fn initialize_user_apc(
        &self,
        thread: ThreadId,
        _trap_frame: Option<TrapFrame>,
        _routine: NormalRoutine,
        context: usize,
        argument1: usize,
        argument2: usize,
    ) {
        self.state.recorded().user_apcs.push((thread, context, argument1, argument2));
    }

    fn queue_reaper_work(&self) {
        self.state.recorded().reaper_requests += 1;
    }

    fn schedule_process_outswap(&self, process: ProcessId) {
        self.state.recorded().outswaps.push(process);
    }

    fn schedule_stack_inswap(&self, thread: ThreadId) {
        self.state.recorded().inswaps.push(thread);
    }

    fn idle(&self, next_timer_due: Option<u64>) {
        match next_timer_due {
            Some(due) => {
                self.state.time.fetch_max(due, Ordering::SeqCst);
            }
            None => {
                self.state.stall();
                loop {
                    std::thread::park();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::dispatcher::{ProcessorMode, Timeout, WaitReason};
    use crate::ke::event::EventType;

    #[test]
    fn test_idle_advances_to_timer() {
        let (kernel, hosted) = HostedHal::boot(1);
        kernel.delay_execution(ProcessorMode::KernelMode, false, Timeout::Relative(1234));
        assert_eq!(hosted.interrupt_time(), 1234);
    }

    #[test]
    #[should_panic(expected = "no kernel thread can make progress")]
    fn test_deadlock_fails_fast() {
        let kernel = HostedHal::kernel();
        let event = kernel.create_event(EventType::Notification, false);
        kernel.wait_for_single_object(event, WaitReason::Executive, ProcessorMode::KernelMode, false, None);
    }
}
