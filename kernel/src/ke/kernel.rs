//! Kernel instance
//!
//! [`Kernel`] ties the dispatcher database to a platform [`Hal`]. It owns
//! the dispatcher lock, the per-processor control regions, and the IRQL
//! discipline: raising to SYNCH_LEVEL to take the lock, and servicing the
//! latched dispatch/APC software interrupts whenever IRQL drops below
//! their level.
//!
//! # Initialization
//!
//! [`Kernel::new`] builds the system and idle processes, one idle thread
//! per processor, and adopts the calling context as the initial system
//! thread running on processor 0. Secondary processors enter
//! [`Kernel::idle_loop`] once the platform has started them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::dispatcher::{DispatcherDatabase, DispatcherGuard, ProcessorMode};
use super::kpcr::{irql, KPcr, Kirql, SoftwareInterrupts};
use super::prcb::KPrcb;
use super::process::ProcessId;
use super::thread::{ThreadId, ThreadState};
use crate::config::KernelConfig;
use crate::hal::Hal;

/// One dispatcher instance
pub struct Kernel {
    pub(crate) hal: Box<dyn Hal>,
    pub(crate) dispatcher: Mutex<DispatcherDatabase>,
    pub(crate) pcrs: Box<[KPcr]>,
    pub(crate) config: KernelConfig,
    system_process: ProcessId,
    idle_process: ProcessId,
}

impl Kernel {
    /// Create the dispatcher and adopt the caller as the initial thread
    pub fn new(hal: Box<dyn Hal>, config: KernelConfig) -> Arc<Kernel> {
        let processors = config
            .processor_count
            .unwrap_or_else(|| hal.processor_count())
            .clamp(1, 64);

        let mut db = DispatcherDatabase::new(config, processors);
        let affinity = db.active_processors;

        let system_process = db.initialize_process(config.system_base_priority, affinity, config.thread_quantum);
        let idle_process = db.initialize_process(0, affinity, config.thread_quantum);

        let initial_thread = db.initialize_thread(system_process);
        let mut pcrs = Vec::with_capacity(processors as usize);

        for number in 0..processors {
            let idle_thread = db.initialize_thread(idle_process);
            {
                let idle = &mut db.threads[idle_thread];
                idle.priority = 0;
                idle.base_priority = 0;
                idle.affinity = 1 << number;
                idle.user_affinity = 1 << number;
                idle.ideal_processor = number;
                idle.next_processor = number;
            }
            db.start_thread(idle_thread);

            let current = if number == 0 {
                initial_thread
            } else {
                db.idle_summary |= 1 << number;
                idle_thread
            };

            let thread = &mut db.threads[current];
            thread.state = ThreadState::Running;
            thread.next_processor = number;

            db.prcbs.push(KPrcb::new(number, current, idle_thread));
            pcrs.push(KPcr::new(number, current));
        }

        db.start_thread(initial_thread);

        let idle0 = db.prcbs[0].idle_thread;
        let kernel = Arc::new(Kernel {
            hal,
            dispatcher: Mutex::new(db),
            pcrs: pcrs.into_boxed_slice(),
            config,
            system_process,
            idle_process,
        });

        let idle_kernel = Arc::clone(&kernel);
        kernel
            .hal
            .initialize_context(idle0, Box::new(move || idle_kernel.idle_loop()));

        log::info!(
            "[KE] dispatcher initialized: {} processor(s), initial thread {:?}",
            processors,
            initial_thread
        );

        kernel
    }

    pub fn hal(&self) -> &dyn Hal {
        &*self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn system_process(&self) -> ProcessId {
        self.system_process
    }

    pub fn idle_process(&self) -> ProcessId {
        self.idle_process
    }

    pub fn processor_count(&self) -> u32 {
        self.pcrs.len() as u32
    }

    pub fn current_processor(&self) -> u32 {
        self.hal.current_processor()
    }

    pub(crate) fn pcr(&self, processor: u32) -> &KPcr {
        &self.pcrs[processor as usize]
    }

    pub(crate) fn current_pcr(&self) -> &KPcr {
        self.pcr(self.current_processor())
    }

    /// Thread running on this processor
    pub fn current_thread(&self) -> ThreadId {
        self.current_pcr().current_thread()
    }

    pub fn interrupt_time(&self) -> u64 {
        self.hal.interrupt_time()
    }

    pub fn current_irql(&self) -> Kirql {
        self.hal.current_irql()
    }

    /// Raise IRQL, returning the old level
    pub fn raise_irql(&self, new_irql: Kirql) -> Kirql {
        let old = self.hal.current_irql();
        debug_assert!(new_irql >= old, "raise_irql to a lower level");
        if new_irql > old {
            self.hal.raise_irql(new_irql);
        }
        old
    }

    /// Lower IRQL, servicing any software interrupt latched above the new
    /// level on the way down
    pub fn lower_irql(&self, new_irql: Kirql) {
        loop {
            let pcr = self.current_pcr();
            let pending = pcr.pending();

            if new_irql < irql::DISPATCH_LEVEL && pending.contains(SoftwareInterrupts::DISPATCH) {
                self.set_irql(irql::DISPATCH_LEVEL);
                if pcr.take(SoftwareInterrupts::DISPATCH) {
                    self.dispatch_interrupt();
                }
                continue;
            }

            if new_irql < irql::APC_LEVEL && pending.contains(SoftwareInterrupts::APC) {
                self.set_irql(irql::APC_LEVEL);
                if pcr.take(SoftwareInterrupts::APC) {
                    self.deliver_apc(ProcessorMode::KernelMode, None);
                }
                continue;
            }

            break;
        }

        self.set_irql(new_irql);
    }

    fn set_irql(&self, level: Kirql) {
        let current = self.hal.current_irql();
        if current > level {
            self.hal.lower_irql(level);
        } else if current < level {
            self.hal.raise_irql(level);
        }
    }

    /// Run software interrupts latched for this processor that the current
    /// IRQL permits. Called by the platform after a cross-processor
    /// software interrupt arrives.
    pub fn service_software_interrupts(&self) {
        self.lower_irql(self.hal.current_irql());
    }

    /// Latch a software interrupt on `processor`, signalling it if remote
    pub(crate) fn request_software_interrupt(&self, level: Kirql, processor: u32) {
        self.pcr(processor).request(SoftwareInterrupts::for_level(level));
        if processor != self.current_processor() {
            self.hal.request_software_interrupt(level, processor);
        }
    }

    /// Raise to SYNCH_LEVEL and acquire the dispatcher lock
    pub fn lock_dispatcher(&self) -> DispatcherGuard<'_> {
        let old = self.hal.current_irql();
        let lower_to = if old < irql::SYNCH_LEVEL {
            self.hal.raise_irql(irql::SYNCH_LEVEL);
            Some(old)
        } else {
            None
        };
        DispatcherGuard::new(self, self.dispatcher.lock(), lower_to, old)
    }

    /// Acquire the dispatcher lock when the caller already runs at
    /// SYNCH_LEVEL or above; dropping the guard leaves IRQL alone
    pub fn lock_dispatcher_at_synch_level(&self) -> DispatcherGuard<'_> {
        let current = self.hal.current_irql();
        debug_assert!(current >= irql::SYNCH_LEVEL, "dispatcher lock below SYNCH_LEVEL");
        DispatcherGuard::new(self, self.dispatcher.lock(), None, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted::HostedHal;

    #[test]
    fn test_initial_state() {
        let kernel = HostedHal::kernel();
        let db = kernel.lock_dispatcher();

        let current = kernel.current_thread();
        let prcb = db.prcb(0);
        assert_eq!(prcb.current_thread, current);
        assert_ne!(prcb.idle_thread, current);
        assert_eq!(db.thread(current).state, ThreadState::Running);
        assert_eq!(db.thread(current).process, kernel.system_process());
        assert_eq!(db.idle_summary, 0);
    }

    #[test]
    fn test_secondary_processors_start_idle() {
        let kernel = HostedHal::kernel_with_processors(4);
        let db = kernel.lock_dispatcher();

        assert_eq!(db.processor_count(), 4);
        assert_eq!(db.idle_summary, 0b1110);
        for number in 1..4 {
            let prcb = db.prcb(number);
            assert_eq!(prcb.current_thread, prcb.idle_thread);
            assert_eq!(db.thread(prcb.idle_thread).affinity, 1 << number);
        }
    }

    #[test]
    fn test_lock_raises_and_restores_irql() {
        let kernel = HostedHal::kernel();
        assert_eq!(kernel.current_irql(), irql::PASSIVE_LEVEL);
        {
            let db = kernel.lock_dispatcher();
            assert_eq!(kernel.current_irql(), irql::SYNCH_LEVEL);
            assert_eq!(db.entry_irql(), irql::PASSIVE_LEVEL);
        }
        assert_eq!(kernel.current_irql(), irql::PASSIVE_LEVEL);
    }

    #[test]
    fn test_release_at_synch_level_keeps_irql() {
        let kernel = HostedHal::kernel();
        let db = kernel.lock_dispatcher();
        db.release_at_synch_level();
        assert_eq!(kernel.current_irql(), irql::SYNCH_LEVEL);
        kernel.lower_irql(irql::PASSIVE_LEVEL);
        assert_eq!(kernel.current_irql(), irql::PASSIVE_LEVEL);
    }
}
