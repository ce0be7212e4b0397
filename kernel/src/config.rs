//! Kernel configuration
//!
//! Tunables for the dispatcher with the NT defaults. Fixed limits such as
//! the maximum number of wait objects are compile-time constants in the
//! modules that enforce them; only values a platform may reasonably want to
//! change live here.

/// Dispatcher tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of processors to schedule on; `None` uses the HAL's count
    pub processor_count: Option<u32>,
    /// Quantum given to threads of newly created processes
    pub thread_quantum: i8,
    /// Quantum charged to the running thread on every clock tick
    pub clock_quantum_decrement: i8,
    /// Quantum charged for a wait that is satisfied without blocking
    pub wait_quantum_decrement: i8,
    /// Base priority of the system process
    pub system_base_priority: i8,
    /// Upper bound on wait blocks allocated beyond the per-thread built-ins
    pub wait_block_limit: usize,
    /// Largest suspend or freeze count a thread may reach
    pub maximum_suspend_count: u8,
    /// Interrupt time (100ns units) a thread must have been waiting before
    /// its kernel stack may be paged out
    pub stack_protect_time: u64,
    /// System time at boot (100ns units since 1601)
    pub initial_system_time: u64,
    /// Terminated threads released per reaper pass
    pub reaper_batch_size: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            processor_count: None,
            thread_quantum: 6,
            clock_quantum_decrement: 3,
            wait_quantum_decrement: 1,
            system_base_priority: 8,
            wait_block_limit: 4096,
            maximum_suspend_count: 127,
            // 3 seconds
            stack_protect_time: 3 * 10_000_000,
            initial_system_time: 0,
            reaper_batch_size: 16,
        }
    }

    /// Same defaults with a fixed processor count
    pub const fn with_processors(count: u32) -> Self {
        let mut config = Self::new();
        config.processor_count = Some(count);
        config
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
