//! Kernel Bug Check
//!
//! Fatal stop path for the dispatcher. Two entry points exist:
//!
//! - [`ke_bugcheck_ex`] for invariant failures: corrupted lists, stale
//!   handles, a process attachment changed across APC delivery. These mean
//!   shared state can no longer be trusted.
//! - [`ke_raise_status`] for caller contract violations that NT raises as
//!   an exception against the offending thread (mutant recursion limit,
//!   suspend count overflow).
//!
//! Both log through `log::error!` and then panic. The embedding platform
//! decides what a panic means (halt, crash dump, test failure).

use core::sync::atomic::{AtomicU32, Ordering};

use super::error::KeError;

/// Number of bugchecks raised (a nonzero value means the system is dead)
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Bug check codes
pub mod codes {
    pub const APC_INDEX_MISMATCH: u32 = 0x0000_0001;
    pub const INVALID_AFFINITY_SET: u32 = 0x0000_0003;
    pub const INVALID_PROCESS_ATTACH_ATTEMPT: u32 = 0x0000_0005;
    pub const INVALID_PROCESS_DETACH_ATTEMPT: u32 = 0x0000_0006;
    pub const IRQL_NOT_LESS_OR_EQUAL: u32 = 0x0000_000A;
    pub const MAXIMUM_WAIT_OBJECTS_EXCEEDED: u32 = 0x0000_000C;
    pub const THREAD_NOT_MUTEX_OWNER: u32 = 0x0000_0011;
    pub const KERNEL_APC_PENDING_DURING_EXIT: u32 = 0x0000_0020;
    pub const INVALID_KERNEL_HANDLE: u32 = 0x0000_0093;
    pub const INVALID_WORK_QUEUE_ITEM: u32 = 0x0000_0096;
    pub const KERNEL_SECURITY_CHECK_FAILURE: u32 = 0x0000_0139;

    // Dispatcher-specific stop codes
    pub const TERMINATED_THREAD_RESUMED: u32 = 0x0000_04B0;
    pub const QUEUE_RUNDOWN_WITH_WAITERS: u32 = 0x0000_04B1;
    pub const INVALID_THREAD_STATE: u32 = 0x0000_04B2;
}

/// `KERNEL_SECURITY_CHECK_FAILURE` parameter 1: a list entry was found
/// corrupt or already linked
pub const CORRUPT_LIST_ENTRY: u64 = 3;

fn bugcheck_code_name(code: u32) -> &'static str {
    match code {
        codes::APC_INDEX_MISMATCH => "APC_INDEX_MISMATCH",
        codes::INVALID_AFFINITY_SET => "INVALID_AFFINITY_SET",
        codes::INVALID_PROCESS_ATTACH_ATTEMPT => "INVALID_PROCESS_ATTACH_ATTEMPT",
        codes::INVALID_PROCESS_DETACH_ATTEMPT => "INVALID_PROCESS_DETACH_ATTEMPT",
        codes::IRQL_NOT_LESS_OR_EQUAL => "IRQL_NOT_LESS_OR_EQUAL",
        codes::MAXIMUM_WAIT_OBJECTS_EXCEEDED => "MAXIMUM_WAIT_OBJECTS_EXCEEDED",
        codes::THREAD_NOT_MUTEX_OWNER => "THREAD_NOT_MUTEX_OWNER",
        codes::KERNEL_APC_PENDING_DURING_EXIT => "KERNEL_APC_PENDING_DURING_EXIT",
        codes::INVALID_KERNEL_HANDLE => "INVALID_KERNEL_HANDLE",
        codes::INVALID_WORK_QUEUE_ITEM => "INVALID_WORK_QUEUE_ITEM",
        codes::KERNEL_SECURITY_CHECK_FAILURE => "KERNEL_SECURITY_CHECK_FAILURE",
        codes::TERMINATED_THREAD_RESUMED => "TERMINATED_THREAD_RESUMED",
        codes::QUEUE_RUNDOWN_WITH_WAITERS => "QUEUE_RUNDOWN_WITH_WAITERS",
        codes::INVALID_THREAD_STATE => "INVALID_THREAD_STATE",
        _ => "UNKNOWN_BUGCHECK_CODE",
    }
}

/// Bug check with just a code
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Bug check with a code and four parameters
///
/// Never returns. The message carries the stop code and its symbolic name
/// so a test can match on the name with `#[should_panic(expected = ...)]`.
#[cold]
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    let count = BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst);
    let name = bugcheck_code_name(code);

    log::error!(
        "[BUGCHECK] *** STOP: {:#010x} ({:#x}, {:#x}, {:#x}, {:#x}) {}{}",
        code,
        p1,
        p2,
        p3,
        p4,
        name,
        if count > 0 { " (nested)" } else { "" }
    );

    panic!(
        "*** STOP: {:#010x} ({:#x}, {:#x}, {:#x}, {:#x}) {}",
        code, p1, p2, p3, p4, name
    )
}

/// Raise a fatal status against the calling thread
///
/// Used for caller contract violations that are not corruption: the thread
/// asked for something the dispatcher cannot do and must not continue.
#[cold]
pub fn ke_raise_status(error: KeError) -> ! {
    log::error!("[BUGCHECK] raised status {:#010x} ({})", error.status() as u32, error);
    panic!("raised status {:#010x}: {}", error.status() as u32, error)
}

/// Number of bugchecks raised so far
pub fn bugcheck_count() -> u32 {
    BUGCHECK_COUNT.load(Ordering::SeqCst)
}

/// Bug check macro for convenience
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck::ke_bugcheck($code)
    };
    ($code:expr, $p1:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, 0, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr, $p4:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, $p4 as u64)
    };
}
