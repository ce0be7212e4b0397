//! Dispatcher error statuses
//!
//! Recoverable failures are returned as `Result<_, KeError>`. The same
//! values are used by [`ke_raise_status`](super::bugcheck::ke_raise_status)
//! for the failures NT raises against the caller.

use core::fmt;

/// NTSTATUS-valued dispatcher errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeError {
    /// Not enough wait blocks (or other dispatcher records) to proceed
    InsufficientResources = 0xC000_009Au32 as i32,
    /// Releasing a semaphore would exceed its limit
    SemaphoreLimitExceeded = 0xC000_0047u32 as i32,
    /// Releasing a mutant not owned by the caller
    MutantNotOwned = 0xC000_0046u32 as i32,
    /// Invalid parameter
    InvalidParameter = 0xC000_000Du32 as i32,
    /// Suspend or freeze count already at its maximum
    SuspendCountExceeded = 0xC000_004Au32 as i32,
    /// Mutant recursion depth exhausted
    MutantLimitExceeded = 0xC000_0191u32 as i32,
    /// Target thread is terminating
    ThreadIsTerminating = 0xC000_004Bu32 as i32,
    /// The same object appears twice in a wait-all
    InvalidParameterMix = 0xC000_0030u32 as i32,
}

impl KeError {
    /// The NTSTATUS value
    pub const fn status(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for KeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            KeError::InsufficientResources => "insufficient resources",
            KeError::SemaphoreLimitExceeded => "semaphore limit exceeded",
            KeError::MutantNotOwned => "mutant not owned",
            KeError::InvalidParameter => "invalid parameter",
            KeError::SuspendCountExceeded => "suspend count exceeded",
            KeError::MutantLimitExceeded => "mutant limit exceeded",
            KeError::ThreadIsTerminating => "thread is terminating",
            KeError::InvalidParameterMix => "invalid parameter mix",
        };
        f.write_str(text)
    }
}
