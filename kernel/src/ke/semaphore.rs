//! Kernel Semaphore Implementation (KSEMAPHORE)
//!
//! A semaphore is a synchronization object that maintains a count.
//! Multiple threads can acquire the semaphore as long as the count
//! is greater than zero. When the count reaches zero, waiting threads
//! block until another thread releases the semaphore.
//!
//! The count lives in the header's `signal_state`; the limit in the
//! object body.
//!
//! # NT Compatibility
//! Equivalent to NT's KSEMAPHORE / KeInitializeSemaphore / KeReleaseSemaphore

use super::dispatcher::{DispatcherObject, DispatcherType, ObjectBody, ObjectId};
use super::error::KeError;
use super::kernel::Kernel;

impl Kernel {
    /// Create a semaphore (KeInitializeSemaphore)
    ///
    /// `limit` must be positive and `count` within `0..=limit`.
    pub fn create_semaphore(&self, count: i32, limit: i32) -> Result<ObjectId, KeError> {
        if limit <= 0 || !(0..=limit).contains(&count) {
            return Err(KeError::InvalidParameter);
        }

        let semaphore = self.lock_dispatcher().objects.insert(DispatcherObject::new(
            DispatcherType::Semaphore,
            count,
            ObjectBody::Semaphore { limit },
        ));
        log::debug!("[KE] created semaphore {:?} ({}/{})", semaphore, count, limit);
        Ok(semaphore)
    }

    /// Add `adjustment` to the count and satisfy waiters
    /// (KeReleaseSemaphore). Returns the previous count.
    ///
    /// Nothing is released if the new count would exceed the limit.
    pub fn release_semaphore(&self, semaphore: ObjectId, increment: i8, adjustment: i32) -> Result<i32, KeError> {
        if adjustment <= 0 {
            return Err(KeError::InvalidParameter);
        }

        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        let object = &mut db.objects[semaphore];
        object.expect_type(DispatcherType::Semaphore);

        let old = object.header.signal_state;
        let new = match old.checked_add(adjustment) {
            Some(new) if new <= object.semaphore_limit() => new,
            _ => return Err(KeError::SemaphoreLimitExceeded),
        };

        object.header.signal_state = new;
        if old == 0 && !object.header.wait_list_head.is_empty() {
            self.ki_wait_test(db, semaphore, increment);
        }
        Ok(old)
    }

    /// Current count (KeReadStateSemaphore)
    pub fn read_state_semaphore(&self, semaphore: ObjectId) -> i32 {
        let guard = self.lock_dispatcher();
        let object = &guard.objects[semaphore];
        object.expect_type(DispatcherType::Semaphore);
        object.header.signal_state
    }
}
