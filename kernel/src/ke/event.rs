//! Kernel Event Implementation (KEVENT)
//!
//! Events are synchronization objects used for signaling between threads.
//! A thread can wait for an event to be signaled, and another thread
//! can signal the event to wake the waiting thread(s).
//!
//! Two types of events:
//! - **Notification (Manual Reset)**: Stays signaled until explicitly reset.
//!   Wakes ALL waiting threads when signaled.
//! - **Synchronization (Auto Reset)**: Automatically resets after waking
//!   ONE thread. Only one waiter is released per signal.
//!
//! # NT Compatibility
//! Equivalent to KeInitializeEvent / KeSetEvent / KeResetEvent /
//! KeClearEvent / KePulseEvent / KeReadStateEvent

use super::dispatcher::{DispatcherObject, DispatcherType, ObjectBody, ObjectId, WaitKey, WaitStatus, WaitType};
use super::kernel::Kernel;

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Notification event (manual reset)
    /// - Wakes ALL waiters when signaled
    /// - Stays signaled until explicitly reset
    Notification = 0,
    /// Synchronization event (auto reset)
    /// - Wakes ONE waiter when signaled
    /// - Automatically resets after waking a thread
    Synchronization = 1,
}

impl EventType {
    const fn object_type(self) -> DispatcherType {
        match self {
            EventType::Notification => DispatcherType::NotificationEvent,
            EventType::Synchronization => DispatcherType::SynchronizationEvent,
        }
    }
}

fn expect_event(object: &DispatcherObject) {
    if !matches!(
        object.header.object_type,
        DispatcherType::NotificationEvent | DispatcherType::SynchronizationEvent
    ) {
        object.expect_type(DispatcherType::NotificationEvent);
    }
}

impl Kernel {
    /// Create an event (KeInitializeEvent)
    pub fn create_event(&self, kind: EventType, signaled: bool) -> ObjectId {
        let event = self.lock_dispatcher().objects.insert(DispatcherObject::new(
            kind.object_type(),
            signaled as i32,
            ObjectBody::Basic,
        ));
        log::debug!("[KE] created {:?} event {:?}", kind, event);
        event
    }

    /// Signal an event (KeSetEvent). Returns the previous signal state.
    ///
    /// A synchronization event whose first waiter is a WaitAny hands the
    /// signal straight to that waiter and stays not-signaled.
    pub fn set_event(&self, event: ObjectId, increment: i8) -> i32 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        expect_event(&db.objects[event]);

        let header = &mut db.objects[event].header;
        let old = header.signal_state;

        let Some(first) = header.wait_list_head.first() else {
            header.signal_state = 1;
            return old;
        };

        let (thread, wait_key, wait_type) = {
            let block = &db.wait_blocks[first];
            (block.thread, block.wait_key, block.wait_type)
        };

        let header = &mut db.objects[event].header;
        if header.object_type == DispatcherType::NotificationEvent || wait_type != WaitType::WaitAny {
            if old == 0 {
                header.signal_state = 1;
                self.ki_wait_test(db, event, increment);
            }
        } else {
            let status = match wait_key {
                WaitKey::Index(index) => WaitStatus::Object(index),
                WaitKey::Timeout => WaitStatus::Timeout,
            };
            self.ki_unwait_thread(db, thread, status, increment);
        }

        ktrace!("[KE] set event {:?}", event);
        old
    }

    /// Reset an event to not-signaled (KeResetEvent). Returns the previous
    /// signal state.
    pub fn reset_event(&self, event: ObjectId) -> i32 {
        let mut guard = self.lock_dispatcher();
        let object = &mut guard.objects[event];
        expect_event(object);
        core::mem::replace(&mut object.header.signal_state, 0)
    }

    /// Reset an event without reporting the old state (KeClearEvent)
    pub fn clear_event(&self, event: ObjectId) {
        let mut guard = self.lock_dispatcher();
        let object = &mut guard.objects[event];
        expect_event(object);
        object.header.signal_state = 0;
    }

    /// Signal an event just long enough to satisfy current waiters, then
    /// leave it not-signaled (KePulseEvent). Returns the previous state.
    pub fn pulse_event(&self, event: ObjectId, increment: i8) -> i32 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        expect_event(&db.objects[event]);

        let header = &mut db.objects[event].header;
        let old = header.signal_state;
        if old == 0 && !header.wait_list_head.is_empty() {
            header.signal_state = 1;
            self.ki_wait_test(db, event, increment);
        }
        db.objects[event].header.signal_state = 0;
        old
    }

    /// Current signal state (KeReadStateEvent)
    pub fn read_state_event(&self, event: ObjectId) -> i32 {
        let guard = self.lock_dispatcher();
        let object = &guard.objects[event];
        expect_event(object);
        object.header.signal_state
    }
}
