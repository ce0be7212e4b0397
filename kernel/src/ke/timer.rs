//! Kernel Timer Implementation (KTIMER)
//!
//! Timers are dispatcher objects that become signaled when their due time
//! passes. Every thread also owns a private notification timer that backs
//! wait timeouts.
//!
//! Inserted timers sit in one table ordered by interrupt-time due time. The
//! clock tick and the idle loop expire everything at or before the current
//! interrupt time.
//!
//! # Absolute timers
//!
//! An absolute due time is system time. It is converted to interrupt time
//! when the timer is inserted and converted again by [`Kernel::set_system_time`],
//! so a clock change moves the timer without changing what the caller asked
//! for.
//!
//! # NT Compatibility
//! Equivalent to NT's KTIMER / KeInitializeTimerEx / KeSetTimerEx /
//! KeCancelTimer / KeSetSystemTime

use super::dispatcher::{DispatcherDatabase, DispatcherObject, DispatcherType, ObjectBody, ObjectId, Timeout};
use super::kernel::Kernel;
use super::thread::constants::TIMER_EXPIRE_INCREMENT;

/// Timer type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Notification timer - stays signaled until reset
    Notification = 0,
    /// Synchronization timer - auto-resets after satisfying one wait
    Synchronization = 1,
}

/// When an inserted timer is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDue {
    /// Interrupt time (relative timeouts, periodic re-arm)
    Interrupt(u64),
    /// System time (absolute timeouts)
    System(u64),
}

/// Timer state kept in the timer object's body
#[derive(Debug, Default)]
pub struct KTimer {
    /// Interrupt time the timer fires at while inserted
    pub due_time: u64,
    /// Requested system time for absolute timers
    pub absolute: Option<u64>,
    /// Re-arm period in milliseconds (0 = one-shot)
    pub period: u32,
    /// Key in the timer table while inserted
    pub(crate) timer_key: Option<(u64, u64)>,
}

impl KTimer {
    pub const fn new() -> Self {
        Self {
            due_time: 0,
            absolute: None,
            period: 0,
            timer_key: None,
        }
    }

    #[inline]
    pub fn is_inserted(&self) -> bool {
        self.timer_key.is_some()
    }
}

impl DispatcherDatabase {
    /// Earliest due time of any inserted timer
    pub(crate) fn next_timer_due(&self) -> Option<u64> {
        self.timer_table.first_key_value().map(|(&(due, _), _)| due)
    }

    /// Interrupt time for a system time under the current time bias
    fn system_to_interrupt(&self, system: u64) -> u64 {
        (system as i128 - self.time_bias as i128).max(0) as u64
    }
}

impl Kernel {
    /// Insert a timer into the timer table (KiInsertTreeTimer)
    ///
    /// Returns false without inserting if the due time has already passed;
    /// the caller then treats the timer as expired.
    pub(crate) fn ki_insert_timer(&self, db: &mut DispatcherDatabase, timer: ObjectId, due: TimerDue) -> bool {
        self.ki_remove_timer(db, timer);

        let (due_time, absolute) = match due {
            TimerDue::Interrupt(time) => (time, None),
            TimerDue::System(time) => (db.system_to_interrupt(time), Some(time)),
        };

        let record = db.objects[timer].timer_mut();
        record.due_time = due_time;
        record.absolute = absolute;

        if due_time <= self.interrupt_time() {
            return false;
        }

        let key = (due_time, db.timer_sequence);
        db.timer_sequence += 1;
        db.timer_table.insert(key, timer);
        db.objects[timer].timer_mut().timer_key = Some(key);
        true
    }

    /// Take a timer out of the timer table. Returns whether it was inserted.
    pub(crate) fn ki_remove_timer(&self, db: &mut DispatcherDatabase, timer: ObjectId) -> bool {
        match db.objects[timer].timer_mut().timer_key.take() {
            Some(key) => {
                db.timer_table.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Signal an expired timer, satisfy its waiters and re-arm it if it is
    /// periodic
    ///
    /// A periodic timer keeps its phase: the next due time is the first
    /// whole period after the one that fired that is still in the future.
    /// Periods missed while the timer was late are skipped.
    fn ki_timer_fired(&self, db: &mut DispatcherDatabase, timer: ObjectId) {
        db.objects[timer].header.signal_state = 1;
        self.ki_wait_test(db, timer, TIMER_EXPIRE_INCREMENT);

        let record = db.objects[timer].timer();
        if record.period != 0 {
            let now = self.interrupt_time();
            let interval = u64::from(record.period) * 10_000;
            let late = now.saturating_sub(record.due_time);
            let due = record
                .due_time
                .saturating_add((late / interval + 1).saturating_mul(interval));
            if !self.ki_insert_timer(db, timer, TimerDue::Interrupt(due)) {
                log::warn!("[TIMER] periodic timer {:?} cannot be re-armed past {:#x}", timer, due);
            }
        }
        ktrace!("[TIMER] timer {:?} fired", timer);
    }

    /// Expire every timer due at or before the current interrupt time
    /// (KiTimerExpiration)
    pub(crate) fn ki_expire_timers(&self, db: &mut DispatcherDatabase) {
        let now = self.interrupt_time();
        while let Some((&key, &timer)) = db.timer_table.first_key_value() {
            if key.0 > now {
                break;
            }
            db.timer_table.remove(&key);
            db.objects[timer].timer_mut().timer_key = None;
            self.ki_timer_fired(db, timer);
        }
    }

    /// Create an unsignaled, uninserted timer (KeInitializeTimerEx)
    pub fn create_timer(&self, kind: TimerType) -> ObjectId {
        let object_type = match kind {
            TimerType::Notification => DispatcherType::NotificationTimer,
            TimerType::Synchronization => DispatcherType::SynchronizationTimer,
        };
        let timer = self
            .lock_dispatcher()
            .objects
            .insert(DispatcherObject::new(object_type, 0, ObjectBody::Timer(KTimer::new())));
        log::debug!("[TIMER] created {:?} timer {:?}", kind, timer);
        timer
    }

    /// Arm a timer (KeSetTimerEx)
    ///
    /// The timer is reset to not-signaled. A due time already in the past
    /// fires it immediately. A non-zero `period` (milliseconds) re-arms it
    /// after every expiration. Returns whether the timer was already
    /// inserted.
    pub fn set_timer(&self, timer: ObjectId, due: Timeout, period: u32) -> bool {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let was_inserted = self.ki_remove_timer(db, timer);
        db.objects[timer].header.signal_state = 0;
        db.objects[timer].timer_mut().period = period;

        let due = match due {
            Timeout::Relative(interval) => TimerDue::Interrupt(self.interrupt_time().saturating_add(interval)),
            Timeout::Absolute(time) => TimerDue::System(time),
        };
        if !self.ki_insert_timer(db, timer, due) {
            self.ki_timer_fired(db, timer);
        }
        was_inserted
    }

    /// Disarm a timer without changing its signal state (KeCancelTimer).
    /// Returns whether it was inserted.
    pub fn cancel_timer(&self, timer: ObjectId) -> bool {
        let mut guard = self.lock_dispatcher();
        self.ki_remove_timer(&mut guard, timer)
    }

    pub fn read_state_timer(&self, timer: ObjectId) -> bool {
        self.lock_dispatcher().objects[timer].header.is_signaled()
    }

    /// Current system time in 100ns units since 1601
    pub fn system_time(&self) -> u64 {
        let bias = self.lock_dispatcher().time_bias;
        (self.interrupt_time() as i128 + bias as i128).max(0) as u64
    }

    /// Set the system time (KeSetSystemTime). Returns the previous system
    /// time.
    ///
    /// Relative timers keep their interrupt-time due times. Every absolute
    /// timer is reinserted against the new clock, and those now in the past
    /// expire immediately.
    pub fn set_system_time(&self, new_time: u64) -> u64 {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let now = self.interrupt_time();
        let old_time = (now as i128 + db.time_bias as i128).max(0) as u64;
        db.time_bias = (new_time as i128 - now as i128) as i64;

        let absolute: alloc::vec::Vec<(ObjectId, u64)> = db
            .timer_table
            .values()
            .filter_map(|&timer| db.objects[timer].timer().absolute.map(|time| (timer, time)))
            .collect();

        for (timer, time) in absolute {
            if !self.ki_insert_timer(db, timer, TimerDue::System(time)) {
                self.ki_timer_fired(db, timer);
            }
        }

        log::info!("[TIMER] system time set to {:#x} (was {:#x})", new_time, old_time);
        old_time
    }
}
