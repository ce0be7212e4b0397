//! Kernel Mutant Implementation (KMUTANT)
//!
//! A mutant is a recursive, owned lock built on the dispatcher header:
//! - `signal_state` is 1 when free and `1 - depth` while held, so the
//!   owner can re-acquire it without blocking
//! - The owner keeps it on its mutant list, and the list is abandoned
//!   (released with `abandoned` set) when the owner terminates
//! - The next acquirer of an abandoned mutant sees `Abandoned(index)`
//!
//! A *mutex* is a mutant that also disables normal kernel APCs for its
//! owner while held. Releasing a mutex the caller does not own bugchecks;
//! releasing such a mutant returns `MutantNotOwned`.
//!
//! # NT Compatibility
//! Equivalent to KeInitializeMutant / KeInitializeMutex /
//! KeReleaseMutant / KeReleaseMutex / KeReadStateMutant

use super::bugcheck::codes;
use super::dispatcher::{DispatcherDatabase, DispatcherObject, DispatcherType, ObjectBody, ObjectId, ProcessorMode};
use super::error::KeError;
use super::kernel::Kernel;
use super::kpcr::irql;
use super::thread::constants::MUTANT_INCREMENT;
use super::thread::ThreadId;

/// Mutant state kept in the object body
#[derive(Debug, Default)]
pub struct KMutant {
    /// Thread holding the mutant
    pub owner_thread: Option<ThreadId>,
    /// Released by a terminating owner and not yet re-acquired
    pub abandoned: bool,
    /// Added to the owner's kernel APC disable count while held
    pub apc_disable: u32,
}

impl Kernel {
    /// Create a mutant (KeInitializeMutant), optionally owned by the
    /// current thread
    pub fn create_mutant(&self, initial_owner: bool) -> ObjectId {
        self.create_mutant_object(initial_owner, 0)
    }

    /// Create a mutex (KeInitializeMutex): an unowned mutant whose owner
    /// cannot receive normal kernel APCs
    pub fn create_mutex(&self) -> ObjectId {
        self.create_mutant_object(false, 1)
    }

    fn create_mutant_object(&self, initial_owner: bool, apc_disable: u32) -> ObjectId {
        let thread = self.current_thread();
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let mutant = db.objects.insert(DispatcherObject::new(
            DispatcherType::Mutant,
            if initial_owner { 0 } else { 1 },
            ObjectBody::Mutant(KMutant {
                owner_thread: initial_owner.then_some(thread),
                abandoned: false,
                apc_disable,
            }),
        ));

        if initial_owner {
            db.threads[thread].mutant_list_head.insert_head(
                &mut db.objects,
                mutant,
                crate::link!(DispatcherObject, mutant_list_entry),
            );
        }
        log::debug!("[KE] created mutant {:?}", mutant);
        mutant
    }

    /// Release one level of ownership (KeReleaseMutant). Returns the
    /// previous signal state.
    ///
    /// With `abandoned` the mutant is freed outright regardless of owner
    /// or depth, and its next acquirer observes the abandonment.
    pub fn release_mutant(&self, mutant: ObjectId, increment: i8, abandoned: bool) -> Result<i32, KeError> {
        let thread = self.current_thread();
        let processor = self.current_processor();
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;

        let object = &mut db.objects[mutant];
        object.expect_type(DispatcherType::Mutant);
        let old = object.header.signal_state;
        let owner = object.mutant().owner_thread;

        if abandoned {
            object.header.signal_state = 1;
            object.mutant_mut().abandoned = true;
        } else {
            if owner != Some(thread) {
                if object.mutant().apc_disable != 0 {
                    crate::bugcheck!(
                        codes::THREAD_NOT_MUTEX_OWNER,
                        mutant.to_raw(),
                        thread.to_raw(),
                        owner.map_or(0, |owner| owner.to_raw())
                    );
                }
                return Err(KeError::MutantNotOwned);
            }
            object.header.signal_state += 1;
        }

        if db.objects[mutant].header.signal_state == 1 {
            if old <= 0 {
                if let Some(owner) = owner {
                    if self.ki_disown_mutant(db, mutant, owner) {
                        self.request_software_interrupt(irql::APC_LEVEL, processor);
                    }
                }
            }

            db.objects[mutant].mutant_mut().owner_thread = None;
            if !db.objects[mutant].header.wait_list_head.is_empty() {
                self.ki_wait_test(db, mutant, increment);
            }
        }

        Ok(old)
    }

    /// Release a mutex held by the current thread (KeReleaseMutex)
    pub fn release_mutex(&self, mutex: ObjectId) -> i32 {
        match self.release_mutant(mutex, MUTANT_INCREMENT, false) {
            Ok(old) => old,
            Err(error) => super::bugcheck::ke_raise_status(error),
        }
    }

    /// Current signal state (KeReadStateMutant)
    pub fn read_state_mutant(&self, mutant: ObjectId) -> i32 {
        let guard = self.lock_dispatcher();
        let object = &guard.objects[mutant];
        object.expect_type(DispatcherType::Mutant);
        object.header.signal_state
    }

    /// Take a mutant off its owner's list and give back the APC disable
    /// it held. Returns true if normal kernel APCs became deliverable for
    /// the owner and delivery should be requested.
    fn ki_disown_mutant(&self, db: &mut DispatcherDatabase, mutant: ObjectId, owner: ThreadId) -> bool {
        let apc_disable = db.objects[mutant].mutant().apc_disable;
        let record = &mut db.threads[owner];
        record.mutant_list_head.remove_entry(
            &mut db.objects,
            mutant,
            crate::link!(DispatcherObject, mutant_list_entry),
        );

        if apc_disable == 0 {
            return false;
        }
        record.kernel_apc_disable -= apc_disable;
        let kernel_list = &record.apc_state.apc_list_head[ProcessorMode::KernelMode.index()];
        if record.kernel_apc_disable == 0 && !kernel_list.is_empty() {
            record.apc_state.kernel_apc_pending = true;
            return true;
        }
        false
    }

    /// Abandon every mutant a terminating thread still owns
    pub(crate) fn ki_abandon_mutants(&self, db: &mut DispatcherDatabase, thread: ThreadId) {
        while let Some(mutant) = db.threads[thread].mutant_list_head.first() {
            self.ki_disown_mutant(db, mutant, thread);

            let object = &mut db.objects[mutant];
            object.header.signal_state = 1;
            let record = object.mutant_mut();
            record.owner_thread = None;
            record.abandoned = true;

            log::debug!("[KE] mutant {:?} abandoned by {:?}", mutant, thread);
            if !object.header.wait_list_head.is_empty() {
                self.ki_wait_test(db, mutant, MUTANT_INCREMENT);
            }
        }
    }
}
