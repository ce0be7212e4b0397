//! Kernel Gate Object (KGATE)
//!
//! A gate is the cheapest blocking primitive: two states, no timeout, no
//! alerts, one waiter released per signal. Higher level locks (guarded
//! mutexes, push locks) park their contenders on a gate.
//!
//! A gate waiter is in `GateWait` rather than `Waiting`. Only a special or
//! eligible normal kernel APC can pull it off the gate early, after which
//! the wait restarts.
//!
//! # NT Compatibility
//! Equivalent to KeInitializeGate / KeWaitForGate / KeSignalGateBoostPriority

use alloc::vec;

use super::dispatcher::{
    DispatcherObject, DispatcherType, KWaitBlock, ObjectBody, ObjectId, ProcessorMode, WaitReason, WaitStatus,
};
use super::kernel::Kernel;
use super::kpcr::irql;
use super::thread::constants::GATE_INCREMENT;
use super::thread::ThreadState;
use super::wait::ki_check_wait_irql;

impl Kernel {
    /// Create a not-signaled gate (KeInitializeGate)
    pub fn create_gate(&self) -> ObjectId {
        let gate = self
            .lock_dispatcher()
            .objects
            .insert(DispatcherObject::new(DispatcherType::Gate, 0, ObjectBody::Basic));
        log::debug!("[GATE] created gate {:?}", gate);
        gate
    }

    /// Pass the gate, blocking until it is signaled (KeWaitForGate).
    /// Passing clears the signal.
    pub fn wait_for_gate(&self, gate: ObjectId, reason: WaitReason, mode: ProcessorMode) {
        let thread = self.current_thread();

        loop {
            let mut guard = self.lock_dispatcher();
            let entry_irql = guard.entry_irql();
            let db = &mut *guard;

            db.objects[gate].expect_type(DispatcherType::Gate);
            let header = &mut db.objects[gate].header;
            if header.signal_state == 1 {
                header.signal_state = 0;
                return;
            }

            if self.ki_kernel_apc_retry(db, thread, entry_irql) {
                self.request_software_interrupt(irql::APC_LEVEL, self.current_processor());
                continue;
            }
            ki_check_wait_irql(entry_irql, thread);

            let block = db.threads[thread].wait_blocks[0];
            db.wait_blocks[block] = KWaitBlock::new(thread, gate);
            db.objects[gate].header.wait_list_head.insert_tail(
                &mut db.wait_blocks,
                block,
                crate::link!(KWaitBlock, wait_list_entry),
            );
            let record = &mut db.threads[thread];
            record.wait_block_list = vec![block];
            record.gate_object = Some(gate);

            self.ki_commit_wait(db, thread, reason, mode, false, entry_irql, ThreadState::GateWait, true);
            ktrace!("[GATE] thread {:?} waits on {:?}", thread, gate);

            if self.ki_swap_thread(guard) != WaitStatus::KernelApc {
                return;
            }
        }
    }

    /// Release the first waiter that can take the signal with a priority
    /// boost, or leave the gate signaled for the next thread to arrive
    /// (KeSignalGateBoostPriority)
    ///
    /// Ordinary waits that include the gate are served through the wait
    /// test, so a WaitAny reports the gate's index and a WaitAll is only
    /// released once all of its objects are available.
    pub fn signal_gate_boost_priority(&self, gate: ObjectId) {
        let mut guard = self.lock_dispatcher();
        let db = &mut *guard;
        db.objects[gate].expect_type(DispatcherType::Gate);

        db.objects[gate].header.signal_state = 1;
        self.ki_wait_test(db, gate, GATE_INCREMENT);
        ktrace!("[GATE] {:?} signaled, state {}", gate, db.objects[gate].header.signal_state);
    }
}
