//! Degenerated collection: the interrupted concurrent cycle is finished in one pause.

use crate::control::DegenPoint;
use crate::evacuation::EvacuationTask;
use crate::gc_state::GCCause;
use crate::heap::Heap;
use crate::util::log::{info, warn};
use crate::util::statistics::Phase;
use crate::verifier::VerifyPoint;
use std::sync::atomic::Ordering;

impl Heap {
    pub(crate) fn vm_degenerated(&self, point: DegenPoint) {
        self.vm_pause(Phase::DegeneratedGC, |heap| heap.op_degenerated(point));
    }

    fn op_degenerated(&self, point: DegenPoint) {
        info!("Degenerated GC at {:?}", point);
        self.gc_state().clear_cancelled();
        let used_before = self.used();
        if !self.finish_degenerated_cycle(point) {
            return self.op_full(GCCause::AllocationFailure);
        }
        self.verify(VerifyPoint::AfterDegenerated);

        // Another degenerated cycle right away would not do better than a full one.
        let critical_free = self.capacity() * self.options().critical_free_threshold / 100;
        let reclaimed = used_before.saturating_sub(self.used());
        if self.free_bytes() < critical_free || reclaimed < self.options().region_size {
            info!(
                "Degenerated GC reclaimed {} bytes, {} bytes free, upgrading to full GC",
                reclaimed,
                self.free_bytes()
            );
            return self.op_full(GCCause::AllocationFailure);
        }
        self.stats().inc_degenerated_cycles();
        self.heuristics().lock().unwrap().record_success_degenerated();
        info!(
            "Degenerated GC: {} -> {} bytes used",
            used_before,
            self.used()
        );
    }

    /// Run the rest of the cycle from `point` without interruption. Returns false if only a
    /// full collection can finish it.
    fn finish_degenerated_cycle(&self, mut point: DegenPoint) -> bool {
        loop {
            match point {
                DegenPoint::Unset => unreachable!("degenerated cycle without a degeneration point"),
                DegenPoint::OutsideCycle => {
                    if self.gc_state().has_forwarded_objects() {
                        warn!("Forwarded objects outside of a cycle");
                        return false;
                    }
                    self.op_reset();
                    self.op_init_mark();
                    point = DegenPoint::Mark;
                }
                DegenPoint::Mark => {
                    if !self.marking_completed.load(Ordering::Acquire) {
                        if !self.gc_state().is_marking_in_progress() {
                            self.op_reset();
                            self.op_init_mark();
                        }
                        self.finish_mark();
                        self.prepare_evacuation();
                    }
                    self.op_cleanup();
                    point = DegenPoint::Evac;
                }
                DegenPoint::Evac => {
                    if self.gc_state().is_evacuation_in_progress() {
                        // Objects skipped under the OOM protocol are picked up by starting over
                        // from the first cset region. Already evacuated ones only cost a lookup.
                        self.oom_handler().clear();
                        self.evac_failed.store(false, Ordering::Release);
                        self.collection_set().clear_current_index();
                        self.workers()
                            .run_task(self, EvacuationTask { concurrent: false });
                        if self.evac_failed.load(Ordering::Acquire) {
                            return false;
                        }
                    }
                    if !self.gc_state().has_forwarded_objects() {
                        return true;
                    }
                    self.op_init_updaterefs();
                    point = DegenPoint::UpdateRefs;
                }
                DegenPoint::UpdateRefs => {
                    self.op_final_updaterefs();
                    self.op_cleanup();
                    return true;
                }
                DegenPoint::Traversal => {
                    if !self.op_final_traversal() {
                        return false;
                    }
                    self.op_cleanup();
                    return true;
                }
            }
        }
    }
}
