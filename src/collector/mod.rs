//! The phases of a collection.
//!
//! Every operation here is one step the controller drives: `op_init_*` and `op_final_*` run in
//! pauses, the others concurrently with the mutators. The degenerated and full collections in
//! the submodules reuse these steps stop-the-world.

mod degenerated;
mod full_gc;
mod traversal;

use crate::barrier::BarrierSet;
use crate::evacuation::{evacuate_in_scope, EvacuationTask};
use crate::forwarding::resolve_nullable;
use crate::gc_state::GCState;
use crate::heap::Heap;
use crate::marking::{ConcurrentMarkingTask, SATBMarkQueue};
use crate::region::FreeSet;
use crate::update_refs::UpdateHeapRefsTask;
use crate::util::log::{debug, info};
use crate::verifier::VerifyPoint;
use std::sync::atomic::Ordering;

impl Heap {
    /// Clear the bitmap the next marking will use.
    pub(crate) fn op_reset(&self) {
        self.clear_next_bitmap();
    }

    pub(crate) fn op_init_mark(&self) {
        debug_assert!(!self.gc_state().is_marking_in_progress());
        self.retire_all_labs();
        self.verify(VerifyPoint::BeforeMark);
        if cfg!(feature = "extreme_assertions") {
            let next = self.next_marking_context();
            assert!(self.regions().iter().all(|r| next.is_region_clear(r)));
        }
        self.capture_top_at_mark_starts();
        self.record_mark_start_seq();
        self.marking_completed.store(false, Ordering::Release);
        self.satb_queue_set().set_active(true);
        self.gc_state().set(GCState::MARKING, true);
        self.pacer().setup_for_mark(self.free_bytes(), self.used());
        self.mark_roots(self.current_mark_mode());
    }

    pub(crate) fn op_mark(&self) {
        self.concurrent_mark()
            .prepare_for_workers(self.workers().active_workers());
        self.workers().run_task(
            self,
            ConcurrentMarkingTask {
                cancellable: true,
                mode: self.current_mark_mode(),
            },
        );
    }

    /// Finish marking and choose the collection set. A cancelled marking is left in progress,
    /// so that the degenerated cycle can finish it.
    pub(crate) fn op_final_mark(&self) {
        if self.cancelled_gc() {
            debug!("Final mark skipped, the cycle is cancelled");
            return;
        }
        self.finish_mark();
        self.prepare_evacuation();
    }

    /// Drain the remaining marking work without interruption and publish the result as the
    /// complete marking context. Only called in pauses.
    pub(crate) fn finish_mark(&self) {
        debug_assert!(self.gc_state().is_marking_in_progress());
        self.retire_all_labs();
        self.flush_satb_buffers();
        let mode = self.current_mark_mode();
        self.concurrent_mark()
            .prepare_for_workers(self.workers().active_workers());
        self.workers().run_task(
            self,
            ConcurrentMarkingTask {
                cancellable: false,
                mode,
            },
        );
        debug_assert!(!self.concurrent_mark().has_pending_tasks());
        self.satb_queue_set().set_active(false);
        self.marking_contexts().swap();
        self.gc_state().set(GCState::MARKING, false);
        self.marking_completed.store(true, Ordering::Release);
        self.account_allocations_since_mark_start();
        self.string_dedup().clean_table(self);
        self.verify(VerifyPoint::AfterMark);
    }

    /// Everything above TAMS was allocated during marking and is live.
    pub(crate) fn account_allocations_since_mark_start(&self) {
        let complete = self.complete_marking_context();
        for region in self.regions().iter().filter(|r| r.is_active()) {
            let tams = complete.top_at_mark_start(region);
            if region.top() > tams {
                region.increase_live_data_bytes(region.top() - tams);
            }
        }
    }

    /// Stop marking and drop everything it has queued.
    pub(crate) fn abandon_marking(&self) {
        let qset = self.satb_queue_set();
        qset.set_active(false);
        qset.abandon_completed();
        self.reset_satb_buffers();
        self.concurrent_mark().clear_queues();
        self.string_dedup().clear_candidates();
        self.gc_state()
            .set(GCState::MARKING | GCState::TRAVERSAL, false);
        self.marking_completed.store(false, Ordering::Release);
    }

    /// Trash immediate garbage, select the collection set and size the collector reserve for
    /// it. The caller holds the heap lock.
    pub(crate) fn choose_collection_set(&self, free_set: &mut FreeSet) {
        debug_assert!(self.collection_set().is_empty());
        let data = self.region_data();
        let input = self.collection_set_input(free_set);
        let choice = self
            .heuristics()
            .lock()
            .unwrap()
            .choose_collection_set(&data, &input);
        for &index in &choice.trash {
            self.regions().get(index).make_trash();
        }
        for &index in &choice.cset {
            self.collection_set().add_region(self.regions().get(index));
        }
        let cset_reserve =
            (self.collection_set().live_data() as f64 * self.options().evac_waste) as usize;
        free_set.rebuild(self.regions(), self.default_evac_reserve().max(cset_reserve));
    }

    /// Choose the collection set and start evacuation if it is not empty. Only called in
    /// pauses.
    pub(crate) fn prepare_evacuation(&self) {
        {
            let mut free_set = self.lock_free_set();
            self.choose_collection_set(&mut free_set);
        }
        let cset = self.collection_set();
        if cset.is_empty() {
            return;
        }
        info!(
            "Collection set: {} regions, {} live bytes, {} garbage bytes",
            cset.count(),
            cset.live_data(),
            cset.garbage()
        );
        self.oom_handler().clear();
        self.evac_failed.store(false, Ordering::Release);
        self.gc_state()
            .set(GCState::EVACUATION | GCState::HAS_FORWARDED, true);
        self.verify(VerifyPoint::BeforeEvac);
        self.evacuate_roots();
        cset.clear_current_index();
        self.pacer().setup_for_evac(self.free_bytes(), cset.used());
    }

    /// Evacuate the collection set objects the roots refer to.
    fn evacuate_roots(&self) {
        let mut ctx = self.control_context();
        self.roots_do(|slot| {
            if let Some(object) = *slot {
                if self.in_collection_set_obj(object) {
                    *slot = Some(evacuate_in_scope(self, object, &mut ctx));
                }
            }
        });
    }

    /// Deduplicate the strings found by marking.
    pub(crate) fn op_dedup(&self) {
        let dedup = self.string_dedup();
        if !dedup.is_enabled() {
            return;
        }
        if !self.marking_completed.load(Ordering::Acquire) || self.cancelled_gc() {
            dedup.clear_candidates();
            return;
        }
        let mut ctx = self.control_context();
        let mut satb = SATBMarkQueue::new(self.options().satb_buffer_size);
        let mut barriers = BarrierSet::new(self, self.gc_state().load(), &mut satb, &mut ctx);
        let processed = dedup.process_candidates(self, &mut barriers);
        debug!(
            "String dedup processed {} strings, table has {} entries",
            processed,
            dedup.len()
        );
    }

    /// Recycle trash regions. Each region is recycled under its own hold of the heap lock.
    pub(crate) fn op_cleanup(&self) {
        let mut recycled = 0;
        for region in self.regions().iter() {
            if !region.is_trash() {
                continue;
            }
            let _lock = self.lock_free_set();
            if region.is_trash() {
                self.recycle_region(region);
                recycled += 1;
            }
        }
        debug!("Recycled {} trash regions", recycled);
    }

    pub(crate) fn op_evac(&self) {
        self.workers()
            .run_task(self, EvacuationTask { concurrent: true });
    }

    pub(crate) fn op_init_updaterefs(&self) {
        self.retire_all_labs();
        self.gc_state().set(GCState::EVACUATION, false);
        self.gc_state().set(GCState::UPDATEREFS, true);
        self.verify(VerifyPoint::BeforeUpdateRefs);
        for region in self.regions().iter() {
            region.capture_update_watermark();
        }
        self.update_refs_iterator().reset(self.regions().len());
        self.update_refs_complete.store(false, Ordering::Release);
        self.pacer()
            .setup_for_updaterefs(self.free_bytes(), self.used());
    }

    pub(crate) fn op_updaterefs(&self) {
        self.workers()
            .run_task(self, UpdateHeapRefsTask { concurrent: true });
        if !self.cancelled_gc() {
            self.update_refs_complete.store(true, Ordering::Release);
        }
    }

    /// Finish updating references, then trash the collection set.
    pub(crate) fn op_final_updaterefs(&self) {
        if !self.update_refs_complete.load(Ordering::Acquire) {
            // The pass is idempotent. Run it again from the start.
            self.update_refs_iterator().reset(self.regions().len());
            self.workers()
                .run_task(self, UpdateHeapRefsTask { concurrent: false });
            self.update_refs_complete.store(true, Ordering::Release);
        }
        self.update_roots();
        self.string_dedup().update_references(self);
        self.verify(VerifyPoint::AfterUpdateRefs);
        let mut free_set = self.lock_free_set();
        let cset = self.collection_set();
        for index in cset.regions() {
            self.regions().get(index).make_trash();
        }
        cset.clear();
        self.gc_state()
            .set(GCState::HAS_FORWARDED | GCState::UPDATEREFS, false);
        free_set.rebuild(self.regions(), self.default_evac_reserve());
    }

    /// Point every root at the canonical copy of its object.
    pub(crate) fn update_roots(&self) {
        self.roots_do(|slot| *slot = resolve_nullable(*slot));
    }
}
