//! Traversal collection: one concurrent pass marks the heap, evacuates the collection set and
//! fixes references at the same time.
//!
//! The collection set is chosen up front from the liveness the previous cycle computed. The
//! storeval barrier enqueues every stored reference, so mutators cannot hide a live object from
//! the traversal, and the roots are scanned again in the final pause.

use crate::gc_state::GCState;
use crate::heap::Heap;
use crate::marking::{ConcurrentMarkingTask, MarkMode};
use crate::util::log::{debug, info};
use crate::verifier::VerifyPoint;
use std::sync::atomic::Ordering;

impl Heap {
    pub(crate) fn op_init_traversal(&self) {
        self.retire_all_labs();
        self.verify(VerifyPoint::BeforeMark);
        {
            let mut free_set = self.lock_free_set();
            self.choose_collection_set(&mut free_set);
        }
        self.clear_next_bitmap();
        self.capture_top_at_mark_starts();
        self.record_mark_start_seq();
        self.marking_completed.store(false, Ordering::Release);
        self.oom_handler().clear();
        self.evac_failed.store(false, Ordering::Release);

        let cset = self.collection_set();
        let mut bits = GCState::TRAVERSAL;
        if !cset.is_empty() {
            info!(
                "Traversal collection set: {} regions, {} live bytes",
                cset.count(),
                cset.live_data()
            );
            bits |= GCState::HAS_FORWARDED;
        }
        self.satb_queue_set().set_active(true);
        self.gc_state().set(bits, true);
        cset.clear_current_index();
        self.pacer()
            .setup_for_traversal(self.free_bytes(), self.used());
        self.mark_roots(MarkMode::Traversal);
    }

    pub(crate) fn op_traversal(&self) {
        self.concurrent_mark()
            .prepare_for_workers(self.workers().active_workers());
        self.workers().run_task(
            self,
            ConcurrentMarkingTask {
                cancellable: true,
                mode: MarkMode::Traversal,
            },
        );
    }

    /// Finish the traversal and reclaim the collection set. Returns false if an evacuation
    /// failed, in which case only a full collection can restore the heap.
    pub(crate) fn op_final_traversal(&self) -> bool {
        debug_assert!(self.gc_state().is_traversal_in_progress());
        self.retire_all_labs();
        self.flush_satb_buffers();
        self.mark_roots(MarkMode::Traversal);
        self.concurrent_mark()
            .prepare_for_workers(self.workers().active_workers());
        self.workers().run_task(
            self,
            ConcurrentMarkingTask {
                cancellable: false,
                mode: MarkMode::Traversal,
            },
        );
        self.satb_queue_set().set_active(false);
        if self.evac_failed.load(Ordering::Acquire) {
            info!("Evacuation failed during traversal");
            return false;
        }

        self.marking_contexts().swap();
        self.account_allocations_since_mark_start();
        self.string_dedup().update_references(self);
        self.string_dedup().clean_table(self);

        let mut free_set = self.lock_free_set();
        let cset = self.collection_set();
        for index in cset.regions() {
            self.regions().get(index).make_trash();
        }
        cset.clear();
        let regions = self.regions();
        let mut trashed = 0;
        let mut index = 0;
        while index < regions.len() {
            let region = regions.get(index);
            if region.is_regular() && !region.has_live() {
                region.make_trash();
                trashed += 1;
            } else if region.is_humongous_start() && !region.has_live() {
                region.make_trash();
                trashed += 1;
                while index + 1 < regions.len()
                    && regions.get(index + 1).is_humongous_continuation()
                {
                    index += 1;
                    regions.get(index).make_trash();
                    trashed += 1;
                }
            }
            index += 1;
        }
        debug!("Traversal found {} regions of immediate garbage", trashed);
        self.gc_state()
            .set(GCState::TRAVERSAL | GCState::HAS_FORWARDED, false);
        self.marking_completed.store(true, Ordering::Release);
        free_set.rebuild(regions, self.default_evac_reserve());
        drop(free_set);
        self.verify(VerifyPoint::AfterTraversal);
        true
    }
}
