//! Full collection: a stop-the-world sliding mark-compact of the whole heap.
//!
//! The four phases are the classic Lisp2 ones. Marking finds the live objects. Computing
//! addresses slides every live object in a movable region down towards the heap start and
//! records the destination in its forwarding slot. Adjusting pointers rewrites every reference
//! to the recorded destination, and compaction moves the objects. Humongous and pinned regions
//! do not move.

use crate::forwarding::{get_forwardee_raw, set_forwarding_address};
use crate::gc_state::{GCCause, GCState};
use crate::heap::Heap;
use crate::marking::{ConcurrentMarkingTask, MarkMode};
use crate::object::{
    copy_object, slot_load, slot_store, walk_objects, write_filler, ObjectReference,
};
use crate::region::HeapRegion;
use crate::scheduler::{GCWork, GCWorker};
use crate::util::log::{debug, info};
use crate::util::statistics::Phase;
use crate::util::Address;
use crate::verifier::VerifyPoint;
use std::sync::atomic::Ordering;

/// Where the live objects of each region end up.
struct CompactionPlan {
    /// The new top of every movable region, `None` for regions that do not move.
    new_tops: Vec<Option<Address>>,
}

impl CompactionPlan {
    fn is_movable(&self, region: &HeapRegion) -> bool {
        self.new_tops[region.index()].is_some()
    }
}

fn is_movable(region: &HeapRegion) -> bool {
    (region.is_regular() || region.is_cset()) && region.pin_count() == 0
}

impl Heap {
    pub(crate) fn vm_full(&self, cause: GCCause) {
        self.vm_pause(Phase::FullGC, |heap| heap.op_full(cause));
    }

    pub(crate) fn op_full(&self, cause: GCCause) {
        info!("Full GC ({})", cause);
        let used_before = self.used();
        self.prepare_full();
        {
            let _phase = self.timings().start(Phase::FullGCMark);
            self.full_mark();
        }
        let plan = {
            let _phase = self.timings().start(Phase::FullGCCalculateAddresses);
            self.calculate_addresses()
        };
        {
            let _phase = self.timings().start(Phase::FullGCAdjustPointers);
            self.adjust_pointers();
        }
        {
            let _phase = self.timings().start(Phase::FullGCCompact);
            self.compact(&plan);
        }
        self.rebuild_after_full(&plan);
        // Compaction may fill a region past its old top, so only the heap-wide total is exact.
        self.stats()
            .add_bytes_reclaimed(used_before.saturating_sub(self.used()));
        self.stats().inc_full_gcs();
        self.heuristics().lock().unwrap().record_success_full();
        self.verify(VerifyPoint::AfterFull);
        info!("Full GC: {} -> {} bytes used", used_before, self.used());
    }

    /// Abandon whatever concurrent work was in progress.
    fn prepare_full(&self) {
        self.retire_all_labs();
        self.abandon_marking();
        self.update_refs_complete.store(false, Ordering::Release);
    }

    fn full_mark(&self) {
        self.clear_next_bitmap();
        self.capture_top_at_mark_starts();
        // Stale copies in the collection set are never marked, the roots and fields that still
        // point at them are fixed on the way.
        let mode = if self.gc_state().has_forwarded_objects() {
            MarkMode::MarkUpdateRefs
        } else {
            MarkMode::Mark
        };
        self.mark_roots(mode);
        self.concurrent_mark()
            .prepare_for_workers(self.workers().active_workers());
        self.workers().run_task(
            self,
            ConcurrentMarkingTask {
                cancellable: false,
                mode,
            },
        );
        self.marking_contexts().swap();
        self.string_dedup().clean_table(self);
        self.string_dedup().clear_candidates();
    }

    fn calculate_addresses(&self) -> CompactionPlan {
        let regions = self.regions();
        let complete = self.complete_marking_context();
        let mut new_tops: Vec<Option<Address>> = regions
            .iter()
            .map(|r| if is_movable(r) { Some(r.bottom()) } else { None })
            .collect();
        let mut movable = regions.iter().filter(|r| is_movable(r)).map(|r| r.index());
        let Some(mut to_index) = movable.next() else {
            return CompactionPlan { new_tops };
        };
        let mut to_region = regions.get(to_index);
        let mut cursor = to_region.bottom();
        let mut moved = 0;
        for from_index in std::iter::once(to_index).chain(movable) {
            complete.for_each_marked_object(regions.get(from_index), |object| {
                let size = object.size_bytes();
                while cursor + size > to_region.end() {
                    new_tops[to_index] = Some(cursor);
                    to_index = (to_index + 1..regions.len())
                        .find(|&i| new_tops[i].is_some())
                        .unwrap_or(from_index);
                    to_region = regions.get(to_index);
                    cursor = to_region.bottom();
                }
                if cursor != object.to_raw_address() {
                    moved += 1;
                }
                set_forwarding_address(object, cursor);
                cursor += size;
            });
        }
        new_tops[to_index] = Some(cursor);
        debug!("Full GC moves {} objects", moved);
        CompactionPlan { new_tops }
    }

    fn adjust_pointers(&self) {
        self.roots_do(|slot| {
            if let Some(object) = *slot {
                *slot = Some(get_forwardee_raw(object));
            }
        });
        self.update_refs_iterator().reset(self.regions().len());
        self.workers().run_task(self, AdjustPointersTask);
        self.string_dedup().adjust_references(self);
    }

    fn compact(&self, plan: &CompactionPlan) {
        let complete = self.complete_marking_context();
        for region in self.regions().iter() {
            if plan.is_movable(region) {
                complete.for_each_marked_object(region, |object| {
                    let to = get_forwardee_raw(object).to_raw_address();
                    if to != object.to_raw_address() {
                        unsafe { copy_object(object, to) };
                    }
                });
            } else if region.is_pinned() || (region.pin_count() > 0 && !region.is_humongous()) {
                // Dead objects in pinned regions would keep pointing at moved ones.
                walk_objects(region.bottom(), region.top(), |object| {
                    if !complete.is_marked(object) {
                        unsafe { write_filler(object.to_raw_address(), object.size_bytes()) };
                    }
                });
            }
        }
    }

    /// Reset region states, liveness and marking metadata to match the compacted heap.
    fn rebuild_after_full(&self, plan: &CompactionPlan) {
        let mut free_set = self.lock_free_set();
        let complete = self.complete_marking_context();
        let regions = self.regions();
        let mut index = 0;
        while index < regions.len() {
            let region = regions.get(index);
            if let Some(new_top) = plan.new_tops[index] {
                if new_top == region.bottom() {
                    region.make_trash();
                    self.recycle_region_without_accounting(region);
                } else {
                    region.set_top(new_top);
                    region.make_regular_bypass();
                }
            } else if region.is_humongous_start() && !complete.is_marked(region.bottom_object()) {
                region.make_trash();
                self.recycle_region_without_accounting(region);
                while index + 1 < regions.len()
                    && regions.get(index + 1).is_humongous_continuation()
                {
                    index += 1;
                    regions.get(index).make_trash();
                    self.recycle_region_without_accounting(regions.get(index));
                }
            } else if region.is_trash() {
                self.recycle_region(region);
            } else if region.is_cset() {
                region.make_regular_bypass();
            }
            if region.is_regular() && region.pin_count() > 0 {
                region.make_pinned();
            }
            index += 1;
        }

        for region in regions.iter() {
            region.clear_live_data();
            if region.is_active() {
                region.increase_live_data_bytes(region.used());
            }
            for ctx in self.marking_contexts().both() {
                ctx.reset_top_at_mark_start(region);
                ctx.clear_region(region);
            }
        }
        self.collection_set().clear();
        self.gc_state().set(
            GCState::HAS_FORWARDED
                | GCState::MARKING
                | GCState::EVACUATION
                | GCState::UPDATEREFS
                | GCState::TRAVERSAL,
            false,
        );
        self.oom_handler().clear();
        self.evac_failed.store(false, Ordering::Release);
        self.marking_completed.store(false, Ordering::Release);
        self.record_mark_start_seq();
        free_set.rebuild(regions, self.default_evac_reserve());
    }
}

/// Point every reference in a live object at its referent's new address.
fn adjust_object(object: ObjectReference) {
    object.for_each_ref_slot(|slot| {
        if let Some(referent) = slot_load(slot) {
            let forwardee = get_forwardee_raw(referent);
            if forwardee != referent {
                slot_store(slot, Some(forwardee));
            }
        }
    });
}

struct AdjustPointersTask;

impl GCWork for AdjustPointersTask {
    fn do_work(&self, _worker: &mut GCWorker, heap: &Heap) {
        let complete = heap.complete_marking_context();
        while let Some(range) = heap.update_refs_iterator().claim_next() {
            for index in range {
                let region = heap.regions().get(index);
                if region.is_humongous_start() {
                    let object = region.bottom_object();
                    if complete.is_marked(object) {
                        adjust_object(object);
                    }
                } else if region.is_regular() || region.is_pinned() || region.is_cset() {
                    complete.for_each_marked_object(region, adjust_object);
                }
            }
        }
    }
}
