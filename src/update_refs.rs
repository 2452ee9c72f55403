//! Update-references: after evacuation, every reference into the collection set is replaced by
//! the address of the canonical copy.

use crate::forwarding::resolve;
use crate::heap::Heap;
use crate::object::{slot_compare_exchange, slot_load, walk_objects, ObjectKind, ObjectReference};
use crate::region::HeapRegion;
use crate::scheduler::{GCWork, GCWorker};
use crate::util::log::trace;

/// Update the reference fields of `object` that point into the collection set. A slot that a
/// mutator changed in the meantime keeps the mutator's value, which is already up to date.
pub(crate) fn update_object_references(heap: &Heap, object: ObjectReference) {
    object.for_each_ref_slot(|slot| {
        if let Some(value) = slot_load(slot) {
            if heap.in_collection_set_obj(value) {
                let forwardee = resolve(value);
                if forwardee != value {
                    let _ = slot_compare_exchange(slot, Some(value), Some(forwardee));
                }
            }
        }
    });
}

/// Update the objects of one region that is not in the collection set.
fn update_region(heap: &Heap, region: &HeapRegion) {
    let ctx = heap.complete_marking_context();
    if region.is_humongous_start() {
        let object = region.bottom_object();
        if ctx.is_marked(object) {
            update_object_references(heap, object);
        }
        return;
    }
    let tams = ctx.top_at_mark_start(region);
    let watermark = region.update_watermark();
    ctx.for_each_marked_object(region, |object| update_object_references(heap, object));
    let start = tams.max(region.bottom());
    if start < watermark {
        walk_objects(start, watermark, |object| {
            if object.kind() != ObjectKind::Filler {
                update_object_references(heap, object);
            }
        });
    }
    heap.pacer().report_update_refs(watermark - region.bottom());
}

/// One pass over the heap that updates every reference into the collection set.
///
/// The pass is idempotent, so a pass that was cancelled can be run again from the start.
pub struct UpdateHeapRefsTask {
    pub concurrent: bool,
}

impl GCWork for UpdateHeapRefsTask {
    fn do_work(&self, worker: &mut GCWorker, heap: &Heap) {
        let regions = heap.regions();
        let complete = heap.complete_marking_context();
        let mut updated = 0;
        while let Some(range) = heap.update_refs_iterator().claim_next() {
            for index in range {
                if self.concurrent && heap.check_cancelled_gc_and_yield() {
                    trace!("Worker {} stops updating references", worker.ordinal);
                    return;
                }
                let region = regions.get(index);
                if region.is_cset() {
                    complete.clear_region(region);
                } else if region.is_active() && !region.is_humongous_continuation() {
                    update_region(heap, region);
                    updated += 1;
                }
            }
        }
        trace!(
            "Worker {} updated references in {} regions",
            worker.ordinal,
            updated
        );
    }
}
