//! The barrier set.
//!
//! Every access to a managed reference goes through a barrier. Each barrier checks one bit of
//! the thread's GC state snapshot and does nothing else while that bit is clear:
//!
//! * `MARKING`: the SATB pre-write barrier logs overwritten references.
//! * `HAS_FORWARDED`: loaded and stored references are resolved to their canonical copy.
//! * `EVACUATION` or `TRAVERSAL`: writes to a collection set object evacuate it first.
//! * `TRAVERSAL`: stored values are evacuated and logged for marking.

use crate::evacuation::{evacuate_in_scope, EvacuationContext};
use crate::forwarding::{resolve, resolve_nullable};
use crate::gc_state::GCState;
use crate::heap::Heap;
use crate::marking::{MarkingContext, SATBMarkQueue};
use crate::object::{slot_compare_exchange, slot_load, slot_swap, ObjectReference};
use crate::util::options::Options;

/// Barrier switches. Turning one off is only sound for diagnostics.
#[derive(Copy, Clone, Debug)]
pub struct BarrierFlags {
    pub satb: bool,
    pub keep_alive: bool,
    pub read: bool,
    pub write: bool,
    pub storeval_read: bool,
    pub storeval_enqueue: bool,
    pub cas: bool,
    pub acmp: bool,
    pub satb_filter_new_objects: bool,
}

impl BarrierFlags {
    pub fn from_options(options: &Options) -> Self {
        BarrierFlags {
            satb: options.satb_barrier,
            keep_alive: options.keep_alive_barrier,
            read: options.read_barrier,
            write: options.write_barrier,
            storeval_read: options.storeval_read_barrier,
            storeval_enqueue: options.storeval_enqueue_barrier,
            cas: options.cas_barrier,
            acmp: options.acmp_barrier,
            satb_filter_new_objects: options.satb_filter_new_objects,
        }
    }
}

/// Whether marking still has to see `object`. Traversal also traces objects allocated after it
/// started, so only the bitmap counts there.
fn needs_marking(ctx: &MarkingContext, traversal: bool, object: ObjectReference) -> bool {
    if traversal {
        !ctx.bitmap().is_marked(object.to_raw_address())
    } else {
        !ctx.is_marked(object)
    }
}

fn check_ref_range(object: ObjectReference, pos: usize, len: usize) {
    assert!(
        pos.checked_add(len).is_some_and(|end| end <= object.ref_count()),
        "{} has {} reference fields, cannot access {} from {}",
        object,
        object.ref_count(),
        len,
        pos
    );
}

/// The barriers of one thread, bound to its GC state snapshot, SATB queue and evacuation
/// context.
pub struct BarrierSet<'a> {
    heap: &'a Heap,
    state: u8,
    flags: BarrierFlags,
    satb: &'a mut SATBMarkQueue,
    evac: &'a mut EvacuationContext,
}

impl<'a> BarrierSet<'a> {
    pub fn new(
        heap: &'a Heap,
        state: u8,
        satb: &'a mut SATBMarkQueue,
        evac: &'a mut EvacuationContext,
    ) -> Self {
        BarrierSet {
            heap,
            state,
            flags: *heap.barrier_flags(),
            satb,
            evac,
        }
    }

    #[inline(always)]
    fn is_set(&self, bits: u8) -> bool {
        self.state & bits != 0
    }

    /// Resolve `object` if forwarded objects may exist.
    #[inline(always)]
    pub fn read_barrier(&self, object: ObjectReference) -> ObjectReference {
        if self.flags.read && self.is_set(GCState::HAS_FORWARDED) {
            resolve(object)
        } else {
            object
        }
    }

    #[inline(always)]
    pub fn read_barrier_nullable(&self, object: Option<ObjectReference>) -> Option<ObjectReference> {
        object.map(|o| self.read_barrier(o))
    }

    /// Return the copy of `object` that may be written to. A collection set object is
    /// evacuated by the calling thread.
    pub fn write_barrier(&mut self, object: ObjectReference) -> ObjectReference {
        if !self.flags.write {
            return object;
        }
        if self.is_set(GCState::EVACUATION | GCState::TRAVERSAL)
            && self.heap.in_collection_set_obj(object)
        {
            evacuate_in_scope(self.heap, object, self.evac)
        } else if self.is_set(GCState::HAS_FORWARDED) {
            resolve(object)
        } else {
            object
        }
    }

    /// Prepare a value for being stored into the heap.
    pub fn storeval_barrier(&mut self, value: Option<ObjectReference>) -> Option<ObjectReference> {
        let value = value?;
        if self.is_set(GCState::TRAVERSAL) {
            let value = if self.heap.in_collection_set_obj(value) {
                evacuate_in_scope(self.heap, value, self.evac)
            } else {
                resolve(value)
            };
            if self.flags.storeval_enqueue {
                self.enqueue(value);
            }
            return Some(value);
        }
        if self.flags.storeval_read && self.is_set(GCState::HAS_FORWARDED) {
            Some(resolve(value))
        } else {
            Some(value)
        }
    }

    /// Keep a referent obtained through a weak access alive for the running marking.
    pub fn keep_alive_barrier(&mut self, object: Option<ObjectReference>) {
        if !self.flags.keep_alive {
            return;
        }
        if let Some(object) = object {
            if self.is_set(GCState::MARKING | GCState::TRAVERSAL) {
                self.enqueue(object);
            }
        }
    }

    /// The SATB pre-write barrier: log the reference about to be overwritten.
    #[inline(always)]
    pub fn satb_enqueue(&mut self, old: Option<ObjectReference>) {
        if !self.flags.satb || !self.is_set(GCState::MARKING) {
            return;
        }
        if let Some(old) = old {
            self.enqueue(old);
        }
    }

    /// The pre-write barrier for a field of `dst` that holds `old`. The fields of an object
    /// allocated after marking started are not part of the snapshot.
    fn satb_pre_write(&mut self, dst: ObjectReference, old: Option<ObjectReference>) {
        if old.is_none() || !self.flags.satb || !self.is_set(GCState::MARKING) {
            return;
        }
        if self.flags.satb_filter_new_objects
            && self
                .heap
                .next_marking_context()
                .allocated_after_mark_start(dst.to_raw_address())
        {
            return;
        }
        self.satb_enqueue(old);
    }

    fn enqueue(&mut self, object: ObjectReference) {
        let ctx = self.heap.next_marking_context();
        let traversal = self.is_set(GCState::TRAVERSAL);
        if self.flags.satb_filter_new_objects && !needs_marking(ctx, traversal, object) {
            return;
        }
        self.satb.enqueue(object, self.heap.satb_queue_set(), |o| {
            needs_marking(ctx, traversal, o)
        });
    }

    /// Load reference field `index` of `object`.
    pub fn load(&mut self, object: ObjectReference, index: usize) -> Option<ObjectReference> {
        let object = self.read_barrier(object);
        let value = object.load_ref(index);
        self.read_barrier_nullable(value)
    }

    /// Load a weak reference field and keep the referent alive.
    pub fn load_weak(&mut self, object: ObjectReference, index: usize) -> Option<ObjectReference> {
        let value = self.load(object, index);
        self.keep_alive_barrier(value);
        value
    }

    /// Store `value` into reference field `index` of `object`.
    pub fn store(&mut self, object: ObjectReference, index: usize, value: Option<ObjectReference>) {
        let object = self.write_barrier(object);
        if self.is_set(GCState::MARKING) {
            let old = object.load_ref(index);
            self.satb_pre_write(object, old);
        }
        let value = self.storeval_barrier(value);
        object.store_ref(index, value);
    }

    /// Atomically replace `expected` with `new`. A field that holds a stale copy of `expected`
    /// compares equal.
    pub fn compare_and_swap(
        &mut self,
        object: ObjectReference,
        index: usize,
        expected: Option<ObjectReference>,
        new: Option<ObjectReference>,
    ) -> bool {
        let object = self.write_barrier(object);
        let new = self.storeval_barrier(new);
        let slot = object.ref_slot(index);
        let mut compare = expected;
        loop {
            // A successful exchange overwrites `compare`, so it is logged first.
            self.satb_pre_write(object, compare);
            match slot_compare_exchange(slot, compare, new) {
                Ok(_) => return true,
                Err(actual) => {
                    let retry = self.flags.cas
                        && self.is_set(GCState::HAS_FORWARDED)
                        && actual != compare
                        && actual.is_some()
                        && resolve_nullable(actual) == resolve_nullable(expected);
                    if !retry {
                        return false;
                    }
                    compare = actual;
                }
            }
        }
    }

    /// Atomically replace the field and return the previous value.
    pub fn swap(
        &mut self,
        object: ObjectReference,
        index: usize,
        new: Option<ObjectReference>,
    ) -> Option<ObjectReference> {
        let object = self.write_barrier(object);
        let new = self.storeval_barrier(new);
        let slot = object.ref_slot(index);
        if !self.is_set(GCState::MARKING) {
            return self.read_barrier_nullable(slot_swap(slot, new));
        }
        // Log the value before it is replaced, and only replace the value that was logged.
        let mut previous = slot_load(slot);
        loop {
            self.satb_pre_write(object, previous);
            match slot_compare_exchange(slot, previous, new) {
                Ok(_) => return self.read_barrier_nullable(previous),
                Err(actual) => previous = actual,
            }
        }
    }

    /// Copy `len` reference fields from `src` to `dst`. The ranges may overlap.
    pub fn array_copy(
        &mut self,
        src: ObjectReference,
        src_pos: usize,
        dst: ObjectReference,
        dst_pos: usize,
        len: usize,
    ) {
        let src = self.read_barrier(src);
        let dst = self.write_barrier(dst);
        check_ref_range(src, src_pos, len);
        check_ref_range(dst, dst_pos, len);
        if self.is_set(GCState::MARKING) {
            for i in 0..len {
                let old = dst.load_ref(dst_pos + i);
                self.satb_pre_write(dst, old);
            }
        }
        let values: Vec<_> = (0..len).map(|i| src.load_ref(src_pos + i)).collect();
        for (i, value) in values.into_iter().enumerate() {
            let value = self.storeval_barrier(value);
            dst.store_ref(dst_pos + i, value);
        }
    }

    /// Reference equality. Two copies of the same object are the same object.
    pub fn same_object(&self, a: Option<ObjectReference>, b: Option<ObjectReference>) -> bool {
        if a == b {
            return true;
        }
        self.flags.acmp
            && self.is_set(GCState::HAS_FORWARDED)
            && resolve_nullable(a) == resolve_nullable(b)
    }

    pub fn read_word(&self, object: ObjectReference, index: usize) -> usize {
        self.read_barrier(object).load_word(index)
    }

    pub fn write_word(&mut self, object: ObjectReference, index: usize, value: usize) {
        self.write_barrier(object).store_word(index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::small_heap_options;

    #[test]
    fn atomic_updates_log_the_overwritten_snapshot_value() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let mutator = heap.bind_mutator();
        let old_value = mutator.alloc_plain(0, 1).unwrap();
        let holder = mutator.alloc_plain(1, 0).unwrap();
        mutator.store(holder, 0, Some(old_value));
        let roots = [mutator.push_root(Some(old_value)), mutator.push_root(Some(holder))];

        // Start a snapshot by hand. Objects allocated from here on sit above TAMS.
        mutator.enter_safe_region(|| {
            heap.with_world_stopped(|heap| {
                heap.retire_all_labs();
                heap.clear_next_bitmap();
                heap.capture_top_at_mark_starts();
            })
        });
        let fresh = mutator.alloc_plain(1, 0).unwrap();
        let ctx = heap.next_marking_context();
        assert!(!ctx.allocated_after_mark_start(holder.to_raw_address()));
        assert!(ctx.allocated_after_mark_start(fresh.to_raw_address()));

        let mut satb = SATBMarkQueue::new(16);
        let mut evac = EvacuationContext::new();
        {
            let mut barriers = BarrierSet::new(&heap, GCState::MARKING, &mut satb, &mut evac);
            assert_eq!(barriers.swap(holder, 0, Some(fresh)), Some(old_value));

            // A field of an object allocated during marking holds nothing from the snapshot.
            fresh.store_ref(0, Some(old_value));
            assert_eq!(barriers.swap(fresh, 0, None), Some(old_value));
            assert!(barriers.compare_and_swap(fresh, 0, None, Some(old_value)));

            holder.store_ref(0, Some(old_value));
            assert!(barriers.compare_and_swap(holder, 0, Some(old_value), None));
            assert_eq!(holder.load_ref(0), None);
        }
        // Only the two updates of `holder` were logged.
        assert_eq!(satb.len(), 2);

        for root in roots.into_iter().rev() {
            mutator.pop_root(root);
        }
        drop(mutator);
        heap.shutdown();
    }
}
