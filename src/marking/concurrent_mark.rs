use super::MarkingContext;
use crate::evacuation::{evacuate_in_scope, EvacuationContext};
use crate::forwarding::resolve;
use crate::heap::Heap;
use crate::marking::terminator::TaskTerminator;
use crate::object::{slot_compare_exchange, slot_load, ObjectKind, ObjectReference};
use crate::scheduler::{GCWork, GCWorker};
use crate::util::log::{debug, trace};
use crate::util::Address;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What marking does with references into the collection set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkMode {
    /// Plain marking. No object is forwarded.
    Mark,
    /// Forwarded objects are left over from an unfinished update-references phase. Every visited
    /// slot is updated to the forwardee.
    MarkUpdateRefs,
    /// Traversal: collection set objects are evacuated when first reached, visited slots are
    /// updated, and objects allocated after the start are traced too.
    Traversal,
}

/// Marking task queues and the termination protocol.
///
/// Every worker ordinal owns a work-stealing deque. Roots, leftovers of cancelled workers and
/// anything pushed from outside a worker go to the shared injector.
pub struct ConcurrentMark {
    queues: Box<[Mutex<Worker<ObjectReference>>]>,
    stealers: Box<[Stealer<ObjectReference>]>,
    injector: Injector<ObjectReference>,
    terminator: TaskTerminator,
    last_satb_flush: Mutex<Instant>,
}

impl ConcurrentMark {
    pub fn new(max_workers: usize) -> Self {
        let queues: Vec<Worker<ObjectReference>> =
            (0..max_workers.max(1)).map(|_| Worker::new_lifo()).collect();
        let stealers = queues.iter().map(|q| q.stealer()).collect();
        ConcurrentMark {
            queues: queues.into_iter().map(Mutex::new).collect(),
            stealers,
            injector: Injector::new(),
            terminator: TaskTerminator::new(max_workers.max(1)),
            last_satb_flush: Mutex::new(Instant::now()),
        }
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    /// Drop all pending tasks. Used when marking is abandoned.
    pub fn clear_queues(&self) {
        while !self.injector.steal().is_empty() {}
        for queue in self.queues.iter() {
            let queue = queue.lock().unwrap();
            while queue.pop().is_some() {}
        }
    }

    pub(crate) fn prepare_for_workers(&self, workers: usize) {
        debug_assert!(workers <= self.queues.len());
        self.terminator.reset_for_reuse(workers);
        *self.last_satb_flush.lock().unwrap() = Instant::now();
    }

    /// Mark a root and queue it for scanning. Traversal evacuates the root with `evac`.
    pub(crate) fn mark_root(
        &self,
        heap: &Heap,
        object: ObjectReference,
        mode: MarkMode,
        evac: Option<&mut EvacuationContext>,
    ) -> ObjectReference {
        let mut closure = MarkClosure::new(heap, None, &self.injector, mode, evac);
        let marked = closure.mark_object(object);
        heap.pacer().report_mark(closure.marked_bytes);
        marked
    }

    fn steal(&self, ordinal: usize, queue: &Worker<ObjectReference>) -> Option<ObjectReference> {
        std::iter::repeat_with(|| {
            self.injector.steal_batch_and_pop(queue).or_else(|| {
                self.stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != ordinal)
                    .map(|(_, s)| s.steal())
                    .collect::<Steal<ObjectReference>>()
            })
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    }

    fn maybe_request_satb_flush(&self, heap: &Heap) {
        let interval = heap.options().satb_buffer_flush_interval;
        if interval == 0 {
            return;
        }
        let mut last = self.last_satb_flush.lock().unwrap();
        if last.elapsed() >= Duration::from_millis(interval) {
            heap.satb_queue_set().request_flush();
            *last = Instant::now();
        }
    }

    /// Drain marking work on worker `ordinal` until all workers agree that nothing is left.
    /// Returns false if the loop stopped because the cycle was cancelled.
    pub(crate) fn mark_loop(
        &self,
        ordinal: usize,
        heap: &Heap,
        cancellable: bool,
        mode: MarkMode,
        evac: Option<&mut EvacuationContext>,
    ) -> bool {
        let queue = self.queues[ordinal].lock().unwrap();
        let mut closure = MarkClosure::new(heap, Some(&*queue), &self.injector, mode, evac);
        let stride = heap.options().mark_loop_stride;
        let satb = heap.satb_queue_set();
        let mut scanned = 0usize;
        loop {
            if cancellable && heap.check_cancelled_gc_and_yield() {
                let mut returned = 0;
                while let Some(object) = queue.pop() {
                    self.injector.push(object);
                    returned += 1;
                }
                debug!(
                    "Marking worker {} cancelled, {} tasks returned",
                    ordinal, returned
                );
                return false;
            }
            if ordinal == 0 && cancellable {
                self.maybe_request_satb_flush(heap);
            }
            while let Some(buffer) = satb.pop_completed() {
                for object in buffer {
                    closure.mark_object(object);
                }
            }
            let mut work = 0;
            while work < stride {
                match queue.pop().or_else(|| self.steal(ordinal, &queue)) {
                    Some(object) => {
                        closure.scan_object(object);
                        work += 1;
                    }
                    None => break,
                }
            }
            scanned += work;
            heap.pacer().report_mark(std::mem::take(&mut closure.marked_bytes));
            if work == 0 {
                let peek = || {
                    self.has_pending_tasks()
                        || satb.completed_buffers_num() > 0
                        || (cancellable && heap.cancelled_gc())
                };
                if self.terminator.offer_termination(&peek) {
                    trace!("Marking worker {} done, {} objects scanned", ordinal, scanned);
                    return true;
                }
            }
        }
    }
}

/// Marks objects and pushes newly marked ones for scanning.
struct MarkClosure<'a> {
    heap: &'a Heap,
    ctx: &'a MarkingContext,
    queue: Option<&'a Worker<ObjectReference>>,
    injector: &'a Injector<ObjectReference>,
    mode: MarkMode,
    evac: Option<&'a mut EvacuationContext>,
    dedup: bool,
    marked_bytes: usize,
}

impl<'a> MarkClosure<'a> {
    fn new(
        heap: &'a Heap,
        queue: Option<&'a Worker<ObjectReference>>,
        injector: &'a Injector<ObjectReference>,
        mode: MarkMode,
        evac: Option<&'a mut EvacuationContext>,
    ) -> Self {
        debug_assert!(mode != MarkMode::Traversal || evac.is_some());
        MarkClosure {
            heap,
            ctx: heap.next_marking_context(),
            queue,
            injector,
            mode,
            evac,
            dedup: heap.options().string_dedup,
            marked_bytes: 0,
        }
    }

    /// The copy of a collection set object that marking should continue with.
    fn forward(&mut self, object: ObjectReference) -> ObjectReference {
        match (self.mode, self.evac.as_deref_mut()) {
            (MarkMode::Traversal, Some(evac)) => evacuate_in_scope(self.heap, object, evac),
            _ => resolve(object),
        }
    }

    /// Mark `object` and return the object that was marked, which is the forwardee of a
    /// collection set object unless plain marking is running.
    fn mark_object(&mut self, object: ObjectReference) -> ObjectReference {
        let object = if self.mode != MarkMode::Mark && self.heap.in_collection_set_obj(object) {
            self.forward(object)
        } else {
            object
        };
        let newly_marked = if self.mode == MarkMode::Traversal {
            self.ctx.mark_ignoring_tams(object)
        } else {
            self.ctx.mark(object)
        };
        if newly_marked {
            match self.queue {
                Some(queue) => queue.push(object),
                None => self.injector.push(object),
            }
            // Objects above TAMS are accounted for with the region's top at final mark.
            if !self.ctx.allocated_after_mark_start(object.to_raw_address()) {
                self.heap.count_liveness(object);
            }
            self.marked_bytes += object.size_bytes();
            if self.dedup && object.kind() == ObjectKind::String {
                self.heap.string_dedup().enqueue_candidate(object);
            }
        }
        object
    }

    fn mark_through_ref(&mut self, slot: Address) {
        let Some(object) = slot_load(slot) else {
            return;
        };
        let marked = self.mark_object(object);
        if marked != object {
            // A racing mutator store wins. Its value went through the storeval barrier.
            let _ = slot_compare_exchange(slot, Some(object), Some(marked));
        }
    }

    fn scan_object(&mut self, object: ObjectReference) {
        object.for_each_ref_slot(|slot| self.mark_through_ref(slot));
    }
}

/// The marking phase, run by every active worker.
pub struct ConcurrentMarkingTask {
    pub cancellable: bool,
    pub mode: MarkMode,
}

impl GCWork for ConcurrentMarkingTask {
    fn do_work(&self, worker: &mut GCWorker, heap: &Heap) {
        let evac = if self.mode == MarkMode::Traversal {
            Some(&mut worker.evac)
        } else {
            None
        };
        heap.concurrent_mark()
            .mark_loop(worker.ordinal, heap, self.cancellable, self.mode, evac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc_state::GCState;
    use crate::util::test_util::small_heap_options;

    #[test]
    fn marks_everything_reachable_from_roots() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let mutator = heap.bind_mutator();
        // a -> b -> c, d is garbage
        let c = mutator.alloc_plain(0, 1).unwrap();
        let c_root = mutator.push_root(Some(c));
        let b = mutator.alloc_plain(1, 0).unwrap();
        mutator.store(b, 0, mutator.root(c_root));
        let b_root = mutator.push_root(Some(b));
        let a = mutator.alloc_plain(1, 0).unwrap();
        mutator.store(a, 0, mutator.root(b_root));
        mutator.push_root(Some(a));
        mutator.set_root(c_root, None);
        mutator.set_root(b_root, None);
        let d = mutator.alloc_plain(0, 4).unwrap();

        mutator.enter_safe_region(|| {
            heap.with_world_stopped(|heap| {
                heap.retire_all_labs();
                heap.clear_next_bitmap();
                heap.capture_top_at_mark_starts();
                heap.mark_roots(MarkMode::Mark);
                heap.concurrent_mark().prepare_for_workers(1);
                assert!(heap
                    .concurrent_mark()
                    .mark_loop(0, heap, false, MarkMode::Mark, None));
                let ctx = heap.next_marking_context();
                assert!(ctx.is_marked(a));
                assert!(ctx.is_marked(b));
                assert!(ctx.is_marked(c));
                assert!(!ctx.is_marked(d));
                assert!(!heap.concurrent_mark().has_pending_tasks());
                assert_eq!(heap.gc_state().load(), GCState::STABLE);
            })
        });
        drop(mutator);
        heap.shutdown();
    }
}
