//! Evacuation: copying live objects out of the collection set.
//!
//! Any thread may evacuate an object: GC workers walking the collection set, the control thread
//! fixing roots, and mutators hitting the write barrier. They race on the forwarding slot and
//! the first CAS wins. A losing copy is parked in the thread's scratch arena and turned into a
//! filler at the next pause.

use crate::alloc::LocalAllocBuffer;
use crate::forwarding::{get_forwardee, resolve, try_update_forwardee};
use crate::heap::Heap;
use crate::object::{copy_object, walk_objects, write_filler, ObjectKind, ObjectReference};
use crate::region::{AllocRequest, AllocRequestKind, HeapRegion};
use crate::scheduler::{GCWork, GCWorker};
use crate::util::log::{debug, trace};
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Copies that lost the forwarding race in the current epoch.
#[derive(Default)]
struct ScratchArena {
    losers: Vec<(Address, usize)>,
}

impl ScratchArena {
    fn add(&mut self, start: Address, size: usize) {
        self.losers.push((start, size));
    }

    /// Turn the losers into fillers. Called at a pause, when no thread can be reading them.
    fn flush(&mut self) {
        for (start, size) in self.losers.drain(..) {
            unsafe { write_filler(start, size) };
        }
    }
}

/// Per-thread evacuation state.
#[derive(Default)]
pub struct EvacuationContext {
    gclab: LocalAllocBuffer,
    scratch: ScratchArena,
    /// Set while this thread may not copy because evacuation ran out of memory.
    oom_during_evac: bool,
}

impl EvacuationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire the GCLAB and flush the scratch arena. Only called in pauses.
    pub(crate) fn retire(&mut self) {
        self.gclab.retire();
        self.scratch.flush();
    }

    fn allocate(&mut self, heap: &Heap, size: usize) -> Option<Address> {
        if let Some(addr) = self.gclab.alloc(size) {
            return Some(addr);
        }
        let gclab_size = heap.options().gclab_size;
        if size > gclab_size / 2 {
            return heap
                .allocate_memory(AllocRequest::shared(size, AllocRequestKind::SharedGc))
                .map(|(addr, _)| addr);
        }
        self.gclab.retire();
        let (start, actual) = heap.allocate_memory(AllocRequest::lab(
            gclab_size,
            size,
            AllocRequestKind::Gclab,
        ))?;
        self.gclab.set(start, actual);
        self.gclab.alloc(size)
    }

    fn retire_loser(&mut self, start: Address, size: usize) {
        if !self.gclab.rollback(start, size) {
            self.scratch.add(start, size);
        }
    }
}

const OOM_MARKER_MASK: usize = 1 << (usize::BITS - 1);

/// Coordinates threads when evacuation runs out of memory.
///
/// Threads register while they evacuate an object. The first thread that fails to allocate sets
/// the OOM marker and waits until every other thread has left its evacuation scope. From then
/// on, no thread copies objects. They only resolve forwarding slots, so all threads agree on one
/// copy of every object.
#[derive(Default)]
pub struct EvacOOMHandler {
    threads_in_evac: AtomicUsize,
}

impl EvacOOMHandler {
    fn wait_for_no_evac_threads(&self, ctx: &mut EvacuationContext) {
        while self.threads_in_evac.load(Ordering::Acquire) != OOM_MARKER_MASK {
            std::thread::yield_now();
        }
        ctx.oom_during_evac = true;
    }

    pub(crate) fn enter_evacuation(&self, ctx: &mut EvacuationContext) {
        let mut threads = self.threads_in_evac.load(Ordering::Acquire);
        loop {
            if threads & OOM_MARKER_MASK != 0 {
                self.wait_for_no_evac_threads(ctx);
                return;
            }
            match self.threads_in_evac.compare_exchange(
                threads,
                threads + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => threads = current,
            }
        }
    }

    pub(crate) fn leave_evacuation(&self, ctx: &mut EvacuationContext) {
        if ctx.oom_during_evac {
            // This thread never registered.
            ctx.oom_during_evac = false;
        } else {
            let old = self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(old & !OOM_MARKER_MASK > 0, "unbalanced evacuation scope");
        }
    }

    pub(crate) fn handle_out_of_memory_during_evacuation(&self, ctx: &mut EvacuationContext) {
        let mut threads = self.threads_in_evac.load(Ordering::Acquire);
        loop {
            if threads & OOM_MARKER_MASK != 0 {
                // Somebody else set the marker. Deregister and wait like everyone else.
                self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
                self.wait_for_no_evac_threads(ctx);
                return;
            }
            match self.threads_in_evac.compare_exchange(
                threads,
                (threads - 1) | OOM_MARKER_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.wait_for_no_evac_threads(ctx);
                    return;
                }
                Err(current) => threads = current,
            }
        }
    }

    pub fn is_oom(&self) -> bool {
        self.threads_in_evac.load(Ordering::Acquire) & OOM_MARKER_MASK != 0
    }

    /// Reset the handler. Called in pauses, when nobody evacuates.
    pub(crate) fn clear(&self) {
        let threads = self.threads_in_evac.load(Ordering::Acquire);
        debug_assert!(
            threads & !OOM_MARKER_MASK == 0,
            "{} threads still evacuating",
            threads & !OOM_MARKER_MASK
        );
        self.threads_in_evac.store(0, Ordering::Release);
    }
}

/// Evacuate `object`, which is in the collection set, and return its canonical copy.
/// The caller must be inside an evacuation scope.
fn evacuate_object(heap: &Heap, object: ObjectReference, ctx: &mut EvacuationContext) -> ObjectReference {
    if let Some(forwardee) = get_forwardee(object) {
        return forwardee;
    }
    if ctx.oom_during_evac {
        return resolve(object);
    }
    let size = object.size_bytes();
    let injected = heap.options().oom_during_evac_alot && heap.should_inject_fault();
    let target = if injected {
        None
    } else {
        ctx.allocate(heap, size)
    };
    let Some(target) = target else {
        debug!(
            "Failed to evacuate {} ({} bytes){}",
            object,
            size,
            if injected { ", injected" } else { "" }
        );
        heap.on_evacuation_failure();
        heap.oom_handler().handle_out_of_memory_during_evacuation(ctx);
        return resolve(object);
    };
    let copy = unsafe { copy_object(object, target) };
    let winner = try_update_forwardee(object, copy);
    if winner == copy {
        trace!("Evacuated {} to {}", object, copy);
    } else {
        ctx.retire_loser(target, size);
    }
    winner
}

/// Evacuate `object` inside its own evacuation scope.
pub(crate) fn evacuate_in_scope(
    heap: &Heap,
    object: ObjectReference,
    ctx: &mut EvacuationContext,
) -> ObjectReference {
    let handler = heap.oom_handler();
    handler.enter_evacuation(ctx);
    let result = evacuate_object(heap, object, ctx);
    handler.leave_evacuation(ctx);
    result
}

/// Evacuate every live object of a cset region.
fn evacuate_region(heap: &Heap, region: &HeapRegion, ctx: &mut EvacuationContext) {
    debug_assert!(region.is_cset());
    let marking = heap.complete_marking_context();
    let tams = marking.top_at_mark_start(region);
    marking.for_each_marked_object(region, |object| {
        evacuate_in_scope(heap, object, ctx);
    });
    if tams < region.top() {
        walk_objects(tams.max(region.bottom()), region.top(), |object| {
            if object.kind() != ObjectKind::Filler {
                evacuate_in_scope(heap, object, ctx);
            }
        });
    }
    heap.pacer().report_evac(region.used());
}

/// Concurrent or stop-the-world evacuation of the collection set.
pub struct EvacuationTask {
    /// Concurrent evacuation stops when the cycle is cancelled.
    pub concurrent: bool,
}

impl GCWork for EvacuationTask {
    fn do_work(&self, worker: &mut GCWorker, heap: &Heap) {
        let cset = heap.collection_set();
        let mut evacuated = 0;
        while let Some(index) = cset.claim_next() {
            if self.concurrent && heap.check_cancelled_gc_and_yield() {
                break;
            }
            evacuate_region(heap, heap.regions().get(index), &mut worker.evac);
            evacuated += 1;
        }
        trace!("Worker {} evacuated {} regions", worker.ordinal, evacuated);
    }
}

/// Retire the GCLAB and scratch arena of every worker.
pub struct RetireGCLABsTask;

impl GCWork for RetireGCLABsTask {
    fn do_work(&self, worker: &mut GCWorker, _heap: &Heap) {
        worker.evac.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::Arc;

    #[test]
    fn oom_protocol_releases_all_threads() {
        panic_after(5000, || {
            let handler = Arc::new(EvacOOMHandler::default());
            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let handler = handler.clone();
                    std::thread::spawn(move || {
                        let mut ctx = EvacuationContext::new();
                        for n in 0..1000 {
                            handler.enter_evacuation(&mut ctx);
                            if i == 0 && n == 500 && !ctx.oom_during_evac {
                                handler.handle_out_of_memory_during_evacuation(&mut ctx);
                                assert!(ctx.oom_during_evac);
                            }
                            handler.leave_evacuation(&mut ctx);
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
            assert!(handler.is_oom());
            handler.clear();
            assert!(!handler.is_oom());
        })
    }
}
