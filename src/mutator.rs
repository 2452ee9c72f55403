//! Mutator threads.
//!
//! A [`Mutator`] is bound to one thread. It owns the thread's allocation buffer, SATB queue,
//! evacuation context and root slots, and it runs every managed reference operation through the
//! barrier set. References kept outside the root slots are only valid until the next
//! yieldpoint, because allocation may stop the thread for a pause.

use crate::alloc::LocalAllocBuffer;
use crate::barrier::BarrierSet;
use crate::error::AllocationError;
use crate::evacuation::EvacuationContext;
use crate::gc_state::GCCause;
use crate::heap::Heap;
use crate::marking::SATBMarkQueue;
use crate::object::{
    byte_array_payload_words, initialize_object, ObjectHeader, ObjectKind, ObjectReference,
};
use crate::region::{AllocRequest, AllocRequestKind};
use crate::util::log::{debug, trace};
use crate::util::Address;
use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// The thread-local part of a mutator. The collector only touches it while the mutator is
/// stopped.
pub(crate) struct MutatorLocal {
    pub(crate) roots: Vec<Option<ObjectReference>>,
    pub(crate) satb: SATBMarkQueue,
    pub(crate) tlab: LocalAllocBuffer,
    pub(crate) evac: EvacuationContext,
    seen_flush_epoch: usize,
}

/// The part of a mutator that the heap keeps in its mutator list.
pub struct MutatorShared {
    id: usize,
    /// This thread's copy of the GC state. Barriers read it without synchronization.
    gc_state: AtomicU8,
    pub(crate) local: AtomicRefCell<MutatorLocal>,
}

impl MutatorShared {
    pub(crate) fn new(id: usize, gc_state: u8, satb_buffer_size: usize, flush_epoch: usize) -> Self {
        MutatorShared {
            id,
            gc_state: AtomicU8::new(gc_state),
            local: AtomicRefCell::new(MutatorLocal {
                roots: Vec::new(),
                satb: SATBMarkQueue::new(satb_buffer_size),
                tlab: LocalAllocBuffer::new(),
                evac: EvacuationContext::new(),
                seen_flush_epoch: flush_epoch,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[inline(always)]
    pub fn gc_state(&self) -> u8 {
        self.gc_state.load(Ordering::Relaxed)
    }

    /// Refresh the snapshot. Only called while the mutator is stopped.
    pub(crate) fn publish_gc_state(&self, state: u8) {
        self.gc_state.store(state, Ordering::Relaxed);
    }
}

/// A mutator thread's handle to the heap. A thread binds at most one mutator at a time.
pub struct Mutator {
    heap: Arc<Heap>,
    shared: Arc<MutatorShared>,
    /// Set while the thread is inside [`Mutator::enter_safe_region`] and not counted as running.
    in_safe_region: AtomicBool,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, shared: Arc<MutatorShared>) -> Self {
        Mutator {
            heap,
            shared,
            in_safe_region: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The GC state as this thread sees it.
    pub fn gc_state(&self) -> u8 {
        self.shared.gc_state()
    }

    fn with_barriers<R>(&self, f: impl FnOnce(&mut BarrierSet) -> R) -> R {
        let mut local = self.shared.local.borrow_mut();
        let local = &mut *local;
        let mut barriers = BarrierSet::new(
            &self.heap,
            self.shared.gc_state(),
            &mut local.satb,
            &mut local.evac,
        );
        f(&mut barriers)
    }

    // Allocation

    /// Allocate an object with `refs` null reference fields and `payload_words` zeroed words.
    pub fn alloc_plain(
        &self,
        refs: usize,
        payload_words: usize,
    ) -> Result<ObjectReference, AllocationError> {
        self.alloc_object(ObjectHeader::new(ObjectKind::Plain, refs, payload_words))
    }

    pub fn alloc_object(&self, header: ObjectHeader) -> Result<ObjectReference, AllocationError> {
        let addr = self.allocate(header.size_bytes())?;
        Ok(unsafe { initialize_object(addr, header) })
    }

    /// Allocate a byte array holding a copy of `bytes`.
    pub fn alloc_byte_array(&self, bytes: &[u8]) -> Result<ObjectReference, AllocationError> {
        let header = ObjectHeader::new(
            ObjectKind::ByteArray,
            0,
            byte_array_payload_words(bytes.len()),
        );
        let array = self.alloc_object(header)?;
        array.store_word(0, bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                array.byte_array_data().to_mut_ptr::<u8>(),
                bytes.len(),
            );
        }
        Ok(array)
    }

    /// Allocate a string backed by a new byte array.
    pub fn alloc_string(&self, bytes: &[u8]) -> Result<ObjectReference, AllocationError> {
        let array = self.alloc_byte_array(bytes)?;
        let slot = self.push_root(Some(array));
        let string = self.alloc_object(ObjectHeader::new(ObjectKind::String, 1, 0));
        let array = self.pop_root(slot);
        let string = string?;
        self.store(string, 0, array);
        Ok(string)
    }

    /// The contents of a string.
    pub fn string_bytes(&self, string: ObjectReference) -> Vec<u8> {
        match self.load(string, 0) {
            Some(array) => self.with_barriers(|b| b.read_barrier(array)).byte_array_to_vec(),
            None => Vec::new(),
        }
    }

    fn allocate(&self, size: usize) -> Result<Address, AllocationError> {
        let capacity = self.heap.capacity();
        if size > capacity {
            return Err(AllocationError::TooLarge {
                requested: size,
                capacity,
            });
        }
        let mut full_gcs_at_first_failure = None;
        loop {
            self.yieldpoint();
            if self.heap.is_shutting_down() {
                return Err(AllocationError::ShuttingDown);
            }
            if let Some(addr) = self.try_allocate(size) {
                return Ok(addr);
            }
            let full_gcs = self.heap.stats().full_gcs();
            match full_gcs_at_first_failure {
                None => full_gcs_at_first_failure = Some(full_gcs),
                Some(before) if full_gcs > before => {
                    debug!("Mutator {} out of memory for {} bytes", self.id(), size);
                    return Err(AllocationError::OutOfMemory { requested: size });
                }
                Some(_) => {}
            }
            self.enter_safe_region(|| self.heap.handle_alloc_failure(size));
        }
    }

    fn try_allocate(&self, size: usize) -> Option<Address> {
        let heap = &*self.heap;
        let tlab_size = heap.options().tlab_size;
        {
            let mut local = self.shared.local.borrow_mut();
            if let Some(addr) = local.tlab.alloc(size) {
                return Some(addr);
            }
        }
        if heap.options().alloc_failure_alot && heap.should_inject_fault() {
            trace!("Injected allocation failure for {} bytes", size);
            return None;
        }
        if heap.options().pacing {
            let request = if size > tlab_size / 2 { size } else { tlab_size };
            heap.pacer()
                .pace_for_alloc(request, heap.safepoint(), heap.gc_state());
        }
        if size > tlab_size / 2 {
            let (addr, _) =
                heap.allocate_memory(AllocRequest::shared(size, AllocRequestKind::SharedMutator))?;
            return Some(addr);
        }
        let mut local = self.shared.local.borrow_mut();
        local.tlab.retire();
        let (start, actual) = heap.allocate_memory(AllocRequest::lab(
            tlab_size,
            size,
            AllocRequestKind::Tlab,
        ))?;
        local.tlab.set(start, actual);
        local.tlab.alloc(size)
    }

    // Roots

    /// Add a root slot and return its index.
    pub fn push_root(&self, value: Option<ObjectReference>) -> usize {
        let mut local = self.shared.local.borrow_mut();
        local.roots.push(value);
        local.roots.len() - 1
    }

    /// Remove the most recently pushed root slot, which must be `index`.
    pub fn pop_root(&self, index: usize) -> Option<ObjectReference> {
        let value = {
            let mut local = self.shared.local.borrow_mut();
            assert_eq!(index + 1, local.roots.len(), "root slots are popped in LIFO order");
            local.roots.pop().flatten()
        };
        self.with_barriers(|b| b.read_barrier_nullable(value))
    }

    pub fn root(&self, index: usize) -> Option<ObjectReference> {
        let value = self.shared.local.borrow().roots[index];
        self.with_barriers(|b| b.read_barrier_nullable(value))
    }

    pub fn set_root(&self, index: usize, value: Option<ObjectReference>) {
        self.shared.local.borrow_mut().roots[index] = value;
    }

    pub fn root_count(&self) -> usize {
        self.shared.local.borrow().roots.len()
    }

    // Reference operations
    //
    // Field and word indices are checked against the object's layout. An index out of range
    // panics.

    pub fn load(&self, object: ObjectReference, index: usize) -> Option<ObjectReference> {
        self.with_barriers(|b| b.load(object, index))
    }

    /// Load through a weak reference field. The referent is kept alive for the running marking.
    pub fn load_weak(&self, object: ObjectReference, index: usize) -> Option<ObjectReference> {
        self.with_barriers(|b| b.load_weak(object, index))
    }

    pub fn store(&self, object: ObjectReference, index: usize, value: Option<ObjectReference>) {
        self.with_barriers(|b| b.store(object, index, value))
    }

    pub fn compare_and_swap(
        &self,
        object: ObjectReference,
        index: usize,
        expected: Option<ObjectReference>,
        new: Option<ObjectReference>,
    ) -> bool {
        self.with_barriers(|b| b.compare_and_swap(object, index, expected, new))
    }

    pub fn swap(
        &self,
        object: ObjectReference,
        index: usize,
        new: Option<ObjectReference>,
    ) -> Option<ObjectReference> {
        self.with_barriers(|b| b.swap(object, index, new))
    }

    pub fn array_copy(
        &self,
        src: ObjectReference,
        src_pos: usize,
        dst: ObjectReference,
        dst_pos: usize,
        len: usize,
    ) {
        self.with_barriers(|b| b.array_copy(src, src_pos, dst, dst_pos, len))
    }

    pub fn same_object(&self, a: Option<ObjectReference>, b: Option<ObjectReference>) -> bool {
        self.with_barriers(|barriers| barriers.same_object(a, b))
    }

    pub fn read_word(&self, object: ObjectReference, index: usize) -> usize {
        self.with_barriers(|b| b.read_word(object, index))
    }

    pub fn write_word(&self, object: ObjectReference, index: usize, value: usize) {
        self.with_barriers(|b| b.write_word(object, index, value))
    }

    // Pinning and strings

    /// Pin `object` so that no collection moves it. Returns the pinned copy, which the caller
    /// must use from now on.
    pub fn pin_object(&self, object: ObjectReference) -> ObjectReference {
        let object = self.with_barriers(|b| b.write_barrier(object));
        self.heap.pin_object(object);
        object
    }

    pub fn unpin_object(&self, object: ObjectReference) {
        let object = self.with_barriers(|b| b.read_barrier(object));
        self.heap.unpin_object(object);
    }

    /// Replace the backing array of `string` with an equal canonical one, if there is one.
    /// Returns true if the string now shares its array.
    pub fn deduplicate_string(&self, string: ObjectReference) -> bool {
        self.with_barriers(|b| self.heap.string_dedup().deduplicate(b, string))
    }

    // Synchronization

    /// Stop for a pending pause, and flush the SATB buffer if the collector asked for it.
    pub fn yieldpoint(&self) {
        self.heap.safepoint().yieldpoint();
        let qset = self.heap.satb_queue_set();
        let epoch = qset.flush_epoch();
        let mut local = self.shared.local.borrow_mut();
        if local.seen_flush_epoch != epoch {
            local.seen_flush_epoch = epoch;
            local.satb.flush(qset);
        }
    }

    /// Run `f` as safe: pauses may happen while it runs. `f` must not touch the heap through
    /// this mutator.
    pub fn enter_safe_region<R>(&self, f: impl FnOnce() -> R) -> R {
        let safepoint = self.heap.safepoint();
        safepoint.block_begin();
        self.in_safe_region.store(true, Ordering::Relaxed);
        let result = f();
        safepoint.block_end();
        self.in_safe_region.store(false, Ordering::Relaxed);
        result
    }

    /// An explicit collection request. Blocks until the collection is done.
    pub fn collect(&self) {
        self.enter_safe_region(|| self.heap.request_gc(GCCause::ExplicitGC));
    }

    /// Ask for a concurrent cycle. Blocks until it is done.
    pub fn request_concurrent_cycle(&self) {
        self.enter_safe_region(|| self.heap.request_concurrent_cycle());
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let evac = {
            let mut local = self.shared.local.borrow_mut();
            local.tlab.retire();
            let qset = self.heap.satb_queue_set();
            if qset.is_active() {
                local.satb.flush(qset);
            } else {
                local.satb.reset();
            }
            local.roots.clear();
            std::mem::take(&mut local.evac)
        };
        self.heap.remove_mutator(&self.shared, evac);
        // A panic inside a safe region unwinds past `block_end`. The thread is already off the
        // running count then.
        if !self.in_safe_region.load(Ordering::Relaxed) {
            self.heap.safepoint().deregister();
        }
        trace!("Mutator {} destroyed", self.shared.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::small_heap_options;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn panic_in_safe_region_leaves_safepoint_balanced() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mutator = heap.bind_mutator();
            mutator.enter_safe_region(|| panic!("collection failed"));
        }));
        assert!(result.is_err());
        assert_eq!(heap.safepoint().running_mutators(), 0);
        assert_eq!(heap.mutator_count(), 0);
        // The world can still be stopped, and new mutators can bind.
        heap.with_world_stopped(|_| {});
        let mutator = heap.bind_mutator();
        assert_eq!(heap.safepoint().running_mutators(), 1);
        drop(mutator);
        heap.shutdown();
    }

    #[test]
    #[should_panic(expected = "has no reference field 1")]
    fn load_checks_the_field_index() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let mutator = heap.bind_mutator();
        let object = mutator.alloc_plain(1, 4).unwrap();
        mutator.load(object, 1);
    }

    #[test]
    #[should_panic(expected = "cannot access 2 from 3")]
    fn array_copy_checks_both_ranges() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let mutator = heap.bind_mutator();
        let src = mutator.alloc_plain(8, 0).unwrap();
        let src = mutator.push_root(Some(src));
        let dst = mutator.alloc_plain(4, 0).unwrap();
        mutator.array_copy(mutator.root(src).unwrap(), 0, dst, 3, 2);
    }
}
