//! The heap: regions, collector state and the services every phase works with.
//!
//! One [`Heap`] owns the reserved memory, the region table and free set, the marking contexts,
//! the GC state, the worker gang and the control thread. It is shared as `Arc<Heap>` by
//! mutators, workers and the controller. The collection phases themselves live in
//! [`crate::collector`].

use crate::barrier::BarrierFlags;
use crate::control::{DegenPoint, GCController};
use crate::dedup::StringDedup;
use crate::error::HeapError;
use crate::evacuation::{EvacOOMHandler, EvacuationContext, RetireGCLABsTask};
use crate::gc_state::{GCCause, SharedGCState};
use crate::heuristics::{self, CollectionSetInput, Heuristics, RegionData, RegionKind, TriggerInput};
use crate::marking::{ConcurrentMark, MarkMode, MarkingContext, MarkingContexts, SATBMarkQueueSet};
use crate::mutator::{Mutator, MutatorShared};
use crate::object::ObjectReference;
use crate::pacer::Pacer;
use crate::region::{
    AllocRequest, CollectionSet, FreeSet, HeapRegion, ParallelRegionIterator, RegionTable,
};
use crate::safepoint::Safepoint;
use crate::scheduler::WorkGang;
use crate::util::conversions::bytes_to_formatted_string;
use crate::util::log::{debug, info, trace};
use crate::util::memory::ReservedMemory;
use crate::util::options::{HeuristicsMode, Options};
use crate::util::statistics::{GCStatistics, Phase, PhaseTimings};
use crate::util::Address;
use crate::verifier::{self, VerifyPoint};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Injected faults fire once every this many opportunities.
const FAULT_INJECTION_PERIOD: usize = 64;

pub struct Heap {
    options: Options,
    barrier_flags: BarrierFlags,
    regions: RegionTable,
    /// The heap lock. It guards the free set and every region state transition.
    free_set: Mutex<FreeSet>,
    collection_set: CollectionSet,
    gc_state: SharedGCState,
    marking: MarkingContexts,
    concurrent_mark: ConcurrentMark,
    satb_queue_set: SATBMarkQueueSet,
    heuristics: Mutex<Box<dyn Heuristics>>,
    safepoint: Safepoint,
    mutators: Mutex<Vec<Arc<MutatorShared>>>,
    next_mutator_id: AtomicUsize,
    workers: WorkGang,
    controller: GCController,
    oom_handler: EvacOOMHandler,
    pacer: Pacer,
    string_dedup: StringDedup,
    update_refs_iterator: ParallelRegionIterator,
    /// Set when the concurrent update-references pass ran to the end.
    pub(crate) update_refs_complete: AtomicBool,
    alloc_seq: AtomicU64,
    mark_start_seq: AtomicU64,
    fault_counter: AtomicUsize,
    /// Set when some thread failed to evacuate an object in this cycle.
    pub(crate) evac_failed: AtomicBool,
    /// Set when the last marking ran to the end and its context is the complete one.
    pub(crate) marking_completed: AtomicBool,
    bytes_allocated_since_cycle_start: AtomicUsize,
    peak_used: AtomicUsize,
    timings: PhaseTimings,
    stats: GCStatistics,
    /// Evacuation context of the control thread and of pause code.
    control_context: Mutex<EvacuationContext>,
    /// Contexts of destroyed mutators. Retired at the next pause.
    orphaned_evac_contexts: Mutex<Vec<EvacuationContext>>,
    shutting_down: AtomicBool,
    // Declared last, so that it is unmapped after everything that points into it.
    memory: ReservedMemory,
}

impl Heap {
    pub fn new(options: Options) -> Result<Arc<Heap>, HeapError> {
        options.validate().map_err(HeapError::InvalidOptions)?;
        let region_size = options.region_size;
        let region_count = options.heap_size / region_size;
        let memory = ReservedMemory::reserve(region_count * region_size, region_size)
            .map_err(HeapError::Mmap)?;
        let regions = RegionTable::new(memory.start(), region_size, region_count);
        let mut free_set = FreeSet::new(region_count, options.evac_reserve_overflow);
        free_set.rebuild(
            &regions,
            region_count * region_size * options.evac_reserve / 100,
        );
        let marking = MarkingContexts::new(&regions);
        info!(
            "Heap of {} in {} regions of {}, {} GC threads",
            bytes_to_formatted_string(memory.size()),
            region_count,
            bytes_to_formatted_string(region_size),
            options.threads
        );
        let heap = Heap {
            barrier_flags: BarrierFlags::from_options(&options),
            free_set: Mutex::new(free_set),
            collection_set: CollectionSet::new(region_count),
            gc_state: SharedGCState::default(),
            marking,
            concurrent_mark: ConcurrentMark::new(options.threads),
            satb_queue_set: SATBMarkQueueSet::new(options.satb_buffer_size),
            heuristics: Mutex::new(heuristics::create(&options)),
            safepoint: Safepoint::default(),
            mutators: Mutex::new(Vec::new()),
            next_mutator_id: AtomicUsize::new(0),
            workers: WorkGang::new(options.threads),
            controller: GCController::default(),
            oom_handler: EvacOOMHandler::default(),
            pacer: Pacer::new(&options),
            string_dedup: StringDedup::new(options.string_dedup),
            update_refs_iterator: ParallelRegionIterator::new(options.parallel_region_stride),
            update_refs_complete: AtomicBool::new(false),
            alloc_seq: AtomicU64::new(1),
            mark_start_seq: AtomicU64::new(0),
            fault_counter: AtomicUsize::new(0),
            evac_failed: AtomicBool::new(false),
            marking_completed: AtomicBool::new(false),
            bytes_allocated_since_cycle_start: AtomicUsize::new(0),
            peak_used: AtomicUsize::new(0),
            timings: PhaseTimings::default(),
            stats: GCStatistics::default(),
            control_context: Mutex::new(EvacuationContext::new()),
            orphaned_evac_contexts: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            regions,
            options,
            memory,
        };
        Ok(Arc::new(heap))
    }

    // Accessors

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn barrier_flags(&self) -> &BarrierFlags {
        &self.barrier_flags
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn collection_set(&self) -> &CollectionSet {
        &self.collection_set
    }

    pub fn gc_state(&self) -> &SharedGCState {
        &self.gc_state
    }

    pub fn cancelled_gc(&self) -> bool {
        self.gc_state.cancelled()
    }

    pub fn concurrent_mark(&self) -> &ConcurrentMark {
        &self.concurrent_mark
    }

    pub fn satb_queue_set(&self) -> &SATBMarkQueueSet {
        &self.satb_queue_set
    }

    pub fn string_dedup(&self) -> &StringDedup {
        &self.string_dedup
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub fn oom_handler(&self) -> &EvacOOMHandler {
        &self.oom_handler
    }

    pub(crate) fn update_refs_iterator(&self) -> &ParallelRegionIterator {
        &self.update_refs_iterator
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn heuristics(&self) -> &Mutex<Box<dyn Heuristics>> {
        &self.heuristics
    }

    pub fn controller(&self) -> &GCController {
        &self.controller
    }

    pub fn workers(&self) -> &WorkGang {
        &self.workers
    }

    pub fn stats(&self) -> &GCStatistics {
        &self.stats
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    /// The context the running (or last started) marking writes to.
    pub fn next_marking_context(&self) -> &MarkingContext {
        self.marking.next()
    }

    /// The result of the last finished marking.
    pub fn complete_marking_context(&self) -> &MarkingContext {
        self.marking.complete()
    }

    pub(crate) fn marking_contexts(&self) -> &MarkingContexts {
        &self.marking
    }

    pub(crate) fn lock_free_set(&self) -> MutexGuard<'_, FreeSet> {
        self.free_set.lock().unwrap()
    }

    pub(crate) fn control_context(&self) -> MutexGuard<'_, EvacuationContext> {
        self.control_context.lock().unwrap()
    }

    pub(crate) fn mutators(&self) -> MutexGuard<'_, Vec<Arc<MutatorShared>>> {
        self.mutators.lock().unwrap()
    }

    pub fn is_traversal_mode(&self) -> bool {
        self.options.heuristics == HeuristicsMode::Traversal
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn mark_start_seq(&self) -> u64 {
        self.mark_start_seq.load(Ordering::Acquire)
    }

    /// Remember the current allocation sequence number as the start of a marking.
    pub(crate) fn record_mark_start_seq(&self) {
        self.mark_start_seq
            .store(self.alloc_seq.load(Ordering::Acquire), Ordering::Release);
    }

    // Sizes

    pub fn capacity(&self) -> usize {
        self.regions.len() * self.regions.region_size()
    }

    /// Bytes in regions that may hold live objects.
    pub fn used(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.used())
            .sum()
    }

    /// Bytes mutators can still allocate without a collection.
    pub fn free_bytes(&self) -> usize {
        self.lock_free_set().available(&self.regions)
    }

    // Collection set membership

    pub fn in_collection_set(&self, region_index: usize) -> bool {
        self.collection_set.is_in(region_index)
    }

    pub fn in_collection_set_addr(&self, addr: Address) -> bool {
        self.collection_set.is_in_addr(&self.regions, addr)
    }

    #[inline(always)]
    pub fn in_collection_set_obj(&self, object: ObjectReference) -> bool {
        self.in_collection_set_addr(object.to_raw_address())
    }

    /// Add a newly marked object to its region's live data. A humongous object makes its whole
    /// run of regions live.
    pub(crate) fn count_liveness(&self, object: ObjectReference) {
        let region = self.regions.region_containing(object.to_raw_address());
        if region.is_humongous_start() {
            let count = self.regions.required_regions(object.size_bytes());
            for index in region.index()..region.index() + count {
                let r = self.regions.get(index);
                r.increase_live_data_bytes(r.used());
            }
        } else {
            region.increase_live_data_bytes(object.size_bytes());
        }
    }

    // Allocation

    /// Allocate from the free set. Returns the start and the actual size, which may be smaller
    /// than requested for a LAB.
    pub(crate) fn allocate_memory(&self, req: AllocRequest) -> Option<(Address, usize)> {
        let result = {
            let mut free_set = self.lock_free_set();
            let seq = self.alloc_seq.fetch_add(1, Ordering::AcqRel);
            free_set.allocate(req, &self.regions, seq, &mut |r| self.recycle_region(r))
        };
        if let Some((addr, size)) = result {
            trace!("Allocated {} bytes at {} for {:?}", size, addr, req.kind);
            if req.kind.is_mutator_alloc() {
                self.bytes_allocated_since_cycle_start
                    .fetch_add(size, Ordering::Relaxed);
            }
            self.peak_used.fetch_max(self.used(), Ordering::Relaxed);
        }
        result
    }

    /// Turn a trash region into an empty one. The caller holds the heap lock.
    pub(crate) fn recycle_region(&self, region: &HeapRegion) {
        self.stats.add_bytes_reclaimed(region.used());
        self.recycle_region_without_accounting(region);
    }

    /// Like [`Heap::recycle_region`], for callers that account reclaimed bytes themselves.
    pub(crate) fn recycle_region_without_accounting(&self, region: &HeapRegion) {
        debug_assert!(region.is_trash());
        for ctx in self.marking.both() {
            ctx.reset_top_at_mark_start(region);
            ctx.clear_region(region);
        }
        region.make_empty();
    }

    /// Should a diagnostic fault fire now?
    pub(crate) fn should_inject_fault(&self) -> bool {
        self.fault_counter.fetch_add(1, Ordering::Relaxed) % FAULT_INJECTION_PERIOD
            == FAULT_INJECTION_PERIOD - 1
    }

    pub(crate) fn on_evacuation_failure(&self) {
        if !self.evac_failed.swap(true, Ordering::AcqRel) {
            self.stats.inc_evacuation_failures();
        }
        self.cancel_gc(GCCause::AllocationFailureEvac);
    }

    // Mutators

    /// Bind the calling thread as a mutator.
    pub fn bind_mutator(self: &Arc<Self>) -> Mutator {
        self.safepoint.register();
        let shared = {
            let mut mutators = self.mutators();
            let id = self.next_mutator_id.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::new(MutatorShared::new(
                id,
                self.gc_state.load(),
                self.options.satb_buffer_size,
                self.satb_queue_set.flush_epoch(),
            ));
            mutators.push(shared.clone());
            shared
        };
        debug!("Mutator {} bound", shared.id());
        Mutator::new(self.clone(), shared)
    }

    pub(crate) fn remove_mutator(&self, shared: &Arc<MutatorShared>, evac: EvacuationContext) {
        self.mutators().retain(|m| !Arc::ptr_eq(m, shared));
        self.orphaned_evac_contexts.lock().unwrap().push(evac);
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators().len()
    }

    // Pinning

    pub(crate) fn pin_object(&self, object: ObjectReference) {
        let _lock = self.lock_free_set();
        let region = self.regions.region_containing(object.to_raw_address());
        region.record_pin();
        if region.is_regular() {
            region.make_pinned();
        }
    }

    pub(crate) fn unpin_object(&self, object: ObjectReference) {
        let _lock = self.lock_free_set();
        let region = self.regions.region_containing(object.to_raw_address());
        region.record_unpin();
        if region.pin_count() == 0 && region.is_pinned() {
            region.make_unpinned();
        }
    }

    // Requests

    /// Request a collection for `cause` and wait until it is done. The caller must not be a
    /// running mutator.
    pub fn request_gc(&self, cause: GCCause) {
        let ticket = self.controller.requests().request_explicit(cause);
        self.controller.wait_or_drive(self, ticket);
    }

    /// Request a full GC and wait until it is done.
    pub fn request_full_gc(&self, cause: GCCause) {
        let ticket = self.controller.requests().request_full(cause);
        self.controller.wait_or_drive(self, ticket);
    }

    /// Request a concurrent cycle and wait until it is done.
    pub fn request_concurrent_cycle(&self) {
        let ticket = self.controller.requests().request_concurrent();
        self.controller.wait_or_drive(self, ticket);
    }

    /// Poll for cancellation from a concurrent GC task.
    pub(crate) fn check_cancelled_gc_and_yield(&self) -> bool {
        self.gc_state
            .check_cancelled_and_yield(self.safepoint.is_requested())
    }

    pub fn cancel_gc(&self, cause: GCCause) {
        if self.gc_state.try_cancel(cause) {
            info!("Cancelling GC: {}", cause);
        }
    }

    pub fn is_busy(&self) -> bool {
        self.controller.is_busy()
    }

    /// An allocation of `bytes` failed. Cancel the running cycle and wait until the degenerated
    /// or full collection that serves the failure is done.
    pub fn handle_alloc_failure(&self, bytes: usize) {
        self.stats.inc_alloc_failures();
        debug!("Allocation failure for {} bytes", bytes);
        let ticket = self.controller.requests().request_alloc_failure();
        self.cancel_gc(GCCause::AllocationFailure);
        self.controller.wait_or_drive(self, ticket);
    }

    /// Cancel the next cycle when it reaches `point`.
    pub fn inject_cancellation(&self, point: DegenPoint) {
        self.controller.inject_cancellation(point);
    }

    // Lifecycle

    /// Start the GC workers and the control thread.
    pub fn initialize_collection(self: &Arc<Self>) -> Result<(), HeapError> {
        self.workers
            .spawn_workers(self)
            .map_err(HeapError::ThreadSpawn)?;
        self.controller
            .spawn(self)
            .map_err(HeapError::ThreadSpawn)?;
        Ok(())
    }

    /// Stop the control thread and the workers. Mutators must not be running heap operations.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.gc_state.try_cancel(GCCause::Shutdown);
        self.controller.shutdown();
        self.workers.shutdown();
        self.pacer.setup_for_idle();
        info!("GC summary: {}", self.stats.print_summary());
        debug!("Phase timings:\n{}", self.timings.print_summary());
    }

    // Cycle bookkeeping

    pub(crate) fn trigger_input(&self) -> TriggerInput {
        TriggerInput {
            capacity: self.capacity(),
            available: self.free_bytes(),
            allocated_since_cycle_start: self
                .bytes_allocated_since_cycle_start
                .load(Ordering::Relaxed),
        }
    }

    /// What collection set selection needs to know about the regions. Called with the heap
    /// lock held, in a pause.
    pub(crate) fn region_data(&self) -> Vec<RegionData> {
        self.regions
            .iter()
            .map(|r| RegionData {
                index: r.index(),
                kind: if r.is_regular() {
                    RegionKind::Regular
                } else if r.is_humongous_start() {
                    RegionKind::HumongousStart
                } else if r.is_humongous_continuation() {
                    RegionKind::HumongousCont
                } else {
                    RegionKind::Other
                },
                used: r.used(),
                live: r.live_data_bytes(),
                first_alloc_seq: r.first_alloc_seq(),
                last_alloc_seq: r.last_alloc_seq(),
            })
            .collect()
    }

    pub(crate) fn collection_set_input(&self, free_set: &FreeSet) -> CollectionSetInput {
        CollectionSetInput {
            capacity: self.capacity(),
            region_size: self.regions.region_size(),
            available: free_set.available(&self.regions),
            mark_start_seq: self.mark_start_seq(),
        }
    }

    /// The collector reserve when no evacuation is planned.
    pub(crate) fn default_evac_reserve(&self) -> usize {
        self.capacity() * self.options.evac_reserve / 100
    }

    pub(crate) fn on_cycle_start(&self) {
        self.heuristics.lock().unwrap().record_cycle_start();
        self.bytes_allocated_since_cycle_start
            .store(0, Ordering::Relaxed);
        self.peak_used.store(self.used(), Ordering::Relaxed);
    }

    pub(crate) fn on_cycle_end(&self) {
        self.heuristics.lock().unwrap().record_cycle_end();
        self.string_dedup.clear_candidates();
        self.pacer.setup_for_idle();
    }

    pub(crate) fn record_success_concurrent(&self) {
        let peak = self.peak_used.load(Ordering::Relaxed);
        let mut heuristics = self.heuristics.lock().unwrap();
        heuristics.record_peak_occupancy(peak, self.capacity());
        heuristics.record_success_concurrent();
    }

    // Pause helpers

    /// Visit every root slot. Only called while the world is stopped.
    pub(crate) fn roots_do(&self, mut f: impl FnMut(&mut Option<ObjectReference>)) {
        for mutator in self.mutators().iter() {
            let mut local = mutator.local.borrow_mut();
            for slot in local.roots.iter_mut() {
                f(slot);
            }
        }
    }

    /// Visit every region that may hold live objects.
    pub fn heap_region_iterate(&self, mut f: impl FnMut(&HeapRegion)) {
        for region in self.regions.iter().filter(|r| r.is_active()) {
            f(region);
        }
    }

    /// Stop every mutator, run `f`, publish the GC state to the mutators and resume them.
    /// The caller must not be a running mutator.
    pub fn with_world_stopped<R>(&self, f: impl FnOnce(&Heap) -> R) -> R {
        self.safepoint.synchronize();
        let result = f(self);
        let state = self.gc_state.load();
        for mutator in self.mutators().iter() {
            mutator.publish_gc_state(state);
        }
        self.safepoint.desynchronize();
        result
    }

    /// Run `f` as a timed pause.
    pub(crate) fn vm_pause<R>(&self, phase: Phase, f: impl FnOnce(&Heap) -> R) -> R {
        self.with_world_stopped(|heap| {
            let _phase = heap.timings.start(phase);
            f(heap)
        })
    }

    /// Run `f` as a timed concurrent phase.
    pub(crate) fn vm_concurrent(&self, phase: Phase, f: impl FnOnce(&Heap)) {
        let _phase = self.timings.start(phase);
        f(self)
    }

    /// Retire the allocation buffers of every thread, so the heap is parsable.
    pub(crate) fn retire_all_labs(&self) {
        for mutator in self.mutators().iter() {
            let mut local = mutator.local.borrow_mut();
            local.tlab.retire();
            local.evac.retire();
        }
        for mut ctx in self.orphaned_evac_contexts.lock().unwrap().drain(..) {
            ctx.retire();
        }
        self.control_context().retire();
        self.workers.run_task(self, RetireGCLABsTask);
    }

    /// Hand the partial SATB buffers of all mutators to the queue set.
    pub(crate) fn flush_satb_buffers(&self) {
        for mutator in self.mutators().iter() {
            mutator.local.borrow_mut().satb.flush(&self.satb_queue_set);
        }
    }

    /// Drop everything the mutators logged.
    pub(crate) fn reset_satb_buffers(&self) {
        for mutator in self.mutators().iter() {
            mutator.local.borrow_mut().satb.reset();
        }
    }

    pub(crate) fn clear_next_bitmap(&self) {
        let ctx = self.next_marking_context();
        for region in self.regions.iter() {
            ctx.clear_region(region);
        }
    }

    /// Start a marking: TAMS is each region's current top and live data is zero.
    pub(crate) fn capture_top_at_mark_starts(&self) {
        let ctx = self.next_marking_context();
        for region in self.regions.iter() {
            ctx.capture_top_at_mark_start(region);
            region.clear_live_data();
        }
    }

    /// Mark the objects the root slots refer to. Slots are updated to the copy that was
    /// marked.
    pub(crate) fn mark_roots(&self, mode: MarkMode) {
        let cm = &self.concurrent_mark;
        let mut control = self.control_context();
        self.roots_do(|slot| {
            if let Some(object) = *slot {
                let evac = if mode == MarkMode::Traversal {
                    Some(&mut *control)
                } else {
                    None
                };
                *slot = Some(cm.mark_root(self, object, mode, evac));
            }
        });
    }

    /// Marking has to fix references too while forwarded objects are around.
    pub(crate) fn current_mark_mode(&self) -> MarkMode {
        if self.gc_state.has_forwarded_objects() {
            MarkMode::MarkUpdateRefs
        } else {
            MarkMode::Mark
        }
    }

    /// Run the verifier at `point` if verification is enabled. Panics on failure.
    pub(crate) fn verify(&self, point: VerifyPoint) {
        if !(self.options.verify || cfg!(feature = "extreme_assertions")) {
            return;
        }
        if let Err(e) = verifier::verify(self, point) {
            panic!("Heap verification failed at {:?}: {}", point, e);
        }
    }
}
