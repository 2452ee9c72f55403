//! The control thread.
//!
//! The controller decides when a cycle runs and which kind it is. It drives every phase of a
//! concurrent cycle, checks for cancellation between them, and finishes a cancelled cycle with a
//! degenerated or full collection.
//!
//! Without a control thread, a thread that requests a collection drives the cycle itself.

mod requests;

pub use requests::{GCRequests, PendingRequests};

use crate::gc_state::GCCause;
use crate::heap::Heap;
use crate::util::log::{debug, info};
use crate::util::statistics::Phase;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Where a cancelled cycle continues stop-the-world.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DegenPoint {
    Unset,
    /// Cancelled before the cycle started.
    OutsideCycle,
    Mark,
    Evac,
    UpdateRefs,
    Traversal,
}

pub struct GCController {
    requests: GCRequests,
    degen_point: Mutex<DegenPoint>,
    /// A cancellation to inject at the next check of the given point.
    injected: Mutex<Option<DegenPoint>>,
    /// Held while a cycle runs, by the control thread or an inline driver.
    cycle_lock: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for GCController {
    fn default() -> Self {
        GCController {
            requests: GCRequests::default(),
            degen_point: Mutex::new(DegenPoint::Unset),
            injected: Mutex::new(None),
            cycle_lock: Mutex::new(()),
            thread: Mutex::new(None),
        }
    }
}

impl GCController {
    pub fn requests(&self) -> &GCRequests {
        &self.requests
    }

    /// Start the control thread.
    pub(crate) fn spawn(&self, heap: &Arc<Heap>) -> std::io::Result<()> {
        let mut thread = self.thread.lock().unwrap();
        debug_assert!(thread.is_none(), "control thread started twice");
        let heap = heap.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name("ccgc-control".to_string())
                .spawn(move || heap.controller().run_service(&heap))?,
        );
        Ok(())
    }

    pub fn has_control_thread(&self) -> bool {
        self.thread.lock().unwrap().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.requests.is_busy()
    }

    /// Cancel the cycle at the next check of `point`.
    pub fn inject_cancellation(&self, point: DegenPoint) {
        debug_assert_ne!(point, DegenPoint::Unset);
        *self.injected.lock().unwrap() = Some(point);
    }

    /// Wait until `ticket` is served. Drive the cycle on this thread if there is no control
    /// thread. The caller must be safe for pauses.
    pub(crate) fn wait_or_drive(&self, heap: &Heap, ticket: usize) {
        if self.has_control_thread() {
            self.requests.wait_served(ticket);
            return;
        }
        let _cycle = self.cycle_lock.lock().unwrap();
        if self.requests.is_served(ticket) {
            return;
        }
        let pending = self.requests.take_pending_and_start();
        self.run_cycle(heap, pending);
        self.requests.finish_cycle();
    }

    /// Stop the control thread.
    pub(crate) fn shutdown(&self) {
        self.requests.request_shutdown();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                debug!("The control thread ended with a panic");
            }
        }
    }

    fn run_service(&self, heap: &Heap) {
        debug!("Control thread started");
        let interval = Duration::from_millis(heap.options().control_interval);
        loop {
            if self.requests.is_shutdown() {
                break;
            }
            let pending = self.requests.pending();
            if pending.is_empty() && !self.should_start_by_heuristics(heap) {
                self.requests.wait_for_request(interval);
                continue;
            }
            let _cycle = self.cycle_lock.lock().unwrap();
            let pending = self.requests.take_pending_and_start();
            self.run_cycle(heap, pending);
            self.requests.finish_cycle();
        }
        debug!("Control thread exited");
    }

    fn should_start_by_heuristics(&self, heap: &Heap) -> bool {
        let input = heap.trigger_input();
        let mut heuristics = heap.heuristics().lock().unwrap();
        if heuristics.should_start_cycle(&input) {
            info!(
                "Trigger ({}): free {} of {} bytes, {} allocated since last cycle",
                heuristics.name(),
                input.available,
                input.capacity,
                input.allocated_since_cycle_start
            );
            true
        } else {
            false
        }
    }

    /// Serve `pending` with one cycle. Allocation failures take precedence over explicit
    /// requests, which take precedence over concurrent ones.
    fn run_cycle(&self, heap: &Heap, pending: PendingRequests) {
        // A cancellation that arrived between cycles is served by the pending requests.
        if !heap.is_shutting_down() {
            heap.gc_state().clear_cancelled();
        }
        heap.on_cycle_start();
        if pending.alloc_failure {
            let point = self.take_degen_point();
            self.degenerate_or_full(heap, point, GCCause::AllocationFailure);
        } else if let Some(cause) = pending.explicit {
            let concurrent = {
                let mut heuristics = heap.heuristics().lock().unwrap();
                heuristics.record_explicit_gc();
                !pending.full
                    && heap.options().explicit_gc_invokes_concurrent
                    && heuristics.can_do_concurrent()
            };
            if concurrent {
                self.service_concurrent_cycle(heap);
            } else {
                heap.vm_full(cause);
            }
        } else {
            self.service_concurrent_cycle(heap);
        }
        heap.on_cycle_end();
    }

    fn take_degen_point(&self) -> DegenPoint {
        match std::mem::replace(&mut *self.degen_point.lock().unwrap(), DegenPoint::Unset) {
            DegenPoint::Unset => DegenPoint::OutsideCycle,
            point => point,
        }
    }

    fn degenerate_or_full(&self, heap: &Heap, point: DegenPoint, cause: GCCause) {
        let degenerate = {
            let mut heuristics = heap.heuristics().lock().unwrap();
            if heap.options().degenerated_gc && heuristics.should_degenerate_cycle() {
                heuristics.record_alloc_failure_to_degenerated(point);
                true
            } else {
                heuristics.record_alloc_failure_to_full();
                false
            }
        };
        if degenerate {
            heap.vm_degenerated(point);
        } else {
            heap.vm_full(cause);
        }
    }

    /// Returns true if the cycle was cancelled. A cancellation request pending for `point` is
    /// applied first.
    fn check_cancellation(&self, heap: &Heap, point: DegenPoint) -> bool {
        {
            let mut injected = self.injected.lock().unwrap();
            if *injected == Some(point) {
                *injected = None;
                heap.cancel_gc(GCCause::Injected);
            }
        }
        if heap.cancelled_gc() {
            debug!("Cycle cancelled at {:?}", point);
            *self.degen_point.lock().unwrap() = point;
            true
        } else {
            false
        }
    }

    fn service_concurrent_cycle(&self, heap: &Heap) {
        let completed = if heap.is_traversal_mode() {
            self.service_concurrent_traversal_cycle(heap)
        } else {
            self.service_concurrent_normal_cycle(heap)
        };
        if !completed {
            self.handle_cancelled_cycle(heap);
        }
    }

    fn handle_cancelled_cycle(&self, heap: &Heap) {
        let cause = heap.gc_state().cancel_cause();
        if cause == GCCause::Shutdown || self.requests.is_shutdown() {
            return;
        }
        heap.stats().inc_cancelled_cycles();
        self.requests.absorb_alloc_failure();
        let point = self.take_degen_point();
        self.degenerate_or_full(heap, point, cause);
    }

    /// Reset, mark, evacuate, update references, and clean up. Returns false if the cycle was
    /// cancelled.
    fn service_concurrent_normal_cycle(&self, heap: &Heap) -> bool {
        if self.check_cancellation(heap, DegenPoint::OutsideCycle) {
            return false;
        }
        heap.vm_concurrent(Phase::Reset, |h| h.op_reset());
        heap.vm_pause(Phase::InitMark, |h| h.op_init_mark());
        if self.check_cancellation(heap, DegenPoint::Mark) {
            return false;
        }
        heap.vm_concurrent(Phase::ConcurrentMark, |h| h.op_mark());
        if self.check_cancellation(heap, DegenPoint::Mark) {
            return false;
        }
        heap.vm_pause(Phase::FinalMark, |h| h.op_final_mark());
        heap.vm_concurrent(Phase::Dedup, |h| h.op_dedup());
        if self.check_cancellation(heap, DegenPoint::Mark) {
            return false;
        }
        heap.vm_concurrent(Phase::ConcurrentCleanup, |h| h.op_cleanup());
        if heap.gc_state().is_evacuation_in_progress() {
            heap.vm_concurrent(Phase::ConcurrentEvac, |h| h.op_evac());
            if self.check_cancellation(heap, DegenPoint::Evac) {
                return false;
            }
        }
        if heap.gc_state().has_forwarded_objects() {
            heap.vm_pause(Phase::InitUpdateRefs, |h| h.op_init_updaterefs());
            heap.vm_concurrent(Phase::ConcurrentUpdateRefs, |h| h.op_updaterefs());
            if self.check_cancellation(heap, DegenPoint::UpdateRefs) {
                return false;
            }
            heap.vm_pause(Phase::FinalUpdateRefs, |h| h.op_final_updaterefs());
            heap.vm_concurrent(Phase::ConcurrentCleanup, |h| h.op_cleanup());
        }
        heap.stats().inc_concurrent_cycles();
        heap.record_success_concurrent();
        true
    }

    /// One traversal pass that marks, evacuates and updates references together.
    fn service_concurrent_traversal_cycle(&self, heap: &Heap) -> bool {
        if self.check_cancellation(heap, DegenPoint::OutsideCycle) {
            return false;
        }
        heap.vm_concurrent(Phase::Reset, |h| h.op_reset());
        heap.vm_pause(Phase::InitTraversal, |h| h.op_init_traversal());
        heap.vm_concurrent(Phase::ConcurrentTraversal, |h| h.op_traversal());
        if self.check_cancellation(heap, DegenPoint::Traversal) {
            return false;
        }
        let evacuated = heap.vm_pause(Phase::FinalTraversal, |h| h.op_final_traversal());
        if !evacuated {
            heap.vm_full(GCCause::AllocationFailureEvac);
            return true;
        }
        heap.vm_concurrent(Phase::ConcurrentCleanup, |h| h.op_cleanup());
        heap.stats().inc_traversal_cycles();
        heap.record_success_concurrent();
        true
    }
}
