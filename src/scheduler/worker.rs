use super::worker_monitor::WorkerMonitor;
use crate::evacuation::EvacuationContext;
use crate::heap::Heap;
use crate::util::log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A GC worker.  This part is privately owned by a worker thread.
pub struct GCWorker {
    pub ordinal: usize,
    /// The GCLAB and scratch arena this worker evacuates with.
    pub(crate) evac: EvacuationContext,
}

impl GCWorker {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            evac: EvacuationContext::new(),
        }
    }

    /// The worker thread's main loop. Runs every dispatched task until asked to exit.
    pub(crate) fn run(mut self, heap: Arc<Heap>, monitor: &WorkerMonitor) {
        debug!("Worker {} started", self.ordinal);
        let mut seen_epoch = 0;
        while let Ok((task, epoch)) = monitor.park_and_wait(self.ordinal, seen_epoch) {
            seen_epoch = epoch;
            let result = catch_unwind(AssertUnwindSafe(|| task.do_work(&mut self, &heap)));
            if result.is_err() {
                error!("Worker {} panicked", self.ordinal);
            }
            monitor.on_task_done(self.ordinal, result.is_err());
        }
        self.evac.retire();
        debug!("Worker {} exited", self.ordinal);
    }
}
