//! The parallel GC worker gang.
//!
//! Each phase of a cycle is a [`GCWork`] task. The gang hands the task to every worker and
//! returns once all of them are done. Without started worker threads the task runs on the
//! calling thread as worker 0.

mod work;
mod worker;
mod worker_monitor;

pub use work::GCWork;
pub use worker::GCWorker;

use crate::heap::Heap;
use crate::util::log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use worker_monitor::WorkerMonitor;

pub struct WorkGang {
    worker_count: usize,
    monitor: Arc<WorkerMonitor>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Runs tasks on the caller's thread while no workers are started.
    inline_worker: Mutex<GCWorker>,
}

impl WorkGang {
    pub fn new(worker_count: usize) -> Self {
        WorkGang {
            worker_count,
            monitor: Arc::new(WorkerMonitor::new(worker_count)),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            inline_worker: Mutex::new(GCWorker::new(0)),
        }
    }

    /// Start the worker threads.
    pub(crate) fn spawn_workers(&self, heap: &Arc<Heap>) -> std::io::Result<()> {
        let mut handles = self.handles.lock().unwrap();
        for ordinal in 0..self.worker_count {
            let heap = heap.clone();
            let monitor = self.monitor.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ccgc-worker-{}", ordinal))
                .spawn(move || GCWorker::new(ordinal).run(heap, &monitor))?;
            handles.push(handle);
        }
        // The inline worker is no longer used. Its GCLAB must not stay half-filled.
        self.inline_worker.lock().unwrap().evac.retire();
        self.started.store(true, Ordering::Release);
        info!("Started {} GC workers", self.worker_count);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn max_workers(&self) -> usize {
        self.worker_count
    }

    /// The number of workers that will run the next task.
    pub fn active_workers(&self) -> usize {
        if self.is_started() {
            self.worker_count
        } else {
            1
        }
    }

    /// Run `task` on every active worker and wait for all of them.
    pub fn run_task<W: GCWork>(&self, heap: &Heap, task: W) {
        if self.is_started() {
            let task: Arc<dyn GCWork> = Arc::new(task);
            if !self.monitor.dispatch_and_wait(task) {
                panic!("A GC worker panicked");
            }
        } else {
            let mut worker = self.inline_worker.lock().unwrap();
            task.do_work(&mut worker, heap);
        }
    }

    /// Stop and join the worker threads.
    pub(crate) fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.monitor.request_exit();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                debug!("A GC worker thread ended with a panic");
            }
        }
    }
}
