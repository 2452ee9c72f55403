//! This module contains `WorkerMonitor` and related types.  Its purposes include:
//!
//! -   allowing workers to park until a task is dispatched,
//! -   handing the same task to every worker of the gang, and
//! -   letting the dispatcher wait until every worker has finished the task.

use super::work::GCWork;
use crate::util::log::trace;
use std::sync::{Arc, Condvar, Mutex};

/// Returned by `park_and_wait` when the worker should exit.
#[derive(Debug)]
pub(crate) struct WorkerShouldExit;

/// A data structure for synchronizing workers with the thread that dispatches tasks.
pub(crate) struct WorkerMonitor {
    /// The synchronized part.
    sync: Mutex<WorkerMonitorSync>,
    /// Workers wait on this when idle.  Notified when a task is dispatched or workers should exit.
    workers_have_anything_to_do: Condvar,
    /// The dispatcher waits on this until all workers are done with the current task.
    task_finished: Condvar,
}

/// The synchronized part of `WorkerMonitor`.
struct WorkerMonitorSync {
    /// Count parked workers.
    parker: WorkerParker,
    /// The task of the current round.
    task: Option<Arc<dyn GCWork>>,
    /// Incremented for every dispatched task.  Workers remember the last epoch they ran.
    epoch: usize,
    /// Workers that have not finished the current task.
    pending: usize,
    /// Set if a worker panicked while running the current task.
    panicked: bool,
    exit: bool,
}

/// This struct counts the number of workers parked.
struct WorkerParker {
    /// The total number of workers.
    worker_count: usize,
    /// Number of parked workers.
    parked_workers: usize,
}

impl WorkerParker {
    fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            parked_workers: 0,
        }
    }

    /// Increase the parked-workers counter.
    /// Called before a worker is parked.
    ///
    /// Return true if all the workers are parked.
    fn inc_parked_workers(&mut self) -> bool {
        let old = self.parked_workers;
        debug_assert!(old < self.worker_count);
        let new = old + 1;
        self.parked_workers = new;
        new == self.worker_count
    }

    /// Decrease the parked-workers counter.
    /// Called after a worker is resumed from the parked state.
    fn dec_parked_workers(&mut self) {
        let old = self.parked_workers;
        debug_assert!(old <= self.worker_count);
        debug_assert!(old > 0);
        self.parked_workers = old - 1;
    }
}

impl WorkerMonitor {
    pub fn new(worker_count: usize) -> Self {
        Self {
            sync: Mutex::new(WorkerMonitorSync {
                parker: WorkerParker::new(worker_count),
                task: None,
                epoch: 0,
                pending: 0,
                panicked: false,
                exit: false,
            }),
            workers_have_anything_to_do: Default::default(),
            task_finished: Default::default(),
        }
    }

    /// Park a worker until a task newer than `seen_epoch` is dispatched.
    ///
    /// This function returns the task and its epoch if the current worker should run it,
    /// or `Err(WorkerShouldExit)` if the current worker should exit now.
    pub fn park_and_wait(
        &self,
        ordinal: usize,
        seen_epoch: usize,
    ) -> Result<(Arc<dyn GCWork>, usize), WorkerShouldExit> {
        let mut sync = self.sync.lock().unwrap();

        // Park this worker
        let all_parked = sync.parker.inc_parked_workers();
        trace!(
            "Worker {} parked.  parked/total: {}/{}.  All parked: {}",
            ordinal,
            sync.parker.parked_workers,
            sync.parker.worker_count,
            all_parked
        );

        // The task is set together with the epoch while holding the mutex, so a worker that
        // wakes up spuriously sees the old epoch and waits again.
        let result = loop {
            if sync.exit {
                break Err(WorkerShouldExit);
            }
            if sync.epoch != seen_epoch {
                if let Some(task) = sync.task.as_ref() {
                    break Ok((task.clone(), sync.epoch));
                }
            }
            sync = self.workers_have_anything_to_do.wait(sync).unwrap();
        };

        // Unpark this worker.
        sync.parker.dec_parked_workers();
        trace!(
            "Worker {} unparked.  parked/total: {}/{}.",
            ordinal,
            sync.parker.parked_workers,
            sync.parker.worker_count,
        );
        result
    }

    /// Called by a worker when it has finished the current task.
    pub fn on_task_done(&self, ordinal: usize, panicked: bool) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.pending > 0);
        sync.pending -= 1;
        sync.panicked |= panicked;
        trace!("Worker {} finished task, {} pending", ordinal, sync.pending);
        if sync.pending == 0 {
            self.task_finished.notify_all();
        }
    }

    /// Hand `task` to all workers and wait until every one of them has finished it.
    /// Returns false if a worker panicked.
    pub fn dispatch_and_wait(&self, task: Arc<dyn GCWork>) -> bool {
        let mut sync = self.sync.lock().unwrap();
        debug_assert_eq!(sync.pending, 0, "a task is already running");
        sync.task = Some(task);
        sync.epoch += 1;
        sync.pending = sync.parker.worker_count;
        sync.panicked = false;
        self.workers_have_anything_to_do.notify_all();
        while sync.pending > 0 {
            sync = self.task_finished.wait(sync).unwrap();
        }
        sync.task = None;
        !sync.panicked
    }

    /// Ask all workers to exit.
    pub fn request_exit(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.exit = true;
        self.workers_have_anything_to_do.notify_all();
    }

    pub fn parked_workers(&self) -> usize {
        self.sync.lock().unwrap().parker.parked_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::scheduler::GCWorker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Count(AtomicUsize);

    impl GCWork for Count {
        fn do_work(&self, _worker: &mut GCWorker, _heap: &Heap) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Every worker runs each dispatched task exactly once, even if it wakes up spuriously.
    #[test]
    fn each_worker_runs_each_task_once() {
        let number_threads = 4;
        let monitor = Arc::new(WorkerMonitor::new(number_threads));
        let runs = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for ordinal in 0..number_threads {
                let monitor = monitor.clone();
                let runs = runs.clone();
                scope.spawn(move || {
                    let mut seen = 0;
                    while let Ok((_task, epoch)) = monitor.park_and_wait(ordinal, seen) {
                        seen = epoch;
                        runs.fetch_add(1, Ordering::SeqCst);
                        monitor.on_task_done(ordinal, false);
                    }
                });
            }
            for round in 1..=10 {
                let task: Arc<dyn GCWork> = Arc::new(Count(AtomicUsize::new(0)));
                assert!(monitor.dispatch_and_wait(task));
                assert_eq!(runs.load(Ordering::SeqCst), round * number_threads);
            }
            monitor.request_exit();
        });
        assert_eq!(monitor.parked_workers(), 0);
    }
}
