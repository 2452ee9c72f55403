use crate::util::log::trace;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Agreement among parallel workers that no work is left.
///
/// A worker that runs out of tasks offers termination. It leaves the offer as soon as `peek`
/// reports new work, and the protocol completes once all workers have offered at the same time.
pub struct TaskTerminator {
    sync: Mutex<TerminatorSync>,
    cond: Condvar,
}

struct TerminatorSync {
    workers: usize,
    offered: usize,
    terminated: bool,
}

impl TaskTerminator {
    pub fn new(workers: usize) -> Self {
        TaskTerminator {
            sync: Mutex::new(TerminatorSync {
                workers,
                offered: 0,
                terminated: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Prepare for a new round with `workers` participants.
    pub fn reset_for_reuse(&self, workers: usize) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.offered == 0 || sync.terminated);
        sync.workers = workers;
        sync.offered = 0;
        sync.terminated = false;
    }

    /// Returns true if all workers agreed to terminate, or false if this worker should go back
    /// to work because `peek` found something to do.
    pub fn offer_termination(&self, peek: &dyn Fn() -> bool) -> bool {
        let mut sync = self.sync.lock().unwrap();
        sync.offered += 1;
        trace!("Offer termination {}/{}", sync.offered, sync.workers);
        loop {
            if sync.terminated || sync.offered == sync.workers {
                sync.terminated = true;
                self.cond.notify_all();
                return true;
            }
            if peek() {
                sync.offered -= 1;
                return false;
            }
            sync = self
                .cond
                .wait_timeout(sync, Duration::from_millis(1))
                .unwrap()
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn single_worker_terminates_immediately() {
        let t = TaskTerminator::new(1);
        assert!(t.offer_termination(&|| true));
    }

    #[test]
    fn workers_leave_while_work_remains() {
        let t = Arc::new(TaskTerminator::new(4));
        let work = Arc::new(AtomicUsize::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = t.clone();
                let work = work.clone();
                std::thread::spawn(move || loop {
                    while work
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| w.checked_sub(1))
                        .is_ok()
                    {}
                    if t.offer_termination(&|| work.load(Ordering::Acquire) > 0) {
                        return;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(work.load(Ordering::SeqCst), 0);
        t.reset_for_reuse(2);
    }
}
