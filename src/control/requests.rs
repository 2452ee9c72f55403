use crate::gc_state::GCCause;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// What the requesters asked for since the last cycle started.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingRequests {
    pub alloc_failure: bool,
    pub explicit: Option<GCCause>,
    /// The explicit request must be served by a full GC.
    pub full: bool,
    pub concurrent: bool,
}

impl PendingRequests {
    pub fn is_empty(&self) -> bool {
        !self.alloc_failure && self.explicit.is_none() && !self.concurrent
    }
}

struct RequestSync {
    pending: PendingRequests,
    /// Number of cycles started. A request made now is served by cycle `started + 1`.
    started: usize,
    /// Number of cycles finished.
    completed: usize,
    /// True while the control thread or an inline driver runs a cycle.
    busy: bool,
    shutdown: bool,
}

/// Collection requests from mutators, and the handshake that tells them when their request was
/// served.
pub struct GCRequests {
    sync: Mutex<RequestSync>,
    /// Wakes the control thread.
    requested: Condvar,
    /// Wakes requesters waiting for a cycle to finish.
    finished: Condvar,
}

impl Default for GCRequests {
    fn default() -> Self {
        GCRequests {
            sync: Mutex::new(RequestSync {
                pending: PendingRequests::default(),
                started: 0,
                completed: 0,
                busy: false,
                shutdown: false,
            }),
            requested: Condvar::new(),
            finished: Condvar::new(),
        }
    }
}

impl GCRequests {
    /// Record a request and return the ticket to wait for.
    fn post(&self, f: impl FnOnce(&mut PendingRequests)) -> usize {
        let mut sync = self.sync.lock().unwrap();
        f(&mut sync.pending);
        self.requested.notify_all();
        sync.started + 1
    }

    pub fn request_alloc_failure(&self) -> usize {
        self.post(|p| p.alloc_failure = true)
    }

    pub fn request_explicit(&self, cause: GCCause) -> usize {
        self.post(|p| p.explicit = Some(cause))
    }

    pub fn request_full(&self, cause: GCCause) -> usize {
        self.post(|p| {
            p.explicit = Some(cause);
            p.full = true;
        })
    }

    pub fn request_concurrent(&self) -> usize {
        self.post(|p| p.concurrent = true)
    }

    pub fn pending(&self) -> PendingRequests {
        self.sync.lock().unwrap().pending
    }

    /// Is the cycle that serves `ticket` finished?
    pub fn is_served(&self, ticket: usize) -> bool {
        let sync = self.sync.lock().unwrap();
        sync.completed >= ticket || sync.shutdown
    }

    /// Take every pending request and start a cycle that serves them.
    pub fn take_pending_and_start(&self) -> PendingRequests {
        let mut sync = self.sync.lock().unwrap();
        sync.started += 1;
        sync.busy = true;
        std::mem::take(&mut sync.pending)
    }

    /// A cycle was cancelled by an allocation failure and is about to be finished by a
    /// degenerated or full GC. Serve the pending allocation failure with it.
    pub fn absorb_alloc_failure(&self) {
        let mut sync = self.sync.lock().unwrap();
        if sync.pending.alloc_failure {
            sync.pending.alloc_failure = false;
            sync.started += 1;
        }
    }

    pub fn finish_cycle(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.completed = sync.started;
        sync.busy = false;
        self.finished.notify_all();
    }

    pub fn is_busy(&self) -> bool {
        self.sync.lock().unwrap().busy
    }

    /// Block until the cycle serving `ticket` has finished, or the heap shuts down.
    pub fn wait_served(&self, ticket: usize) {
        let mut sync = self.sync.lock().unwrap();
        while sync.completed < ticket && !sync.shutdown {
            sync = self.finished.wait(sync).unwrap();
        }
    }

    /// Sleep until a request arrives or `timeout` elapses.
    pub fn wait_for_request(&self, timeout: Duration) {
        let sync = self.sync.lock().unwrap();
        if sync.pending.is_empty() && !sync.shutdown {
            let _ = self.requested.wait_timeout(sync, timeout).unwrap();
        }
    }

    pub fn request_shutdown(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.shutdown = true;
        self.requested.notify_all();
        self.finished.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.sync.lock().unwrap().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::Arc;

    #[test]
    fn requests_are_served_by_the_next_cycle() {
        let requests = GCRequests::default();
        let ticket = requests.request_concurrent();
        assert!(!requests.is_served(ticket));
        let pending = requests.take_pending_and_start();
        assert!(pending.concurrent);
        assert!(requests.is_busy());
        // A request made while the cycle runs waits for the one after.
        let later = requests.request_explicit(GCCause::ExplicitGC);
        requests.finish_cycle();
        assert!(requests.is_served(ticket));
        assert!(!requests.is_served(later));
        assert_eq!(requests.pending().explicit, Some(GCCause::ExplicitGC));
    }

    #[test]
    fn absorbed_alloc_failure_is_served() {
        let requests = GCRequests::default();
        requests.take_pending_and_start();
        let ticket = requests.request_alloc_failure();
        requests.absorb_alloc_failure();
        requests.finish_cycle();
        assert!(requests.is_served(ticket));
        assert!(requests.pending().is_empty());
    }

    #[test]
    fn waiters_are_released() {
        panic_after(5000, || {
            let requests = Arc::new(GCRequests::default());
            let ticket = requests.request_alloc_failure();
            let waiter = {
                let requests = requests.clone();
                std::thread::spawn(move || requests.wait_served(ticket))
            };
            requests.take_pending_and_start();
            requests.finish_cycle();
            waiter.join().unwrap();

            let ticket = requests.request_concurrent();
            let waiter = {
                let requests = requests.clone();
                std::thread::spawn(move || requests.wait_served(ticket))
            };
            requests.request_shutdown();
            waiter.join().unwrap();
        })
    }
}
