//! The safepoint rendezvous between mutators and the collector.
//!
//! Every registered mutator is either running or safe. A mutator is safe while it is parked at
//! a yieldpoint or inside a blocking region, such as waiting for a collection. The collector stops
//! the world by raising the request flag and waiting until no mutator is running.

use crate::util::log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

struct SafepointSync {
    requested: bool,
    running: usize,
}

pub struct Safepoint {
    sync: Mutex<SafepointSync>,
    /// Fast-path copy of `sync.requested`.
    requested: AtomicBool,
    /// The collector waits on this for mutators to stop.
    all_stopped: Condvar,
    /// Stopped mutators wait on this for the pause to end.
    resumed: Condvar,
}

impl Default for Safepoint {
    fn default() -> Self {
        Safepoint {
            sync: Mutex::new(SafepointSync {
                requested: false,
                running: 0,
            }),
            requested: AtomicBool::new(false),
            all_stopped: Condvar::new(),
            resumed: Condvar::new(),
        }
    }
}

impl Safepoint {
    /// Add a running mutator. Waits if the world is currently stopped.
    pub fn register(&self) {
        let mut sync = self.sync.lock().unwrap();
        while sync.requested {
            sync = self.resumed.wait(sync).unwrap();
        }
        sync.running += 1;
    }

    /// Remove a running mutator.
    pub fn deregister(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.running > 0);
        sync.running -= 1;
        if sync.requested && sync.running == 0 {
            self.all_stopped.notify_all();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Stop here if a pause is requested. Returns true if the mutator was stopped.
    #[inline(always)]
    pub fn yieldpoint(&self) -> bool {
        if self.is_requested() {
            self.block_begin();
            self.block_end();
            true
        } else {
            false
        }
    }

    /// Enter a region in which the mutator does not touch the heap.
    pub fn block_begin(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.running > 0);
        sync.running -= 1;
        if sync.requested && sync.running == 0 {
            self.all_stopped.notify_all();
        }
    }

    /// Leave a blocking region. Waits until the current pause, if any, has ended.
    pub fn block_end(&self) {
        let mut sync = self.sync.lock().unwrap();
        while sync.requested {
            sync = self.resumed.wait(sync).unwrap();
        }
        sync.running += 1;
    }

    /// Stop the world. Returns once every mutator is safe.
    pub fn synchronize(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(!sync.requested, "nested safepoint");
        sync.requested = true;
        self.requested.store(true, Ordering::Release);
        trace!("Safepoint requested, {} mutators running", sync.running);
        while sync.running > 0 {
            sync = self.all_stopped.wait(sync).unwrap();
        }
        trace!("Safepoint reached");
    }

    /// Resume the world.
    pub fn desynchronize(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.requested);
        sync.requested = false;
        self.requested.store(false, Ordering::Release);
        self.resumed.notify_all();
        trace!("Safepoint released");
    }

    pub fn running_mutators(&self) -> usize {
        self.sync.lock().unwrap().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn synchronize_waits_for_running_mutators() {
        panic_after(5000, || {
            let safepoint = Arc::new(Safepoint::default());
            let stop = Arc::new(AtomicBool::new(false));
            let in_pause_work = Arc::new(AtomicUsize::new(0));
            let mutators: Vec<_> = (0..4)
                .map(|_| {
                    let safepoint = safepoint.clone();
                    let stop = stop.clone();
                    let in_pause_work = in_pause_work.clone();
                    safepoint.register();
                    std::thread::spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            // No mutator may run while the collector works in the pause.
                            assert_eq!(in_pause_work.load(Ordering::SeqCst), 0);
                            safepoint.yieldpoint();
                        }
                        safepoint.deregister();
                    })
                })
                .collect();

            for _ in 0..20 {
                safepoint.synchronize();
                assert_eq!(safepoint.running_mutators(), 0);
                in_pause_work.store(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_micros(200));
                in_pause_work.store(0, Ordering::SeqCst);
                safepoint.desynchronize();
            }
            stop.store(true, Ordering::Relaxed);
            for m in mutators {
                m.join().unwrap();
            }
            assert_eq!(safepoint.running_mutators(), 0);
        })
    }

    #[test]
    fn blocked_mutators_are_safe() {
        panic_after(5000, || {
            let safepoint = Safepoint::default();
            safepoint.register();
            safepoint.block_begin();
            safepoint.synchronize();
            safepoint.desynchronize();
            safepoint.block_end();
            assert!(!safepoint.yieldpoint());
            safepoint.deregister();
        })
    }
}
