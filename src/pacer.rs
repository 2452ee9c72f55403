//! Allocation pacing.
//!
//! Each concurrent phase starts with an allocation budget. Mutator allocations spend it and GC
//! progress earns it back at a rate (the tax) chosen so that the phase finishes before free
//! memory runs out. A mutator that finds the budget exhausted stalls for up to
//! `pacing_max_delay` milliseconds, giving the collector time to catch up.

use crate::gc_state::SharedGCState;
use crate::safepoint::Safepoint;
use crate::util::log::{debug, trace};
use crate::util::options::Options;
use atomic::Atomic;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Mutators may allocate this share of the free memory before the phase has made any progress.
const INITIAL_BUDGET_PERCENT: usize = 50;

pub struct Pacer {
    budget: AtomicIsize,
    /// Budget earned per byte of GC work.
    tax: Atomic<f64>,
    active: AtomicBool,
    max_delay: Duration,
    lock: Mutex<()>,
    progress: Condvar,
    /// Mutators currently stalled.
    waiters: AtomicUsize,
    stalls: AtomicUsize,
}

impl Pacer {
    pub fn new(options: &Options) -> Self {
        Pacer {
            budget: AtomicIsize::new(0),
            tax: Atomic::new(0.0),
            active: AtomicBool::new(false),
            max_delay: Duration::from_millis(options.pacing_max_delay),
            lock: Mutex::new(()),
            progress: Condvar::new(),
            waiters: AtomicUsize::new(0),
            stalls: AtomicUsize::new(0),
        }
    }

    fn setup(&self, phase: &str, free: usize, expected_work: usize) {
        let initial = free * INITIAL_BUDGET_PERCENT / 100;
        let tax = (free - initial) as f64 / expected_work.max(1) as f64;
        self.budget.store(initial as isize, Ordering::Release);
        self.tax.store(tax, Ordering::Release);
        self.active.store(true, Ordering::Release);
        debug!(
            "Pacer for {}: budget {} bytes, tax {:.3} per byte of work",
            phase, initial, tax
        );
        self.wake_waiters();
    }

    /// Marking is expected to visit every used byte.
    pub fn setup_for_mark(&self, free: usize, used: usize) {
        self.setup("marking", free, used);
    }

    pub fn setup_for_evac(&self, free: usize, cset_used: usize) {
        self.setup("evacuation", free, cset_used);
    }

    pub fn setup_for_updaterefs(&self, free: usize, used: usize) {
        self.setup("update references", free, used);
    }

    pub fn setup_for_traversal(&self, free: usize, used: usize) {
        self.setup("traversal", free, used);
    }

    /// No concurrent phase is running. Allocation is not paced.
    pub fn setup_for_idle(&self) {
        self.active.store(false, Ordering::Release);
        self.wake_waiters();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> isize {
        self.budget.load(Ordering::Acquire)
    }

    /// How often a mutator had to stall.
    pub fn stalls(&self) -> usize {
        self.stalls.load(Ordering::Relaxed)
    }

    fn report(&self, work: usize) {
        if work == 0 || !self.is_active() {
            return;
        }
        let earned = (work as f64 * self.tax.load(Ordering::Acquire)) as isize;
        self.budget.fetch_add(earned, Ordering::AcqRel);
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.wake_waiters();
        }
    }

    pub fn report_mark(&self, bytes: usize) {
        self.report(bytes);
    }

    pub fn report_evac(&self, bytes: usize) {
        self.report(bytes);
    }

    pub fn report_update_refs(&self, bytes: usize) {
        self.report(bytes);
    }

    fn wake_waiters(&self) {
        let _lock = self.lock.lock().unwrap();
        self.progress.notify_all();
    }

    /// Claim `bytes` of budget, stalling if it is exhausted. The mutator counts as safe for
    /// pauses while it stalls.
    pub fn pace_for_alloc(&self, bytes: usize, safepoint: &Safepoint, gc_state: &SharedGCState) {
        if !self.is_active() {
            return;
        }
        let remaining = self.budget.fetch_sub(bytes as isize, Ordering::AcqRel) - bytes as isize;
        if remaining >= 0 {
            return;
        }
        self.stalls.fetch_add(1, Ordering::Relaxed);
        trace!("Pacing allocation of {} bytes, budget {}", bytes, remaining);
        let deadline = Instant::now() + self.max_delay;
        safepoint.block_begin();
        self.waiters.fetch_add(1, Ordering::AcqRel);
        {
            let mut lock = self.lock.lock().unwrap();
            loop {
                if self.budget() >= 0 || !self.is_active() || gc_state.cancelled() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                lock = self.progress.wait_timeout(lock, deadline - now).unwrap().0;
            }
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        safepoint.block_end();
    }
}
