//! The global GC state bits and the cancellation flag.

use crate::util::log::debug;
use atomic::Atomic;
use bytemuck::NoUninit;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use strum_macros::IntoStaticStr;

/// Bits of the GC state. Zero means the heap is stable.
pub struct GCState;

impl GCState {
    pub const STABLE: u8 = 0;
    /// Objects may have been evacuated, so references must be resolved.
    pub const HAS_FORWARDED: u8 = 1;
    /// Concurrent marking is running. SATB barriers are active.
    pub const MARKING: u8 = 2;
    /// Concurrent evacuation is running. Write barriers copy cset objects.
    pub const EVACUATION: u8 = 4;
    /// References into the collection set are being updated.
    pub const UPDATEREFS: u8 = 8;
    /// A traversal cycle is running.
    pub const TRAVERSAL: u8 = 16;

    pub fn describe(state: u8) -> String {
        if state == Self::STABLE {
            return "STABLE".to_string();
        }
        [
            (Self::HAS_FORWARDED, "HAS_FORWARDED"),
            (Self::MARKING, "MARKING"),
            (Self::EVACUATION, "EVACUATION"),
            (Self::UPDATEREFS, "UPDATEREFS"),
            (Self::TRAVERSAL, "TRAVERSAL"),
        ]
        .iter()
        .filter(|(bit, _)| state & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join("|")
    }
}

/// Why a collection was requested or a cycle was cancelled.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, IntoStaticStr)]
pub enum GCCause {
    #[strum(serialize = "Allocation Failure")]
    AllocationFailure,
    #[strum(serialize = "Allocation Failure During Evacuation")]
    AllocationFailureEvac,
    #[strum(serialize = "System.gc()")]
    ExplicitGC,
    #[strum(serialize = "Heuristics")]
    Heuristics,
    #[strum(serialize = "Injected Cancellation")]
    Injected,
    #[strum(serialize = "Shutdown")]
    Shutdown,
}

impl fmt::Display for GCCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum CancelState {
    /// Not cancelled. A cancel request succeeds.
    Cancellable,
    /// Cancelled. Workers bail out at their next check.
    Cancelled,
    /// Not cancelled, and a worker is yielding. Cancel requests wait until it is done.
    NotCancelled,
}

/// The GC state shared by the collector, the workers and the barriers.
///
/// State bits are only written inside pauses, with release ordering, and read with acquire
/// ordering. Mutators read their own snapshot instead, which is refreshed at the end of every
/// pause.
pub struct SharedGCState {
    state: AtomicU8,
    cancelled: Atomic<CancelState>,
    cancel_cause: Atomic<GCCause>,
}

impl Default for SharedGCState {
    fn default() -> Self {
        SharedGCState {
            state: AtomicU8::new(GCState::STABLE),
            cancelled: Atomic::new(CancelState::Cancellable),
            cancel_cause: Atomic::new(GCCause::Heuristics),
        }
    }
}

impl SharedGCState {
    pub fn load(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_set(&self, bits: u8) -> bool {
        self.load() & bits != 0
    }

    pub fn is_stable(&self) -> bool {
        self.load() == GCState::STABLE
    }

    pub(crate) fn set(&self, bits: u8, value: bool) {
        let old = if value {
            self.state.fetch_or(bits, Ordering::AcqRel)
        } else {
            self.state.fetch_and(!bits, Ordering::AcqRel)
        };
        debug!(
            "GC state {} -> {}",
            GCState::describe(old),
            GCState::describe(self.load())
        );
    }

    pub fn is_marking_in_progress(&self) -> bool {
        self.is_set(GCState::MARKING)
    }

    pub fn is_evacuation_in_progress(&self) -> bool {
        self.is_set(GCState::EVACUATION)
    }

    pub fn is_update_refs_in_progress(&self) -> bool {
        self.is_set(GCState::UPDATEREFS)
    }

    pub fn has_forwarded_objects(&self) -> bool {
        self.is_set(GCState::HAS_FORWARDED)
    }

    pub fn is_traversal_in_progress(&self) -> bool {
        self.is_set(GCState::TRAVERSAL)
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) == CancelState::Cancelled
    }

    pub fn cancel_cause(&self) -> GCCause {
        self.cancel_cause.load(Ordering::Relaxed)
    }

    /// Cancel the running cycle. Returns true if this call cancelled it, false if it was already
    /// cancelled.
    pub fn try_cancel(&self, cause: GCCause) -> bool {
        let mut expected = CancelState::Cancellable;
        loop {
            match self.cancelled.compare_exchange(
                expected,
                CancelState::Cancelled,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.cancel_cause.store(cause, Ordering::Relaxed);
                    return true;
                }
                Err(CancelState::Cancelled) => return false,
                // A worker is yielding. It finds the cancellation when it comes back.
                Err(current) => expected = current,
            }
        }
    }

    pub fn clear_cancelled(&self) {
        self.cancelled
            .store(CancelState::Cancellable, Ordering::Release);
    }

    /// Poll for cancellation from a GC worker. `should_yield` is set while a pause waits for
    /// the world to stop. Only then does the worker yield, holding the flag in `NotCancelled`
    /// until it is back.
    pub fn check_cancelled_and_yield(&self, should_yield: bool) -> bool {
        if !should_yield {
            return self.cancelled();
        }
        match self.cancelled.compare_exchange(
            CancelState::Cancellable,
            CancelState::NotCancelled,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                std::thread::yield_now();
                // Fails if a cancel request replaced `NotCancelled` in the meantime.
                self.cancelled
                    .compare_exchange(
                        CancelState::NotCancelled,
                        CancelState::Cancellable,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
            }
            Err(CancelState::Cancelled) => true,
            // Another worker is yielding.
            Err(_) => {
                std::thread::yield_now();
                self.cancelled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::Arc;

    #[test]
    fn set_and_clear_bits() {
        let state = SharedGCState::default();
        assert!(state.is_stable());
        state.set(GCState::MARKING, true);
        assert!(state.is_marking_in_progress());
        state.set(GCState::EVACUATION | GCState::HAS_FORWARDED, true);
        assert_eq!(
            GCState::describe(state.load()),
            "HAS_FORWARDED|MARKING|EVACUATION"
        );
        state.set(GCState::MARKING, false);
        assert!(!state.is_marking_in_progress());
        assert!(state.has_forwarded_objects());
    }

    #[test]
    fn cancel_once() {
        let state = SharedGCState::default();
        assert!(!state.cancelled());
        assert!(state.try_cancel(GCCause::AllocationFailure));
        assert!(!state.try_cancel(GCCause::ExplicitGC));
        assert!(state.cancelled());
        assert_eq!(state.cancel_cause(), GCCause::AllocationFailure);
        assert!(state.check_cancelled_and_yield(false));
        assert!(state.check_cancelled_and_yield(true));
        state.clear_cancelled();
        assert!(!state.check_cancelled_and_yield(false));
        assert!(!state.check_cancelled_and_yield(true));
        assert!(!state.cancelled());
    }

    #[test]
    fn cancel_while_a_worker_yields() {
        let state = SharedGCState::default();
        state
            .cancelled
            .store(CancelState::NotCancelled, Ordering::Release);
        assert!(!state.cancelled());
        assert!(state.try_cancel(GCCause::Injected));
        assert!(state.cancelled());
        assert_eq!(state.cancel_cause(), GCCause::Injected);
    }

    fn cancel_spinning_workers(should_yield: bool) {
        panic_after(5000, move || {
            let state = Arc::new(SharedGCState::default());
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let state = state.clone();
                    std::thread::spawn(move || {
                        while !state.check_cancelled_and_yield(should_yield) {}
                    })
                })
                .collect();
            std::thread::sleep(std::time::Duration::from_millis(5));
            assert!(state.try_cancel(GCCause::Injected));
            for w in workers {
                w.join().unwrap();
            }
            assert!(state.cancelled());
        })
    }

    #[test]
    fn cancel_reaches_polling_workers() {
        cancel_spinning_workers(false);
    }

    #[test]
    fn cancel_reaches_workers_yielding_to_a_pause() {
        cancel_spinning_workers(true);
    }
}
