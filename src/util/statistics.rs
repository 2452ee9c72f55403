//! Phase timings and cycle counters.
//!
//! Every pause and concurrent phase is timed by a [`GCPhase`] guard. Dropping the guard adds the
//! elapsed time to the phase's accumulator and logs a line such as `Pause Init Mark (3.2 ms)`.

use crate::util::conversions::bytes_to_formatted_string;
use crate::util::log::info;
use enum_map::{Enum, EnumMap};
use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use strum_macros::IntoStaticStr;

/// The phases of the collector that are timed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum, IntoStaticStr)]
pub enum Phase {
    #[strum(serialize = "Concurrent reset")]
    Reset,
    #[strum(serialize = "Pause Init Mark")]
    InitMark,
    #[strum(serialize = "Concurrent marking")]
    ConcurrentMark,
    #[strum(serialize = "Pause Final Mark")]
    FinalMark,
    #[strum(serialize = "Concurrent string deduplication")]
    Dedup,
    #[strum(serialize = "Concurrent evacuation")]
    ConcurrentEvac,
    #[strum(serialize = "Pause Init Update Refs")]
    InitUpdateRefs,
    #[strum(serialize = "Concurrent update references")]
    ConcurrentUpdateRefs,
    #[strum(serialize = "Pause Final Update Refs")]
    FinalUpdateRefs,
    #[strum(serialize = "Concurrent cleanup")]
    ConcurrentCleanup,
    #[strum(serialize = "Pause Init Traversal")]
    InitTraversal,
    #[strum(serialize = "Concurrent traversal")]
    ConcurrentTraversal,
    #[strum(serialize = "Pause Final Traversal")]
    FinalTraversal,
    #[strum(serialize = "Pause Degenerated GC")]
    DegeneratedGC,
    #[strum(serialize = "Pause Full GC")]
    FullGC,
    #[strum(serialize = "Full GC mark")]
    FullGCMark,
    #[strum(serialize = "Full GC calculate addresses")]
    FullGCCalculateAddresses,
    #[strum(serialize = "Full GC adjust pointers")]
    FullGCAdjustPointers,
    #[strum(serialize = "Full GC compact")]
    FullGCCompact,
}

impl Phase {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn is_pause(self) -> bool {
        matches!(
            self,
            Phase::InitMark
                | Phase::FinalMark
                | Phase::InitUpdateRefs
                | Phase::FinalUpdateRefs
                | Phase::InitTraversal
                | Phase::FinalTraversal
                | Phase::DegeneratedGC
                | Phase::FullGC
        )
    }

    /// Sub-phases of a pause are timed but not logged on their own.
    fn is_logged(self) -> bool {
        !matches!(
            self,
            Phase::FullGCMark
                | Phase::FullGCCalculateAddresses
                | Phase::FullGCAdjustPointers
                | Phase::FullGCCompact
        )
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct PhaseStat {
    pub count: usize,
    pub total: Duration,
    pub max: Duration,
}

impl PhaseStat {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        if elapsed > self.max {
            self.max = elapsed;
        }
    }
}

/// Accumulated time per phase.
#[derive(Default)]
pub struct PhaseTimings {
    stats: Mutex<EnumMap<Phase, PhaseStat>>,
}

impl PhaseTimings {
    pub fn record(&self, phase: Phase, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap();
        stats[phase].record(elapsed);
    }

    pub fn get(&self, phase: Phase) -> PhaseStat {
        self.stats.lock().unwrap()[phase]
    }

    /// Start timing a phase. The returned guard records the time when it is dropped.
    pub fn start(&self, phase: Phase) -> GCPhase<'_> {
        GCPhase {
            timings: self,
            phase,
            start: Instant::now(),
        }
    }

    pub fn print_summary(&self) -> String {
        let stats = self.stats.lock().unwrap();
        let mut out = String::new();
        for (phase, stat) in stats.iter() {
            if stat.count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{:<36} {:>6} x, total {:>10.3} ms, max {:>8.3} ms",
                phase.name(),
                stat.count,
                stat.total.as_secs_f64() * 1e3,
                stat.max.as_secs_f64() * 1e3
            );
        }
        out
    }
}

/// Times one execution of a phase.
pub struct GCPhase<'a> {
    timings: &'a PhaseTimings,
    phase: Phase,
    start: Instant,
}

impl<'a> Drop for GCPhase<'a> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.timings.record(self.phase, elapsed);
        if self.phase.is_logged() {
            info!(
                "{} ({:.3} ms)",
                self.phase.name(),
                elapsed.as_secs_f64() * 1e3
            );
        }
    }
}

/// Cycle counters.
#[derive(Default)]
pub struct GCStatistics {
    concurrent_cycles: AtomicUsize,
    traversal_cycles: AtomicUsize,
    degenerated_cycles: AtomicUsize,
    full_gcs: AtomicUsize,
    cancelled_cycles: AtomicUsize,
    alloc_failures: AtomicUsize,
    evacuation_failures: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
}

macro_rules! counter_accessors {
    ($($field:ident, $inc:ident);* $(;)?) => {
        $(
            pub fn $field(&self) -> usize {
                self.$field.load(Ordering::Relaxed)
            }

            pub(crate) fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl GCStatistics {
    counter_accessors! {
        concurrent_cycles, inc_concurrent_cycles;
        traversal_cycles, inc_traversal_cycles;
        degenerated_cycles, inc_degenerated_cycles;
        full_gcs, inc_full_gcs;
        cancelled_cycles, inc_cancelled_cycles;
        alloc_failures, inc_alloc_failures;
        evacuation_failures, inc_evacuation_failures;
    }

    pub fn bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes_reclaimed(&self, bytes: usize) {
        self.bytes_reclaimed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn print_summary(&self) -> String {
        format!(
            "{} concurrent, {} traversal, {} degenerated, {} full, {} cancelled; \
             {} allocation failures, {} evacuation failures; {} reclaimed",
            self.concurrent_cycles(),
            self.traversal_cycles(),
            self.degenerated_cycles(),
            self.full_gcs(),
            self.cancelled_cycles(),
            self.alloc_failures(),
            self.evacuation_failures(),
            bytes_to_formatted_string(self.bytes_reclaimed())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names() {
        assert_eq!(Phase::InitMark.name(), "Pause Init Mark");
        assert_eq!(Phase::ConcurrentEvac.name(), "Concurrent evacuation");
        assert!(Phase::FinalUpdateRefs.is_pause());
        assert!(!Phase::ConcurrentMark.is_pause());
    }

    #[test]
    fn guard_records_time() {
        let timings = PhaseTimings::default();
        {
            let _phase = timings.start(Phase::InitMark);
            std::thread::sleep(Duration::from_millis(2));
        }
        {
            let _phase = timings.start(Phase::InitMark);
        }
        let stat = timings.get(Phase::InitMark);
        assert_eq!(stat.count, 2);
        assert!(stat.total >= Duration::from_millis(2));
        assert!(stat.max >= Duration::from_millis(2));
        assert_eq!(timings.get(Phase::FullGC).count, 0);
        assert!(timings.print_summary().contains("Pause Init Mark"));
    }

    #[test]
    fn counters() {
        let stats = GCStatistics::default();
        stats.inc_full_gcs();
        stats.inc_full_gcs();
        stats.inc_degenerated_cycles();
        stats.add_bytes_reclaimed(2048);
        assert_eq!(stats.full_gcs(), 2);
        assert_eq!(stats.degenerated_cycles(), 1);
        assert_eq!(stats.concurrent_cycles(), 0);
        assert_eq!(stats.bytes_reclaimed(), 2048);
        assert!(stats.print_summary().contains("2 full"));
    }
}
