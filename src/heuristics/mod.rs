//! Heuristics decide when a cycle starts and which regions it evacuates.
//!
//! Each policy is a [`Heuristics`] trait object chosen by the `heuristics` option when the heap
//! is built. The policies share the bookkeeping in [`HeuristicsBase`] and the base collection
//! set selection, and differ in their trigger and in how greedily they pick candidates.

mod adaptive;
mod aggressive;
mod compact;
mod passive;
mod static_heuristics;
mod traversal;

pub use adaptive::AdaptiveHeuristics;
pub use aggressive::AggressiveHeuristics;
pub use compact::CompactHeuristics;
pub use passive::PassiveHeuristics;
pub use static_heuristics::StaticHeuristics;
pub use traversal::TraversalHeuristics;

use crate::control::DegenPoint;
use crate::util::log::{debug, info};
use crate::util::options::{HeuristicsMode, Options};
use downcast_rs::{impl_downcast, Downcast};
use itertools::Itertools;
use std::time::{Duration, Instant};

/// What kind of region a [`RegionData`] describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Regular,
    HumongousStart,
    HumongousCont,
    /// Empty, trash, pinned or collection set regions. Never selected.
    Other,
}

/// A snapshot of one region, taken under the heap lock.
#[derive(Copy, Clone, Debug)]
pub struct RegionData {
    pub index: usize,
    pub kind: RegionKind,
    pub used: usize,
    pub live: usize,
    pub first_alloc_seq: u64,
    pub last_alloc_seq: u64,
}

impl RegionData {
    pub fn garbage(&self) -> usize {
        self.used.saturating_sub(self.live)
    }
}

/// Heap figures the collection set selection works with.
#[derive(Copy, Clone, Debug)]
pub struct CollectionSetInput {
    pub capacity: usize,
    pub region_size: usize,
    /// Free bytes not counting the collection set.
    pub available: usize,
    /// The allocation sequence number when the last marking started.
    pub mark_start_seq: u64,
}

/// Heap figures a trigger looks at.
#[derive(Copy, Clone, Debug)]
pub struct TriggerInput {
    pub capacity: usize,
    pub available: usize,
    pub allocated_since_cycle_start: usize,
}

/// The outcome of collection set selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionSetChoice {
    /// Regions to evacuate.
    pub cset: Vec<usize>,
    /// Regions without live data, to be trashed right away.
    pub trash: Vec<usize>,
    pub immediate_garbage: usize,
    pub total_garbage: usize,
}

/// Bookkeeping shared by every policy.
pub struct HeuristicsBase {
    pub degenerated_cycles_in_a_row: usize,
    pub successful_cycles_in_a_row: usize,
    pub cycle_start: Instant,
    pub last_cycle_end: Instant,
    pub guaranteed_gc_interval: Option<Duration>,
    pub full_gc_threshold: usize,
    pub garbage_threshold: usize,
    pub immediate_threshold: usize,
    pub min_free_threshold: usize,
    pub allocation_threshold: usize,
    pub evac_waste: f64,
}

impl HeuristicsBase {
    pub fn new(options: &Options) -> Self {
        let now = Instant::now();
        HeuristicsBase {
            degenerated_cycles_in_a_row: 0,
            successful_cycles_in_a_row: 0,
            cycle_start: now,
            last_cycle_end: now,
            guaranteed_gc_interval: match options.guaranteed_gc_interval {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            full_gc_threshold: options.full_gc_threshold,
            garbage_threshold: options.garbage_threshold,
            immediate_threshold: options.immediate_threshold,
            min_free_threshold: options.min_free_threshold,
            allocation_threshold: options.allocation_threshold,
            evac_waste: options.evac_waste,
        }
    }

    pub fn guaranteed_interval_expired(&self) -> bool {
        match self.guaranteed_gc_interval {
            Some(interval) if self.last_cycle_end.elapsed() > interval => {
                info!(
                    "Trigger: time since last GC ({} ms) is larger than guaranteed interval ({} ms)",
                    self.last_cycle_end.elapsed().as_millis(),
                    interval.as_millis()
                );
                true
            }
            _ => false,
        }
    }

    /// Garbage above which a region is worth evacuating on its own.
    pub fn region_garbage_threshold(&self, region_size: usize) -> usize {
        region_size * self.garbage_threshold / 100
    }
}

/// A collection policy.
pub trait Heuristics: Downcast + Send {
    fn name(&self) -> &'static str;
    fn base(&self) -> &HeuristicsBase;
    fn base_mut(&mut self) -> &mut HeuristicsBase;

    /// Should a concurrent cycle start now?
    fn should_start_cycle(&mut self, _input: &TriggerInput) -> bool {
        self.base().guaranteed_interval_expired()
    }

    /// Can explicit requests be served by a concurrent cycle?
    fn can_do_concurrent(&self) -> bool {
        true
    }

    fn should_degenerate_cycle(&self) -> bool {
        let base = self.base();
        base.degenerated_cycles_in_a_row <= base.full_gc_threshold
    }

    fn immediate_threshold(&self) -> usize {
        self.base().immediate_threshold
    }

    /// Whether regions without live data are trashed at selection.
    fn trashes_immediate_garbage(&self) -> bool {
        true
    }

    /// Whether a regular region with garbage may be evacuated at all.
    fn is_candidate(&self, _region: &RegionData, _input: &CollectionSetInput) -> bool {
        true
    }

    /// Select immediate garbage and the collection set.
    fn choose_collection_set(
        &mut self,
        regions: &[RegionData],
        input: &CollectionSetInput,
    ) -> CollectionSetChoice {
        let trash_immediate = self.trashes_immediate_garbage();
        let mut choice = CollectionSetChoice::default();
        let mut candidates = Vec::new();
        let mut trashing_humongous = false;
        for region in regions {
            match region.kind {
                RegionKind::Regular => {
                    trashing_humongous = false;
                    choice.total_garbage += region.garbage();
                    if trash_immediate && region.live == 0 {
                        choice.trash.push(region.index);
                        choice.immediate_garbage += region.used;
                    } else if region.garbage() > 0 && self.is_candidate(region, input) {
                        candidates.push(*region);
                    }
                }
                RegionKind::HumongousStart => {
                    trashing_humongous = trash_immediate && region.live == 0;
                    if trashing_humongous {
                        choice.total_garbage += region.used;
                        choice.trash.push(region.index);
                        choice.immediate_garbage += region.used;
                    }
                }
                RegionKind::HumongousCont => {
                    if trashing_humongous {
                        choice.total_garbage += region.used;
                        choice.trash.push(region.index);
                        choice.immediate_garbage += region.used;
                    }
                }
                RegionKind::Other => trashing_humongous = false,
            }
        }

        let immediate_percent = if choice.total_garbage == 0 {
            0
        } else {
            choice.immediate_garbage * 100 / choice.total_garbage
        };
        if immediate_percent > self.immediate_threshold() {
            info!(
                "Immediate garbage is {}% of all garbage, skipping evacuation",
                immediate_percent
            );
        } else {
            // Most garbage first, and the older region on a tie.
            let candidates: Vec<RegionData> = candidates
                .into_iter()
                .sorted_by(|a, b| {
                    b.garbage()
                        .cmp(&a.garbage())
                        .then(a.first_alloc_seq.cmp(&b.first_alloc_seq))
                })
                .collect();
            choice.cset =
                self.choose_collection_set_from_regiondata(&candidates, input, choice.immediate_garbage);
        }
        info!(
            "Collectable garbage: {} bytes, immediate: {} bytes in {} regions, cset: {} regions",
            choice.total_garbage,
            choice.immediate_garbage,
            choice.trash.len(),
            choice.cset.len()
        );
        choice
    }

    /// Pick the collection set from `candidates`, which are sorted by decreasing garbage.
    fn choose_collection_set_from_regiondata(
        &mut self,
        candidates: &[RegionData],
        input: &CollectionSetInput,
        immediate_garbage: usize,
    ) -> Vec<usize>;

    fn record_cycle_start(&mut self) {
        self.base_mut().cycle_start = Instant::now();
    }

    fn record_cycle_end(&mut self) {
        self.base_mut().last_cycle_end = Instant::now();
    }

    fn record_success_concurrent(&mut self) {
        let base = self.base_mut();
        base.degenerated_cycles_in_a_row = 0;
        base.successful_cycles_in_a_row += 1;
    }

    fn record_success_degenerated(&mut self) {
        let base = self.base_mut();
        base.degenerated_cycles_in_a_row += 1;
        base.successful_cycles_in_a_row = 0;
    }

    fn record_success_full(&mut self) {
        let base = self.base_mut();
        base.degenerated_cycles_in_a_row = 0;
        base.successful_cycles_in_a_row = 0;
    }

    fn record_alloc_failure_to_degenerated(&mut self, point: DegenPoint) {
        debug!("{}: degenerated cycle at {:?}", self.name(), point);
    }

    fn record_alloc_failure_to_full(&mut self) {
        debug!("{}: allocation failure handled by full GC", self.name());
    }

    fn record_explicit_gc(&mut self) {}

    /// The highest heap occupancy seen during the cycle that just ended.
    fn record_peak_occupancy(&mut self, _peak_used: usize, _capacity: usize) {}
}

impl_downcast!(Heuristics);

/// Add candidates in order while their live data fits in `max_cset` and `accept` takes them.
pub(crate) fn select_bounded(
    candidates: &[RegionData],
    max_cset: usize,
    mut accept: impl FnMut(&RegionData, usize) -> bool,
) -> Vec<usize> {
    let mut live = 0;
    let mut garbage = 0;
    let mut cset = Vec::new();
    for region in candidates {
        let new_live = live + region.live;
        if new_live > max_cset {
            break;
        }
        if accept(region, garbage) {
            live = new_live;
            garbage += region.garbage();
            cset.push(region.index);
        }
    }
    cset
}

/// Build the heuristics selected by `options`.
pub fn create(options: &Options) -> Box<dyn Heuristics> {
    let heuristics: Box<dyn Heuristics> = match options.heuristics {
        HeuristicsMode::Static => Box::new(StaticHeuristics::new(options)),
        HeuristicsMode::Adaptive => Box::new(AdaptiveHeuristics::new(options)),
        HeuristicsMode::Aggressive => Box::new(AggressiveHeuristics::new(options)),
        HeuristicsMode::Passive => Box::new(PassiveHeuristics::new(options)),
        HeuristicsMode::Compact => Box::new(CompactHeuristics::new(options)),
        HeuristicsMode::Traversal => Box::new(TraversalHeuristics::new(options)),
    };
    info!("Using {} heuristics", heuristics.name());
    heuristics
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const REGION: usize = 64 * 1024;

    pub(crate) fn regular(index: usize, live: usize, seq: u64) -> RegionData {
        RegionData {
            index,
            kind: RegionKind::Regular,
            used: REGION,
            live,
            first_alloc_seq: seq,
            last_alloc_seq: seq,
        }
    }

    pub(crate) fn input(available: usize) -> CollectionSetInput {
        CollectionSetInput {
            capacity: 32 * REGION,
            region_size: REGION,
            available,
            mark_start_seq: u64::MAX,
        }
    }

    #[test]
    fn empty_regions_are_immediate_garbage() {
        let mut heuristics = StaticHeuristics::new(&Options::without_env());
        let regions = [regular(0, 0, 1), regular(1, REGION, 2), regular(2, REGION / 4, 3)];
        let choice = heuristics.choose_collection_set(&regions, &input(16 * REGION));
        assert_eq!(choice.trash, vec![0]);
        assert_eq!(choice.immediate_garbage, REGION);
        assert_eq!(choice.total_garbage, REGION + REGION * 3 / 4);
        assert_eq!(choice.cset, vec![2]);
    }

    #[test]
    fn dead_humongous_runs_are_trashed_whole() {
        let mut heuristics = AggressiveHeuristics::new(&Options::without_env());
        let mut start = regular(3, 0, 1);
        start.kind = RegionKind::HumongousStart;
        let mut cont = regular(4, 0, 1);
        cont.kind = RegionKind::HumongousCont;
        let mut live_start = regular(5, 2 * REGION, 1);
        live_start.kind = RegionKind::HumongousStart;
        let mut live_cont = regular(6, 0, 1);
        live_cont.kind = RegionKind::HumongousCont;
        let choice =
            heuristics.choose_collection_set(&[start, cont, live_start, live_cont], &input(REGION));
        assert_eq!(choice.trash, vec![3, 4]);
        assert!(choice.cset.is_empty());
    }

    #[test]
    fn mostly_immediate_garbage_skips_evacuation() {
        let mut heuristics = StaticHeuristics::new(&Options::without_env());
        let mut regions: Vec<_> = (0..20).map(|i| regular(i, 0, i as u64)).collect();
        regions.push(regular(20, REGION / 2, 20));
        let choice = heuristics.choose_collection_set(&regions, &input(16 * REGION));
        assert_eq!(choice.trash.len(), 20);
        assert!(choice.cset.is_empty());
    }

    #[test]
    fn candidates_sorted_by_garbage_then_age() {
        let mut heuristics = AggressiveHeuristics::new(&Options::without_env());
        let regions = [
            regular(0, REGION / 2, 5),
            regular(1, REGION / 4, 9),
            regular(2, REGION / 2, 1),
        ];
        let choice = heuristics.choose_collection_set(&regions, &input(16 * REGION));
        assert_eq!(choice.cset, vec![1, 2, 0]);
    }

    #[test]
    fn degenerated_cycles_in_a_row_lead_to_full() {
        let mut options = Options::without_env();
        options.full_gc_threshold = 2;
        let mut heuristics: Box<dyn Heuristics> = Box::new(AdaptiveHeuristics::new(&options));
        for _ in 0..3 {
            assert!(heuristics.should_degenerate_cycle());
            heuristics.record_success_degenerated();
        }
        assert!(!heuristics.should_degenerate_cycle());
        heuristics.record_success_full();
        assert!(heuristics.should_degenerate_cycle());
        assert!(heuristics.downcast_ref::<AdaptiveHeuristics>().is_some());
    }
}
