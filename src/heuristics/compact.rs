use super::{
    select_bounded, CollectionSetInput, Heuristics, HeuristicsBase, RegionData, TriggerInput,
};
use crate::util::log::info;
use crate::util::options::Options;

/// Percentage of capacity allocated since the last cycle that starts a new one.
const ALLOCATION_TRIGGER: usize = 10;
/// Percentage of a region that must be garbage for it to be evacuated.
const GARBAGE_THRESHOLD: usize = 10;

/// Frequent cycles with low thresholds that keep the heap footprint small.
pub struct CompactHeuristics {
    base: HeuristicsBase,
}

impl CompactHeuristics {
    pub fn new(options: &Options) -> Self {
        CompactHeuristics {
            base: HeuristicsBase::new(options),
        }
    }
}

impl Heuristics for CompactHeuristics {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn should_start_cycle(&mut self, input: &TriggerInput) -> bool {
        let min_free = input.capacity * self.base.min_free_threshold / 100;
        if input.available < min_free {
            info!(
                "Trigger: free ({} bytes) is below minimum threshold ({} bytes)",
                input.available, min_free
            );
            return true;
        }
        let allocation_trigger = input.capacity * ALLOCATION_TRIGGER / 100;
        if input.allocated_since_cycle_start > allocation_trigger {
            info!(
                "Trigger: allocated since last cycle ({} bytes) is larger than allocation threshold ({} bytes)",
                input.allocated_since_cycle_start, allocation_trigger
            );
            return true;
        }
        self.base.guaranteed_interval_expired()
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        candidates: &[RegionData],
        input: &CollectionSetInput,
        _immediate_garbage: usize,
    ) -> Vec<usize> {
        let max_cset = input.available * 3 / 4;
        let threshold = input.region_size * GARBAGE_THRESHOLD / 100;
        select_bounded(candidates, max_cset, |region, _| region.garbage() > threshold)
    }
}
