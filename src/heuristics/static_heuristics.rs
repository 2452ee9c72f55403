use super::{
    select_bounded, CollectionSetInput, Heuristics, HeuristicsBase, RegionData, TriggerInput,
};
use crate::util::log::info;
use crate::util::options::Options;

/// Fixed thresholds: a cycle starts when free memory is low and enough was allocated since the
/// last one, and every region above the garbage threshold is evacuated.
pub struct StaticHeuristics {
    base: HeuristicsBase,
}

impl StaticHeuristics {
    pub fn new(options: &Options) -> Self {
        StaticHeuristics {
            base: HeuristicsBase::new(options),
        }
    }
}

impl Heuristics for StaticHeuristics {
    fn name(&self) -> &'static str {
        "static"
    }

    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn should_start_cycle(&mut self, input: &TriggerInput) -> bool {
        let threshold = input.capacity * self.base.min_free_threshold / 100;
        let min_allocated = input.capacity * self.base.allocation_threshold / 100;
        if input.available < threshold && input.allocated_since_cycle_start >= min_allocated {
            info!(
                "Trigger: free ({} bytes) is below minimum threshold ({} bytes)",
                input.available, threshold
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
        let threshold = self.base.region_garbage_threshold(input.region_size);
        select_bounded(candidates, input.available, |region, _| {
            region.garbage() > threshold
        })
    }
}
