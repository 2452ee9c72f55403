use super::{
    select_bounded, CollectionSetInput, Heuristics, HeuristicsBase, RegionData, TriggerInput,
};
use crate::util::options::Options;

/// Never starts a concurrent cycle on its own. Allocation failures go straight to full GC.
pub struct PassiveHeuristics {
    base: HeuristicsBase,
}

impl PassiveHeuristics {
    pub fn new(options: &Options) -> Self {
        PassiveHeuristics {
            base: HeuristicsBase::new(options),
        }
    }
}

impl Heuristics for PassiveHeuristics {
    fn name(&self) -> &'static str {
        "passive"
    }

    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn should_start_cycle(&mut self, _input: &TriggerInput) -> bool {
        false
    }

    fn can_do_concurrent(&self) -> bool {
        false
    }

    fn should_degenerate_cycle(&self) -> bool {
        false
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        candidates: &[RegionData],
        input: &CollectionSetInput,
        _immediate_garbage: usize,
    ) -> Vec<usize> {
        let max_cset = (input.available as f64 / self.base.evac_waste) as usize;
        let threshold = self.base.region_garbage_threshold(input.region_size);
        select_bounded(candidates, max_cset, |region, _| region.garbage() > threshold)
    }
}
