use super::{
    select_bounded, CollectionSetInput, Heuristics, HeuristicsBase, RegionData, TriggerInput,
};
use crate::util::log::info;
use crate::util::options::Options;

/// Heuristics for traversal cycles. The collection set is chosen when traversal starts, from
/// the liveness the previous cycle computed, so regions allocated into since then are skipped.
pub struct TraversalHeuristics {
    base: HeuristicsBase,
}

impl TraversalHeuristics {
    pub fn new(options: &Options) -> Self {
        TraversalHeuristics {
            base: HeuristicsBase::new(options),
        }
    }
}

impl Heuristics for TraversalHeuristics {
    fn name(&self) -> &'static str {
        "traversal"
    }

    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn should_start_cycle(&mut self, input: &TriggerInput) -> bool {
        let threshold = input.capacity * self.base.min_free_threshold / 100;
        if input.available < threshold {
            info!(
                "Trigger: free ({} bytes) is below minimum threshold ({} bytes)",
                input.available, threshold
            );
            return true;
        }
        self.base.guaranteed_interval_expired()
    }

    /// Liveness is stale, so no region can be declared garbage without tracing it.
    fn trashes_immediate_garbage(&self) -> bool {
        false
    }

    fn is_candidate(&self, region: &RegionData, input: &CollectionSetInput) -> bool {
        region.last_alloc_seq <= input.mark_start_seq
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        candidates: &[RegionData],
        input: &CollectionSetInput,
        _immediate_garbage: usize,
    ) -> Vec<usize> {
        let max_cset = input.available * 3 / 4;
        let threshold = self.base.region_garbage_threshold(input.region_size);
        select_bounded(candidates, max_cset, |region, _| region.garbage() > threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::tests::{input, regular, REGION};

    #[test]
    fn skips_regions_allocated_since_last_mark() {
        let mut heuristics = TraversalHeuristics::new(&Options::without_env());
        let mut input = input(16 * REGION);
        input.mark_start_seq = 10;
        let regions = [regular(0, 0, 5), regular(1, REGION / 10, 5), regular(2, 0, 11)];
        let choice = heuristics.choose_collection_set(&regions, &input);
        assert!(choice.trash.is_empty());
        assert_eq!(choice.cset, vec![0, 1]);
    }
}
