use super::{CollectionSetInput, Heuristics, HeuristicsBase, RegionData, TriggerInput};
use crate::util::options::Options;

/// Runs cycles back to back and evacuates every region with garbage. Used to stress the
/// collector.
pub struct AggressiveHeuristics {
    base: HeuristicsBase,
}

impl AggressiveHeuristics {
    pub fn new(options: &Options) -> Self {
        AggressiveHeuristics {
            base: HeuristicsBase::new(options),
        }
    }
}

impl Heuristics for AggressiveHeuristics {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn should_start_cycle(&mut self, _input: &TriggerInput) -> bool {
        true
    }

    fn immediate_threshold(&self) -> usize {
        100
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        candidates: &[RegionData],
        _input: &CollectionSetInput,
        _immediate_garbage: usize,
    ) -> Vec<usize> {
        candidates.iter().map(|r| r.index).collect()
    }
}
