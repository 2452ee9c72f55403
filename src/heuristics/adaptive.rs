use super::{
    select_bounded, CollectionSetInput, Heuristics, HeuristicsBase, RegionData, TriggerInput,
};
use crate::control::DegenPoint;
use crate::util::log::info;
use crate::util::options::Options;

const DEGENERATED_PENALTY: isize = 10;
const FULL_PENALTY: isize = 20;
const EXPLICIT_PENALTY: isize = 10;
/// The most a single successful cycle moves the free threshold.
const ADJUSTMENT_STEP: isize = 5;

/// Starts a cycle when free memory drops below a threshold that follows how the previous cycles
/// went: failures raise it, comfortable cycles lower it.
pub struct AdaptiveHeuristics {
    base: HeuristicsBase,
    free_threshold: usize,
    min_free_threshold: usize,
    max_free_threshold: usize,
    happy_cycles_threshold: usize,
    happy_cycles: usize,
    /// The lowest free percentage seen during the last cycle.
    peak_free_percent: Option<usize>,
}

impl AdaptiveHeuristics {
    pub fn new(options: &Options) -> Self {
        AdaptiveHeuristics {
            base: HeuristicsBase::new(options),
            free_threshold: options
                .init_free_threshold
                .clamp(options.min_free_threshold, options.max_free_threshold),
            min_free_threshold: options.min_free_threshold,
            max_free_threshold: options.max_free_threshold,
            happy_cycles_threshold: options.happy_cycles_threshold,
            happy_cycles: 0,
            peak_free_percent: None,
        }
    }

    pub fn free_threshold(&self) -> usize {
        self.free_threshold
    }

    fn adjust_free_threshold(&mut self, delta: isize) {
        let old = self.free_threshold;
        self.free_threshold = (old as isize + delta)
            .clamp(self.min_free_threshold as isize, self.max_free_threshold as isize)
            as usize;
        if self.free_threshold != old {
            info!(
                "Adjusting free threshold from {}% to {}%",
                old, self.free_threshold
            );
        }
    }
}

impl Heuristics for AdaptiveHeuristics {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn should_start_cycle(&mut self, input: &TriggerInput) -> bool {
        let threshold = input.capacity * self.free_threshold / 100;
        if input.available < threshold {
            info!(
                "Trigger: free ({} bytes) is below free threshold ({}% = {} bytes)",
                input.available, self.free_threshold, threshold
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
        // Aim for a free set somewhat above the threshold, so the next cycle starts later.
        let free_target = (self.free_threshold + 5).min(100) * input.capacity / 100;
        let min_garbage = free_target.saturating_sub(input.available);
        let max_cset = input.available * 3 / 4;
        let threshold = self.base.region_garbage_threshold(input.region_size);
        select_bounded(candidates, max_cset, |region, garbage| {
            garbage < min_garbage || region.garbage() > threshold
        })
    }

    fn record_success_concurrent(&mut self) {
        self.base.degenerated_cycles_in_a_row = 0;
        self.base.successful_cycles_in_a_row += 1;
        let Some(peak_free) = self.peak_free_percent.take() else {
            return;
        };
        // The threshold that would have left exactly the minimum free at the peak.
        let consumed = self.free_threshold.saturating_sub(peak_free);
        let target = (consumed + self.min_free_threshold) as isize;
        let delta = (target - self.free_threshold as isize).clamp(-ADJUSTMENT_STEP, ADJUSTMENT_STEP);
        if delta > 0 {
            self.happy_cycles = 0;
            self.adjust_free_threshold(delta);
        } else if delta < 0 {
            self.happy_cycles += 1;
            if self.happy_cycles >= self.happy_cycles_threshold {
                self.happy_cycles = 0;
                self.adjust_free_threshold(delta);
            }
        }
    }

    fn record_alloc_failure_to_degenerated(&mut self, _point: DegenPoint) {
        self.happy_cycles = 0;
        self.adjust_free_threshold(DEGENERATED_PENALTY);
    }

    fn record_alloc_failure_to_full(&mut self) {
        self.happy_cycles = 0;
        self.adjust_free_threshold(FULL_PENALTY);
    }

    fn record_explicit_gc(&mut self) {
        self.happy_cycles = 0;
        self.adjust_free_threshold(EXPLICIT_PENALTY);
    }

    fn record_peak_occupancy(&mut self, peak_used: usize, capacity: usize) {
        if capacity > 0 {
            self.peak_free_percent = Some(100usize.saturating_sub(peak_used * 100 / capacity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::tests::{input, regular, REGION};

    fn options() -> Options {
        let mut options = Options::without_env();
        options.init_free_threshold = 30;
        options.min_free_threshold = 10;
        options.max_free_threshold = 70;
        options.happy_cycles_threshold = 2;
        options
    }

    #[test]
    fn failures_raise_the_threshold() {
        let mut heuristics = AdaptiveHeuristics::new(&options());
        heuristics.record_alloc_failure_to_degenerated(DegenPoint::Mark);
        assert_eq!(heuristics.free_threshold(), 40);
        heuristics.record_alloc_failure_to_full();
        assert_eq!(heuristics.free_threshold(), 60);
        heuristics.record_explicit_gc();
        assert_eq!(heuristics.free_threshold(), 70);
    }

    #[test]
    fn comfortable_cycles_lower_the_threshold_slowly() {
        let mut heuristics = AdaptiveHeuristics::new(&options());
        // Free never dropped below 28%: far more headroom than needed.
        for _ in 0..2 {
            heuristics.record_peak_occupancy(72, 100);
            heuristics.record_success_concurrent();
        }
        assert_eq!(heuristics.free_threshold(), 25);
        // Free dropped to 2%: move up by at most one step.
        heuristics.record_peak_occupancy(98, 100);
        heuristics.record_success_concurrent();
        assert_eq!(heuristics.free_threshold(), 30);
    }

    #[test]
    fn triggers_below_free_threshold() {
        let mut heuristics = AdaptiveHeuristics::new(&options());
        let trigger = |available| TriggerInput {
            capacity: 100 * REGION,
            available,
            allocated_since_cycle_start: 0,
        };
        assert!(!heuristics.should_start_cycle(&trigger(50 * REGION)));
        assert!(heuristics.should_start_cycle(&trigger(20 * REGION)));
    }

    #[test]
    fn selection_takes_garbage_until_target_is_met() {
        let mut heuristics = AdaptiveHeuristics::new(&options());
        let candidates = [
            regular(0, REGION / 10, 1),
            regular(1, REGION / 2, 2),
            regular(2, REGION * 9 / 10, 3),
        ];
        // 32 regions, threshold 30%: target is 35% = 11.2 regions free. With 10 regions free,
        // at least 1.2 regions of garbage are needed.
        let cset =
            heuristics.choose_collection_set_from_regiondata(&candidates, &input(10 * REGION), 0);
        assert_eq!(cset, vec![0, 1]);
    }
}
