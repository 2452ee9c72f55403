use crate::util::constants::{BYTES_IN_KBYTE, BYTES_IN_MBYTE, MIN_OBJECT_ALIGNMENT};
use crate::util::log::trace;
use std::default::Default;
use strum_macros::EnumString;

/// The collection-set selection and triggering policy.
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HeuristicsMode {
    /// Fixed garbage and free thresholds.
    Static,
    /// A free threshold that adapts to how the previous cycles went.
    Adaptive,
    /// Collect all the time, and evacuate every region with garbage.
    Aggressive,
    /// Never start concurrent cycles. Allocation failures go straight to full GC.
    Passive,
    /// Frequent cycles that keep the heap small.
    Compact,
    /// Single-pass traversal cycles that mark, evacuate and update references together.
    Traversal,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

fn is_percentage(v: &usize) -> bool {
    *v <= 100
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])*$name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])*$name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Collector options. Each option has a type, a validator and a default value.
        /// `Options::default()` also picks up environment variables named `CCGC_<OPTION>`.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])*pub $name: $type),*
        }
        impl Options {
            /// Set an option by its snake case name. Returns true if the value was parsed and
            /// passed validation. Otherwise the previous value is kept.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling process()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        eprintln!("Warn: unknown option {}", s);
                        false
                    }
                }
            }

            fn new_with_defaults() -> Self {
                Options {
                    $($name: $default),*
                }
            }

            /// Set options from environment variables that start with `CCGC_`.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "CCGC_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Self::new_with_defaults();
                // If we have env vars that start with CCGC_ and match any option (such as CCGC_HEURISTICS),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                options.read_env_var_settings();
                options
            }
        }
    ]
}

options! {
    /// The size of the heap in bytes. It is rounded up to a multiple of the region size.
    heap_size:                      usize          [|v: &usize| *v > 0] = 64 * BYTES_IN_MBYTE,
    /// The size of a heap region in bytes.
    region_size:                    usize          [|v: &usize| v.is_power_of_two() && *v >= 4 * BYTES_IN_KBYTE] = 256 * BYTES_IN_KBYTE,
    /// Number of GC worker threads.
    threads:                        usize          [|v: &usize| *v > 0] = num_cpus::get(),
    /// Which heuristics to use.
    heuristics:                     HeuristicsMode [always_valid] = HeuristicsMode::Adaptive,
    /// A region whose garbage exceeds this percentage of its size is a collection set candidate.
    garbage_threshold:              usize          [is_percentage] = 25,
    /// The initial free threshold of the adaptive heuristics, in percent of capacity.
    init_free_threshold:            usize          [is_percentage] = 70,
    /// Start a cycle when free memory drops below this percentage of capacity.
    min_free_threshold:             usize          [is_percentage] = 10,
    /// Upper bound for the adaptive free threshold, in percent of capacity.
    max_free_threshold:             usize          [is_percentage] = 70,
    /// Only start a cycle after this percentage of capacity was allocated since the last one.
    allocation_threshold:           usize          [is_percentage] = 0,
    /// Skip evacuation when immediate garbage exceeds this percentage of total garbage.
    immediate_threshold:            usize          [is_percentage] = 90,
    /// Number of successful concurrent cycles before the adaptive heuristics lower the free threshold.
    happy_cycles_threshold:         usize          [always_valid] = 3,
    /// Start a cycle if none ran for this many milliseconds. Zero disables it.
    guaranteed_gc_interval:         u64            [always_valid] = 300_000,
    /// How long the control thread sleeps between decisions, in milliseconds.
    control_interval:               u64            [|v: &u64| *v > 0] = 10,
    /// Degenerated cycles in a row after which the collector goes straight to full GC.
    full_gc_threshold:              usize          [always_valid] = 3,
    /// Percentage of capacity reserved for evacuation.
    evac_reserve:                   usize          [is_percentage] = 5,
    /// How much waste evacuation may produce, as a multiple of the collection set live size.
    evac_waste:                     f64            [|v: &f64| *v >= 1.0] = 1.2,
    /// Allow evacuation to take empty regions from the mutator partition when the reserve runs out.
    evac_reserve_overflow:          bool           [always_valid] = true,
    /// The size of a GC local allocation buffer in bytes.
    gclab_size:                     usize          [|v: &usize| *v >= MIN_OBJECT_ALIGNMENT && *v % MIN_OBJECT_ALIGNMENT == 0] = 8 * BYTES_IN_KBYTE,
    /// The size of a mutator local allocation buffer in bytes.
    tlab_size:                      usize          [|v: &usize| *v >= MIN_OBJECT_ALIGNMENT && *v % MIN_OBJECT_ALIGNMENT == 0] = 16 * BYTES_IN_KBYTE,
    /// A degenerated cycle that leaves less than this percentage of capacity free made no progress.
    critical_free_threshold:        usize          [is_percentage] = 1,
    /// Capacity of each thread's SATB buffer, in entries.
    satb_buffer_size:               usize          [|v: &usize| *v > 0] = 1024,
    /// How often the control thread asks mutators to flush partial SATB buffers, in milliseconds.
    satb_buffer_flush_interval:     u64            [always_valid] = 100,
    /// Number of tasks a marking worker processes between SATB drains and cancellation checks.
    mark_loop_stride:               usize          [|v: &usize| *v > 0] = 1000,
    /// Number of regions a worker claims at once during update-references.
    parallel_region_stride:         usize          [|v: &usize| *v > 0] = 1024,
    /// Handle allocation failures with a degenerated cycle rather than a full GC.
    degenerated_gc:                 bool           [always_valid] = true,
    /// Run a concurrent cycle rather than a full GC for explicit requests.
    explicit_gc_invokes_concurrent: bool           [always_valid] = false,
    /// Deduplicate the backing arrays of strings found by marking.
    string_dedup:                   bool           [always_valid] = false,
    /// Verify the heap before and after every phase.
    verify:                         bool           [always_valid] = false,
    /// Stall allocating threads while the collector is behind.
    pacing:                         bool           [always_valid] = true,
    /// The longest a single pacing stall lasts, in milliseconds.
    pacing_max_delay:               u64            [always_valid] = 10,
    /// Make mutator allocations fail now and then, to exercise degenerated cycles.
    alloc_failure_alot:             bool           [always_valid] = false,
    /// Make evacuation allocations fail now and then, to exercise the evacuation OOM protocol.
    oom_during_evac_alot:           bool           [always_valid] = false,
    satb_barrier:                   bool           [always_valid] = true,
    keep_alive_barrier:             bool           [always_valid] = true,
    read_barrier:                   bool           [always_valid] = true,
    write_barrier:                  bool           [always_valid] = true,
    storeval_read_barrier:          bool           [always_valid] = true,
    storeval_enqueue_barrier:       bool           [always_valid] = true,
    cas_barrier:                    bool           [always_valid] = true,
    acmp_barrier:                   bool           [always_valid] = true,
    /// Do not enqueue values that were allocated after marking started, or are already marked.
    satb_filter_new_objects:        bool           [always_valid] = true,
}

impl Options {
    /// Set an option by its camel case name, such as `garbageThreshold`.
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c);
            }
        }

        let result = self.set_from_str(sr.as_str(), val);

        trace!("Trying to process option pair: ({})", sr);

        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }

    /// Options with built-in defaults only, ignoring the environment.
    pub fn without_env() -> Self {
        Self::new_with_defaults()
    }

    /// Check the combinations of options that individual validators cannot see.
    pub fn validate(&self) -> Result<(), String> {
        if self.heap_size < self.region_size * 4 {
            return Err(format!(
                "heap_size ({}) must hold at least 4 regions of {} bytes",
                self.heap_size, self.region_size
            ));
        }
        if self.min_free_threshold > self.max_free_threshold {
            return Err(format!(
                "min_free_threshold ({}) exceeds max_free_threshold ({})",
                self.min_free_threshold, self.max_free_threshold
            ));
        }
        if self.gclab_size > self.region_size || self.tlab_size > self.region_size {
            return Err(format!(
                "LAB sizes (gclab {}, tlab {}) must not exceed the region size {}",
                self.gclab_size, self.tlab_size, self.region_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.garbage_threshold, 25);
            assert_eq!(options.heuristics, HeuristicsMode::Adaptive);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("CCGC_HEURISTICS", "aggressive");
                    std::env::set_var("CCGC_GARBAGE_THRESHOLD", "40");

                    let options = Options::default();
                    assert_eq!(options.heuristics, HeuristicsMode::Aggressive);
                    assert_eq!(options.garbage_threshold, 40);
                },
                || {
                    std::env::remove_var("CCGC_HEURISTICS");
                    std::env::remove_var("CCGC_GARBAGE_THRESHOLD");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // a percentage above 100 fails validation
                    std::env::set_var("CCGC_EVAC_RESERVE", "150");

                    let options = Options::default();
                    assert_eq!(options.evac_reserve, 5);
                },
                || {
                    std::env::remove_var("CCGC_EVAC_RESERVE");
                },
            )
        })
    }

    #[test]
    fn with_unparsable_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("CCGC_HEURISTICS", "generational");

                    let options = Options::default();
                    assert_eq!(options.heuristics, HeuristicsMode::Adaptive);
                },
                || {
                    std::env::remove_var("CCGC_HEURISTICS");
                },
            )
        })
    }

    #[test]
    fn camelcase_names() {
        let mut options = Options::without_env();
        assert!(options.set_from_camelcase_str("immediateThreshold", "50"));
        assert_eq!(options.immediate_threshold, 50);
        assert!(options.set_from_camelcase_str("heuristics", "Passive"));
        assert_eq!(options.heuristics, HeuristicsMode::Passive);
        assert!(!options.set_from_camelcase_str("noSuchOption", "1"));
    }

    #[test]
    fn region_size_must_be_power_of_two() {
        let mut options = Options::without_env();
        assert!(!options.set_from_str("region_size", "100000"));
        assert!(options.set_from_str("region_size", "65536"));
        assert_eq!(options.region_size, 65536);
    }

    #[test]
    fn cross_option_validation() {
        let mut options = Options::without_env();
        assert!(options.validate().is_ok());
        options.heap_size = options.region_size * 2;
        assert!(options.validate().is_err());

        let mut options = Options::without_env();
        options.min_free_threshold = 80;
        assert!(options.validate().is_err());
    }
}
