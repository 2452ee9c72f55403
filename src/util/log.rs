//! Log macros used throughout the collector.
//!
//! `error!`, `warn!` and `info!` are the `log` crate macros. Pauses, concurrent phases and
//! heuristic decisions are reported at `info`, so those stay in every build.
//!
//! `debug!` and `trace!` fire from hot loops: per region during cset selection and recycling, per
//! object on the marking and evacuation paths. Release builds compile them out unless the
//! `hot_log` feature is on.

// The `log` crate under another name, so that an IDE never auto-imports `log::debug!` and
// bypasses the gate below.
use the_log_crate;

pub(crate) use the_log_crate::{error, info, warn};

/// Whether `debug!` and `trace!` are compiled in.
pub(crate) const HOT_LOG_ENABLED: bool = cfg!(any(debug_assertions, feature = "hot_log"));

/// `the_log_crate::debug!` behind [`HOT_LOG_ENABLED`]. A `target:` prefix is forwarded as is.
macro_rules! debug {
    ($($arg:tt)+) => {
        if $crate::util::log::HOT_LOG_ENABLED {
            the_log_crate::debug!($($arg)+)
        }
    };
}

/// `the_log_crate::trace!` behind [`HOT_LOG_ENABLED`].
macro_rules! trace {
    ($($arg:tt)+) => {
        if $crate::util::log::HOT_LOG_ENABLED {
            the_log_crate::trace!($($arg)+)
        }
    };
}

// Path-based access for the macros above: `use crate::util::log::{debug, trace}`.
pub(crate) use debug;
pub(crate) use trace;
