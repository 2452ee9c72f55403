//! Utilities shared by the collector: addresses, constants, options, logging and statistics.

/// Address and byte arithmetic.
pub mod address;
/// Constants for word, page and object sizes.
pub mod constants;
/// Alignment helpers and unit conversions.
pub mod conversions;
/// Wrappers of the `log` crate macros.
pub(crate) mod log;
/// The built-in logger.
pub mod logger;
/// Heap memory reservation.
pub mod memory;
/// Collector options.
pub mod options;
/// Phase timings and cycle counters.
pub mod statistics;
#[cfg(test)]
pub(crate) mod test_util;

pub use self::address::Address;
