use the_log_crate::SetLoggerError;

/// Environment variable holding the filter of the built-in logger, in `env_logger` syntax.
/// `RUST_LOG` is not consulted, so the host's own logging settings do not leak into the collector.
pub const LOG_FILTER_ENV: &str = "CCGC_LOG";
/// Environment variable holding the colour setting of the built-in logger.
pub const LOG_STYLE_ENV: &str = "CCGC_LOG_STYLE";

/// Install `env_logger` as the global logger unless the `builtin_env_logger` feature is off.
/// Fails if the process already has a logger.
///
/// Without `CCGC_LOG`, the filter is `info`, which shows one line per pause and per concurrent
/// phase. Pause timings are in milliseconds, so timestamps are too.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let env = env_logger::Env::new()
                .filter_or(LOG_FILTER_ENV, "info")
                .write_style(LOG_STYLE_ENV);
            env_logger::Builder::from_env(env)
                .format_timestamp_millis()
                .try_init()
        } else {
            Ok(())
        }
    }
}
