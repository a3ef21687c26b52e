//! Logger setup for hosts and tests
//!
//! The bin logs through the `log` facade under the `render_bin` target
//! prefix. Hosts that already install a logger skip this module.

use env_logger::{Builder, Env};

/// Environment variable holding the filter, in `env_logger` syntax
pub const LOG_ENV: &str = "RENDER_BIN_LOG";

/// Filter used when [`LOG_ENV`] is unset
pub const DEFAULT_FILTER: &str = "render_bin=info";

fn builder(default_filter: &str) -> Builder {
    Builder::from_env(Env::new().filter_or(LOG_ENV, default_filter))
}

/// Install the logger, filtered by [`LOG_ENV`] or [`DEFAULT_FILTER`]
///
/// # Errors
///
/// Fails when another logger is already installed.
pub fn init() -> Result<(), log::SetLoggerError> {
    builder(DEFAULT_FILTER).try_init()
}

/// Test logger at debug level, captured per test; repeated calls are ignored
pub fn init_for_tests() {
    let _ = builder("render_bin=debug").is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_reported() {
        init_for_tests();
        assert!(init().is_err());
        log::debug!(target: "render_bin::logging", "logger installed once");
    }
}
