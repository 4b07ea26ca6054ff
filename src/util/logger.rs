//! Built-in logger bootstrap.
//!
//! Uses the `env_logger` crate behind the default-on "builtin_env_logger"
//! Cargo feature. An embedding runtime that wires its own `log`
//! implementation should disable that feature and this function becomes a
//! no-op.

/// Attempt to initialize the built-in env_logger.
pub(crate) fn try_init() {
    #[cfg(feature = "builtin_env_logger")]
    {
        let result = env_logger::try_init_from_env(
            // By default, show info level logging.
            env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
        );
        match result {
            Ok(()) => debug!("initialized the built-in logger"),
            // The only current failure mode is "a logger is already set".
            Err(e) => debug!("failed to initialize the built-in env_logger: {e}"),
        }
    }
}
