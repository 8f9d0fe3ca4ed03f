//! Logging subscriber setup
//!
//! Builds a layered subscriber:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else the configured level)
//!   └── Fmt Layer (text or JSON)
//! ```
//!
//! Request/response pairs are logged at DEBUG under the
//! [`WIRE_TARGET`] target, so `RUST_LOG=b2_engine::wire=debug` shows the
//! traffic without the rest of the debug output.
//!
//! # Example
//!
//! ```no_run
//! use b2_engine::config::LoggingConfig;
//! use b2_engine::logging::init_subscriber;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_subscriber(&LoggingConfig::default())?;
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Target of the request/response logs
pub const WIRE_TARGET: &str = "b2_engine::wire";

/// Logging errors
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Filter from `RUST_LOG`, or from `default_level` when it is unset.
pub fn env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| LoggingError::Filter(e.to_string())),
    }
}

/// Install the global subscriber.
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = env_filter(&config.level)?;

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_falls_back_to_level() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter("debug").unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_env_filter_prefers_rust_log() {
        std::env::set_var("RUST_LOG", "b2_engine::wire=debug");
        let filter = env_filter("warn").unwrap();
        assert_eq!(filter.to_string(), "b2_engine::wire=debug");
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    #[serial]
    fn test_invalid_level() {
        std::env::remove_var("RUST_LOG");
        assert!(matches!(
            env_filter("b2_engine=loudest"),
            Err(LoggingError::Filter(_))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        let _ = init_subscriber(&config);
        assert!(matches!(
            init_subscriber(&config),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
