//! Process-wide logging setup.
//!
//! Library code logs through `tracing` (worker, queue, converter, sweeper)
//! and `log` (db layer). Both end up in one `tracing-subscriber` registry.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("A global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to bridge `log` records: {0}")]
    LogBridge(#[from] log::SetLoggerError),
}

/// `RUST_LOG` wins over the configured level when it is set and valid.
fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

/// Installs the global subscriber: text lines on stderr, or one JSON object
/// per line when `config.json` is set. Fails if called twice.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(&config.level)?;

    let text_layer = (!config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
    });
    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
    });

    let subscriber = Registry::default()
        .with(filter)
        .with(text_layer)
        .with(json_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    tracing::debug!(level = %config.level, json = config.json, "Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_configured_levels_parse() {
        for level in ["trace", "debug", "info", "warn", "error", "meshconv=debug,info"] {
            assert!(EnvFilter::try_new(level).is_ok(), "{}", level);
        }
    }
}
