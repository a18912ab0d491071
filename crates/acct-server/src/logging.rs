//! Tracing subscriber setup

use crate::config::{Config, LogFormat};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level. In JSON mode
/// event fields are flattened so `event_id`, `trace_id` and friends are
/// top-level keys of each line.
pub fn init(config: &Config) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (json, pretty) = match config.log_format {
        LogFormat::Json => (
            Some(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_target(false),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(fmt::layer().with_target(false))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|e| format!("failed to init tracing: {e}"))
}

/// Minimal stderr subscriber for errors raised before the config is loaded
pub fn init_fallback() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("info"))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
