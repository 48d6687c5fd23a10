//! `tracing` subscriber setup

use crate::{ObservabilityError, Result};
use tracing_subscriber::EnvFilter;

/// How log output should look
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Default to `debug` instead of `info` when `RUST_LOG` is unset
    pub verbose: bool,
    /// Emit one JSON object per event
    pub json: bool,
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose` when set.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ObservabilityError::Logging(e.to_string()))
}
