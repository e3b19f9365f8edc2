//! # Structured Logging Setup
//!
//! Tracing-based logging shared by library users, integration tests, and
//! experiment drivers. Protocol modules emit `debug!`/`info!` events at
//! milestones (herald outcomes, rule firings, reservation decisions) and
//! `warn!` on recoverable failures; this module only owns subscriber setup.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

use crate::Result;

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Logging configuration for simulator runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter when `RUST_LOG` is unset (e.g. "info", "debug")
    pub default_filter: String,
    /// Emit newline-delimited JSON instead of human-readable lines
    pub json_output: bool,
    /// Include event targets (module paths) in output
    pub with_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json_output: false,
            with_targets: true,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// `RUST_LOG` overrides the configured default filter.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if TRACING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));

    if config.json_output {
        let subscriber = fmt()
            .json()
            .with_env_filter(filter)
            .with_target(config.with_targets)
            .finish();
        // A racing subscriber installation is not an error for the simulator
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let subscriber = fmt()
            .with_env_filter(filter)
            .with_target(config.with_targets)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    Ok(())
}

/// Initialize logging with defaults, for tests and quick experiments.
pub fn init_default_logging() {
    let _ = init_logging(&LoggingConfig::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_filter, "info");
        assert!(!config.json_output);
    }
}
