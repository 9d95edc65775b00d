//! Logging system setup and configuration
//!
//! This module handles the initialization of the tracing-based logging system
//! used by every mesh instance.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize the logging system
///
/// Sets up structured logging with an environment-aware filter. `RUST_LOG`
/// takes precedence over the configured level.
///
/// # Arguments
/// * `settings` - Level and output format
///
/// # Returns
/// * `Result<()>` - Fails if a global subscriber is already installed
///
/// # Environment Variables
/// * `RUST_LOG` - Override the default logging filter (e.g., "debug", "mesh_server=trace")
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_setup() {
        let settings = LoggingSettings::default();

        // Only the first initialisation in a test binary can succeed; this
        // mainly checks that both formats build without panicking.
        let first = setup_logging(&settings);
        let second = setup_logging(&LoggingSettings {
            level: "debug".to_string(),
            json_format: true,
        });
        assert!(first.is_ok() || first.is_err());
        assert!(second.is_err() || first.is_err());
    }
}
