use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::ConfigError;

/// Maps a configured level name to a filter. Accepts the classic
/// `FINEST`..`CRITICAL` names as well as the tracing ones, in any case.
pub fn level_filter(level: &str) -> Result<LevelFilter, ConfigError> {
    let filter = match level.trim().to_ascii_uppercase().as_str() {
        "FINEST" | "FINE" | "TRACE" => LevelFilter::TRACE,
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" | "CRITICAL" => LevelFilter::ERROR,
        "OFF" => LevelFilter::OFF,
        _ => {
            return Err(ConfigError::InvalidValue {
                key: "LogLevel",
                value: level.to_string(),
            })
        }
    };

    Ok(filter)
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(level: &str) -> Result<(), ConfigError> {
    let level = level_filter(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // a subscriber may already be installed when embedded
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    Ok(())
}
