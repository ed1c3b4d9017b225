//! Configuration validation.

use super::Config;
use crate::error::ConfigError;

/// Minimum allowed address lookup timeout in milliseconds.
pub const MIN_LOOKUP_TIMEOUT_MS: u64 = 100;

/// Maximum allowed address lookup timeout in milliseconds (1 minute).
pub const MAX_LOOKUP_TIMEOUT_MS: u64 = 60_000;

/// Maximum allowed pool size per session.
pub const MAX_CONNECTIONS: u32 = 32;

/// Validate configuration values.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] if any value is out of range:
/// - `TEAM_USER` must not be empty
/// - `DATABASE_PATH` must not be empty
/// - `IP_LOOKUP_TIMEOUT_MS` must be between 100 and 60000
/// - `MAX_CONNECTIONS` must be between 1 and 32
#[must_use = "validation result should be checked"]
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.user.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            var: "TEAM_USER".into(),
            reason: "must not be empty".into(),
        });
    }

    if config.database_path.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            var: "DATABASE_PATH".into(),
            reason: "must not be empty".into(),
        });
    }

    if config.lookup_timeout_ms < MIN_LOOKUP_TIMEOUT_MS
        || config.lookup_timeout_ms > MAX_LOOKUP_TIMEOUT_MS
    {
        return Err(ConfigError::InvalidValue {
            var: "IP_LOOKUP_TIMEOUT_MS".into(),
            reason: format!(
                "must be between {MIN_LOOKUP_TIMEOUT_MS} and {MAX_LOOKUP_TIMEOUT_MS} ms"
            ),
        });
    }

    if config.max_connections == 0 || config.max_connections > MAX_CONNECTIONS {
        return Err(ConfigError::InvalidValue {
            var: "MAX_CONNECTIONS".into(),
            reason: format!("must be between 1 and {MAX_CONNECTIONS}"),
        });
    }

    Ok(())
}
