//! Configuration management.
//!
//! This module handles:
//! - Environment variable loading
//! - Configuration validation
//! - Default value handling
//! - Password protection via [`SecretString`]
//!
//! # Example
//!
//! ```
//! use team_store::config::{Config, SecretString, DEFAULT_LOOKUP_URL};
//!
//! // Create a config directly (use Config::from_env() in production)
//! let config = Config {
//!     database_path: "./data/team.db".to_string(),
//!     user: "root".to_string(),
//!     password: SecretString::new("hunter2"),
//!     host: "localhost".to_string(),
//!     log_level: "info".to_string(),
//!     lookup_url: DEFAULT_LOOKUP_URL.to_string(),
//!     lookup_timeout_ms: 5_000,
//!     max_connections: 5,
//! };
//!
//! let debug = format!("{:?}", config);
//! assert!(debug.contains("<REDACTED>"));
//! assert!(!debug.contains("hunter2"));
//! ```

mod secret;
mod validation;

pub use secret::SecretString;
pub use validation::{
    validate_config, MAX_CONNECTIONS, MAX_LOOKUP_TIMEOUT_MS, MIN_LOOKUP_TIMEOUT_MS,
};

use crate::error::ConfigError;
use crate::storage::LoginInfo;

/// Default database path.
pub const DEFAULT_DATABASE_PATH: &str = "./data/team.db";

/// Default session host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default public address lookup endpoint.
pub const DEFAULT_LOOKUP_URL: &str = "https://checkip.amazonaws.com";

/// Default address lookup timeout in milliseconds.
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;

/// Default pool size per session.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Application configuration.
///
/// Use [`Config::from_env`] to load configuration from environment variables.
/// The `password` field uses [`SecretString`] to prevent accidental logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the shared database file.
    pub database_path: String,
    /// Session identity.
    pub user: String,
    /// Session password (protected from logging via [`SecretString`]).
    pub password: SecretString,
    /// Host the session originates from.
    pub host: String,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: String,
    /// Public address lookup endpoint.
    pub lookup_url: String,
    /// Address lookup timeout in milliseconds.
    pub lookup_timeout_ms: u64,
    /// Maximum pooled connections for this session.
    pub max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `TEAM_USER`: Session identity (`root` bootstraps the catalog)
    /// - `TEAM_PASSWORD`: Session password
    ///
    /// Optional environment variables (with defaults):
    /// - `DATABASE_PATH`: Path to the shared database (default: `./data/team.db`)
    /// - `TEAM_HOST`: Originating host (default: `localhost`)
    /// - `LOG_LEVEL`: Logging level (default: `info`)
    /// - `IP_LOOKUP_URL`: Public address service (default: `https://checkip.amazonaws.com`)
    /// - `IP_LOOKUP_TIMEOUT_MS`: Lookup timeout (default: `5000`)
    /// - `MAX_CONNECTIONS`: Pool size (default: `5`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing, a numeric
    /// variable does not parse, or any value fails [`validate_config`].
    #[must_use = "configuration should be used"]
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let user = std::env::var("TEAM_USER").map_err(|_| ConfigError::MissingRequired {
            var: "TEAM_USER".into(),
        })?;
        let password =
            std::env::var("TEAM_PASSWORD").map_err(|_| ConfigError::MissingRequired {
                var: "TEAM_PASSWORD".into(),
            })?;

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.into());
        let host = std::env::var("TEAM_HOST").unwrap_or_else(|_| DEFAULT_HOST.into());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.into());
        let lookup_url =
            std::env::var("IP_LOOKUP_URL").unwrap_or_else(|_| DEFAULT_LOOKUP_URL.into());

        let lookup_timeout_ms = parse_env_u64("IP_LOOKUP_TIMEOUT_MS", DEFAULT_LOOKUP_TIMEOUT_MS)?;
        let max_connections = parse_env_u32("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;

        let config = Self {
            database_path,
            user,
            password: SecretString::new(password),
            host,
            log_level,
            lookup_url,
            lookup_timeout_ms,
            max_connections,
        };

        validate_config(&config)?;
        Ok(config)
    }

    /// Login credentials for opening a store session.
    #[must_use]
    pub fn login_info(&self) -> LoginInfo {
        LoginInfo::new(&self.host, &self.user, self.password.clone())
    }
}

/// Parse an environment variable as u64, using a default if not set.
fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    std::env::var(name).map_or(Ok(default), |val| {
        val.parse().map_err(|_| ConfigError::InvalidValue {
            var: name.into(),
            reason: "must be a positive integer".into(),
        })
    })
}

/// Parse an environment variable as u32, using a default if not set.
fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    std::env::var(name).map_or(Ok(default), |val| {
        val.parse().map_err(|_| ConfigError::InvalidValue {
            var: name.into(),
            reason: "must be a positive integer".into(),
        })
    })
}
