//! Error types for the team data store.
//!
//! This module defines a small error hierarchy:
//! - [`AppError`]: Top-level errors returned by the binary
//! - [`StoreError`]: Store operation errors (preconditions, authorization,
//!   engine and external-service failures)
//! - [`ConfigError`]: Configuration errors
//!
//! All errors implement `Send + Sync` for async compatibility.

use thiserror::Error;

/// Top-level application error.
///
/// Wraps all subsystem errors for unified error handling in the binary.
#[derive(Debug, Error)]
pub enum AppError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Store errors.
///
/// Every public store operation either completes or fails with one of these,
/// carrying the offending reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("Database connection failed: {message}")]
    ConnectionFailed {
        /// Description of the connection failure.
        message: String,
    },

    /// A database statement failed.
    #[error("Query failed: {query} - {message}")]
    QueryFailed {
        /// The statement that failed (may be a short name).
        query: String,
        /// Description of the failure.
        message: String,
    },

    /// Reserved schema creation failed.
    #[error("Migration failed: {version} - {message}")]
    MigrationFailed {
        /// The migration version that failed.
        version: String,
        /// Description of the failure.
        message: String,
    },

    /// The reserved catalog has not been bootstrapped by the superuser.
    #[error("Catalog not initialized: reserved object {object} is missing")]
    CatalogMissing {
        /// The missing reserved object.
        object: String,
    },

    /// Login credentials were rejected.
    #[error("Authentication failed for user {user}")]
    AuthenticationFailed {
        /// The user that failed to log in.
        user: String,
    },

    /// The session identity may not perform the operation.
    #[error("Permission denied: {user} cannot {operation}")]
    PermissionDenied {
        /// The session user.
        user: String,
        /// The denied operation or object.
        operation: String,
    },

    /// A reserved system name was used as a user table.
    #[error("{name} is a reserved table")]
    ReservedName {
        /// The reserved name.
        name: String,
    },

    /// A table or column identifier is not a plain identifier.
    #[error("Invalid identifier: {name}")]
    InvalidIdentifier {
        /// The rejected identifier.
        name: String,
    },

    /// A column does not exist in the target table.
    #[error("Unknown column {column} in table {table}")]
    UnknownColumn {
        /// The table that was queried.
        table: String,
        /// The missing column.
        column: String,
    },

    /// Table already exists (registered or initialized).
    #[error("Table {name} exists")]
    TableExists {
        /// The table name.
        name: String,
    },

    /// Table does not exist.
    #[error("Table {name} does not exist")]
    TableNotFound {
        /// The table name.
        name: String,
    },

    /// Table is registered but has no schema bound yet.
    #[error("Table {name} is not initialized")]
    TableNotInitialized {
        /// The table name.
        name: String,
    },

    /// Table already has a schema bound.
    #[error("Table {name} is already initialized")]
    TableAlreadyInitialized {
        /// The table name.
        name: String,
    },

    /// User already exists.
    #[error("User {name} already exists")]
    UserExists {
        /// The user name.
        name: String,
    },

    /// User does not exist.
    #[error("User {name} doesn't exist")]
    UserNotFound {
        /// The user name.
        name: String,
    },

    /// The superuser cannot be removed.
    #[error("Cannot drop superuser {name}")]
    SuperuserImmutable {
        /// The superuser name.
        name: String,
    },

    /// Row does not exist in the table.
    #[error("Entry {row} not found in table {table}")]
    EntryNotFound {
        /// The table name.
        table: String,
        /// The row id.
        row: i64,
    },

    /// Provided values do not match the bound dimensions.
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being matched.
        what: String,
        /// Expected length.
        expected: usize,
        /// Provided length.
        actual: usize,
    },

    /// A value is outside its allowed domain.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// The field name.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// Public address lookup failed.
    #[error("Cannot identify public IP address: {message}")]
    AddressLookup {
        /// Description of the lookup failure.
        message: String,
    },

    /// Internal store error.
    #[error("Internal store error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StoreError {
    /// Returns true for errors caused by caller input rather than the engine.
    ///
    /// These leave the store untouched; the caller must fix the input.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ReservedName { .. }
                | Self::InvalidIdentifier { .. }
                | Self::UnknownColumn { .. }
                | Self::TableExists { .. }
                | Self::TableNotFound { .. }
                | Self::TableNotInitialized { .. }
                | Self::TableAlreadyInitialized { .. }
                | Self::UserExists { .. }
                | Self::UserNotFound { .. }
                | Self::SuperuserImmutable { .. }
                | Self::EntryNotFound { .. }
                | Self::DimensionMismatch { .. }
                | Self::InvalidValue { .. }
        )
    }
}

/// Configuration errors.
///
/// These errors represent failures in configuration loading and validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required configuration is missing.
    #[error("Missing required: {var}")]
    MissingRequired {
        /// The missing variable name.
        var: String,
    },

    /// Configuration value is invalid.
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue {
        /// The variable name.
        var: String,
        /// Why the value is invalid.
        reason: String,
    },
}
