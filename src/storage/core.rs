//! Core store implementation.
//!
//! This module provides the main [`TeamStore`] struct, session setup, and the
//! authorization helpers shared by every operation.

#![allow(clippy::missing_errors_doc)]

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use super::catalog::{is_reserved, SUPERUSER};
use super::connection::Connection;
use super::grants::SqliteGrantEngine;
use super::lookup::HttpAddressLookup;
use super::types::{GrantObject, Routine, Value};
use crate::config::{Config, SecretString};
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

/// Credentials a session is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    /// Host the session originates from.
    pub host: String,
    /// Session identity.
    pub user: String,
    /// Session password.
    pub passwd: SecretString,
}

impl LoginInfo {
    /// Create login credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>, passwd: SecretString) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            passwd,
        }
    }

    /// Superuser credentials from `localhost`.
    #[must_use]
    pub fn superuser(passwd: impl Into<SecretString>) -> Self {
        Self::new("localhost", SUPERUSER, passwd.into())
    }

    /// Whether these credentials name the superuser.
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.user == SUPERUSER
    }
}

/// Team data store session.
///
/// Owns one connection to the shared database, the identity it was opened
/// with, the grant adapter and the address lookup. Independent worker
/// processes each open their own `TeamStore` against the same file.
#[derive(Debug)]
pub struct TeamStore<G = SqliteGrantEngine, L = HttpAddressLookup> {
    pub(crate) conn: Connection,
    pub(crate) login: LoginInfo,
    pub(crate) grants: G,
    pub(crate) lookup: L,
    pub(crate) session_id: String,
}

impl TeamStore {
    /// Open a session described by `config`.
    ///
    /// The superuser bootstraps the reserved catalog on open; any other user
    /// requires it to exist already.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AuthenticationFailed`] for bad credentials,
    /// [`StoreError::CatalogMissing`] if a non-superuser opens an empty
    /// database, or an engine error.
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        let conn = Connection::new(&config.database_path, config.max_connections)?;
        let grants = SqliteGrantEngine::new(conn.clone());
        let lookup = HttpAddressLookup::new(&config.lookup_url, config.lookup_timeout_ms)?;
        Self::with_parts(conn, config.login_info(), grants, lookup).await
    }

    /// Open a session on a database file with default lookup settings.
    pub async fn open_path(
        database_path: impl AsRef<std::path::Path>,
        login: LoginInfo,
    ) -> Result<Self, StoreError> {
        let conn = Connection::new(database_path, crate::config::DEFAULT_MAX_CONNECTIONS)?;
        let grants = SqliteGrantEngine::new(conn.clone());
        Self::with_parts(conn, login, grants, HttpAddressLookup::with_defaults()?).await
    }

    /// Open a session on a private in-memory database.
    pub async fn open_in_memory(login: LoginInfo) -> Result<Self, StoreError> {
        let conn = Connection::in_memory()?;
        let grants = SqliteGrantEngine::new(conn.clone());
        Self::with_parts(conn, login, grants, HttpAddressLookup::with_defaults()?).await
    }
}

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Open a session from explicit parts.
    pub async fn with_parts(
        conn: Connection,
        login: LoginInfo,
        grants: G,
        lookup: L,
    ) -> Result<Self, StoreError> {
        conn.connect(false).await?;

        let store = Self {
            conn,
            login,
            grants,
            lookup,
            session_id: Self::generate_id(),
        };

        if store.is_superuser() {
            store.bootstrap().await?;
        } else {
            store.ensure_catalog().await?;
        }

        let verified = store
            .grants
            .verify_password(&store.login.user, store.login.passwd.expose())
            .await?;
        if !verified {
            tracing::warn!(user = %store.login.user, "Login rejected");
            return Err(StoreError::AuthenticationFailed {
                user: store.login.user.clone(),
            });
        }

        store.register_session().await?;
        tracing::info!(
            user = %store.login.user,
            host = %store.login.host,
            session = %store.session_id,
            "Session opened"
        );
        Ok(store)
    }

    /// The connection this session runs on.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Login credentials of this session.
    #[must_use]
    pub const fn login(&self) -> &LoginInfo {
        &self.login
    }

    /// Unique id of this session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Grant adapter used by this session.
    #[must_use]
    pub const fn grant_engine(&self) -> &G {
        &self.grants
    }

    /// Whether this session runs as the superuser.
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.login.is_superuser()
    }

    /// Unregister the session and close its pool.
    ///
    /// The next call reconnects without registering again.
    pub async fn quit(&self) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM _session WHERE id = ?",
                &[Value::from(self.session_id.as_str())],
            )
            .await?;
        self.conn.quit().await;
        tracing::info!(user = %self.login.user, session = %self.session_id, "Session closed");
        Ok(())
    }

    async fn register_session(&self) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO _session (id, user, host, connected_at) VALUES (?, ?, ?, ?)",
                &[
                    Value::from(self.session_id.as_str()),
                    Value::from(self.login.user.as_str()),
                    Value::from(self.login.host.as_str()),
                    Value::from(Self::timestamp(Utc::now())),
                ],
            )
            .await?;
        Ok(())
    }

    /// Fail unless this session is the superuser. Never touches the engine.
    pub(crate) fn require_superuser(&self, operation: &str) -> Result<(), StoreError> {
        if self.is_superuser() {
            return Ok(());
        }
        tracing::warn!(user = %self.login.user, operation, "Superuser operation denied");
        Err(self.denied(operation))
    }

    /// Fail unless this session may read and write `table`.
    pub(crate) async fn authorize_table(&self, table: &str) -> Result<(), StoreError> {
        if self.is_superuser() {
            return Ok(());
        }
        if is_reserved(table) {
            tracing::warn!(user = %self.login.user, table, "Reserved table access denied");
            return Err(self.denied(table));
        }
        let object = GrantObject::Table(table.to_string());
        if self.grants.has_grant(&self.login.user, &object).await? {
            Ok(())
        } else {
            tracing::warn!(user = %self.login.user, table, "Table access denied");
            Err(self.denied(table))
        }
    }

    /// Fail unless this session may execute `routine`.
    pub(crate) async fn authorize_routine(&self, routine: Routine) -> Result<(), StoreError> {
        if self.is_superuser() {
            return Ok(());
        }
        let object = GrantObject::Routine(routine);
        if self.grants.has_grant(&self.login.user, &object).await? {
            Ok(())
        } else {
            tracing::warn!(user = %self.login.user, routine = routine.as_str(), "Routine denied");
            Err(self.denied(routine.as_str()))
        }
    }

    fn denied(&self, operation: &str) -> StoreError {
        StoreError::PermissionDenied {
            user: self.login.user.clone(),
            operation: operation.to_string(),
        }
    }

    /// Generate a new UUID.
    pub(crate) fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Format a timestamp the way every reserved table stores it.
    pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parse a datetime string from the database.
    pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
        s.parse::<DateTime<Utc>>()
            .map_err(|e| StoreError::Internal {
                message: format!("Failed to parse datetime '{s}': {e}"),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    pub const ROOT_PASSWORD: &str = "root-pw";

    pub async fn test_store() -> TeamStore {
        TeamStore::open_in_memory(LoginInfo::superuser(ROOT_PASSWORD))
            .await
            .expect("Failed to create test store")
    }

    /// Root store on a file database, for tests that open several sessions.
    pub async fn file_store() -> (TeamStore, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = TeamStore::open_path(
            dir.path().join("team.db"),
            LoginInfo::superuser(ROOT_PASSWORD),
        )
        .await
        .expect("Failed to create file store");
        (store, dir)
    }

    #[tokio::test]
    #[serial]
    async fn test_open_in_memory_bootstraps() {
        let store = test_store().await;
        assert!(store.is_superuser());
        assert!(store.connection().is_connected().await);

        let rows = store
            .conn
            .fetch_all("SELECT name FROM _user WHERE name = 'root'", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_root_password_is_checked_after_bootstrap() {
        let (store, dir) = file_store().await;
        store.quit().await.unwrap();

        let err = TeamStore::open_path(
            dir.path().join("team.db"),
            LoginInfo::superuser("wrong"),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            StoreError::AuthenticationFailed {
                user: "root".to_string()
            }
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_non_superuser_needs_catalog() {
        let dir = TempDir::new().unwrap();
        let login = LoginInfo::new("localhost", "alice", SecretString::new("pw"));
        let err = TeamStore::open_path(dir.path().join("empty.db"), login)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CatalogMissing { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn test_session_registered_and_removed() {
        let (store, dir) = file_store().await;
        let observer = TeamStore::open_path(
            dir.path().join("team.db"),
            LoginInfo::superuser(ROOT_PASSWORD),
        )
        .await
        .unwrap();
        let sessions = |s: &TeamStore| {
            let conn = s.conn.clone();
            let id = store.session_id().to_string();
            async move {
                conn.fetch_all("SELECT id FROM _session WHERE id = ?", &[Value::from(id)])
                    .await
                    .unwrap()
                    .len()
            }
        };

        assert_eq!(sessions(&observer).await, 1);
        store.quit().await.unwrap();
        assert!(!store.connection().is_connected().await);
        assert_eq!(sessions(&observer).await, 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_require_superuser_denies_others() {
        let store = test_store().await;
        assert!(store.require_superuser("create_user").is_ok());

        let other = TeamStore {
            conn: store.conn.clone(),
            login: LoginInfo::new("localhost", "bob", SecretString::new("pw")),
            grants: SqliteGrantEngine::new(store.conn.clone()),
            lookup: HttpAddressLookup::with_defaults().unwrap(),
            session_id: "test".to_string(),
        };
        assert_eq!(
            other.require_superuser("create_user").unwrap_err(),
            StoreError::PermissionDenied {
                user: "bob".to_string(),
                operation: "create_user".to_string(),
            }
        );
        assert!(matches!(
            other.authorize_table("_user").await,
            Err(StoreError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_login_info_superuser() {
        let login = LoginInfo::superuser("s3cret");
        assert!(login.is_superuser());
        assert_eq!(login.host, "localhost");
        assert!(!format!("{login:?}").contains("s3cret"));
    }

    #[test]
    fn test_generate_id_unique() {
        let id1 = TeamStore::<SqliteGrantEngine, HttpAddressLookup>::generate_id();
        let id2 = TeamStore::<SqliteGrantEngine, HttpAddressLookup>::generate_id();
        assert_ne!(id1, id2);
        assert!(Uuid::parse_str(&id1).is_ok());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let text = TeamStore::<SqliteGrantEngine, HttpAddressLookup>::timestamp(now);
        assert!(text.ends_with('Z'));
        let parsed = TeamStore::<SqliteGrantEngine, HttpAddressLookup>::parse_datetime(&text)
            .unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_parse_datetime_invalid() {
        let result = TeamStore::<SqliteGrantEngine, HttpAddressLookup>::parse_datetime("yesterday");
        assert!(matches!(result, Err(StoreError::Internal { .. })));
    }
}
