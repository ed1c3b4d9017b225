//! Entry lock.
//!
//! Every experiment row carries a `locked` flag, the lock holder, the lock
//! time and a `version` bumped on every lock transition. `lock_entry` is an
//! unconditional set; `claim_entry` is the compare-and-swap acquire.

#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::catalog::{quote_ident, validate_table_name};
use super::connection::column;
use super::core::TeamStore;
use super::types::{Routine, Value};
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

/// Columns managed by the store rather than by callers.
pub const SYSTEM_COLUMNS: [&str; 5] = ["id", "locked", "locked_by", "locked_at", "version"];

/// Lock state of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLock {
    /// Row id.
    pub row: i64,
    /// Whether the entry is locked.
    pub locked: bool,
    /// User holding the lock.
    pub locked_by: Option<String>,
    /// When the lock was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Row version, bumped on every lock transition and optimistic write.
    pub version: i64,
}

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Whether an entry is locked.
    pub async fn check_entry(&self, name: &str, row: i64) -> Result<bool, StoreError> {
        Ok(self.entry_lock(name, row).await?.locked)
    }

    /// Full lock state of an entry.
    pub async fn entry_lock(&self, name: &str, row: i64) -> Result<EntryLock, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::CheckEntry).await?;
        self.require_inited(name).await?;

        let found = self
            .conn
            .fetch_optional(
                &format!(
                    "SELECT locked, locked_by, locked_at, version FROM {} WHERE id = ?",
                    quote_ident(name)
                ),
                &[Value::Integer(row)],
            )
            .await?
            .ok_or_else(|| entry_not_found(name, row))?;

        let locked_at: Option<String> = column(&found, "locked_at")?;
        Ok(EntryLock {
            row,
            locked: column::<i64>(&found, "locked")? != 0,
            locked_by: column(&found, "locked_by")?,
            locked_at: locked_at.as_deref().map(Self::parse_datetime).transpose()?,
            version: column(&found, "version")?,
        })
    }

    /// Current version of an entry.
    pub async fn entry_version(&self, name: &str, row: i64) -> Result<i64, StoreError> {
        Ok(self.entry_lock(name, row).await?.version)
    }

    /// Mark an entry as locked by this session's user.
    ///
    /// Never waits and never fails on an already locked entry: locking twice
    /// just refreshes the holder and lock time.
    pub async fn lock_entry(&self, name: &str, row: i64) -> Result<(), StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::LockEntry).await?;
        self.require_inited(name).await?;

        let result = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET locked = 1, locked_by = ?, locked_at = ?, \
                     version = version + 1 WHERE id = ?",
                    quote_ident(name)
                ),
                &[
                    Value::from(self.login.user.as_str()),
                    Value::from(Self::timestamp(Utc::now())),
                    Value::Integer(row),
                ],
            )
            .await?;
        if result.rows_affected == 0 {
            return Err(entry_not_found(name, row));
        }
        tracing::debug!(table = name, row, user = %self.login.user, "Entry locked");
        Ok(())
    }

    /// Clear an entry's lock.
    pub async fn release_entry(&self, name: &str, row: i64) -> Result<(), StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::ReleaseEntry).await?;
        self.require_inited(name).await?;

        let result = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL, \
                     version = version + 1 WHERE id = ?",
                    quote_ident(name)
                ),
                &[Value::Integer(row)],
            )
            .await?;
        if result.rows_affected == 0 {
            return Err(entry_not_found(name, row));
        }
        tracing::debug!(table = name, row, "Entry released");
        Ok(())
    }

    /// Lock an entry only if it is currently unlocked.
    ///
    /// Returns `true` if this call took the lock. Of any number of concurrent
    /// claims on one unlocked entry, exactly one succeeds.
    pub async fn claim_entry(&self, name: &str, row: i64) -> Result<bool, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::LockEntry).await?;
        self.require_inited(name).await?;

        let result = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET locked = 1, locked_by = ?, locked_at = ?, \
                     version = version + 1 WHERE id = ? AND locked = 0",
                    quote_ident(name)
                ),
                &[
                    Value::from(self.login.user.as_str()),
                    Value::from(Self::timestamp(Utc::now())),
                    Value::Integer(row),
                ],
            )
            .await?;
        if result.rows_affected == 1 {
            tracing::debug!(table = name, row, user = %self.login.user, "Entry claimed");
            return Ok(true);
        }
        self.require_entry(name, row).await?;
        Ok(false)
    }

    /// Write columns of an entry only if its version still equals `expected`.
    ///
    /// Returns `true` if the write happened; the version is bumped with it.
    pub async fn update_entry_if_version(
        &self,
        name: &str,
        row: i64,
        expected: i64,
        columns: &[&str],
        values: &[Value],
    ) -> Result<bool, StoreError> {
        validate_table_name(name)?;
        self.authorize_table(name).await?;
        self.require_inited(name).await?;
        if columns.len() != values.len() {
            return Err(StoreError::DimensionMismatch {
                what: "values".to_string(),
                expected: columns.len(),
                actual: values.len(),
            });
        }
        if columns.is_empty() {
            return Err(StoreError::InvalidValue {
                field: "columns".to_string(),
                reason: "at least one column is required".to_string(),
            });
        }
        for col in columns {
            if SYSTEM_COLUMNS.contains(col) {
                return Err(StoreError::InvalidValue {
                    field: (*col).to_string(),
                    reason: "managed by the store".to_string(),
                });
            }
        }
        self.check_columns(name, columns).await?;

        let assignments = columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params = values.to_vec();
        params.push(Value::Integer(row));
        params.push(Value::Integer(expected));

        let result = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET {assignments}, version = version + 1 \
                     WHERE id = ? AND version = ?",
                    quote_ident(name)
                ),
                &params,
            )
            .await?;
        if result.rows_affected == 1 {
            return Ok(true);
        }
        self.require_entry(name, row).await?;
        tracing::debug!(table = name, row, expected, "Optimistic write lost");
        Ok(false)
    }

    /// Release every lock on `name` older than `lease`.
    ///
    /// Returns how many entries were released.
    pub async fn release_stale_entries(
        &self,
        name: &str,
        lease: Duration,
    ) -> Result<u64, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::ReleaseEntry).await?;
        self.require_inited(name).await?;

        let lease = chrono::Duration::from_std(lease).map_err(|e| StoreError::InvalidValue {
            field: "lease".to_string(),
            reason: e.to_string(),
        })?;
        let cutoff = Utc::now()
            .checked_sub_signed(lease)
            .ok_or_else(|| StoreError::InvalidValue {
                field: "lease".to_string(),
                reason: "reaches before the earliest representable time".to_string(),
            })?;

        let result = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL, \
                     version = version + 1 WHERE locked = 1 AND locked_at < ?",
                    quote_ident(name)
                ),
                &[Value::from(Self::timestamp(cutoff))],
            )
            .await?;
        if result.rows_affected > 0 {
            tracing::info!(
                table = name,
                released = result.rows_affected,
                "Stale entry locks released"
            );
        }
        Ok(result.rows_affected)
    }

    /// Fail unless `name` is an initialized table.
    pub(crate) async fn require_inited(&self, name: &str) -> Result<(), StoreError> {
        if self.is_inited_table(name).await? {
            Ok(())
        } else if self.is_registered_table(name).await? {
            Err(StoreError::TableNotInitialized {
                name: name.to_string(),
            })
        } else {
            Err(StoreError::TableNotFound {
                name: name.to_string(),
            })
        }
    }

    async fn require_entry(&self, name: &str, row: i64) -> Result<(), StoreError> {
        self.conn
            .fetch_optional(
                &format!("SELECT 1 FROM {} WHERE id = ?", quote_ident(name)),
                &[Value::Integer(row)],
            )
            .await?
            .map(|_| ())
            .ok_or_else(|| entry_not_found(name, row))
    }
}

fn entry_not_found(table: &str, row: i64) -> StoreError {
    StoreError::EntryNotFound {
        table: table.to_string(),
        row,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::SecretString;
    use crate::storage::core::tests::{file_store, test_store};
    use crate::storage::{Access, Filter, LoginInfo, Role, VarType};
    use serial_test::serial;

    async fn store_with_rows(n: u32) -> TeamStore {
        let store = test_store().await;
        store.create_table("zdt1").await.unwrap();
        store
            .init_table("zdt1", VarType::Real, 2, 2, 0, true)
            .await
            .unwrap();
        let rows: Vec<Vec<Value>> = (0..n)
            .map(|i| vec![Value::from(f64::from(i)), Value::from(0.5)])
            .collect();
        store
            .insert_multiple_data("zdt1", &["x1", "x2"], &rows)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    #[serial]
    async fn test_lock_check_release() {
        let store = store_with_rows(5).await;

        assert!(!store.check_entry("zdt1", 5).await.unwrap());
        store.lock_entry("zdt1", 5).await.unwrap();
        assert!(store.check_entry("zdt1", 5).await.unwrap());

        let lock = store.entry_lock("zdt1", 5).await.unwrap();
        assert_eq!(lock.locked_by.as_deref(), Some("root"));
        assert!(lock.locked_at.is_some());

        store.release_entry("zdt1", 5).await.unwrap();
        assert!(!store.check_entry("zdt1", 5).await.unwrap());
        assert!(store.entry_lock("zdt1", 5).await.unwrap().locked_by.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_double_lock_is_not_an_error() {
        let store = store_with_rows(1).await;
        store.lock_entry("zdt1", 1).await.unwrap();
        store.lock_entry("zdt1", 1).await.unwrap();
        assert!(store.check_entry("zdt1", 1).await.unwrap());
        assert_eq!(store.entry_version("zdt1", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_entry() {
        let store = store_with_rows(1).await;
        let missing = StoreError::EntryNotFound {
            table: "zdt1".to_string(),
            row: 99,
        };
        assert_eq!(store.check_entry("zdt1", 99).await.unwrap_err(), missing);
        assert_eq!(store.lock_entry("zdt1", 99).await.unwrap_err(), missing);
        assert_eq!(store.release_entry("zdt1", 99).await.unwrap_err(), missing);
        assert_eq!(store.claim_entry("zdt1", 99).await.unwrap_err(), missing);
    }

    #[tokio::test]
    #[serial]
    async fn test_lock_on_uninitialized_table() {
        let store = test_store().await;
        store.create_table("pending").await.unwrap();
        assert!(matches!(
            store.lock_entry("pending", 1).await,
            Err(StoreError::TableNotInitialized { .. })
        ));
        assert!(matches!(
            store.lock_entry("ghost", 1).await,
            Err(StoreError::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_claim_entry_succeeds_once() {
        let store = store_with_rows(1).await;
        assert!(store.claim_entry("zdt1", 1).await.unwrap());
        assert!(!store.claim_entry("zdt1", 1).await.unwrap());

        store.release_entry("zdt1", 1).await.unwrap();
        assert!(store.claim_entry("zdt1", 1).await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_claim_entry_across_sessions() {
        let (root, dir) = file_store().await;
        root.create_table("zdt1").await.unwrap();
        root.init_table("zdt1", VarType::Real, 1, 1, 0, true)
            .await
            .unwrap();
        root.insert_data("zdt1", &["x1"], &[Value::Real(0.3)])
            .await
            .unwrap();
        root.create_user("w1", "pw", Role::Operator, &Access::All)
            .await
            .unwrap();
        root.create_user("w2", "pw", Role::Operator, &Access::All)
            .await
            .unwrap();

        let path = dir.path().join("team.db");
        let worker = |name: &str| LoginInfo::new("localhost", name, SecretString::new("pw"));
        let w1 = TeamStore::open_path(&path, worker("w1")).await.unwrap();
        let w2 = TeamStore::open_path(&path, worker("w2")).await.unwrap();

        let (a, b) = tokio::join!(w1.claim_entry("zdt1", 1), w2.claim_entry("zdt1", 1));
        let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);

        let holder = root.entry_lock("zdt1", 1).await.unwrap().locked_by.unwrap();
        assert!(holder == "w1" || holder == "w2");
    }

    #[tokio::test]
    #[serial]
    async fn test_update_entry_if_version() {
        let store = store_with_rows(1).await;
        let version = store.entry_version("zdt1", 1).await.unwrap();

        assert!(store
            .update_entry_if_version(
                "zdt1",
                1,
                version,
                &["f1", "f2"],
                &[Value::Real(1.0), Value::Real(2.0)],
            )
            .await
            .unwrap());
        // The same expected version is now stale.
        assert!(!store
            .update_entry_if_version("zdt1", 1, version, &["f1"], &[Value::Real(9.0)])
            .await
            .unwrap());

        let rows = store
            .select_data("zdt1", &["f1", "status"], &Filter::new().eq("id", 1_i64))
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Real(1.0), Value::from("evaluated")]]);
        assert_eq!(store.entry_version("zdt1", 1).await.unwrap(), version + 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_update_entry_if_version_rejects_system_columns() {
        let store = store_with_rows(1).await;
        assert!(matches!(
            store
                .update_entry_if_version("zdt1", 1, 0, &["version"], &[Value::Integer(7)])
                .await,
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(matches!(
            store
                .update_entry_if_version("zdt1", 1, 0, &["nope"], &[Value::Integer(7)])
                .await,
            Err(StoreError::UnknownColumn { .. })
        ));
        assert!(matches!(
            store
                .update_entry_if_version("zdt1", 1, 0, &["f1", "f2"], &[Value::Real(1.0)])
                .await,
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_release_stale_entries() {
        let store = store_with_rows(3).await;
        store.lock_entry("zdt1", 1).await.unwrap();
        store.lock_entry("zdt1", 2).await.unwrap();
        store
            .connection()
            .execute(
                "UPDATE zdt1 SET locked_at = ? WHERE id = 1",
                &[Value::from("2020-01-01T00:00:00.000Z")],
            )
            .await
            .unwrap();

        let released = store
            .release_stale_entries("zdt1", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(!store.check_entry("zdt1", 1).await.unwrap());
        assert!(store.check_entry("zdt1", 2).await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_release_stale_entries_out_of_range_lease() {
        let store = store_with_rows(1).await;
        store.lock_entry("zdt1", 1).await.unwrap();

        for lease in [Duration::from_secs(10_000_000_000_000), Duration::MAX] {
            let err = store
                .release_stale_entries("zdt1", lease)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidValue { ref field, .. } if field == "lease"));
        }
        assert!(store.check_entry("zdt1", 1).await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_viewer_cannot_lock() {
        let (root, dir) = file_store().await;
        root.create_table("zdt1").await.unwrap();
        root.init_table("zdt1", VarType::Real, 1, 1, 0, true)
            .await
            .unwrap();
        root.insert_data("zdt1", &["x1"], &[Value::Real(0.3)])
            .await
            .unwrap();
        root.create_user("v", "pw", Role::Viewer, &Access::All)
            .await
            .unwrap();

        let viewer = TeamStore::open_path(
            dir.path().join("team.db"),
            LoginInfo::new("localhost", "v", SecretString::new("pw")),
        )
        .await
        .unwrap();
        assert!(!viewer.check_entry("zdt1", 1).await.unwrap());
        assert!(matches!(
            viewer.lock_entry("zdt1", 1).await,
            Err(StoreError::PermissionDenied { .. })
        ));
    }
}
