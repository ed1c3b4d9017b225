//! Grant cache.
//!
//! [`SqliteGrantEngine`] keeps principals and grants in `_principal` and
//! `_grant`. The policy in `_user` stays authoritative; the helpers on
//! [`TeamStore`] derive the grants a user should hold and repair drift.

#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;

use super::connection::{column, query_error, Connection};
use super::core::TeamStore;
use super::types::{Access, GrantObject, Role, Routine, RoutineAccess, Value};
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

/// [`GrantEngine`] backed by the reserved principal and grant tables.
#[derive(Debug, Clone)]
pub struct SqliteGrantEngine {
    conn: Connection,
}

impl SqliteGrantEngine {
    /// Create an engine sharing `conn`.
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[async_trait]
impl GrantEngine for SqliteGrantEngine {
    async fn create_principal(&self, name: &str, passwd: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO _principal (name, passwd, created_at) VALUES (?, ?, ?)",
                &[Value::from(name), Value::from(passwd), Value::from(Self::now())],
            )
            .await?;
        tracing::debug!(principal = name, "Principal created");
        Ok(())
    }

    async fn drop_principal(&self, name: &str) -> Result<(), StoreError> {
        let mut tx = self.conn.begin().await?;
        sqlx::query("DELETE FROM _grant WHERE grantee = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("DELETE _grant", &e))?;
        let result = sqlx::query("DELETE FROM _principal WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("DELETE _principal", &e))?;
        tx.commit().await.map_err(|e| query_error("COMMIT", &e))?;

        if result.rows_affected() > 0 {
            tracing::debug!(principal = name, "Principal dropped");
        }
        Ok(())
    }

    async fn set_password(&self, name: &str, passwd: &str) -> Result<(), StoreError> {
        let result = self
            .conn
            .execute(
                "UPDATE _principal SET passwd = ? WHERE name = ?",
                &[Value::from(passwd), Value::from(name)],
            )
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::UserNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn verify_password(&self, name: &str, passwd: &str) -> Result<bool, StoreError> {
        let row = self
            .conn
            .fetch_optional(
                "SELECT passwd FROM _principal WHERE name = ?",
                &[Value::from(name)],
            )
            .await?;
        match row {
            Some(row) => Ok(column::<String>(&row, "passwd")? == passwd),
            None => Ok(false),
        }
    }

    async fn grant(&self, grantee: &str, object: &GrantObject) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO _grant (grantee, object_kind, object_name, granted_at) \
                 VALUES (?, ?, ?, ?)",
                &[
                    Value::from(grantee),
                    Value::from(object.kind()),
                    Value::from(object.name()),
                    Value::from(Self::now()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn revoke(&self, grantee: &str, object: &GrantObject) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM _grant WHERE grantee = ? AND object_kind = ? AND object_name = ?",
                &[
                    Value::from(grantee),
                    Value::from(object.kind()),
                    Value::from(object.name()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn revoke_object(&self, object: &GrantObject) -> Result<u64, StoreError> {
        let result = self
            .conn
            .execute(
                "DELETE FROM _grant WHERE object_kind = ? AND object_name = ?",
                &[Value::from(object.kind()), Value::from(object.name())],
            )
            .await?;
        Ok(result.rows_affected)
    }

    async fn grants_for(&self, grantee: &str) -> Result<Vec<GrantObject>, StoreError> {
        let rows = self
            .conn
            .fetch_all(
                "SELECT object_kind, object_name FROM _grant WHERE grantee = ?",
                &[Value::from(grantee)],
            )
            .await?;

        let mut objects = rows
            .iter()
            .map(|row| {
                let kind: String = column(row, "object_kind")?;
                let name: String = column(row, "object_name")?;
                GrantObject::from_parts(&kind, &name)
            })
            .collect::<Result<Vec<_>, _>>()?;
        objects.sort();
        Ok(objects)
    }

    async fn has_grant(&self, grantee: &str, object: &GrantObject) -> Result<bool, StoreError> {
        let row = self
            .conn
            .fetch_optional(
                "SELECT 1 FROM _grant WHERE grantee = ? AND object_kind = ? AND object_name = ?",
                &[
                    Value::from(grantee),
                    Value::from(object.kind()),
                    Value::from(object.name()),
                ],
            )
            .await?;
        Ok(row.is_some())
    }
}

/// Grants a user with `role` and `access` should hold.
///
/// `tables` is every initialized table; `routines` is the routine access map.
#[must_use]
pub fn derive_grants(
    role: Role,
    access: &Access,
    tables: &[String],
    routines: &[(Routine, RoutineAccess)],
) -> Vec<GrantObject> {
    let mut expected = BTreeSet::new();
    for table in tables {
        if access.covers(table) {
            expected.insert(GrantObject::Table(table.clone()));
        }
    }
    for (routine, routine_access) in routines {
        if routine_access.permits(role) {
            expected.insert(GrantObject::Routine(*routine));
        }
    }
    expected.into_iter().collect()
}

/// Changes applied by [`TeamStore::reconcile_grants`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantDiff {
    /// Grants that were missing and have been pushed.
    pub granted: Vec<GrantObject>,
    /// Grants that were not implied by the policy and have been revoked.
    pub revoked: Vec<GrantObject>,
}

impl GrantDiff {
    /// Whether the cache already matched the policy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.revoked.is_empty()
    }
}

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Grants `name` should hold according to the policy table.
    pub async fn expected_grants(&self, name: &str) -> Result<Vec<GrantObject>, StoreError> {
        self.require_superuser("expected_grants")?;
        let user = self
            .get_user(name)
            .await?
            .ok_or_else(|| StoreError::UserNotFound {
                name: name.to_string(),
            })?;
        let tables = self.inited_tables().await?;
        let routines = self.routine_access_map().await?;
        Ok(derive_grants(user.role, &user.access, &tables, &routines))
    }

    /// Make the grant cache for `name` match the policy table.
    ///
    /// Pushes every missing grant and revokes every extra one.
    pub async fn reconcile_grants(&self, name: &str) -> Result<GrantDiff, StoreError> {
        self.require_superuser("reconcile_grants")?;
        let expected = self.expected_grants(name).await?;
        let actual = self.grants.grants_for(name).await?;

        let mut diff = GrantDiff::default();
        for object in &expected {
            if !actual.contains(object) {
                self.grants.grant(name, object).await?;
                diff.granted.push(object.clone());
            }
        }
        for object in &actual {
            if !expected.contains(object) {
                self.grants.revoke(name, object).await?;
                diff.revoked.push(object.clone());
            }
        }

        if !diff.is_empty() {
            tracing::info!(
                user = name,
                granted = diff.granted.len(),
                revoked = diff.revoked.len(),
                "Grants reconciled"
            );
        }
        Ok(diff)
    }

    /// Reconcile every user in the policy table.
    ///
    /// Returns the users whose grants changed, with their diffs.
    pub async fn reconcile_all_grants(&self) -> Result<Vec<(String, GrantDiff)>, StoreError> {
        self.require_superuser("reconcile_grants")?;
        let mut changed = Vec::new();
        for user in self.get_user_list(None).await? {
            let diff = self.reconcile_grants(&user).await?;
            if !diff.is_empty() {
                changed.push((user, diff));
            }
        }
        Ok(changed)
    }

    /// Grant the tables covered by `access`.
    pub(crate) async fn grant_table_scope(
        &self,
        name: &str,
        access: &Access,
    ) -> Result<(), StoreError> {
        match access {
            Access::None => Ok(()),
            Access::All => {
                for table in self.inited_tables().await? {
                    self.grants.grant(name, &GrantObject::Table(table)).await?;
                }
                Ok(())
            }
            Access::Table(table) => {
                self.grants
                    .grant(name, &GrantObject::Table(table.clone()))
                    .await
            }
        }
    }

    /// Revoke the tables covered by `access`.
    pub(crate) async fn revoke_table_scope(
        &self,
        name: &str,
        access: &Access,
    ) -> Result<(), StoreError> {
        match access {
            Access::None => Ok(()),
            Access::All => {
                for object in self.grants.grants_for(name).await? {
                    if matches!(object, GrantObject::Table(_)) {
                        self.grants.revoke(name, &object).await?;
                    }
                }
                Ok(())
            }
            Access::Table(table) => {
                self.grants
                    .revoke(name, &GrantObject::Table(table.clone()))
                    .await
            }
        }
    }

    /// Replace every routine grant of `name` with the ones `role` permits.
    pub(crate) async fn grant_role_routines(&self, name: &str, role: Role) -> Result<(), StoreError> {
        let permitted = self.routines_for_role(role).await?;
        for object in self.grants.grants_for(name).await? {
            if let GrantObject::Routine(routine) = object {
                if !permitted.contains(&routine) {
                    self.grants.revoke(name, &object).await?;
                }
            }
        }
        for routine in permitted {
            self.grants
                .grant(name, &GrantObject::Routine(routine))
                .await?;
        }
        Ok(())
    }
}
