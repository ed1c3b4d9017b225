//! User lifecycle and session identity.
//!
//! Every mutation writes the grant cache first and the `_user` policy row
//! last, so a failed grant never leaves a user record behind.

#![allow(clippy::missing_errors_doc)]

use super::catalog::{validate_table_name, SUPERUSER};
use super::connection::column;
use super::core::TeamStore;
use super::lookup::is_private_host;
use super::types::{Access, ActiveUser, Role, Routine, UserRecord, Value};
use crate::config::SecretString;
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Names of every user, optionally filtered by role.
    pub async fn get_user_list(&self, role: Option<Role>) -> Result<Vec<String>, StoreError> {
        self.require_superuser("get_user_list")?;
        let rows = match role {
            Some(role) => {
                self.conn
                    .fetch_all(
                        "SELECT name FROM _user WHERE role = ? ORDER BY name",
                        &[Value::from(role.as_str())],
                    )
                    .await?
            }
            None => {
                self.conn
                    .fetch_all("SELECT name FROM _user ORDER BY name", &[])
                    .await?
            }
        };
        rows.iter().map(|row| column(row, "name")).collect()
    }

    /// Whether a user exists.
    pub async fn check_user_exist(&self, name: &str) -> Result<bool, StoreError> {
        self.require_superuser("check_user_exist")?;
        Ok(self.fetch_user(name).await?.is_some())
    }

    /// A user's policy row.
    pub async fn get_user(&self, name: &str) -> Result<Option<UserRecord>, StoreError> {
        self.require_superuser("get_user")?;
        self.fetch_user(name).await
    }

    pub(crate) async fn fetch_user(&self, name: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = self
            .conn
            .fetch_optional(
                "SELECT name, passwd, role, access FROM _user WHERE name = ?",
                &[Value::from(name)],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let role: String = column(&row, "role")?;
        let access: String = column(&row, "access")?;
        Ok(Some(UserRecord {
            name: column(&row, "name")?,
            passwd: SecretString::new(column::<String>(&row, "passwd")?),
            role: Role::from_str(&role)?,
            access: Access::from_str(&access),
        }))
    }

    /// Users with at least one open session, with the host of each session.
    pub async fn get_active_user_list(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<ActiveUser>, StoreError> {
        self.require_superuser("get_active_user_list")?;
        let mut sql = String::from(
            "SELECT DISTINCT s.user AS name, s.host AS host FROM _session s \
             JOIN _user u ON u.name = s.user",
        );
        let mut params = Vec::new();
        if let Some(role) = role {
            sql.push_str(" WHERE u.role = ?");
            params.push(Value::from(role.as_str()));
        }
        sql.push_str(" ORDER BY s.user, s.host");

        let rows = self.conn.fetch_all(&sql, &params).await?;
        rows.iter()
            .map(|row| {
                Ok(ActiveUser {
                    name: column(row, "name")?,
                    host: column(row, "host")?,
                })
            })
            .collect()
    }

    /// Create a user with its principal, table grants and routine grants.
    ///
    /// The policy row is written only after every grant succeeds; on a grant
    /// failure the half-built principal is dropped again.
    pub async fn create_user(
        &self,
        name: &str,
        passwd: &str,
        role: Role,
        access: &Access,
    ) -> Result<(), StoreError> {
        self.require_superuser("create_user")?;
        validate_user_name(name)?;
        if self.fetch_user(name).await?.is_some() {
            return Err(StoreError::UserExists {
                name: name.to_string(),
            });
        }
        let access = &self.resolve_access(access).await?;

        self.grants.drop_principal(name).await?;
        self.grants.create_principal(name, passwd).await?;

        let granted = async {
            self.grant_table_scope(name, access).await?;
            self.grant_role_routines(name, role).await
        }
        .await;
        if let Err(e) = granted {
            tracing::warn!(user = name, error = %e, "Grant failed, dropping principal");
            if let Err(cleanup) = self.grants.drop_principal(name).await {
                tracing::warn!(user = name, error = %cleanup, "Principal cleanup failed");
            }
            return Err(e);
        }

        self.conn
            .execute(
                "INSERT INTO _user (name, passwd, role, access) VALUES (?, ?, ?, ?)",
                &[
                    Value::from(name),
                    Value::from(passwd),
                    Value::from(role.as_str()),
                    Value::from(access.as_str()),
                ],
            )
            .await?;

        tracing::info!(user = name, role = role.as_str(), access = access.as_str(), "User created");
        Ok(())
    }

    /// Update a user's password, role and access.
    ///
    /// Returns `false` without touching anything when nothing changed.
    pub async fn update_user(
        &self,
        name: &str,
        passwd: &str,
        role: Role,
        access: &Access,
    ) -> Result<bool, StoreError> {
        self.require_superuser("update_user")?;
        let old = self
            .fetch_user(name)
            .await?
            .ok_or_else(|| StoreError::UserNotFound {
                name: name.to_string(),
            })?;
        let access = &self.resolve_access(access).await?;

        let passwd_changed = old.passwd.expose() != passwd;
        let role_changed = old.role != role;
        let access_changed = old.access != *access;
        if !(passwd_changed || role_changed || access_changed) {
            return Ok(false);
        }
        if passwd_changed {
            self.grants.set_password(name, passwd).await?;
        }
        if access_changed {
            if *access != Access::All {
                self.revoke_table_scope(name, &old.access).await?;
            }
            self.grant_table_scope(name, access).await?;
        }
        if role_changed {
            self.grant_role_routines(name, role).await?;
        }

        self.conn
            .execute(
                "UPDATE _user SET passwd = ?, role = ?, access = ? WHERE name = ?",
                &[
                    Value::from(passwd),
                    Value::from(role.as_str()),
                    Value::from(access.as_str()),
                    Value::from(name),
                ],
            )
            .await?;

        tracing::info!(user = name, role = role.as_str(), access = access.as_str(), "User updated");
        Ok(true)
    }

    /// Remove a user, its principal and grants. The superuser is immutable.
    pub async fn remove_user(&self, name: &str) -> Result<(), StoreError> {
        self.require_superuser("remove_user")?;
        if name == SUPERUSER {
            return Err(StoreError::SuperuserImmutable {
                name: name.to_string(),
            });
        }
        if self.fetch_user(name).await?.is_none() {
            return Err(StoreError::UserNotFound {
                name: name.to_string(),
            });
        }

        self.grants.drop_principal(name).await?;
        self.conn
            .execute("DELETE FROM _user WHERE name = ?", &[Value::from(name)])
            .await?;

        tracing::info!(user = name, "User removed");
        Ok(())
    }

    /// Whether `name` exists with exactly `role` and an access covering `access`.
    pub async fn login_verify(
        &self,
        name: &str,
        role: Role,
        access: &str,
    ) -> Result<bool, StoreError> {
        self.authorize_routine(Routine::LoginVerify).await?;
        let row = self
            .conn
            .fetch_optional(
                "SELECT 1 FROM _user WHERE name = ? AND role = ? AND (access = '*' OR access = ?)",
                &[
                    Value::from(name),
                    Value::from(role.as_str()),
                    Value::from(access),
                ],
            )
            .await?;
        Ok(row.is_some())
    }

    /// The session's user name.
    #[must_use]
    pub fn get_current_user(&self) -> &str {
        &self.login.user
    }

    /// The session's user and public host.
    ///
    /// `localhost`, loopback and private hosts are replaced by the address
    /// reported by the lookup service; a failed lookup fails the call.
    pub async fn get_current_user_host(&self) -> Result<ActiveUser, StoreError> {
        let host = if is_private_host(&self.login.host) {
            self.lookup.public_ip().await?
        } else {
            self.login.host.clone()
        };
        Ok(ActiveUser {
            name: self.login.user.clone(),
            host,
        })
    }

    /// `*`, empty, or an existing initialized user table.
    /// Check a table scope and spell its table the way the catalog does.
    async fn resolve_access(&self, access: &Access) -> Result<Access, StoreError> {
        let Access::Table(table) = access else {
            return Ok(access.clone());
        };
        validate_table_name(table)?;
        let row = self
            .conn
            .fetch_optional(
                "SELECT name FROM _problem_info WHERE name = ?",
                &[Value::from(table.as_str())],
            )
            .await?;
        if let Some(row) = row {
            Ok(Access::Table(column(&row, "name")?))
        } else if self.is_registered_table(table).await? {
            Err(StoreError::TableNotInitialized {
                name: table.clone(),
            })
        } else {
            Err(StoreError::TableNotFound {
                name: table.clone(),
            })
        }
    }
}

fn validate_user_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidValue {
            field: "name".to_string(),
            reason: "user name must not be empty".to_string(),
        });
    }
    Ok(())
}
