//! Schema catalog.
//!
//! Reserved system tables, the routine access map, and the identifier rules
//! every dynamic table or column name must pass before interpolation.

#![allow(clippy::missing_errors_doc)]

use super::connection::column;
use super::core::TeamStore;
use super::types::{Access, GrantObject, Role, Routine, RoutineAccess, Value};
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

/// The superuser identity.
pub const SUPERUSER: &str = "root";

/// Reserved system tables, in creation order.
pub const RESERVED_TABLES: [&str; 8] = [
    "_user",
    "_empty_table",
    "_problem_info",
    "_config",
    "_routine",
    "_principal",
    "_grant",
    "_session",
];

/// Longest accepted identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Whether `name` is a reserved system table, including engine-internal ones.
///
/// Comparison ignores ASCII case, as the engine does.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    RESERVED_TABLES.contains(&lower.as_str()) || lower.starts_with("sqlite_")
}

/// Check that `name` is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

/// Check that `name` may be used as an experiment table.
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    if is_reserved(name) {
        return Err(StoreError::ReservedName {
            name: name.to_string(),
        });
    }
    validate_identifier(name)
}

/// Quote a validated identifier for interpolation.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Minimal role required by each routine.
#[must_use]
pub const fn routine_access(routine: Routine) -> RoutineAccess {
    match routine {
        Routine::LoginVerify
        | Routine::CheckTableExist
        | Routine::CheckInitedTableExist
        | Routine::QueryProblem
        | Routine::QueryConfig
        | Routine::CheckEntry => RoutineAccess::All,
        Routine::InitTable
        | Routine::UpdateConfig
        | Routine::LockEntry
        | Routine::ReleaseEntry => RoutineAccess::Min(Role::Operator),
    }
}

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Create the reserved catalog and seed the superuser.
    ///
    /// Idempotent: an existing catalog is left untouched, and an existing
    /// superuser keeps its password.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        self.require_superuser("bootstrap")?;

        let pool = self.conn.connect(false).await?;
        let schema_001 = include_str!("../../migrations/001_reserved_tables.sql");
        sqlx::query(schema_001)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::MigrationFailed {
                version: "001".to_string(),
                message: format!("Failed to run migration 001: {e}"),
            })?;

        let routines: Vec<Vec<Value>> = Routine::ALL
            .iter()
            .map(|r| {
                vec![
                    Value::from(r.as_str()),
                    Value::from(routine_access(*r).as_str()),
                ]
            })
            .collect();
        self.conn
            .execute_many(
                "INSERT OR IGNORE INTO _routine (name, access) VALUES (?, ?)",
                &routines,
            )
            .await?;

        let seeded = self
            .conn
            .fetch_optional(
                "SELECT 1 FROM _user WHERE name = ?",
                &[Value::from(SUPERUSER)],
            )
            .await?
            .is_some();
        if !seeded {
            self.seed_superuser().await?;
        }

        tracing::debug!("Catalog bootstrapped");
        Ok(())
    }

    async fn seed_superuser(&self) -> Result<(), StoreError> {
        let passwd = self.login.passwd.expose();
        self.grants.drop_principal(SUPERUSER).await?;
        self.grants.create_principal(SUPERUSER, passwd).await?;
        for routine in Routine::ALL {
            self.grants
                .grant(SUPERUSER, &GrantObject::Routine(routine))
                .await?;
        }
        self.conn
            .execute(
                "INSERT INTO _user (name, passwd, role, access) VALUES (?, ?, ?, ?)",
                &[
                    Value::from(SUPERUSER),
                    Value::from(passwd),
                    Value::from(Role::Admin.as_str()),
                    Value::from(Access::All.as_str()),
                ],
            )
            .await?;
        tracing::info!(user = SUPERUSER, "Superuser seeded");
        Ok(())
    }

    /// Fail with [`StoreError::CatalogMissing`] unless every reserved table exists.
    pub(crate) async fn ensure_catalog(&self) -> Result<(), StoreError> {
        let existing = self.engine_tables().await?;
        for reserved in RESERVED_TABLES {
            if !existing.iter().any(|t| t == reserved) {
                tracing::warn!(object = reserved, "Reserved table missing");
                return Err(StoreError::CatalogMissing {
                    object: reserved.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Every table the engine holds, reserved ones included.
    pub(crate) async fn engine_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .conn
            .fetch_all(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
            )
            .await?;
        rows.iter().map(|row| column(row, "name")).collect()
    }

    /// The persisted routine access map.
    pub async fn routine_access_map(&self) -> Result<Vec<(Routine, RoutineAccess)>, StoreError> {
        let rows = self
            .conn
            .fetch_all("SELECT name, access FROM _routine ORDER BY name", &[])
            .await?;

        let mut map = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = column(row, "name")?;
            let access: String = column(row, "access")?;
            if let Some(routine) = Routine::from_str(&name) {
                map.push((routine, RoutineAccess::from_str(&access)?));
            }
        }
        Ok(map)
    }

    /// Routines a role may execute, per the persisted map.
    pub(crate) async fn routines_for_role(&self, role: Role) -> Result<Vec<Routine>, StoreError> {
        Ok(self
            .routine_access_map()
            .await?
            .into_iter()
            .filter(|(_, access)| access.permits(role))
            .map(|(routine, _)| routine)
            .collect())
    }
}
