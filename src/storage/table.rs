//! Table lifecycle.
//!
//! A table is first registered by name (`_empty_table`), then initialized
//! with a typed schema (`_problem_info` plus the real table and its
//! triggers), and finally removed with its metadata, config and grants.

#![allow(clippy::missing_errors_doc)]

use chrono::Utc;

use super::catalog::{quote_ident, validate_table_name};
use super::connection::{column, query_error};
use super::core::TeamStore;
use super::types::{GrantObject, Minimize, ProblemInfo, Routine, Value, VarType};
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

/// `CREATE TABLE` statement for an initialized experiment table.
#[must_use]
pub fn create_table_sql(info: &ProblemInfo) -> String {
    let mut columns = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    for x in info.variable_columns() {
        columns.push(format!("{} {}", quote_ident(&x), info.var_type.column_type()));
    }
    for f in info.objective_columns() {
        columns.push(format!("{} REAL", quote_ident(&f)));
    }
    for g in info.constraint_columns() {
        columns.push(format!("{} REAL", quote_ident(&g)));
    }
    columns.push("status TEXT NOT NULL DEFAULT 'pending'".to_string());
    columns.push("locked INTEGER NOT NULL DEFAULT 0".to_string());
    columns.push("locked_by TEXT".to_string());
    columns.push("locked_at TEXT".to_string());
    columns.push("version INTEGER NOT NULL DEFAULT 0".to_string());

    format!(
        "CREATE TABLE {} ({})",
        quote_ident(&info.name),
        columns.join(", ")
    )
}

/// Row-level triggers for an initialized table.
///
/// Inserts without every design variable abort; a row becomes `evaluated`
/// once every objective holds a value.
#[must_use]
pub fn trigger_sql(info: &ProblemInfo) -> Vec<String> {
    let table = quote_ident(&info.name);
    let vars = info.variable_columns();
    let objs = info.objective_columns();

    let any_var_null = vars
        .iter()
        .map(|x| format!("NEW.{} IS NULL", quote_ident(x)))
        .collect::<Vec<_>>()
        .join(" OR ");
    let all_obj_set = objs
        .iter()
        .map(|f| format!("NEW.{} IS NOT NULL", quote_ident(f)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let obj_list = objs
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        format!(
            "CREATE TRIGGER IF NOT EXISTS {trigger} BEFORE INSERT ON {table} \
             WHEN {any_var_null} \
             BEGIN SELECT RAISE(ABORT, 'design variables must not be null'); END",
            trigger = quote_ident(&format!("{}_require_variables", info.name)),
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER INSERT ON {table} \
             WHEN {all_obj_set} \
             BEGIN UPDATE {table} SET status = 'evaluated' WHERE id = NEW.id; END",
            trigger = quote_ident(&format!("{}_insert_evaluated", info.name)),
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER UPDATE OF {obj_list} ON {table} \
             WHEN {all_obj_set} \
             BEGIN UPDATE {table} SET status = 'evaluated' WHERE id = NEW.id; END",
            trigger = quote_ident(&format!("{}_update_evaluated", info.name)),
        ),
    ]
}

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Register `name` as an empty table.
    pub async fn create_table(&self, name: &str) -> Result<(), StoreError> {
        self.require_superuser("create_table")?;
        validate_table_name(name)?;

        let taken = self.is_registered_table(name).await?
            || self
                .engine_tables()
                .await?
                .iter()
                .any(|t| t.eq_ignore_ascii_case(name));
        if taken {
            return Err(StoreError::TableExists {
                name: name.to_string(),
            });
        }

        self.conn
            .execute(
                "INSERT INTO _empty_table (name) VALUES (?)",
                &[Value::from(name)],
            )
            .await?;
        tracing::info!(table = name, "Table registered");
        Ok(())
    }

    /// Bind a schema to a registered table.
    ///
    /// Creates the typed table, its metadata row and its triggers in one
    /// transaction, then grants the table to every user whose access covers it.
    pub async fn init_table(
        &self,
        name: &str,
        var_type: VarType,
        n_var: usize,
        n_obj: usize,
        n_constr: usize,
        minimize: impl Into<Minimize> + Send,
    ) -> Result<(), StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::InitTable).await?;

        if self.is_inited_table(name).await? {
            return Err(StoreError::TableAlreadyInitialized {
                name: name.to_string(),
            });
        }
        let Some(registered) = self.registered_name(name).await? else {
            return Err(StoreError::TableNotFound {
                name: name.to_string(),
            });
        };
        let name = registered.as_str();
        for (field, n) in [("n_var", n_var), ("n_obj", n_obj)] {
            if n == 0 {
                return Err(StoreError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        let info = ProblemInfo {
            name: name.to_string(),
            var_type,
            n_var,
            n_obj,
            n_constr,
            minimize: minimize.into(),
        };
        let minimize_str = info.minimize.encode(n_obj)?;
        let dims = [n_var, n_obj, n_constr]
            .map(|n| i64::try_from(n).map_err(|_| too_large(n)))
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.conn.begin().await?;
        sqlx::query("DELETE FROM _empty_table WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("DELETE _empty_table", &e))?;
        sqlx::query(&create_table_sql(&info))
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("CREATE TABLE", &e))?;
        sqlx::query(
            "INSERT INTO _problem_info (name, var_type, n_var, n_obj, n_constr, minimize) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(var_type.as_str())
        .bind(dims[0])
        .bind(dims[1])
        .bind(dims[2])
        .bind(&minimize_str)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_error("INSERT _problem_info", &e))?;
        for trigger in trigger_sql(&info) {
            sqlx::query(&trigger)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error("CREATE TRIGGER", &e))?;
        }
        tx.commit().await.map_err(|e| query_error("COMMIT", &e))?;

        let rows = self
            .conn
            .fetch_all(
                "SELECT name FROM _user WHERE access = '*' OR access = ?",
                &[Value::from(name)],
            )
            .await?;
        let object = GrantObject::Table(name.to_string());
        for row in &rows {
            let user: String = column(row, "name")?;
            self.grants.grant(&user, &object).await?;
        }

        tracing::info!(
            table = name,
            var_type = var_type.as_str(),
            n_var,
            n_obj,
            n_constr,
            minimize = %minimize_str,
            "Table initialized"
        );
        Ok(())
    }

    /// Initialized user tables.
    pub async fn get_inited_table_list(&self) -> Result<Vec<String>, StoreError> {
        self.require_superuser("get_inited_table_list")?;
        self.inited_tables().await
    }

    /// Registered and initialized user tables.
    pub async fn get_table_list(&self) -> Result<Vec<String>, StoreError> {
        self.require_superuser("get_table_list")?;
        let mut tables = self.inited_tables().await?;
        tables.extend(self.registered_tables().await?);
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    /// Whether `name` is registered or initialized.
    ///
    /// A reserved name fails before the engine is reached.
    pub async fn check_table_exist(&self, name: &str) -> Result<bool, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::CheckTableExist).await?;
        Ok(self.is_inited_table(name).await? || self.is_registered_table(name).await?)
    }

    /// Whether `name` is initialized.
    ///
    /// A reserved name fails before the engine is reached.
    pub async fn check_inited_table_exist(&self, name: &str) -> Result<bool, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::CheckInitedTableExist).await?;
        self.is_inited_table(name).await
    }

    /// Remove a table.
    ///
    /// An initialized table is dropped together with every user access
    /// pointing at it, its metadata, its config and its grants. A registered
    /// table only loses its registry and config rows.
    pub async fn remove_table(&self, name: &str) -> Result<(), StoreError> {
        self.require_superuser("remove_table")?;
        validate_table_name(name)?;

        if self.is_inited_table(name).await? {
            let mut tx = self.conn.begin().await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error("DROP TABLE", &e))?;
            let cleared = sqlx::query("UPDATE _user SET access = '' WHERE access = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error("UPDATE _user", &e))?;
            for table in ["_problem_info", "_config"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE name = ?"))
                    .bind(name)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| query_error(&format!("DELETE {table}"), &e))?;
            }
            tx.commit().await.map_err(|e| query_error("COMMIT", &e))?;

            let revoked = self
                .grants
                .revoke_object(&GrantObject::Table(name.to_string()))
                .await?;
            tracing::info!(
                table = name,
                users_cleared = cleared.rows_affected(),
                grants_revoked = revoked,
                "Table removed"
            );
        } else if self.is_registered_table(name).await? {
            let mut tx = self.conn.begin().await?;
            for table in ["_empty_table", "_config"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE name = ?"))
                    .bind(name)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| query_error(&format!("DELETE {table}"), &e))?;
            }
            tx.commit().await.map_err(|e| query_error("COMMIT", &e))?;
            tracing::info!(table = name, "Registered table removed");
        } else {
            return Err(StoreError::TableNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Problem metadata of an initialized table, `None` if it has none.
    pub async fn query_problem(&self, name: &str) -> Result<Option<ProblemInfo>, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::QueryProblem).await?;
        self.problem_info(name).await
    }

    pub(crate) async fn problem_info(&self, name: &str) -> Result<Option<ProblemInfo>, StoreError> {
        let row = self
            .conn
            .fetch_optional(
                "SELECT name, var_type, n_var, n_obj, n_constr, minimize \
                 FROM _problem_info WHERE name = ?",
                &[Value::from(name)],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let var_type: String = column(&row, "var_type")?;
        let minimize: String = column(&row, "minimize")?;
        Ok(Some(ProblemInfo {
            name: column(&row, "name")?,
            var_type: VarType::from_str(&var_type)?,
            n_var: to_usize(column(&row, "n_var")?)?,
            n_obj: to_usize(column(&row, "n_obj")?)?,
            n_constr: to_usize(column(&row, "n_constr")?)?,
            minimize: Minimize::decode(&minimize)?,
        }))
    }

    /// Attach a configuration document to a table, replacing any previous one.
    pub async fn update_config(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<(), StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::UpdateConfig).await?;
        let document = serde_json::to_string(config).map_err(|e| StoreError::InvalidValue {
            field: "config".to_string(),
            reason: e.to_string(),
        })?;

        let mut tx = self.conn.begin().await?;
        let exists = sqlx::query(
            "SELECT 1 FROM _problem_info WHERE name = ?1 \
             UNION ALL SELECT 1 FROM _empty_table WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_error("SELECT table", &e))?
        .is_some();
        if !exists {
            return Err(StoreError::TableNotFound {
                name: name.to_string(),
            });
        }
        sqlx::query(
            "INSERT INTO _config (name, config, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET config = excluded.config, \
             updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(&document)
        .bind(Self::timestamp(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|e| query_error("UPSERT _config", &e))?;
        tx.commit().await.map_err(|e| query_error("COMMIT", &e))?;

        tracing::debug!(table = name, bytes = document.len(), "Config updated");
        Ok(())
    }

    /// The configuration document attached to a table, if any.
    pub async fn query_config(&self, name: &str) -> Result<Option<serde_json::Value>, StoreError> {
        validate_table_name(name)?;
        self.authorize_routine(Routine::QueryConfig).await?;
        let row = self
            .conn
            .fetch_optional(
                "SELECT config FROM _config WHERE name = ?",
                &[Value::from(name)],
            )
            .await?;
        row.map(|row| {
            let document: String = column(&row, "config")?;
            serde_json::from_str(&document).map_err(|e| StoreError::Internal {
                message: format!("Stored config for {name} is not valid JSON: {e}"),
            })
        })
        .transpose()
    }

    pub(crate) async fn inited_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .conn
            .fetch_all("SELECT name FROM _problem_info ORDER BY name", &[])
            .await?;
        rows.iter().map(|row| column(row, "name")).collect()
    }

    pub(crate) async fn registered_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .conn
            .fetch_all("SELECT name FROM _empty_table ORDER BY name", &[])
            .await?;
        rows.iter().map(|row| column(row, "name")).collect()
    }

    pub(crate) async fn is_inited_table(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .conn
            .fetch_optional(
                "SELECT 1 FROM _problem_info WHERE name = ?",
                &[Value::from(name)],
            )
            .await?
            .is_some())
    }

    pub(crate) async fn is_registered_table(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.registered_name(name).await?.is_some())
    }

    /// The registered spelling of `name`, matched case-insensitively.
    async fn registered_name(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .fetch_optional(
                "SELECT name FROM _empty_table WHERE name = ?",
                &[Value::from(name)],
            )
            .await?
            .map(|row| column(&row, "name"))
            .transpose()
    }
}

fn to_usize(n: i64) -> Result<usize, StoreError> {
    usize::try_from(n).map_err(|_| StoreError::Internal {
        message: format!("negative dimension {n} in problem metadata"),
    })
}

fn too_large(n: usize) -> StoreError {
    StoreError::InvalidValue {
        field: "dimension".to_string(),
        reason: format!("{n} is too large"),
    }
}
