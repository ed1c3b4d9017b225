//! Connection manager.
//!
//! Owns the pool to the shared database file and reconnects on demand.
//! Every statement goes through [`Connection::execute`] and friends, with
//! parameters always bound out-of-band from the statement text.

#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Row, Sqlite, Transaction, TypeInfo, ValueRef};
use tokio::sync::RwLock;

use super::types::Value;
use crate::error::StoreError;

/// Busy timeout applied to every connection.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Rows changed by the statement.
    pub rows_affected: u64,
    /// Row id of the last inserted row.
    pub last_insert_id: i64,
}

/// Live session to the backing database.
///
/// Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Connection {
    pool: Arc<RwLock<Option<SqlitePool>>>,
    options: SqliteConnectOptions,
    max_connections: u32,
}

impl Connection {
    /// Prepare a connection to a database file. Nothing is opened until
    /// [`Connection::connect`].
    pub fn new(database_path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StoreError> {
        let path = database_path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::ConnectionFailed {
                message: format!("Failed to create database directory: {e}"),
            })?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::ConnectionFailed {
                    message: format!("Invalid database path: {e}"),
                })?
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT)
                .create_if_missing(true);

        Ok(Self {
            pool: Arc::new(RwLock::new(None)),
            options,
            max_connections: max_connections.max(1),
        })
    }

    /// Prepare a private in-memory database.
    ///
    /// The pool is limited to one connection so every statement sees the same
    /// database; a forced reconnect starts from an empty database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::ConnectionFailed {
                message: format!("Invalid memory database options: {e}"),
            })?
            .journal_mode(SqliteJournalMode::Wal);

        Ok(Self {
            pool: Arc::new(RwLock::new(None)),
            options,
            max_connections: 1,
        })
    }

    /// Establish the pool if none is live, or unconditionally when `force` is set.
    ///
    /// Cheap when already connected.
    pub async fn connect(&self, force: bool) -> Result<SqlitePool, StoreError> {
        if !force {
            if let Some(pool) = self.pool.read().await.as_ref() {
                if !pool.is_closed() {
                    return Ok(pool.clone());
                }
            }
        }

        let mut guard = self.pool.write().await;
        // Another task may have reconnected while we waited for the lock.
        if !force {
            if let Some(pool) = guard.as_ref() {
                if !pool.is_closed() {
                    return Ok(pool.clone());
                }
            }
        }
        if let Some(old) = guard.take() {
            old.close().await;
        }

        tracing::debug!(force, "Opening database pool");
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(self.options.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                message: format!("Failed to connect to database: {e}"),
            })?;

        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Whether a live pool exists.
    pub async fn is_connected(&self) -> bool {
        self.pool
            .read()
            .await
            .as_ref()
            .is_some_and(|pool| !pool.is_closed())
    }

    /// Close the pool. The next statement reconnects.
    pub async fn quit(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
    }

    /// Database file backing this connection, if any.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.options.get_filename().to_path_buf()
    }

    /// Run one parameterized statement.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, StoreError> {
        let pool = self.connect(false).await?;
        let result = bind_all(sqlx::query(sql), params)
            .execute(&pool)
            .await
            .map_err(|e| query_error(sql, &e))?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
        })
    }

    /// Run one statement once per parameter row, inside a single transaction.
    pub async fn execute_many(
        &self,
        sql: &str,
        rows: &[Vec<Value>],
    ) -> Result<ExecResult, StoreError> {
        let mut tx = self.begin().await?;
        let mut total = ExecResult::default();
        for params in rows {
            let result = bind_all(sqlx::query(sql), params)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error(sql, &e))?;
            total.rows_affected += result.rows_affected();
            total.last_insert_id = result.last_insert_rowid();
        }
        tx.commit().await.map_err(|e| query_error("COMMIT", &e))?;
        Ok(total)
    }

    /// Fetch every row of a query.
    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<SqliteRow>, StoreError> {
        let pool = self.connect(false).await?;
        bind_all(sqlx::query(sql), params)
            .fetch_all(&pool)
            .await
            .map_err(|e| query_error(sql, &e))
    }

    /// Fetch at most one row of a query.
    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<SqliteRow>, StoreError> {
        let pool = self.connect(false).await?;
        bind_all(sqlx::query(sql), params)
            .fetch_optional(&pool)
            .await
            .map_err(|e| query_error(sql, &e))
    }

    /// Begin an application-level transaction.
    ///
    /// While the transaction is open, issue statements through it only: an
    /// in-memory database has a single pooled connection.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        let pool = self.connect(false).await?;
        pool.begin().await.map_err(|e| query_error("BEGIN", &e))
    }
}

/// Bind every value of `params` in order.
pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Bool(b) => query.bind(*b),
        };
    }
    query
}

/// Decode every column of a row into typed values, following the storage
/// class of each cell.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, StoreError> {
    (0..row.columns().len())
        .map(|index| decode_cell(row, index))
        .collect()
}

/// Read one named column of a row.
pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| StoreError::Internal {
        message: format!("Failed to read column {name}: {e}"),
    })
}

fn decode_cell(row: &SqliteRow, index: usize) -> Result<Value, StoreError> {
    let raw = row.try_get_raw(index).map_err(|e| decode_error(row, index, &e))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let kind = raw.type_info().name().to_string();
    let value = match kind.as_str() {
        "INTEGER" => row.try_get::<i64, _>(index).map(Value::Integer),
        "REAL" => row.try_get::<f64, _>(index).map(Value::Real),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| Value::Text(String::from_utf8_lossy(&bytes).into_owned())),
        _ => row.try_get::<String, _>(index).map(Value::Text),
    };
    value.map_err(|e| decode_error(row, index, &e))
}

fn decode_error(row: &SqliteRow, index: usize, err: &sqlx::Error) -> StoreError {
    let column = row
        .columns()
        .get(index)
        .map_or_else(|| index.to_string(), |c| c.name().to_string());
    StoreError::Internal {
        message: format!("Failed to decode column {column}: {err}"),
    }
}

/// Create a query error with the given statement and driver error.
pub(crate) fn query_error(sql: &str, err: &sqlx::Error) -> StoreError {
    StoreError::QueryFailed {
        query: sql.trim().to_string(),
        message: format!("{err}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    #[serial]
    async fn test_connect_is_idempotent() {
        let conn = Connection::in_memory().unwrap();
        assert!(!conn.is_connected().await);

        conn.connect(false).await.unwrap();
        assert!(conn.is_connected().await);

        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        // A second non-forced connect keeps the same in-memory database.
        conn.connect(false).await.unwrap();
        let rows = conn.fetch_all("SELECT * FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_reconnect_after_quit() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::new(dir.path().join("reconnect.db"), 2).unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[Value::Integer(7)])
            .await
            .unwrap();

        conn.quit().await;
        assert!(!conn.is_connected().await);

        // The next statement reconnects transparently.
        let row = conn
            .fetch_optional("SELECT v FROM t", &[])
            .await
            .unwrap()
            .expect("row");
        assert_eq!(decode_row(&row).unwrap(), vec![Value::Integer(7)]);
    }

    #[tokio::test]
    #[serial]
    async fn test_force_reconnect_file_keeps_data() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::new(dir.path().join("force.db"), 2).unwrap();
        conn.execute("CREATE TABLE t (v TEXT)", &[]).await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[Value::from("kept")])
            .await
            .unwrap();

        conn.connect(true).await.unwrap();
        let rows = conn.fetch_all("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_execute_reports_rows_and_insert_id() {
        let conn = Connection::in_memory().unwrap();
        conn.execute(
            "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v REAL)",
            &[],
        )
        .await
        .unwrap();

        let first = conn
            .execute("INSERT INTO t (v) VALUES (?)", &[Value::Real(0.5)])
            .await
            .unwrap();
        assert_eq!(first.rows_affected, 1);
        assert_eq!(first.last_insert_id, 1);

        let many = conn
            .execute_many(
                "INSERT INTO t (v) VALUES (?)",
                &[vec![Value::Real(1.0)], vec![Value::Real(2.0)]],
            )
            .await
            .unwrap();
        assert_eq!(many.rows_affected, 2);
        assert_eq!(many.last_insert_id, 3);
    }

    #[tokio::test]
    #[serial]
    async fn test_execute_many_rolls_back_on_error() {
        let conn = Connection::in_memory().unwrap();
        conn.execute("CREATE TABLE t (v INTEGER NOT NULL)", &[])
            .await
            .unwrap();

        let result = conn
            .execute_many(
                "INSERT INTO t (v) VALUES (?)",
                &[vec![Value::Integer(1)], vec![Value::Null]],
            )
            .await;
        assert!(matches!(result, Err(StoreError::QueryFailed { .. })));

        let rows = conn.fetch_all("SELECT v FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_decode_row_storage_classes() {
        let conn = Connection::in_memory().unwrap();
        let row = conn
            .fetch_optional(
                "SELECT ? AS i, ? AS r, ? AS t, ? AS n, ? AS b",
                &[
                    Value::Integer(3),
                    Value::Real(2.5),
                    Value::from("txt"),
                    Value::Null,
                    Value::Bool(true),
                ],
            )
            .await
            .unwrap()
            .expect("row");

        assert_eq!(
            decode_row(&row).unwrap(),
            vec![
                Value::Integer(3),
                Value::Real(2.5),
                Value::Text("txt".to_string()),
                Value::Null,
                Value::Integer(1),
            ]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_statement_error_is_not_retried() {
        let conn = Connection::in_memory().unwrap();
        let err = conn.execute("SELECT * FROM missing_table", &[]).await;
        match err {
            Err(StoreError::QueryFailed { query, message }) => {
                assert_eq!(query, "SELECT * FROM missing_table");
                assert!(message.contains("no such table"));
            }
            other => panic!("Expected QueryFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_new_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("team.db");
        let conn = Connection::new(&path, 1).unwrap();
        assert!(path.parent().unwrap().exists());
        assert_eq!(conn.database_path(), path);
    }
}
