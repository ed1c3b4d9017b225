//! Generic query layer.
//!
//! Parameterized insert, update, select and delete over any table the
//! session may reach. Table and column names are validated against the
//! live schema and quoted; every value is bound.

#![allow(clippy::missing_errors_doc)]

use serde::{Deserialize, Serialize};

use super::catalog::{quote_ident, validate_identifier, validate_table_name};
use super::connection::{column, decode_row};
use super::core::TeamStore;
use super::transform::{transform_data, transform_multiple_data, ColumnData, Field};
use super::types::Value;
use crate::error::StoreError;
use crate::traits::{AddressLookup, GrantEngine};

/// Comparison operator of a [`Filter`] condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IS NULL`, value ignored.
    IsNull,
    /// `IS NOT NULL`, value ignored.
    IsNotNull,
}

impl Op {
    const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    const fn binds_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

/// One `column op value` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Column name.
    pub column: String,
    /// Operator.
    pub op: Op,
    /// Bound value.
    pub value: Value,
}

/// Conditions joined with `AND`. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// A filter matching every row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition.
    #[must_use]
    pub fn and(mut self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Add `column = value`.
    #[must_use]
    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, Op::Eq, value)
    }

    /// Add `column <> value`.
    #[must_use]
    pub fn ne(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, Op::Ne, value)
    }

    /// Add `column < value`.
    #[must_use]
    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, Op::Lt, value)
    }

    /// Add `column <= value`.
    #[must_use]
    pub fn le(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, Op::Le, value)
    }

    /// Add `column > value`.
    #[must_use]
    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, Op::Gt, value)
    }

    /// Add `column >= value`.
    #[must_use]
    pub fn ge(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, Op::Ge, value)
    }

    /// Add `column IS NULL`.
    #[must_use]
    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.and(column, Op::IsNull, Value::Null)
    }

    /// Add `column IS NOT NULL`.
    #[must_use]
    pub fn is_not_null(self, column: impl Into<String>) -> Self {
        self.and(column, Op::IsNotNull, Value::Null)
    }

    /// Whether the filter has no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// The conditions, in order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// ` WHERE ...` clause (empty for an empty filter) and its parameters.
    fn render(&self) -> (String, Vec<Value>) {
        if self.conditions.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut params = Vec::new();
        let clauses = self
            .conditions
            .iter()
            .map(|c| {
                if c.op.binds_value() {
                    params.push(c.value.clone());
                    format!("{} {} ?", quote_ident(&c.column), c.op.sql())
                } else {
                    format!("{} {}", quote_ident(&c.column), c.op.sql())
                }
            })
            .collect::<Vec<_>>();
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

/// Every row of a table with its column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    /// Column names in table order.
    pub columns: Vec<String>,
    /// Rows, one value per column.
    pub rows: Vec<Vec<Value>>,
}

impl<G: GrantEngine, L: AddressLookup> TeamStore<G, L> {
    /// Column names of a table, in table order.
    pub async fn get_column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.prepare_table(table).await?;
        self.column_names(table).await
    }

    /// Insert one row. Empty `columns` means every column in table order.
    ///
    /// Returns the new row id.
    pub async fn insert_data(
        &self,
        table: &str,
        columns: &[&str],
        values: &[Value],
    ) -> Result<i64, StoreError> {
        let (sql, width) = self.insert_statement(table, columns).await?;
        check_width("values", width, values.len())?;
        let result = self.conn.execute(&sql, values).await?;
        Ok(result.last_insert_id)
    }

    /// Insert many rows in one transaction.
    ///
    /// Returns the number of inserted rows.
    pub async fn insert_multiple_data(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<u64, StoreError> {
        let (sql, width) = self.insert_statement(table, columns).await?;
        for row in rows {
            check_width("values", width, row.len())?;
        }
        Ok(self.conn.execute_many(&sql, rows).await?.rows_affected)
    }

    /// Set `columns` to `values` on every row matching `filter`.
    pub async fn update_data(
        &self,
        table: &str,
        columns: &[&str],
        values: &[Value],
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        self.prepare_table(table).await?;
        check_width("values", columns.len(), values.len())?;
        self.check_columns(table, columns).await?;
        self.check_filter(table, filter).await?;

        let (where_clause, filter_params) = filter.render();
        let sql = format!(
            "UPDATE {} SET {}{where_clause}",
            quote_ident(table),
            assignments(columns)?
        );
        let mut params = values.to_vec();
        params.extend(filter_params);
        Ok(self.conn.execute(&sql, &params).await?.rows_affected)
    }

    /// Update many rows in one transaction.
    ///
    /// Each row holds one value per column followed by the key matched
    /// against `key_column`.
    pub async fn update_multiple_data(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
        key_column: &str,
    ) -> Result<u64, StoreError> {
        self.prepare_table(table).await?;
        self.check_columns(table, columns).await?;
        self.check_columns(table, &[key_column]).await?;
        for row in rows {
            check_width("values", columns.len() + 1, row.len())?;
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table),
            assignments(columns)?,
            quote_ident(key_column)
        );
        Ok(self.conn.execute_many(&sql, rows).await?.rows_affected)
    }

    /// Delete every row matching `filter`. An empty filter is refused.
    pub async fn delete_data(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        if filter.is_empty() {
            return Err(StoreError::InvalidValue {
                field: "filter".to_string(),
                reason: "delete requires at least one condition".to_string(),
            });
        }
        self.prepare_table(table).await?;
        self.check_filter(table, filter).await?;

        let (where_clause, params) = filter.render();
        let sql = format!("DELETE FROM {}{where_clause}", quote_ident(table));
        Ok(self.conn.execute(&sql, &params).await?.rows_affected)
    }

    /// Rows matching `filter`. Empty `columns` selects every column.
    pub async fn select_data(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
    ) -> Result<Vec<Vec<Value>>, StoreError> {
        let sql = self.select_statement(table, columns, filter, "").await?;
        let (_, params) = filter.render();
        let rows = self.conn.fetch_all(&sql, &params).await?;
        rows.iter().map(decode_row).collect()
    }

    /// First row matching `filter`, in engine order.
    pub async fn select_first_data(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
    ) -> Result<Option<Vec<Value>>, StoreError> {
        let sql = self
            .select_statement(table, columns, filter, " LIMIT 1")
            .await?;
        let (_, params) = filter.render();
        self.conn
            .fetch_optional(&sql, &params)
            .await?
            .as_ref()
            .map(decode_row)
            .transpose()
    }

    /// Matching row with the highest `id`.
    ///
    /// Fails with [`StoreError::UnknownColumn`] if the table has no `id`.
    pub async fn select_last_data(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
    ) -> Result<Option<Vec<Value>>, StoreError> {
        let sql = self
            .select_statement(table, columns, filter, " ORDER BY \"id\" DESC LIMIT 1")
            .await?;
        self.check_columns(table, &["id"]).await?;
        let (_, params) = filter.render();
        self.conn
            .fetch_optional(&sql, &params)
            .await?
            .as_ref()
            .map(decode_row)
            .transpose()
    }

    /// Every row of an initialized table.
    pub async fn load_table(&self, name: &str) -> Result<TableData, StoreError> {
        validate_table_name(name)?;
        self.authorize_table(name).await?;
        self.require_inited(name).await?;

        let columns = self.column_names(name).await?;
        let rows = self
            .conn
            .fetch_all(&format!("SELECT * FROM {} ORDER BY id", quote_ident(name)), &[])
            .await?;
        Ok(TableData {
            columns,
            rows: rows.iter().map(decode_row).collect::<Result<_, _>>()?,
        })
    }

    /// Fingerprint of an initialized table's content, as lowercase hex.
    ///
    /// Equal across sessions while no row changes; any insert, update,
    /// delete or lock change yields a different value.
    pub async fn get_checksum(&self, name: &str) -> Result<String, StoreError> {
        let data = self.load_table(name).await?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&encode_for_checksum(&data.columns)?);
        for row in &data.rows {
            hasher.update(&encode_for_checksum(row)?);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Insert one row built from mixed scalar and vector fields.
    pub async fn insert_fields(
        &self,
        table: &str,
        columns: &[&str],
        fields: &[Field],
    ) -> Result<i64, StoreError> {
        self.insert_data(table, columns, &transform_data(fields))
            .await
    }

    /// Insert many rows built from column blocks.
    pub async fn insert_multiple_fields(
        &self,
        table: &str,
        columns: &[&str],
        blocks: &[ColumnData],
    ) -> Result<u64, StoreError> {
        let rows = transform_multiple_data(blocks)?;
        self.insert_multiple_data(table, columns, &rows).await
    }

    /// Update matching rows from mixed scalar and vector fields.
    pub async fn update_fields(
        &self,
        table: &str,
        columns: &[&str],
        fields: &[Field],
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        self.update_data(table, columns, &transform_data(fields), filter)
            .await
    }

    /// Validate the identifier, authorize it, and check it exists.
    async fn prepare_table(&self, table: &str) -> Result<(), StoreError> {
        validate_identifier(table)?;
        self.authorize_table(table).await?;
        let exists = self
            .engine_tables()
            .await?
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table));
        if exists {
            Ok(())
        } else {
            Err(StoreError::TableNotFound {
                name: table.to_string(),
            })
        }
    }

    pub(crate) async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .conn
            .fetch_all(&format!("PRAGMA table_info({})", quote_ident(table)), &[])
            .await?;
        rows.iter().map(|row| column(row, "name")).collect()
    }

    /// Fail with [`StoreError::UnknownColumn`] unless every column exists.
    pub(crate) async fn check_columns(&self, table: &str, columns: &[&str]) -> Result<(), StoreError> {
        let known = self.column_names(table).await?;
        for col in columns {
            if !known.iter().any(|k| k.eq_ignore_ascii_case(col)) {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: (*col).to_string(),
                });
            }
        }
        Ok(())
    }

    async fn check_filter(&self, table: &str, filter: &Filter) -> Result<(), StoreError> {
        let columns: Vec<&str> = filter.conditions.iter().map(|c| c.column.as_str()).collect();
        self.check_columns(table, &columns).await
    }

    async fn insert_statement(
        &self,
        table: &str,
        columns: &[&str],
    ) -> Result<(String, usize), StoreError> {
        self.prepare_table(table).await?;
        if columns.is_empty() {
            let width = self.column_names(table).await?.len();
            let sql = format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(table),
                placeholders(width)
            );
            return Ok((sql, width));
        }
        self.check_columns(table, columns).await?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            column_list(columns),
            placeholders(columns.len())
        );
        Ok((sql, columns.len()))
    }

    async fn select_statement(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
        suffix: &str,
    ) -> Result<String, StoreError> {
        self.prepare_table(table).await?;
        self.check_columns(table, columns).await?;
        self.check_filter(table, filter).await?;

        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            column_list(columns)
        };
        let (where_clause, _) = filter.render();
        Ok(format!(
            "SELECT {projection} FROM {}{where_clause}{suffix}",
            quote_ident(table)
        ))
    }
}

fn encode_for_checksum<T: Serialize>(part: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec(part).map_err(|e| StoreError::Internal {
        message: format!("Failed to encode row for checksum: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn check_width(what: &str, expected: usize, actual: usize) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual,
        })
    }
}

fn assignments(columns: &[&str]) -> Result<String, StoreError> {
    if columns.is_empty() {
        return Err(StoreError::InvalidValue {
            field: "columns".to_string(),
            reason: "at least one column is required".to_string(),
        });
    }
    Ok(columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", "))
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
