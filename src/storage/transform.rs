//! Row data normalization.
//!
//! Experiment rows mix scalars with variable-length vectors (design
//! variables, objectives, constraints). These helpers flatten them into
//! typed values in column order before binding.

use serde::{Deserialize, Serialize};

use super::types::Value;
use crate::error::StoreError;

/// One field of a single row: a scalar or a vector spanning several columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    /// One column.
    Scalar(Value),
    /// Consecutive columns.
    Vector(Vec<Value>),
}

impl Field {
    /// Number of columns this field covers.
    #[must_use]
    pub fn width(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Vector(values) => values.len(),
        }
    }
}

impl From<Value> for Field {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Self::Scalar(Value::Real(value))
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Self::Scalar(Value::Integer(value))
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self::Scalar(Value::from(value))
    }
}

impl From<Vec<f64>> for Field {
    fn from(values: Vec<f64>) -> Self {
        Self::Vector(values.into_iter().map(Value::from).collect())
    }
}

impl From<&[f64]> for Field {
    fn from(values: &[f64]) -> Self {
        Self::Vector(values.iter().copied().map(Value::from).collect())
    }
}

impl From<Vec<Value>> for Field {
    fn from(values: Vec<Value>) -> Self {
        Self::Vector(values)
    }
}

/// One block of a multi-row batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnData {
    /// One value per row.
    Column(Vec<Value>),
    /// One vector per row, all of the same width.
    Matrix(Vec<Vec<Value>>),
}

impl ColumnData {
    /// Number of rows in this block.
    #[must_use]
    pub fn rows(&self) -> usize {
        match self {
            Self::Column(values) => values.len(),
            Self::Matrix(rows) => rows.len(),
        }
    }
}

impl From<Vec<f64>> for ColumnData {
    fn from(values: Vec<f64>) -> Self {
        Self::Column(values.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<Vec<f64>>> for ColumnData {
    fn from(rows: Vec<Vec<f64>>) -> Self {
        Self::Matrix(
            rows.into_iter()
                .map(|row| row.into_iter().map(Value::from).collect())
                .collect(),
        )
    }
}

impl From<Vec<Value>> for ColumnData {
    fn from(values: Vec<Value>) -> Self {
        Self::Column(values)
    }
}

/// Flatten the fields of one row into values in column order.
#[must_use]
pub fn transform_data(fields: &[Field]) -> Vec<Value> {
    let mut row = Vec::with_capacity(fields.iter().map(Field::width).sum());
    for field in fields {
        match field {
            Field::Scalar(value) => row.push(value.clone()),
            Field::Vector(values) => row.extend(values.iter().cloned()),
        }
    }
    row
}

/// Join column blocks side by side into rows.
///
/// # Errors
///
/// Returns [`StoreError::DimensionMismatch`] if blocks disagree on the row
/// count or a matrix is ragged.
pub fn transform_multiple_data(blocks: &[ColumnData]) -> Result<Vec<Vec<Value>>, StoreError> {
    let Some(first) = blocks.first() else {
        return Ok(Vec::new());
    };
    let n_rows = first.rows();

    let mut rows: Vec<Vec<Value>> = vec![Vec::new(); n_rows];
    for block in blocks {
        if block.rows() != n_rows {
            return Err(StoreError::DimensionMismatch {
                what: "rows".to_string(),
                expected: n_rows,
                actual: block.rows(),
            });
        }
        match block {
            ColumnData::Column(values) => {
                for (row, value) in rows.iter_mut().zip(values) {
                    row.push(value.clone());
                }
            }
            ColumnData::Matrix(matrix) => {
                let width = matrix.first().map_or(0, Vec::len);
                for (row, values) in rows.iter_mut().zip(matrix) {
                    if values.len() != width {
                        return Err(StoreError::DimensionMismatch {
                            what: "matrix width".to_string(),
                            expected: width,
                            actual: values.len(),
                        });
                    }
                    row.extend(values.iter().cloned());
                }
            }
        }
    }
    Ok(rows)
}
