//! Storage types for the team data store.
//!
//! This module defines:
//! - [`Value`]: A typed cell bound into or decoded from a statement
//! - [`Role`], [`Access`]: User policy attributes
//! - [`Routine`], [`RoutineAccess`]: The routine access map vocabulary
//! - [`GrantObject`]: A table or routine a principal can be granted
//! - [`VarType`], [`Minimize`], [`ProblemInfo`]: Experiment schema metadata
//! - [`UserRecord`], [`ActiveUser`]: User listings

#![allow(clippy::should_implement_trait)]

use serde::{Deserialize, Serialize};

use crate::config::SecretString;
use crate::error::StoreError;

/// A typed value bound as a statement parameter or decoded from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    #[default]
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double-precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Boolean, stored as 0/1.
    Bool(bool),
}

impl Value {
    /// Returns true for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value, if it has one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Null | Self::Text(_) => None,
        }
    }

    /// Integer view of the value, if it has one.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            Self::Null | Self::Real(_) | Self::Text(_) => None,
        }
    }

    /// Text view of the value, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Real(f64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only team member.
    Viewer,
    /// Runs evaluations: initializes tables, locks entries, edits configs.
    Operator,
    /// Full access to every routine.
    Admin,
}

impl Role {
    /// Convert to storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
            Self::Admin => "admin",
        }
    }

    /// Parse a role name, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] for unknown roles.
    pub fn from_str(s: &str) -> Result<Self, StoreError> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(Self::Viewer),
            "operator" => Ok(Self::Operator),
            "admin" => Ok(Self::Admin),
            _ => Err(StoreError::InvalidValue {
                field: "role".to_string(),
                reason: format!("unknown role '{s}'"),
            }),
        }
    }
}

/// A user's table-grant scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Access {
    /// Every initialized table (`*`).
    All,
    /// No table (`''`).
    #[default]
    None,
    /// Exactly one table.
    Table(String),
}

impl Access {
    /// Convert to storage string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "*",
            Self::None => "",
            Self::Table(name) => name,
        }
    }

    /// Parse from storage string.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "*" => Self::All,
            "" => Self::None,
            name => Self::Table(name.to_string()),
        }
    }

    /// Whether this scope covers the given table, ignoring ASCII case.
    #[must_use]
    pub fn covers(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Table(name) => name.eq_ignore_ascii_case(table),
        }
    }
}

/// Routines whose execution is granted per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routine {
    /// Verify a user's role and access.
    LoginVerify,
    /// Registered-or-initialized existence predicate.
    CheckTableExist,
    /// Initialized existence predicate.
    CheckInitedTableExist,
    /// Bind a schema to a registered table.
    InitTable,
    /// Read a table's problem metadata.
    QueryProblem,
    /// Write a table's config document.
    UpdateConfig,
    /// Read a table's config document.
    QueryConfig,
    /// Read an entry's lock flag.
    CheckEntry,
    /// Set an entry's lock flag.
    LockEntry,
    /// Clear an entry's lock flag.
    ReleaseEntry,
}

impl Routine {
    /// Every routine, in catalog order.
    pub const ALL: [Self; 10] = [
        Self::LoginVerify,
        Self::CheckTableExist,
        Self::CheckInitedTableExist,
        Self::InitTable,
        Self::QueryProblem,
        Self::UpdateConfig,
        Self::QueryConfig,
        Self::CheckEntry,
        Self::LockEntry,
        Self::ReleaseEntry,
    ];

    /// Routine name as granted.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LoginVerify => "login_verify",
            Self::CheckTableExist => "check_table_exist",
            Self::CheckInitedTableExist => "check_inited_table_exist",
            Self::InitTable => "init_table",
            Self::QueryProblem => "query_problem",
            Self::UpdateConfig => "update_config",
            Self::QueryConfig => "query_config",
            Self::CheckEntry => "check_entry",
            Self::LockEntry => "lock_entry",
            Self::ReleaseEntry => "release_entry",
        }
    }

    /// Parse a routine name.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

/// Minimal role required to execute a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutineAccess {
    /// Any role.
    All,
    /// The given role or a higher one.
    Min(Role),
}

impl RoutineAccess {
    /// Convert to storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Min(role) => role.as_str(),
        }
    }

    /// Parse from storage string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] if the role is unknown.
    pub fn from_str(s: &str) -> Result<Self, StoreError> {
        if s.eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            Role::from_str(s).map(Self::Min)
        }
    }

    /// Whether a user with `role` may execute the routine.
    #[must_use]
    pub fn permits(&self, role: Role) -> bool {
        match self {
            Self::All => true,
            Self::Min(min) => role >= *min,
        }
    }
}

/// An object a principal can be granted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GrantObject {
    /// Full privileges on one experiment table.
    Table(String),
    /// Execute privilege on one routine.
    Routine(Routine),
}

impl GrantObject {
    /// Object kind as stored in the grant cache.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Table(_) => "table",
            Self::Routine(_) => "routine",
        }
    }

    /// Object name as stored in the grant cache.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Table(name) => name,
            Self::Routine(routine) => routine.as_str(),
        }
    }

    /// Rebuild from the grant cache's `(kind, name)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Internal`] for unrecognized pairs.
    pub fn from_parts(kind: &str, name: &str) -> Result<Self, StoreError> {
        match kind {
            "table" => Ok(Self::Table(name.to_string())),
            "routine" => Routine::from_str(name).map(Self::Routine).ok_or_else(|| {
                StoreError::Internal {
                    message: format!("unknown routine in grant cache: {name}"),
                }
            }),
            _ => Err(StoreError::Internal {
                message: format!("unknown grant kind: {kind}"),
            }),
        }
    }
}

/// Type of an experiment's design variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    /// Continuous variables.
    #[default]
    Real,
    /// Integer variables.
    Integer,
    /// 0/1 variables.
    Binary,
}

impl VarType {
    /// Convert to storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Integer => "integer",
            Self::Binary => "binary",
        }
    }

    /// Parse from storage string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] for unknown types.
    pub fn from_str(s: &str) -> Result<Self, StoreError> {
        match s.to_lowercase().as_str() {
            "real" | "continuous" => Ok(Self::Real),
            "integer" | "int" => Ok(Self::Integer),
            "binary" => Ok(Self::Binary),
            _ => Err(StoreError::InvalidValue {
                field: "var_type".to_string(),
                reason: format!("unknown variable type '{s}'"),
            }),
        }
    }

    /// Column type used for design variables.
    #[must_use]
    pub const fn column_type(&self) -> &'static str {
        match self {
            Self::Real => "REAL",
            Self::Integer | Self::Binary => "INTEGER",
        }
    }
}

/// Per-objective optimization direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Minimize {
    /// One flag broadcast to every objective.
    All(bool),
    /// One flag per objective.
    PerObjective(Vec<bool>),
}

impl Minimize {
    /// Serialize the way the problem metadata stores it (`True` or `True,False`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DimensionMismatch`] if a per-objective sequence
    /// does not have exactly `n_obj` flags.
    pub fn encode(&self, n_obj: usize) -> Result<String, StoreError> {
        match self {
            Self::All(flag) => Ok(encode_flag(*flag).to_string()),
            Self::PerObjective(flags) => {
                if flags.len() != n_obj {
                    return Err(StoreError::DimensionMismatch {
                        what: "minimize".to_string(),
                        expected: n_obj,
                        actual: flags.len(),
                    });
                }
                Ok(flags
                    .iter()
                    .map(|f| encode_flag(*f))
                    .collect::<Vec<_>>()
                    .join(","))
            }
        }
    }

    /// Parse the stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Internal`] if any flag is not `True`/`False`.
    pub fn decode(s: &str) -> Result<Self, StoreError> {
        if s.contains(',') {
            s.split(',')
                .map(decode_flag)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::PerObjective)
        } else {
            decode_flag(s).map(Self::All)
        }
    }

    /// Flags expanded to `n_obj` objectives.
    #[must_use]
    pub fn flags(&self, n_obj: usize) -> Vec<bool> {
        match self {
            Self::All(flag) => vec![*flag; n_obj],
            Self::PerObjective(flags) => flags.clone(),
        }
    }
}

impl From<bool> for Minimize {
    fn from(value: bool) -> Self {
        Self::All(value)
    }
}

impl From<Vec<bool>> for Minimize {
    fn from(value: Vec<bool>) -> Self {
        Self::PerObjective(value)
    }
}

impl From<&[bool]> for Minimize {
    fn from(value: &[bool]) -> Self {
        Self::PerObjective(value.to_vec())
    }
}

const fn encode_flag(flag: bool) -> &'static str {
    if flag {
        "True"
    } else {
        "False"
    }
}

fn decode_flag(s: &str) -> Result<bool, StoreError> {
    match s.trim() {
        "True" => Ok(true),
        "False" => Ok(false),
        other => Err(StoreError::Internal {
            message: format!("invalid minimize flag '{other}'"),
        }),
    }
}

/// Problem metadata bound to an initialized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemInfo {
    /// Table name.
    pub name: String,
    /// Design variable type.
    pub var_type: VarType,
    /// Number of design variables.
    pub n_var: usize,
    /// Number of objectives.
    pub n_obj: usize,
    /// Number of constraints.
    pub n_constr: usize,
    /// Optimization direction.
    pub minimize: Minimize,
}

impl ProblemInfo {
    /// Design variable column names (`x1..xN`).
    #[must_use]
    pub fn variable_columns(&self) -> Vec<String> {
        numbered("x", self.n_var)
    }

    /// Objective column names (`f1..fM`).
    #[must_use]
    pub fn objective_columns(&self) -> Vec<String> {
        numbered("f", self.n_obj)
    }

    /// Constraint column names (`g1..gK`).
    #[must_use]
    pub fn constraint_columns(&self) -> Vec<String> {
        numbered("g", self.n_constr)
    }
}

pub(crate) fn numbered(prefix: &str, n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{prefix}{i}")).collect()
}

/// A row of the user policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// User name.
    pub name: String,
    /// Password (redacted in debug output).
    pub passwd: SecretString,
    /// Role.
    pub role: Role,
    /// Table-grant scope.
    pub access: Access,
}

/// A user with at least one open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    /// User name.
    pub name: String,
    /// Host the session originates from.
    pub host: String,
}
