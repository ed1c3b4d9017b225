//! Storage backend.
//!
//! This module provides:
//! - `SQLite` connection management
//! - Reserved catalog bootstrap and identifier rules
//! - User and grant administration
//! - Experiment table lifecycle and configuration
//! - Row-level locking with optimistic versioning
//! - A parameterized generic query layer
//!
//! # Architecture
//!
//! The storage layer uses `SQLite` with the `sqlx` crate for async operations.
//! Every session is a [`TeamStore`]; independent processes open their own
//! store against the same database file.
//!
//! The implementation is split across submodules:
//! - `core`: Session setup and authorization helpers
//! - `connection`: Pool handling and value binding
//! - `catalog`: Reserved tables, routine map, identifier validation
//! - `grants`: Grant engine and grant reconciliation
//! - `access`: User administration
//! - `table`: Table lifecycle, problem info and configuration
//! - `entry`: Row locks
//! - `query`: Generic insert, update, select and delete
//! - `transform`: Row flattening helpers
//! - `lookup`: Public address lookup
//!
//! # Example
//!
//! ```ignore
//! use team_store::storage::{LoginInfo, TeamStore, VarType};
//!
//! let store = TeamStore::open_path("./data/team.db", LoginInfo::superuser("pw")).await?;
//! store.create_table("zdt1").await?;
//! store.init_table("zdt1", VarType::Real, 30, 2, 0, true).await?;
//! ```

mod access;
mod catalog;
mod connection;
mod core;
mod entry;
mod grants;
mod lookup;
mod query;
mod table;
mod transform;
mod types;

pub use self::core::{LoginInfo, TeamStore};
pub use catalog::{
    is_reserved, routine_access, validate_identifier, validate_table_name, MAX_IDENTIFIER_LEN,
    RESERVED_TABLES, SUPERUSER,
};
pub use connection::{Connection, ExecResult};
pub use entry::{EntryLock, SYSTEM_COLUMNS};
pub use grants::{derive_grants, GrantDiff, SqliteGrantEngine};
pub use lookup::{is_private_host, HttpAddressLookup};
pub use query::{Condition, Filter, Op, TableData};
pub use table::{create_table_sql, trigger_sql};
pub use transform::{transform_data, transform_multiple_data, ColumnData, Field};
pub use types::{
    Access, ActiveUser, GrantObject, Minimize, ProblemInfo, Role, Routine, RoutineAccess,
    UserRecord, Value, VarType,
};
