//! Team Data Store
//!
//! A shared experiment store for teams running optimization studies.
//! Every worker opens its own session against one `SQLite` database and
//! exchanges candidate solutions through experiment tables.
//!
//! # Features
//!
//! - Experiment table lifecycle bound to a problem definition
//! - Role based users (`viewer`, `operator`, `admin`) with per-table access
//! - Grants kept in sync with the user catalog
//! - Row locks with lease expiry and optimistic versioning
//! - Parameterized generic query layer
//!
//! # Quick Start
//!
//! ```bash
//! TEAM_USER=root TEAM_PASSWORD=secret ./team-store bootstrap
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐               ┌──────────────┐
//! │ worker A │── TeamStore ─▶│              │
//! ├──────────┤               │    SQLite    │
//! │ worker B │── TeamStore ─▶│  (WAL mode)  │
//! ├──────────┤               │              │
//! │  admin   │── TeamStore ─▶│              │
//! └──────────┘               └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod storage;
pub mod traits;
