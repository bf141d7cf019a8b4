//! Sluice Storage - persistence for the interception proxy.
//!
//! This crate holds the two tables the proxy writes:
//!
//! - `ignore_hosts`: backoff state per destination, read on every new TLS
//!   connection and updated when interception succeeds or fails
//! - `responses`: append-only archive of classified request/response pairs
//!
//! The proxy only depends on the [`IgnoreHostStore`] and [`ArchiveStore`]
//! traits. [`MySqlStore`] is the production backend; [`Database`] is an
//! embedded SQLite backend for single-node runs and tests.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use sluice_storage::{Database, IgnoreHostStore};
//!
//! # async fn demo() -> sluice_storage::Result<()> {
//! let db = Database::in_memory()?;
//!
//! db.record_seen("example.com", Utc::now()).await?;
//! assert!(db.is_ignored("example.com", Utc::now()).await?);
//! # Ok(())
//! # }
//! ```

pub mod config;
mod database;
pub mod error;
pub mod models;
mod mysql;
mod pool;
pub mod repository;
mod schema;
pub mod store;

pub use config::DatastoreConfig;
pub use database::Database;
pub use error::{Result, StorageError};
pub use models::IgnoreHost;
pub use mysql::MySqlStore;
pub use pool::ConnectionPool;
pub use repository::{IgnoreHostsRepo, ResponsesRepo};
pub use schema::{MYSQL_SCHEMA, SCHEMA_VERSION};
pub use store::{ArchiveStore, IgnoreHostStore};
