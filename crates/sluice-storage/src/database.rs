//! Embedded SQLite backend.
//!
//! Useful for running a single proxy without a database server, and used by
//! the test suites. The async store traits run each operation on the blocking
//! thread pool so the runtime never waits on SQLite.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::ArchivedExchange;
use tracing::info;

use crate::error::{Result, StorageError};
use crate::models::IgnoreHost;
use crate::pool::ConnectionPool;
use crate::repository::{IgnoreHostsRepo, ResponsesRepo};
use crate::store::{ArchiveStore, IgnoreHostStore};

/// High-level SQLite database interface.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open (or create) a database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Close the database. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.pool.close()
    }

    // === Ignore hosts ===

    /// Get the backoff record for an address.
    pub fn find_ignore_host(&self, address: &str) -> Result<Option<IgnoreHost>> {
        let conn = self.pool.get()?;
        IgnoreHostsRepo::find(&conn, address)
    }

    /// Record that interception of an address was established.
    pub fn upsert_ignore_host(&self, address: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        IgnoreHostsRepo::upsert_seen(&conn, address, now)
    }

    /// Delete the backoff record for an address.
    pub fn delete_ignore_host(&self, address: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        IgnoreHostsRepo::delete(&conn, address)
    }

    /// Count tracked addresses.
    pub fn count_ignore_hosts(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        IgnoreHostsRepo::count(&conn)
    }

    // === Responses ===

    /// Append an archived exchange.
    pub fn insert_response(&self, exchange: &ArchivedExchange) -> Result<i64> {
        let conn = self.pool.get()?;
        ResponsesRepo::insert(&conn, exchange)
    }

    /// Get an archived exchange by ID.
    pub fn get_response(&self, id: i64) -> Result<Option<ArchivedExchange>> {
        let conn = self.pool.get()?;
        ResponsesRepo::get_by_id(&conn, id)
    }

    /// Count archived exchanges.
    pub fn count_responses(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        ResponsesRepo::count(&conn)
    }
}

/// Runs a database call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

#[async_trait]
impl IgnoreHostStore for Database {
    async fn find(&self, address: &str) -> Result<Option<IgnoreHost>> {
        let db = self.clone();
        let address = address.to_string();
        blocking(move || db.find_ignore_host(&address)).await
    }

    async fn record_seen(&self, address: &str, now: DateTime<Utc>) -> Result<()> {
        let db = self.clone();
        let address = address.to_string();
        blocking(move || db.upsert_ignore_host(&address, now)).await
    }

    async fn reset(&self, address: &str) -> Result<()> {
        let db = self.clone();
        let address = address.to_string();
        blocking(move || db.delete_ignore_host(&address).map(|_| ())).await
    }
}

#[async_trait]
impl ArchiveStore for Database {
    async fn append(&self, exchange: &ArchivedExchange) -> Result<i64> {
        let db = self.clone();
        let exchange = exchange.clone();
        blocking(move || db.insert_response(&exchange)).await
    }

    async fn get(&self, id: i64) -> Result<Option<ArchivedExchange>> {
        let db = self.clone();
        blocking(move || db.get_response(id)).await
    }
}
