//! Store traits shared by the MySQL and SQLite backends.
//!
//! The proxy only talks to these traits, so the backend is picked once at
//! startup and injected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::ArchivedExchange;

use crate::error::Result;
use crate::models::IgnoreHost;

/// Persisted backoff state keyed by destination.
///
/// Calls for different addresses never interfere with each other. Concurrent
/// calls for the same address are last-writer-wins, except that
/// [`record_seen`](Self::record_seen) increments atomically in the datastore.
#[async_trait]
pub trait IgnoreHostStore: Send + Sync {
    /// Fetches the record for `address`.
    async fn find(&self, address: &str) -> Result<Option<IgnoreHost>>;

    /// Returns true when connections to `address` should bypass interception.
    ///
    /// Unknown addresses are never ignored. Read-only.
    async fn is_ignored(&self, address: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .find(address)
            .await?
            .is_some_and(|host| host.is_ignored_at(now)))
    }

    /// Inserts the record with phase 1, or bumps the phase by one and
    /// refreshes `last_seen_at`.
    async fn record_seen(&self, address: &str, now: DateTime<Utc>) -> Result<()>;

    /// Deletes the record. Deleting an unknown address is not an error.
    async fn reset(&self, address: &str) -> Result<()>;
}

/// Append-only archive of classified exchanges.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Writes one exchange and returns its row id.
    async fn append(&self, exchange: &ArchivedExchange) -> Result<i64>;

    /// Reads an exchange back by row id.
    async fn get(&self, id: i64) -> Result<Option<ArchivedExchange>>;
}
