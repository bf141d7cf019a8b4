//! MySQL backend.
//!
//! The production datastore. One pool is created at startup and shared by
//! every store operation; it is bounded by
//! [`DatastoreConfig::max_connections`] and operations wait at most
//! [`DatastoreConfig::acquire_timeout`] for a connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{ArchivedExchange, ContentType};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::config::DatastoreConfig;
use crate::error::{Result, StorageError};
use crate::models::IgnoreHost;
use crate::schema::MYSQL_SCHEMA;
use crate::store::{ArchiveStore, IgnoreHostStore};

/// Store backed by a MySQL connection pool.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Connect to the datastore and make sure the schema exists.
    pub async fn connect(config: &DatastoreConfig) -> Result<Self> {
        info!(
            "Connecting to MySQL at {}:{}/{} (max {} connections)",
            config.host, config.port, config.database, config.max_connections
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options())
            .await?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they don't exist.
    pub async fn run_migrations(&self) -> Result<()> {
        for statement in MYSQL_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        debug!("MySQL schema ready");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("MySQL pool closed");
        }
    }

    /// Returns true once the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn map_closed(err: sqlx::Error) -> StorageError {
        match err {
            sqlx::Error::PoolClosed => StorageError::Closed,
            other => StorageError::MySql(other),
        }
    }
}

#[async_trait]
impl IgnoreHostStore for MySqlStore {
    async fn find(&self, address: &str) -> Result<Option<IgnoreHost>> {
        let row = sqlx::query(
            "SELECT address, last_seen_at, next_check_phase FROM ignore_hosts WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_closed)?;

        row.map(|row| map_ignore_host(&row)).transpose()
    }

    async fn record_seen(&self, address: &str, now: DateTime<Utc>) -> Result<()> {
        let now = now.naive_utc();
        sqlx::query(
            "INSERT INTO ignore_hosts (address, last_seen_at, next_check_phase) VALUES (?, ?, 1)
             ON DUPLICATE KEY UPDATE last_seen_at = ?, next_check_phase = next_check_phase + 1",
        )
        .bind(address)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::map_closed)?;

        Ok(())
    }

    async fn reset(&self, address: &str) -> Result<()> {
        sqlx::query("DELETE FROM ignore_hosts WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await
            .map_err(Self::map_closed)?;

        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for MySqlStore {
    async fn append(&self, exchange: &ArchivedExchange) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO responses (
                host, port, method, scheme, authority, path, path_hash, query,
                request_content, request_content_type, http_version, request_headers,
                status_code, response_headers, response_content, response_content_type
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&exchange.host)
        .bind(exchange.port)
        .bind(&exchange.method)
        .bind(&exchange.scheme)
        .bind(&exchange.authority)
        .bind(&exchange.path)
        .bind(&exchange.path_hash)
        .bind(&exchange.query)
        .bind(&exchange.request_content)
        .bind(exchange.request_content_type.as_str())
        .bind(&exchange.http_version)
        .bind(&exchange.request_headers)
        .bind(exchange.status_code)
        .bind(&exchange.response_headers)
        .bind(&exchange.response_content)
        .bind(exchange.response_content_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(Self::map_closed)?;

        i64::try_from(result.last_insert_id())
            .map_err(|_| StorageError::InvalidData("row id out of range".to_string()))
    }

    async fn get(&self, id: i64) -> Result<Option<ArchivedExchange>> {
        let row = sqlx::query(
            "SELECT host, port, method, scheme, authority, path, path_hash, query,
                    request_content, request_content_type, http_version, request_headers,
                    status_code, response_headers, response_content, response_content_type
             FROM responses WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_closed)?;

        row.map(|row| map_exchange(&row)).transpose()
    }
}

fn map_ignore_host(row: &MySqlRow) -> Result<IgnoreHost> {
    let last_seen: chrono::NaiveDateTime = row.try_get("last_seen_at")?;
    Ok(IgnoreHost {
        address: row.try_get("address")?,
        last_seen_at: last_seen.and_utc(),
        next_check_phase: row.try_get("next_check_phase")?,
    })
}

fn map_exchange(row: &MySqlRow) -> Result<ArchivedExchange> {
    Ok(ArchivedExchange {
        host: row.try_get("host")?,
        port: row.try_get("port")?,
        method: row.try_get("method")?,
        scheme: row.try_get("scheme")?,
        authority: row.try_get("authority")?,
        path: row.try_get("path")?,
        path_hash: row.try_get("path_hash")?,
        query: row.try_get("query")?,
        request_content: row.try_get("request_content")?,
        request_content_type: content_type_column(row, "request_content_type")?,
        http_version: row.try_get("http_version")?,
        request_headers: row.try_get("request_headers")?,
        status_code: row.try_get("status_code")?,
        response_headers: row.try_get("response_headers")?,
        response_content: row.try_get("response_content")?,
        response_content_type: content_type_column(row, "response_content_type")?,
    })
}

fn content_type_column(row: &MySqlRow, column: &str) -> Result<ContentType> {
    let raw: String = row.try_get(column)?;
    ContentType::parse(&raw)
        .ok_or_else(|| StorageError::InvalidData(format!("unknown content type {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_pool_reports_closed_after_close() {
        let config = DatastoreConfig::from_lookup(|key| match key {
            "DB_HOST" => Some("127.0.0.1".to_string()),
            "DB_USER" => Some("sluice".to_string()),
            "DB_PASSWORD" => Some("secret".to_string()),
            "DB_NAME" => Some("sluice".to_string()),
            _ => None,
        })
        .unwrap();

        let pool = MySqlPoolOptions::new().connect_lazy_with(config.connect_options());
        let store = MySqlStore::from_pool(pool);
        assert!(!store.is_closed());

        store.close().await;
        store.close().await;
        assert!(store.is_closed());

        let err = store.reset("example.com").await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }
}
