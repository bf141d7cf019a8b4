//! Datastore connection settings.
//!
//! Read from the environment:
//!
//! | variable             | required | default |
//! |----------------------|----------|---------|
//! | `DB_HOST`            | yes      |         |
//! | `DB_PORT`            | no       | 3306    |
//! | `DB_USER`            | yes      |         |
//! | `DB_PASSWORD`        | yes      |         |
//! | `DB_NAME`            | yes      |         |
//! | `DB_MAX_CONNECTIONS` | no       | 10      |

use std::fmt;
use std::time::Duration;

use sqlx::mysql::MySqlConnectOptions;

use crate::error::{Result, StorageError};

/// Default MySQL port.
pub const DEFAULT_PORT: u16 = 3306;

/// Default pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// How long an operation waits for a pooled connection before failing.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the MySQL datastore.
#[derive(Clone, PartialEq, Eq)]
pub struct DatastoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl fmt::Debug for DatastoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl DatastoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| StorageError::Config(format!("{key} is not set")))
        };

        let port = match lookup("DB_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| StorageError::Config(format!("DB_PORT is not a valid port: {raw}")))?,
            None => DEFAULT_PORT,
        };

        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                StorageError::Config(format!("DB_MAX_CONNECTIONS is not a number: {raw}"))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            host: required("DB_HOST")?,
            port,
            user: required("DB_USER")?,
            password: required("DB_PASSWORD")?,
            database: required("DB_NAME")?,
            max_connections,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        })
    }

    /// Connection options for the MySQL driver.
    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .charset("utf8mb4")
    }
}
