//! SQLite connection pool.
//!
//! A single Mutex-protected connection. Callers take it for the duration of
//! one operation and release it when the guard drops. The pool can be closed
//! once; later checkouts fail with [`StorageError::Closed`].

use std::path::Path;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use rusqlite::Connection;

use crate::error::{Result, StorageError};
use crate::schema::run_migrations;

/// Thread-safe SQLite connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl ConnectionPool {
    /// Create a new connection pool with a file-based database.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::setup_connection(&conn, true)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Create a new connection pool with an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::setup_connection(&conn, false)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<'_>> {
        let guard = MutexGuard::try_map(self.conn.lock(), Option::as_mut)
            .map_err(|_| StorageError::Closed)?;

        Ok(PooledConnection { guard })
    }

    /// Close the underlying connection. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        }
        Ok(())
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Setup connection pragmas for performance and safety.
    fn setup_connection(conn: &Connection, on_disk: bool) -> Result<()> {
        // Use WAL mode for better concurrent read performance
        if on_disk {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }

        // Sync mode for durability vs performance balance
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

        // Wait for locks held by other processes instead of failing immediately
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(())
    }
}

/// A connection borrowed from the pool.
pub struct PooledConnection<'a> {
    guard: MappedMutexGuard<'a, Connection>,
}

impl<'a> std::ops::Deref for PooledConnection<'a> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}
