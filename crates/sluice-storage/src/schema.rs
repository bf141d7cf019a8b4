//! Database schema and migrations.
//!
//! Both backends carry the same two tables: `responses` (append-only archive)
//! and `ignore_hosts` (backoff state, unique on `address`).

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current SQLite schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// MySQL DDL, executed one statement at a time on startup.
pub const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS `responses` (
        `id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `host` VARCHAR(255) NOT NULL,
        `port` SMALLINT UNSIGNED NOT NULL,
        `method` VARCHAR(32) NOT NULL,
        `scheme` VARCHAR(16) NOT NULL,
        `authority` VARCHAR(255) NOT NULL,
        `path` TEXT NOT NULL,
        `path_hash` CHAR(32) NOT NULL,
        `query` LONGTEXT NOT NULL,
        `request_content` LONGTEXT NULL,
        `request_content_type` VARCHAR(8) NOT NULL,
        `http_version` VARCHAR(16) NOT NULL,
        `request_headers` LONGTEXT NOT NULL,
        `status_code` SMALLINT UNSIGNED NOT NULL,
        `response_headers` LONGTEXT NOT NULL,
        `response_content` LONGTEXT NULL,
        `response_content_type` VARCHAR(8) NOT NULL,
        `created_at` DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        PRIMARY KEY (`id`),
        KEY `idx_responses_host_path_hash` (`host`, `path_hash`)
    ) DEFAULT CHARSET = utf8mb4",
    "CREATE TABLE IF NOT EXISTS `ignore_hosts` (
        `address` VARCHAR(255) NOT NULL,
        `last_seen_at` DATETIME(6) NOT NULL,
        `next_check_phase` INT UNSIGNED NOT NULL DEFAULT 1,
        PRIMARY KEY (`address`)
    ) DEFAULT CHARSET = utf8mb4",
];

/// Run all pending SQLite migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: archive and ignore-host tables.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: Initial schema");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            method TEXT NOT NULL,
            scheme TEXT NOT NULL,
            authority TEXT NOT NULL,
            path TEXT NOT NULL,
            path_hash TEXT NOT NULL,
            query TEXT NOT NULL,
            request_content TEXT,
            request_content_type TEXT NOT NULL,
            http_version TEXT NOT NULL,
            request_headers TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            response_headers TEXT NOT NULL,
            response_content TEXT,
            response_content_type TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        [],
    )?;

    // Lookup of every capture of one endpoint
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_host_path_hash ON responses (host, path_hash)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ignore_hosts (
            address TEXT PRIMARY KEY,
            last_seen_at TEXT NOT NULL,
            next_check_phase INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    Ok(())
}
