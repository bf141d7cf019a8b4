//! Ignore-hosts repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{format_timestamp, parse_timestamp};
use crate::error::Result;
use crate::models::IgnoreHost;

/// Repository for `ignore_hosts` operations.
pub struct IgnoreHostsRepo;

impl IgnoreHostsRepo {
    /// Get the record for an address.
    pub fn find(conn: &Connection, address: &str) -> Result<Option<IgnoreHost>> {
        let row = conn
            .query_row(
                "SELECT address, last_seen_at, next_check_phase
                 FROM ignore_hosts WHERE address = ?1",
                [address],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(address, last_seen_at, next_check_phase)| {
            Ok(IgnoreHost {
                address,
                last_seen_at: parse_timestamp(&last_seen_at)?,
                next_check_phase,
            })
        })
        .transpose()
    }

    /// Insert with phase 1, or bump the phase and refresh `last_seen_at`.
    pub fn upsert_seen(conn: &Connection, address: &str, now: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "INSERT INTO ignore_hosts (address, last_seen_at, next_check_phase)
             VALUES (?1, ?2, 1)
             ON CONFLICT(address) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                next_check_phase = next_check_phase + 1",
            params![address, format_timestamp(now)],
        )?;
        Ok(())
    }

    /// Delete the record. Returns whether a row was removed.
    pub fn delete(conn: &Connection, address: &str) -> Result<bool> {
        let affected = conn.execute("DELETE FROM ignore_hosts WHERE address = ?1", [address])?;
        Ok(affected > 0)
    }

    /// Count tracked addresses.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM ignore_hosts", [], |row| row.get(0))?;
        Ok(count)
    }
}
