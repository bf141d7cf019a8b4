//! Database repositories for each table.

pub mod ignore_hosts;
pub mod responses;

pub use ignore_hosts::IgnoreHostsRepo;
pub use responses::ResponsesRepo;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Result, StorageError};

/// Formats a timestamp for a TEXT column.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`format_timestamp`].
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("bad timestamp {raw:?}: {e}")))
}
