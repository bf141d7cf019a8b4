//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::backoff;

/// Backoff state of one destination (`ignore_hosts` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreHost {
    /// SNI host name or formatted `host:port`.
    pub address: String,
    /// Last time interception of the destination was established.
    pub last_seen_at: DateTime<Utc>,
    /// Number of times interception was established.
    pub next_check_phase: u32,
}

impl IgnoreHost {
    /// Returns true when the destination is due for a re-probe at `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        backoff::is_due(self.last_seen_at, self.next_check_phase, now)
    }

    /// Returns true when connections to the destination should bypass
    /// interception at `now`.
    pub fn is_ignored_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_due_at(now)
    }

    /// When the destination becomes due, or `None` if it is ignored until reset.
    pub fn next_check_at(&self) -> Option<DateTime<Utc>> {
        backoff::next_check_at(self.last_seen_at, self.next_check_phase)
    }
}
