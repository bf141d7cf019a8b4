//! Re-probe schedule for ignored hosts.
//!
//! Every time interception of a host is established its phase is bumped by
//! one. While a host is ignored, the phase selects how long the proxy waits
//! before it intercepts the host again:
//!
//! | phase | delay  |
//! |-------|--------|
//! | 1     | 1 min  |
//! | 2     | 5 min  |
//! | 3     | 30 min |
//! | 4     | 1 h    |
//! | 5     | 3 h    |
//! | 6     | 6 h    |
//! | 7     | 12 h   |
//! | 8     | 24 h   |
//! | 9     | 48 h   |
//!
//! Any other phase (0, or 10 and above) is never due: the host stays ignored
//! until its record is reset.

use chrono::{DateTime, Duration, Utc};

/// Highest phase that still has a re-probe delay.
pub const MAX_SCHEDULED_PHASE: u32 = 9;

/// Returns the delay before a host at `phase` may be re-probed, or `None`
/// when the phase is outside the schedule.
pub fn retry_delay(phase: u32) -> Option<Duration> {
    let delay = match phase {
        1 => Duration::minutes(1),
        2 => Duration::minutes(5),
        3 => Duration::minutes(30),
        4 => Duration::hours(1),
        5 => Duration::hours(3),
        6 => Duration::hours(6),
        7 => Duration::hours(12),
        8 => Duration::hours(24),
        9 => Duration::hours(48),
        _ => return None,
    };
    Some(delay)
}

/// Returns true when a host last seen at `last_seen_at` with the given phase
/// is due for a re-probe at `now`.
///
/// The comparison is strict: a host is due only once `last_seen_at + delay`
/// lies in the past.
pub fn is_due(last_seen_at: DateTime<Utc>, phase: u32, now: DateTime<Utc>) -> bool {
    let Some(delay) = retry_delay(phase) else {
        return false;
    };

    last_seen_at
        .checked_add_signed(delay)
        .is_some_and(|next_check_at| next_check_at < now)
}

/// Same as [`is_due`], evaluated against the current time.
pub fn is_due_now(last_seen_at: DateTime<Utc>, phase: u32) -> bool {
    is_due(last_seen_at, phase, Utc::now())
}

/// Returns when a host becomes due, or `None` if it never does.
pub fn next_check_at(last_seen_at: DateTime<Utc>, phase: u32) -> Option<DateTime<Utc>> {
    retry_delay(phase).and_then(|delay| last_seen_at.checked_add_signed(delay))
}
