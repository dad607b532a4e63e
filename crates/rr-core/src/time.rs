//! Time utilities for Remote Relay
//!
//! Persisted timestamps are Unix seconds (`i64`, as stored by SQLite);
//! in-memory liveness tracking uses milliseconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// A clock set before the Unix epoch reads as 0.
///
/// # Examples
/// ```
/// use rr_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get the current Unix timestamp in seconds, as stored in the database.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Calculate elapsed time in milliseconds since a given timestamp.
///
/// Returns 0 if the given time is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

/// Calculate elapsed time as a Duration since a given millisecond timestamp.
///
/// Returns Duration::ZERO if the given time is in the future.
pub fn elapsed_duration(since_millis: u64) -> Duration {
    Duration::from_millis(elapsed_millis(since_millis))
}
