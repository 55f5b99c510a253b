// ============================================
// File: crates/fleet-common/src/time.rs
// ============================================
//! # Time Utilities
//!
//! ## Creation Reason
//! Provides Unix timestamps for persisted records (jobs, audit events,
//! risk tokens) and a millisecond clock for identifiers.
//!
//! ## Main Functionality
//! - `Timestamp`: Unix timestamp in seconds, serialized transparently
//! - `unix_timestamp_millis`: current time in milliseconds
//!
//! ## ⚠️ Important Note for Next Developer
//! - Persisted timestamps are seconds; job ids carry milliseconds
//! - In-process deadlines (sessions, tickets) use `tokio::time::Instant`
//!   instead so paused-clock tests can drive them
//!
//! ## Last Modified
//! v0.1.0 - Initial time utilities

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================
// Timestamp
// ============================================

/// Unix timestamp in seconds.
///
/// # Example
/// ```
/// use fleet_common::time::Timestamp;
///
/// let now = Timestamp::now();
/// let later = now.plus_secs(60);
/// assert!(later > now);
/// assert_eq!(later.age_secs(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a new timestamp from Unix seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Creates a timestamp for the current time.
    #[must_use]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Self(secs)
    }

    /// Returns the Unix timestamp in seconds.
    #[must_use]
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// Returns a timestamp `secs` seconds after this one.
    #[must_use]
    pub fn plus_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)))
    }

    /// Returns how many seconds ago this timestamp was (0 if in the future).
    #[must_use]
    pub fn age_secs(&self) -> u64 {
        u64::try_from(Self::now().0 - self.0).unwrap_or(0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(secs: i64) -> Self {
        Self(secs)
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================
// Utility Functions
// ============================================

/// Returns the current Unix timestamp in milliseconds.
#[must_use]
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_expiry() {
        let past = Timestamp::from_secs(Timestamp::now().as_secs() - 10);
        assert!(past.age_secs() >= 10);

        let future = Timestamp::now().plus_secs(300);
        assert!(future > past);
        assert_eq!(future.age_secs(), 0);
    }

    #[test]
    fn test_timestamp_display() {
        let ts = Timestamp::from_secs(1_700_000_000);
        assert_eq!(ts.to_string(), "1700000000");
        assert_eq!(i64::from(ts), 1_700_000_000);
    }
}
