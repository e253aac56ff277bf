// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time source used to stamp skipped message keys.
use std::time::Duration;
#[cfg(not(test))]
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use mock_instant::thread_local::{SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};

/// Signed seconds since the UNIX epoch.
///
/// Persisted with every skipped message key to decide when it expires.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(seconds: i64) -> Self {
        Self(seconds)
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    /// Returns true if more than `lifetime` has passed between this timestamp and `now`.
    pub fn is_older_than(&self, now: Timestamp, lifetime: Duration) -> bool {
        let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        now.0.saturating_sub(self.0) > lifetime
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for i64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

/// Source of the current time, injected into every session.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Clock reading the system time.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = SystemTime::now();
        match now.duration_since(UNIX_EPOCH) {
            Ok(since_epoch) => {
                Timestamp(i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX))
            }
            // System clocks set before 1970 yield negative timestamps.
            Err(_) => UNIX_EPOCH
                .duration_since(now)
                .map(|before_epoch| {
                    let secs = i64::try_from(before_epoch.as_secs()).map_or(i64::MIN, |secs| -secs);
                    Timestamp(secs)
                })
                .unwrap_or_default(),
        }
    }
}
