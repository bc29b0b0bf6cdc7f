//! Monotonic-ish wall-clock types used throughout the reactor and protocol engine.
//!
//! Every timeout in the system is expressed in reactor ticks, but the reactor itself
//! schedules wakeups against real time, so we need a small absolute/relative time pair.
//! Modeled after the `LocalTime`/`LocalDuration` split used by the poll reactor this
//! crate grew out of: an absolute instant plus a duration that converts cleanly to and
//! from [`std::time::Duration`].

use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// An absolute point in time, measured as a duration since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime(Duration);

impl LocalTime {
    /// The current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Seconds since the Unix epoch, saturating.
    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl From<SystemTime> for LocalTime {
    fn from(t: SystemTime) -> Self {
        Self(t.duration_since(UNIX_EPOCH).unwrap_or_default())
    }
}

impl Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime(self.0 + other.0)
    }
}

impl Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.0.saturating_sub(other.0))
    }
}

/// A relative duration. Converts losslessly to/from [`std::time::Duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LocalDuration(Duration);

impl LocalDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub const fn from_mins(mins: u64) -> Self {
        Self(Duration::from_secs(mins * 60))
    }

    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }
}

impl From<LocalDuration> for Duration {
    fn from(d: LocalDuration) -> Duration {
        d.0
    }
}

impl From<Duration> for LocalDuration {
    fn from(d: Duration) -> LocalDuration {
        LocalDuration(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_sub_roundtrip() {
        let t0 = LocalTime::now();
        let t1 = t0 + LocalDuration::from_secs(5);

        assert_eq!(t1 - t0, LocalDuration::from_secs(5));
    }

    #[test]
    fn mins_to_millis() {
        assert_eq!(LocalDuration::from_mins(1).as_millis(), 60_000);
    }
}
