//! Wall-clock time for devices without a reliable clock source
//!
//! Epochs come from the relay and are interpolated with device uptime
//! between syncs. Recurring work is scheduled against aligned epochs,
//! with an hour-tick counter standing in while no sync has succeeded.

pub mod clock;
pub mod schedule;
pub mod tasks;

pub use clock::{ClockSync, HourTicks, MonotonicUptime, Uptime, DEFAULT_SYNC_INTERVAL};
pub use schedule::{next_aligned, next_aligned_at, DriftPolicy, ScheduleSpec};
pub use tasks::{wake_delay, Cadence, TaskTable};

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_HOUR: i64 = 3_600;
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Seconds since the Unix epoch as reported by the relay.
///
/// Zero and negative values mean "unknown": the device has never
/// completed a time sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub i64);

impl Epoch {
    pub const UNKNOWN: Epoch = Epoch(0);

    pub fn from_secs(secs: i64) -> Self {
        Epoch(secs)
    }

    pub fn as_secs(self) -> i64 {
        self.0
    }

    pub fn is_known(self) -> bool {
        self.0 > 0
    }

    pub fn plus_secs(self, secs: i64) -> Self {
        Epoch(self.0.saturating_add(secs))
    }

    /// Seconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    pub fn secs_since(self, earlier: Epoch) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Midnight UTC of the day containing this epoch.
    pub fn start_of_day(self) -> Epoch {
        Epoch(self.0.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY)
    }

    /// Calendar date (UTC), or `None` while the epoch is unknown.
    pub fn date(self) -> Option<NaiveDate> {
        if !self.is_known() {
            return None;
        }
        DateTime::<Utc>::from_timestamp(self.0, 0).map(|dt| dt.date_naive())
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_known() {
            return write!(f, "unknown");
        }
        match DateTime::<Utc>::from_timestamp(self.0, 0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%SZ")),
            None => write!(f, "{}", self.0),
        }
    }
}
