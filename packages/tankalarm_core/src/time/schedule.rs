//! Aligned schedules: "next 06:00, then every 6h"
//!
//! Fire times are anchored to an hour of day rather than to device uptime,
//! so a device that reboots or sleeps through a slot lands back on the same
//! grid once it knows the time again.

use serde::{Deserialize, Serialize};

use super::{Epoch, SECONDS_PER_DAY, SECONDS_PER_HOUR, SECONDS_PER_MINUTE};

/// How slots behave when the interval does not divide a day evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Slots continue past midnight on the interval grid, so the first slot
    /// after midnight may fall before the base hour.
    #[default]
    Free,
    /// The grid restarts at the base hour every calendar day.
    ReanchorDaily,
}

/// A recurring, day-anchored fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub base_hour: u8,
    #[serde(default)]
    pub base_minute: u8,
    pub interval_secs: i64,
    #[serde(default)]
    pub drift: DriftPolicy,
}

impl ScheduleSpec {
    pub fn new(base_hour: u8, interval_secs: i64) -> Self {
        Self {
            base_hour,
            base_minute: 0,
            interval_secs,
            drift: DriftPolicy::Free,
        }
    }

    /// Once a day at `hour:minute`.
    pub fn daily(hour: u8, minute: u8) -> Self {
        Self {
            base_hour: hour,
            base_minute: minute,
            interval_secs: SECONDS_PER_DAY,
            drift: DriftPolicy::Free,
        }
    }

    pub fn with_drift(mut self, drift: DriftPolicy) -> Self {
        self.drift = drift;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.base_hour < 24 && self.base_minute < 60 && self.interval_secs > 0
    }

    /// Smallest aligned instant strictly after `epoch`.
    pub fn next_after(&self, epoch: Epoch) -> Option<Epoch> {
        if !self.is_valid() {
            return None;
        }
        let offset = self.base_hour as i64 * SECONDS_PER_HOUR
            + self.base_minute as i64 * SECONDS_PER_MINUTE;
        next_aligned_at(epoch, offset, self.interval_secs, self.drift)
    }
}

/// Next fire time at `base_hour` plus whole multiples of `interval_secs`,
/// strictly after `epoch`.
///
/// Returns `None` for a negative epoch, a zero interval, an hour past 23,
/// or a next slot beyond the representable range.
pub fn next_aligned(epoch: Epoch, base_hour: u8, interval_secs: i64) -> Option<Epoch> {
    if base_hour > 23 {
        return None;
    }
    next_aligned_at(
        epoch,
        base_hour as i64 * SECONDS_PER_HOUR,
        interval_secs,
        DriftPolicy::Free,
    )
}

/// Like [`next_aligned`] with the anchor given as seconds into the day.
pub fn next_aligned_at(
    epoch: Epoch,
    offset_secs: i64,
    interval_secs: i64,
    drift: DriftPolicy,
) -> Option<Epoch> {
    if epoch.0 < 0 || interval_secs <= 0 || !(0..SECONDS_PER_DAY).contains(&offset_secs) {
        return None;
    }

    let day_start = epoch.start_of_day().0;
    let next_day = day_start.checked_add(SECONDS_PER_DAY)?;
    let mut candidate = day_start + offset_secs;
    if candidate <= epoch.0 {
        let steps = (epoch.0 - candidate) / interval_secs + 1;
        candidate = steps
            .checked_mul(interval_secs)
            .and_then(|span| candidate.checked_add(span))?;
    }

    if drift == DriftPolicy::ReanchorDaily && candidate >= next_day {
        candidate = next_day + offset_secs;
    }

    Some(Epoch(candidate))
}
