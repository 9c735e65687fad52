//! Wire bodies exchanged between devices, the coordinator and viewers

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::identity::DeviceId;
use crate::recovery::RecoveryNotice;
use crate::time::Epoch;

/// One tank level sample, sent on `telemetry.o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub client: DeviceId,
    pub site: String,
    pub tank: u8,
    #[serde(default)]
    pub label: String,
    /// Level in inches.
    pub level: f64,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmKind {
    High,
    Low,
    Clear,
    /// The device came back from an unclean shutdown.
    Recovery(RecoveryNotice),
}

impl AlarmKind {
    /// Whether this kind leaves the tank in an alarm state.
    pub fn is_active(&self) -> bool {
        matches!(self, AlarmKind::High | AlarmKind::Low)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlarmKind::High => "high",
            AlarmKind::Low => "low",
            AlarmKind::Clear => "clear",
            AlarmKind::Recovery(_) => "recovery",
        }
    }
}

/// Sent on `alarm.o`. Recovery notices use tank 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmReport {
    pub client: DeviceId,
    pub site: String,
    pub tank: u8,
    pub level: f64,
    pub epoch: Epoch,
    pub alarm: AlarmKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TankLevel {
    pub tank: u8,
    pub level: f64,
}

/// Once-a-day roll-up, sent on `daily.o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub client: DeviceId,
    pub site: String,
    pub date: NaiveDate,
    pub epoch: Epoch,
    pub tanks: Vec<TankLevel>,
}

/// The coordinator's view of one tank, as served by `/api/tanks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankRecord {
    pub client: DeviceId,
    pub site: String,
    pub tank: u8,
    #[serde(default)]
    pub label: String,
    pub level_inches: f64,
    pub alarm_active: bool,
    #[serde(default)]
    pub last_alarm: Option<String>,
    pub last_update: Epoch,
    #[serde(default)]
    pub stale: bool,
}

/// Fleet snapshot published to viewers on `viewer_summary.o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub generated: Epoch,
    pub tanks: Vec<TankRecord>,
}
