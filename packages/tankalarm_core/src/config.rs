//! Process settings and the device configuration pushed by the coordinator

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::time::{DriftPolicy, Epoch, ScheduleSpec, SECONDS_PER_MINUTE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for one device, coordinator or viewer process, read from a
/// JSON file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub data_dir: PathBuf,
    /// Relay identity of this node.
    pub device_id: String,
    pub site: String,
    /// Notecard request bridge, e.g. `http://127.0.0.1:8088/req`.
    pub relay_url: String,
    pub relay_timeout_secs: u64,
    pub time_sync_interval_secs: u64,
    pub persist_interval_secs: i64,
    pub heartbeat_interval_secs: i64,
    pub watchdog_timeout_secs: u64,
    pub drift_policy: DriftPolicy,
    pub http_port: u16,
    pub summary_base_hour: u8,
    pub summary_interval_secs: i64,
    pub drain_interval_secs: i64,
    /// Records older than this are reported stale.
    pub stale_after_secs: i64,
    pub command_retry_secs: i64,
    pub command_max_attempts: u32,
    pub max_records: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tankalarm-data"),
            device_id: "dev:local".to_string(),
            site: "Site".to_string(),
            relay_url: "http://127.0.0.1:8088/req".to_string(),
            relay_timeout_secs: 10,
            time_sync_interval_secs: 6 * 60 * 60,
            persist_interval_secs: 15 * SECONDS_PER_MINUTE,
            heartbeat_interval_secs: 5 * SECONDS_PER_MINUTE,
            watchdog_timeout_secs: 30,
            drift_policy: DriftPolicy::Free,
            http_port: 8080,
            summary_base_hour: 6,
            summary_interval_secs: 6 * 60 * 60,
            drain_interval_secs: 5 * SECONDS_PER_MINUTE,
            stale_after_secs: 26 * 60 * 60,
            command_retry_secs: 60 * 60,
            command_max_attempts: 5,
            max_records: 64,
        }
    }
}

impl NodeSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{:?}: {}", path, e)))?;
        let settings: Self =
            serde_json::from_str(&json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device_id is empty".to_string()));
        }
        if !self.summary_schedule().is_valid() {
            return Err(ConfigError::Invalid(format!(
                "summary schedule {}h every {}s",
                self.summary_base_hour, self.summary_interval_secs
            )));
        }
        for (name, value) in [
            ("persist_interval_secs", self.persist_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("drain_interval_secs", self.drain_interval_secs),
            ("stale_after_secs", self.stale_after_secs),
            ("command_retry_secs", self.command_retry_secs),
        ] {
            if value <= 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.max_records == 0 {
            return Err(ConfigError::Invalid("max_records must be positive".to_string()));
        }
        Ok(())
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn time_sync_interval(&self) -> Duration {
        Duration::from_secs(self.time_sync_interval_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn summary_schedule(&self) -> ScheduleSpec {
        ScheduleSpec::new(self.summary_base_hour, self.summary_interval_secs)
            .with_drift(self.drift_policy)
    }
}

/// How the device is powered; decides how often it polls for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    Solar,
    Grid,
}

impl PowerMode {
    pub fn inbound_interval_secs(self) -> i64 {
        match self {
            PowerMode::Solar => 60 * SECONDS_PER_MINUTE,
            PowerMode::Grid => 10 * SECONDS_PER_MINUTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankConfig {
    pub number: u8,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub high_alarm: Option<f64>,
    #[serde(default)]
    pub low_alarm: Option<f64>,
}

impl TankConfig {
    pub fn new(number: u8, label: impl Into<String>) -> Self {
        Self {
            number,
            label: label.into(),
            high_alarm: None,
            low_alarm: None,
        }
    }

    pub fn with_alarms(mut self, low: Option<f64>, high: Option<f64>) -> Self {
        self.low_alarm = low;
        self.high_alarm = high;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Field device configuration, delivered by a config push command.
///
/// Pushes are applied last-write-wins on `updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub site: String,
    pub sample_interval_secs: i64,
    /// Minimum level change in inches before telemetry is sent.
    pub level_change_threshold: f64,
    pub report_hour: u8,
    pub report_minute: u8,
    pub power_mode: PowerMode,
    /// Overrides the power mode's command poll interval.
    pub inbound_interval_secs: Option<i64>,
    pub tanks: Vec<TankConfig>,
    pub location: Option<Location>,
    pub updated: Epoch,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            sample_interval_secs: 30 * SECONDS_PER_MINUTE,
            level_change_threshold: 0.0,
            report_hour: 5,
            report_minute: 0,
            power_mode: PowerMode::Solar,
            inbound_interval_secs: None,
            tanks: vec![TankConfig::new(1, "Tank 1")],
            location: None,
            updated: Epoch::UNKNOWN,
        }
    }
}

impl DeviceConfig {
    pub fn inbound_interval_secs(&self) -> i64 {
        self.inbound_interval_secs
            .unwrap_or_else(|| self.power_mode.inbound_interval_secs())
    }

    pub fn report_schedule(&self) -> ScheduleSpec {
        ScheduleSpec::daily(self.report_hour, self.report_minute)
    }

    pub fn tank(&self, number: u8) -> Option<&TankConfig> {
        self.tanks.iter().find(|t| t.number == number)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_secs <= 0 {
            return Err(ConfigError::Invalid("sample interval must be positive".to_string()));
        }
        if self.inbound_interval_secs() <= 0 {
            return Err(ConfigError::Invalid("inbound interval must be positive".to_string()));
        }
        if !self.report_schedule().is_valid() {
            return Err(ConfigError::Invalid(format!(
                "report time {:02}:{:02}",
                self.report_hour, self.report_minute
            )));
        }
        if !self.level_change_threshold.is_finite() || self.level_change_threshold < 0.0 {
            return Err(ConfigError::Invalid("level change threshold".to_string()));
        }

        let mut seen = HashSet::new();
        for tank in &self.tanks {
            if tank.number == 0 || !seen.insert(tank.number) {
                return Err(ConfigError::Invalid(format!("tank number {}", tank.number)));
            }
            if let (Some(low), Some(high)) = (tank.low_alarm, tank.high_alarm) {
                if low >= high {
                    return Err(ConfigError::Invalid(format!(
                        "tank {} low alarm {} is not below high alarm {}",
                        tank.number, low, high
                    )));
                }
            }
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON encoding, hex encoded.
    pub fn digest(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_vec(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&json)))
    }
}
