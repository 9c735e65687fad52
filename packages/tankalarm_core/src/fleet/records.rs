//! FleetRecords: the coordinator's bounded table of tank records
//!
//! One record per (client, tank). Reports arrive in any order; a report
//! older than what a record already holds is ignored, so late delivery
//! never rolls the table back.

use crate::identity::DeviceId;
use crate::report::{AlarmKind, AlarmReport, DailyReport, TankRecord, TelemetryReport};
use crate::time::Epoch;

pub const DEFAULT_MAX_RECORDS: usize = 64;

#[derive(Debug, Clone)]
pub struct FleetRecords {
    records: Vec<TankRecord>,
    capacity: usize,
}

impl FleetRecords {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild from a backup, keeping the newest entry per key.
    pub fn from_backup(records: Vec<TankRecord>, capacity: usize) -> Self {
        let mut table = Self::new(capacity);
        for record in records {
            let (client, site, tank, epoch) =
                (record.client.clone(), record.site.clone(), record.tank, record.last_update);
            table.upsert(&client, &site, tank, epoch, |r| *r = record);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TankRecord] {
        &self.records
    }

    pub fn get(&self, client: &DeviceId, tank: u8) -> Option<&TankRecord> {
        self.records
            .iter()
            .find(|r| &r.client == client && r.tank == tank)
    }

    /// Returns whether the table changed.
    pub fn apply_telemetry(&mut self, report: &TelemetryReport) -> bool {
        self.upsert(&report.client, &report.site, report.tank, report.epoch, |r| {
            r.level_inches = report.level;
            if !report.label.is_empty() {
                r.label = report.label.clone();
            }
        })
    }

    /// Recovery notices carry no tank state and leave the table alone.
    pub fn apply_alarm(&mut self, report: &AlarmReport) -> bool {
        if matches!(report.alarm, AlarmKind::Recovery(_)) {
            return false;
        }
        self.upsert(&report.client, &report.site, report.tank, report.epoch, |r| {
            r.level_inches = report.level;
            r.alarm_active = report.alarm.is_active();
            r.last_alarm = Some(report.alarm.label().to_string());
        })
    }

    /// Returns the number of records changed.
    pub fn apply_daily(&mut self, report: &DailyReport) -> usize {
        report
            .tanks
            .iter()
            .filter(|level| {
                self.upsert(&report.client, &report.site, level.tank, report.epoch, |r| {
                    r.level_inches = level.level;
                })
            })
            .count()
    }

    /// Sorted copy with `stale` set on records not updated within
    /// `stale_after` seconds of `now`. Nothing is stale while `now` is unknown.
    pub fn snapshot(&self, now: Epoch, stale_after: i64) -> Vec<TankRecord> {
        let mut snapshot: Vec<TankRecord> = self
            .records
            .iter()
            .cloned()
            .map(|mut r| {
                r.stale = now.is_known() && now.secs_since(r.last_update) > stale_after;
                r
            })
            .collect();
        snapshot.sort_by(|a, b| (&a.client, a.tank).cmp(&(&b.client, b.tank)));
        snapshot
    }

    fn upsert<F>(&mut self, client: &DeviceId, site: &str, tank: u8, epoch: Epoch, update: F) -> bool
    where
        F: FnOnce(&mut TankRecord),
    {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| &r.client == client && r.tank == tank)
        {
            if epoch < existing.last_update {
                log::debug!("Ignoring late report for {} tank {}", client, tank);
                return false;
            }
            let before = existing.clone();
            update(existing);
            existing.site = site.to_string();
            existing.last_update = epoch;
            existing.stale = false;
            return *existing != before;
        }

        if self.records.len() >= self.capacity {
            let Some((oldest, oldest_epoch)) = self
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.last_update)
                .map(|(i, r)| (i, r.last_update))
            else {
                return false;
            };
            if epoch < oldest_epoch {
                log::warn!("Record table full, dropping {} tank {}", client, tank);
                return false;
            }
            let evicted = self.records.swap_remove(oldest);
            log::warn!(
                "Record table full, evicted {} tank {}",
                evicted.client,
                evicted.tank
            );
        }

        let mut record = TankRecord {
            client: client.clone(),
            site: site.to_string(),
            tank,
            label: String::new(),
            level_inches: 0.0,
            alarm_active: false,
            last_alarm: None,
            last_update: epoch,
            stale: false,
        };
        update(&mut record);
        record.last_update = epoch;
        self.records.push(record);
        true
    }
}

impl Default for FleetRecords {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}
