//! HeartbeatMonitor: periodic liveness record

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{files, AtomicStore, StoreError};
use crate::time::Epoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub epoch: Epoch,
    pub uptime_secs: u64,
    pub sequence: u64,
}

/// Writes a heartbeat file on a fixed cadence; the last one written marks
/// roughly when the process was last alive.
pub struct HeartbeatMonitor {
    store: AtomicStore,
    cadence_secs: i64,
    last: Option<HeartbeatRecord>,
}

impl HeartbeatMonitor {
    pub fn new(store: AtomicStore, cadence_secs: i64) -> Self {
        Self {
            store,
            cadence_secs,
            last: None,
        }
    }

    pub fn cadence_secs(&self) -> i64 {
        self.cadence_secs
    }

    /// Read the heartbeat left by the previous run. A corrupt file is
    /// treated as missing.
    pub fn load(&mut self) -> Result<Option<HeartbeatRecord>, StoreError> {
        let record = match self.store.load_json::<HeartbeatRecord>(files::HEARTBEAT) {
            Ok(record) => record,
            Err(StoreError::DeserializationError(e)) => {
                log::warn!("Ignoring unreadable heartbeat: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        self.last = record;
        Ok(record)
    }

    pub fn beat(&mut self, now: Epoch, uptime: Duration) -> Result<HeartbeatRecord, StoreError> {
        let record = HeartbeatRecord {
            epoch: now,
            uptime_secs: uptime.as_secs(),
            sequence: self.last.map_or(0, |r| r.sequence + 1),
        };
        self.store.write_json(files::HEARTBEAT, &record)?;
        self.last = Some(record);
        Ok(record)
    }

    pub fn last(&self) -> Option<HeartbeatRecord> {
        self.last
    }

    /// Latest known epoch among heartbeats, or unknown.
    pub fn last_epoch(&self) -> Epoch {
        self.last.map_or(Epoch::UNKNOWN, |r| r.epoch)
    }

    /// Whether no heartbeat has been written for more than two cadences.
    pub fn is_overdue(&self, now: Epoch) -> bool {
        match self.last {
            Some(record) if record.epoch.is_known() && now.is_known() => {
                now.secs_since(record.epoch) > 2 * self.cadence_secs
            }
            _ => false,
        }
    }
}
