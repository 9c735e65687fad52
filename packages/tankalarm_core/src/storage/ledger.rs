//! Last-sent report dates, for duplicate suppression across reboots

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::time::Epoch;

use super::{files, AtomicStore, StoreError};

/// When a report was last sent: its calendar date and schedule slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMark {
    pub date: NaiveDate,
    pub slot: Epoch,
}

/// Report kind to last [`SentMark`], persisted as `report_dates`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportLedger {
    marks: BTreeMap<String, SentMark>,
}

impl ReportLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger, skipping entries that fail to decode.
    ///
    /// Returns the ledger and the number of skipped entries. A missing file
    /// is an empty ledger.
    pub fn load(store: &AtomicStore) -> Result<(Self, usize), StoreError> {
        let Some(raw) = store.load_json::<BTreeMap<String, serde_json::Value>>(files::REPORT_DATES)?
        else {
            return Ok((Self::new(), 0));
        };

        let mut ledger = Self::new();
        let mut skipped = 0;
        for (kind, value) in raw {
            match serde_json::from_value::<SentMark>(value) {
                Ok(mark) => {
                    ledger.marks.insert(kind, mark);
                }
                Err(e) => {
                    log::warn!("Skipping report date for {}: {}", kind, e);
                    skipped += 1;
                }
            }
        }
        Ok((ledger, skipped))
    }

    pub fn save(&self, store: &AtomicStore) -> Result<(), StoreError> {
        store.write_json(files::REPORT_DATES, self)
    }

    /// Whether a report of `kind` was already sent for `slot` or a later one.
    pub fn already_sent(&self, kind: &str, slot: Epoch) -> bool {
        self.marks.get(kind).map_or(false, |m| m.slot >= slot)
    }

    /// Whether a report of `kind` was already sent on `date` or later.
    pub fn sent_on(&self, kind: &str, date: NaiveDate) -> bool {
        self.marks.get(kind).map_or(false, |m| m.date >= date)
    }

    /// Record that `kind` was sent for `slot`. Returns `false` when the slot
    /// was already covered or has no calendar date.
    pub fn mark_sent(&mut self, kind: &str, slot: Epoch) -> bool {
        if self.already_sent(kind, slot) {
            return false;
        }
        let Some(date) = slot.date() else {
            return false;
        };
        self.marks.insert(kind.to_string(), SentMark { date, slot });
        true
    }

    pub fn get(&self, kind: &str) -> Option<&SentMark> {
        self.marks.get(kind)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}
