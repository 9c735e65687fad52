//! Power-failure detection and boot-time restoration
//!
//! A `recovery_state` file records why the process last stopped. It reads
//! `normal` only after a clean shutdown; while running it reads `unknown`,
//! and around risky work it carries an operation tag. Anything other than
//! `normal` at boot means the previous run ended without warning.

pub mod heartbeat;
pub mod manager;

pub use heartbeat::{HeartbeatMonitor, HeartbeatRecord};
pub use manager::{BootOutcome, BootState, RecoveryManager};

use serde::{Deserialize, Serialize};

use crate::time::Epoch;

/// Last recorded reason for stopping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    Normal,
    /// Running, or stopped without recording why.
    Unknown,
    /// Inside the named operation.
    Operation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub reason: RecoveryReason,
    /// Epoch of the last heartbeat written before this state.
    pub heartbeat: Epoch,
}

/// Best guess at why the previous run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspectedCause {
    PowerLoss,
    InterruptedOperation { operation: String },
}

/// Summary sent once after a recovering boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryNotice {
    pub cause: SuspectedCause,
    pub records_restored: usize,
    pub report_dates_restored: usize,
    /// Backup entries that failed to decode.
    pub skipped_entries: usize,
    /// Time between the last heartbeat and this boot, when both are known.
    pub downtime_secs: Option<i64>,
}
