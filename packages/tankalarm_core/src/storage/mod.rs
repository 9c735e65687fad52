//! Crash-safe local persistence
//!
//! Every persisted file goes through [`AtomicStore`], which writes a
//! temporary sibling, syncs it and renames it over the target. A power cut at
//! any point leaves either the previous complete file or the new one.

pub mod atomic;
pub mod fs;
pub mod ledger;
pub mod memory;

pub use atomic::{AtomicStore, Lines, TempRecovery};
pub use fs::FsStorage;
pub use ledger::{ReportLedger, SentMark};
pub use memory::{Fault, MemStorage};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// File names inside the data directory.
pub mod files {
    pub const RECOVERY_STATE: &str = "recovery_state.json";
    pub const HEARTBEAT: &str = "heartbeat.json";
    pub const RECORDS_BACKUP: &str = "records_backup.jsonl";
    pub const REPORT_DATES: &str = "report_dates.json";
    pub const PENDING_COMMANDS: &str = "pending_commands.json";
    pub const DEVICE_CONFIG: &str = "device_config.json";
    pub const RELAY_STATES: &str = "relay_states.json";
    pub const PENDING_NOTICES: &str = "pending_notices.json";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Raw file operations underneath [`AtomicStore`].
pub trait Storage: Send + Sync {
    /// Create or truncate `path`, write all of `bytes` and sync to the medium.
    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Atomically replace `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Files directly inside `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}
