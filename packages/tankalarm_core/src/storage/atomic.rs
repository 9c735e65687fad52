//! AtomicStore: write-temp-then-rename persistence rooted in a data directory

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{FsStorage, Storage, StoreError};

const TMP_SUFFIX: &str = ".tmp";

/// Last line of a JSON Lines file written by [`AtomicStore::write_lines`].
/// A temporary cut on a line boundary still parses line by line, so the
/// entry count is what proves it whole.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinesTrailer {
    #[serde(rename = "$entries")]
    entries: usize,
}

fn parse_trailer(line: &str) -> Option<usize> {
    serde_json::from_str::<LinesTrailer>(line).ok().map(|t| t.entries)
}

/// Entries decoded from a JSON Lines file.
#[derive(Debug, Clone, PartialEq)]
pub struct Lines<T> {
    pub entries: Vec<T>,
    /// Lines that failed to decode and were skipped.
    pub skipped: usize,
}

/// Outcome of the boot-time temporary file pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempRecovery {
    pub promoted: usize,
    pub discarded: usize,
}

/// Durable file store. A write leaves either the prior complete value or
/// the new complete value on storage, never a mix.
#[derive(Clone)]
pub struct AtomicStore {
    root: PathBuf,
    storage: Arc<dyn Storage>,
}

impl AtomicStore {
    /// Open a store on the local filesystem, creating `root` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::with_storage(root, Arc::new(FsStorage::new()));
        store
            .storage
            .create_dir_all(&store.root)
            .map_err(|e| StoreError::IoError(format!("creating {:?}: {}", store.root, e)))?;
        Ok(store)
    }

    pub fn with_storage(root: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.into(),
            storage,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, TMP_SUFFIX))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.storage.exists(&self.path(name))
    }

    /// Replace `name` with `bytes`.
    ///
    /// On a write error the temporary is removed and `name` is untouched.
    /// If the rename fails the temporary stays behind for
    /// [`recover_temporaries`](Self::recover_temporaries).
    pub fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.tmp_path(name);
        let target = self.path(name);

        if let Err(e) = self.storage.write_new(&tmp, bytes) {
            if let Err(cleanup) = self.storage.remove(&tmp) {
                log::debug!("Could not remove {:?}: {}", tmp, cleanup);
            }
            return Err(StoreError::IoError(format!("writing {:?}: {}", tmp, e)));
        }

        self.storage.rename(&tmp, &target).map_err(|e| {
            log::warn!("Rename {:?} -> {:?} failed, leaving temporary: {}", tmp, target, e);
            StoreError::IoError(format!("renaming {:?}: {}", tmp, e))
        })
    }

    pub fn read_all(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(name);
        self.storage.read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => StoreError::IoError(format!("reading {:?}: {}", path, e)),
        })
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.write_atomic(name, &json)
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, StoreError> {
        let bytes = self.read_all(name)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::DeserializationError(format!("{}: {}", name, e)))
    }

    /// Like [`read_json`](Self::read_json) but a missing file is `None`.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        match self.read_json(name) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write one JSON document per line, followed by an entry-count trailer.
    pub fn write_lines<T: Serialize>(&self, name: &str, entries: &[T]) -> Result<(), StoreError> {
        let mut out = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut out, entry)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            out.push(b'\n');
        }
        serde_json::to_writer(&mut out, &LinesTrailer { entries: entries.len() })
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        out.push(b'\n');
        self.write_atomic(name, &out)
    }

    /// Decode a JSON Lines file entry by entry, skipping lines that fail.
    pub fn read_lines<T: DeserializeOwned>(&self, name: &str) -> Result<Lines<T>, StoreError> {
        let bytes = self.read_all(name)?;
        let content = String::from_utf8_lossy(&bytes);

        let mut lines = Lines {
            entries: Vec::new(),
            skipped: 0,
        };
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(expected) = parse_trailer(line) {
                let seen = lines.entries.len() + lines.skipped;
                if seen != expected {
                    log::warn!("{} holds {} entries, trailer says {}", name, seen, expected);
                }
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(entry) => lines.entries.push(entry),
                Err(e) => {
                    log::warn!("Skipping line {} in {}: {}", i + 1, name, e);
                    lines.skipped += 1;
                }
            }
        }
        Ok(lines)
    }

    /// Boot pass over leftover temporaries.
    ///
    /// A temporary whose target is missing and whose content is complete is
    /// promoted to the target; every other temporary is discarded.
    pub fn recover_temporaries(&self) -> Result<TempRecovery, StoreError> {
        let paths = self
            .storage
            .list(&self.root)
            .map_err(|e| StoreError::IoError(format!("listing {:?}: {}", self.root, e)))?;

        let mut recovery = TempRecovery::default();
        for tmp in paths {
            let Some(name) = tmp
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(TMP_SUFFIX))
                .map(str::to_string)
            else {
                continue;
            };
            let target = self.path(&name);

            let promote = !self.storage.exists(&target)
                && self
                    .storage
                    .read(&tmp)
                    .map(|bytes| is_complete(&name, &bytes))
                    .unwrap_or(false);

            if promote {
                self.storage
                    .rename(&tmp, &target)
                    .map_err(|e| StoreError::IoError(format!("promoting {:?}: {}", tmp, e)))?;
                log::info!("Promoted leftover temporary for {}", name);
                recovery.promoted += 1;
            } else {
                self.storage
                    .remove(&tmp)
                    .map_err(|e| StoreError::IoError(format!("removing {:?}: {}", tmp, e)))?;
                log::info!("Discarded leftover temporary for {}", name);
                recovery.discarded += 1;
            }
        }
        Ok(recovery)
    }
}

/// Whether a temporary holds a whole document rather than a cut-off prefix.
fn is_complete(name: &str, bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if name.ends_with(".jsonl") {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return false;
        };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some((last, body)) = lines.split_last() else {
            return false;
        };
        text.ends_with('\n')
            && parse_trailer(last) == Some(body.len())
            && body
                .iter()
                .all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok())
    } else {
        serde_json::from_slice::<serde_json::Value>(bytes).is_ok()
    }
}
