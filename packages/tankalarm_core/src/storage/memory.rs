//! In-memory [`Storage`] with fault injection
//!
//! Used to simulate interrupted writes and power loss at an exact byte
//! offset, which a real filesystem cannot reproduce on demand.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::Storage;

/// A failure armed for the next matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next write stores only `after_bytes` bytes, then reports an error.
    WriteError { after_bytes: usize },
    /// Power fails after `after_bytes` bytes of the next write. Every
    /// operation fails until [`MemStorage::power_on`].
    PowerLoss { after_bytes: usize },
    /// The next rename fails and leaves both files in place.
    RenameError,
}

#[derive(Debug)]
struct State {
    files: BTreeMap<PathBuf, Vec<u8>>,
    fault: Option<Fault>,
    powered: bool,
}

#[derive(Debug)]
pub struct MemStorage {
    state: Mutex<State>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                files: BTreeMap::new(),
                fault: None,
                powered: true,
            }),
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().fault = Some(fault);
    }

    /// Restore power after a [`Fault::PowerLoss`], as a reboot would.
    pub fn power_on(&self) {
        let mut state = self.lock();
        state.powered = true;
        state.fault = None;
    }

    pub fn is_powered(&self) -> bool {
        self.lock().powered
    }

    /// Contents of `path`, bypassing faults.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Place a file directly, bypassing faults.
    pub fn put(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.lock().files.insert(path.into(), bytes.into());
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn powered(state: &State) -> io::Result<()> {
    if state.powered {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "storage is powered off"))
    }
}

impl Storage for MemStorage {
    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        powered(&state)?;
        match state.fault {
            Some(Fault::WriteError { after_bytes }) => {
                state.fault = None;
                let cut = after_bytes.min(bytes.len());
                state.files.insert(path.to_path_buf(), bytes[..cut].to_vec());
                Err(io::Error::new(io::ErrorKind::WriteZero, "injected write error"))
            }
            Some(Fault::PowerLoss { after_bytes }) => {
                state.fault = None;
                let cut = after_bytes.min(bytes.len());
                state.files.insert(path.to_path_buf(), bytes[..cut].to_vec());
                state.powered = false;
                Err(io::Error::new(io::ErrorKind::Other, "power lost during write"))
            }
            _ => {
                state.files.insert(path.to_path_buf(), bytes.to_vec());
                Ok(())
            }
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.lock();
        powered(&state)?;
        if state.fault == Some(Fault::RenameError) {
            state.fault = None;
            return Err(io::Error::new(io::ErrorKind::Other, "injected rename error"));
        }
        let bytes = state
            .files
            .remove(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "rename source missing"))?;
        state.files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let state = self.lock();
        powered(&state)?;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        powered(&state)?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let state = self.lock();
        powered(&state)?;
        Ok(state
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        powered(&self.lock())
    }
}
