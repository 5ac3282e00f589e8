//! Run lock
//!
//! Two scans against the same snapshot base would interleave appends and race
//! the final rewrite. Every scan holds an exclusive `fs2` lock on
//! `<base>.csv.lock` for its whole run. A JSON sidecar next to the lock file
//! records who holds it, so `status` can report the holder.

use crate::error::{AuditError, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Holds the run lock until dropped.
pub struct RunLockGuard {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl RunLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Rewrite the sidecar once the run knows what it is doing.
    pub fn record_mode(&mut self, mode: &str) {
        if let Some(path) = write_sidecar(&self.lock_path, mode) {
            self.sidecar_path = Some(path);
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        debug!("Releasing run lock: {}", self.lock_path.display());
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove lock sidecar {}: {}", path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for RunLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Contents of the lock sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub exe: Option<String>,
    pub timestamp: String,
    pub mode: String,
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

fn write_sidecar(lock_path: &Path, mode: &str) -> Option<PathBuf> {
    let holder = LockHolder {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
        mode: mode.to_string(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&holder)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!(
                "Failed to write lock sidecar {}: {}",
                sidecar_path.display(),
                e
            );
            None
        }
    }
}

/// Try to take the run lock without waiting.
///
/// `mode` is recorded in the sidecar, e.g. `"incremental scan"`.
pub fn try_lock_run(lock_path: &Path, mode: &str) -> Result<RunLockGuard> {
    debug!("Attempting to acquire run lock: {}", lock_path.display());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(AuditError::LockFailed)?;

    // fs2's method, not std's File::try_lock_exclusive
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!("Acquired run lock: {}", lock_path.display());
            let sidecar_path = write_sidecar(lock_path, mode);
            Ok(RunLockGuard {
                _file: file,
                lock_path: lock_path.to_path_buf(),
                sidecar_path,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(AuditError::Locked(lock_path.to_path_buf()))
        }
        Err(e) => Err(AuditError::LockFailed(e)),
    }
}

/// Read the sidecar of a held lock, if any.
pub fn current_holder(lock_path: &Path) -> Option<LockHolder> {
    let payload = fs::read(sidecar_path_for(lock_path)).ok()?;
    serde_json::from_slice(&payload).ok()
}
