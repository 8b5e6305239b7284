//! Run lock: one mutating run per state directory.

use crate::error::{StateError, StateResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "clusterform.lock";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub run_id: String,
    pub command: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(run_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            command: command.into(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} ({}, pid {}, since {})",
            self.run_id,
            self.command,
            self.pid,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Held for the duration of a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, info: LockInfo) -> StateResult<Self> {
        Self::acquire_with(dir, info, |file, bytes| file.write_all(bytes))
    }

    fn acquire_with(
        dir: &Path,
        info: LockInfo,
        write: impl FnOnce(&mut std::fs::File, &[u8]) -> std::io::Result<()>,
    ) -> StateResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let contents = serde_json::to_string_pretty(&info)?;
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok())
                    .map(|held| held.to_string())
                    .unwrap_or_else(|| "an unknown run".to_string());
                return Err(StateError::Locked { holder, path });
            }
            Err(e) => return Err(e.into()),
        };
        // Nothing owns the file until `Self` exists.
        if let Err(e) = write(&mut file, contents.as_bytes()) {
            drop(file);
            if let Err(rm) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), "failed to remove partial run lock: {}", rm);
            }
            return Err(e.into());
        }
        tracing::debug!(run_id = %info.run_id, path = %path.display(), "run lock acquired");
        Ok(Self { path })
    }

    /// Remove a lock left behind by a run that no longer exists. Returns the
    /// holder that was removed, if any.
    pub fn break_lock(dir: &Path) -> StateResult<Option<LockInfo>> {
        let path = dir.join(LOCK_FILE);
        let held = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        std::fs::remove_file(&path)?;
        tracing::warn!(path = %path.display(), "run lock broken");
        Ok(held)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to release run lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(tmp.path(), LockInfo::new("run-1", "apply")).unwrap();
        let err = RunLock::acquire(tmp.path(), LockInfo::new("run-2", "apply")).unwrap_err();
        match err {
            StateError::Locked { holder, .. } => assert!(holder.contains("run-1")),
            other => panic!("unexpected {other}"),
        }
        drop(lock);
        assert!(RunLock::acquire(tmp.path(), LockInfo::new("run-3", "plan")).is_ok());
    }

    #[test]
    fn failed_write_leaves_no_lock_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let err = RunLock::acquire_with(tmp.path(), LockInfo::new("run-1", "apply"), |_, _| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        })
        .unwrap_err();
        assert!(matches!(err, StateError::Io(_)), "{err}");
        assert!(!tmp.path().join(LOCK_FILE).exists());
        assert!(RunLock::acquire(tmp.path(), LockInfo::new("run-2", "apply")).is_ok());
    }

    #[test]
    fn break_stale_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(tmp.path(), LockInfo::new("run-1", "apply")).unwrap();
        // Simulate a crashed run: the lock file outlives its holder.
        std::mem::forget(lock);
        let held = RunLock::break_lock(tmp.path()).unwrap().unwrap();
        assert_eq!(held.run_id, "run-1");
        assert!(RunLock::break_lock(tmp.path()).unwrap().is_none());
    }
}
