//! Per-workspace instance lock (`server.lock.json`): prevents two indexer
//! instances from writing the same cache directory concurrently. Combines
//! an advisory OS file lock (`fs4`) for the common case with a
//! liveness-checked PID record for recovering from a crash that left the
//! lock file behind without releasing it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};

use crate::sysutil::process_exists;

pub const LOCK_FILE: &str = "server.lock.json";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("workspace is locked by a running process (pid {pid})")]
    HeldByLiveProcess { pid: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    started_at: u64,
}

/// An acquired lock; releases (and deletes the lock file) on drop.
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Acquire the lock, recovering automatically from a stale lock file
    /// left by a process that no longer exists.
    pub fn acquire(dir: &Path) -> Result<InstanceLock, LockError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);

        if let Some(existing) = read_record(&path) {
            if process_exists(existing.pid) {
                return Err(LockError::HeldByLiveProcess { pid: existing.pid });
            }
            tracing::warn!(pid = existing.pid, "removing stale lock from dead process");
            let _ = std::fs::remove_file(&path);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| LockError::HeldByLiveProcess {
            pid: read_record(&path).map(|r| r.pid).unwrap_or(0),
        })?;

        let record = LockRecord {
            pid: std::process::id(),
            started_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let mut f = &file;
        f.write_all(serde_json::to_string(&record)?.as_bytes())?;
        f.sync_all()?;

        Ok(InstanceLock { path, file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_drop_releases_lock() {
        let dir = tempdir().unwrap();
        {
            let _lock = InstanceLock::acquire(dir.path()).unwrap();
            assert!(dir.path().join(LOCK_FILE).exists());
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
        // Reacquiring after release must succeed.
        let _lock2 = InstanceLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn stale_lock_from_dead_process_is_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let record = LockRecord {
            pid: u32::MAX - 1,
            started_at: 0,
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
        let lock = InstanceLock::acquire(dir.path());
        assert!(lock.is_ok());
    }
}
