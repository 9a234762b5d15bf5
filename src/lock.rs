// =============================================================================
// Single-instance lock — advisory file lock with stale reclaim
// =============================================================================
//
// The lock file holds `{pid, acquired_at}` as JSON. A second process refuses
// to start while the file exists, unless the holder is older than the stale
// timeout (3600 s), in which case the lock is reclaimed. The write itself is
// atomic (tmp + rename) so a crash can never leave a half-written lock.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;

/// Lock holders older than this are considered dead and may be reclaimed.
pub const STALE_TIMEOUT_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// An acquired single-instance lock. Released on [`InstanceLock::release`] or
/// best-effort on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: bool,
}

impl InstanceLock {
    /// Acquire the lock at `path`, reclaiming a stale holder if necessary.
    ///
    /// Returns [`EngineError::LockHeld`] when a live holder exists.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();

        if let Some(existing) = read_record(&path) {
            let age = Utc::now() - existing.acquired_at;
            if age.num_seconds() < STALE_TIMEOUT_SECS {
                return Err(EngineError::LockHeld {
                    path: path.display().to_string(),
                    pid: existing.pid,
                });
            }
            warn!(
                path = %path.display(),
                holder_pid = existing.pid,
                age_secs = age.num_seconds(),
                "reclaiming stale instance lock"
            );
        }

        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        write_record(&path, &record)
            .map_err(|e| EngineError::Config(format!("failed to write lock file: {e}")))?;

        info!(path = %path.display(), pid = record.pid, "instance lock acquired");
        Ok(Self {
            path,
            released: false,
        })
    }

    /// Remove the lock file. Safe to call once; drop does this as a fallback.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        } else {
            info!(path = %self.path.display(), "instance lock released");
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            // A corrupt lock file counts as stale.
            warn!(path = %path.display(), error = %e, "unreadable lock file, treating as stale");
            None
        }
    }
}

fn write_record(path: &Path, record: &LockRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }
    let content = serde_json::to_string(record).context("failed to serialise lock record")?;
    let tmp = path.with_extension("lock.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write tmp lock {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename tmp lock to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_lock_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("halla-lock-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn acquire_and_release() {
        let path = tmp_lock_path("basic");
        let _ = std::fs::remove_file(&path);

        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let path = tmp_lock_path("held");
        let _ = std::fs::remove_file(&path);

        let _lock = InstanceLock::acquire(&path).unwrap();
        match InstanceLock::acquire(&path) {
            Err(EngineError::LockHeld { pid, .. }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let path = tmp_lock_path("stale");
        let _ = std::fs::remove_file(&path);

        let stale = LockRecord {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::seconds(STALE_TIMEOUT_SECS + 10),
        };
        write_record(&path, &stale).unwrap();

        let lock = InstanceLock::acquire(&path).unwrap();
        lock.release();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_lock_is_reclaimed() {
        let path = tmp_lock_path("corrupt");
        std::fs::write(&path, "not json").unwrap();

        let lock = InstanceLock::acquire(&path).unwrap();
        lock.release();
    }

    #[test]
    fn drop_releases() {
        let path = tmp_lock_path("drop");
        let _ = std::fs::remove_file(&path);
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
