//! Single-instance lock file.
//!
//! The lock is a JSON file created with `create_new`. A second instance refuses
//! to start while the recorded owner is alive and reclaims the file otherwise.
//! The held lock is also registered process-wide so the interrupt handler can
//! remove it before exiting.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A lock file this young without readable metadata is assumed to be mid-write.
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

static HELD_LOCK: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub host: String,
    /// RFC 3339 UTC.
    pub started_at: String,
    pub run_id: String,
}

impl LockMetadata {
    pub fn current(run_id: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            run_id: run_id.to_string(),
        }
    }

    /// True when the owner is known to be gone. Owners on other hosts are
    /// never considered stale.
    fn is_stale(&self) -> bool {
        if self.host != current_host() {
            return false;
        }
        !is_process_alive(self.pid)
    }
}

/// Another live instance owns the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeldError {
    pub path: PathBuf,
    pub holder: Option<LockMetadata>,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(holder) => write!(
                f,
                "another loop holds {} (pid {} on {}, run {}, since {})",
                self.path.display(),
                holder.pid,
                holder.host,
                holder.run_id,
                holder.started_at
            ),
            None => write!(f, "another loop is acquiring {}", self.path.display()),
        }
    }
}

impl std::error::Error for LockHeldError {}

/// A held lock; the file is removed on drop.
#[derive(Debug)]
pub struct LoopLock {
    path: PathBuf,
    metadata: LockMetadata,
}

impl LoopLock {
    pub fn acquire(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let metadata = LockMetadata::current(run_id);
        // One reclaim attempt; losing the race afterwards means someone else won.
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let mut payload =
                        serde_json::to_string_pretty(&metadata).context("serialize lock")?;
                    payload.push('\n');
                    file.write_all(payload.as_bytes())
                        .with_context(|| format!("write lock {}", path.display()))?;
                    file.sync_all()
                        .with_context(|| format!("sync lock {}", path.display()))?;
                    register(path);
                    debug!(path = %path.display(), "lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        metadata,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists && attempt == 0 => {
                    let holder = read_metadata(path);
                    let stale = match &holder {
                        Some(holder) => holder.is_stale(),
                        None => older_than(path, UNREADABLE_GRACE),
                    };
                    if !stale {
                        return Err(LockHeldError {
                            path: path.to_path_buf(),
                            holder,
                        }
                        .into());
                    }
                    warn!(
                        path = %path.display(),
                        pid = holder.as_ref().map(|h| h.pid),
                        "reclaiming stale lock"
                    );
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("remove stale lock {}", path.display()));
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(LockHeldError {
                        path: path.to_path_buf(),
                        holder: read_metadata(path),
                    }
                    .into());
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
        Err(LockHeldError {
            path: path.to_path_buf(),
            holder: read_metadata(path),
        }
        .into())
    }

    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }
}

impl Drop for LoopLock {
    fn drop(&mut self) {
        unregister(&self.path);
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock");
        }
    }
}

/// Remove the currently registered lock file, if any.
///
/// Used by the interrupt handler, which exits without running destructors.
pub fn release_registered() {
    let path = match HELD_LOCK.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(path) = path {
        let _ = fs::remove_file(path);
    }
}

fn register(path: &Path) {
    match HELD_LOCK.lock() {
        Ok(mut guard) => *guard = Some(path.to_path_buf()),
        Err(poisoned) => *poisoned.into_inner() = Some(path.to_path_buf()),
    }
}

fn unregister(path: &Path) {
    let mut guard = match HELD_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.as_deref() == Some(path) {
        *guard = None;
    }
}

fn read_metadata(path: &Path) -> Option<LockMetadata> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed >= age)
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn current_host() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(unix))]
fn current_host() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_holder(path: &Path, pid: u32, host: String) {
        let meta = LockMetadata {
            pid,
            host,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            run_id: "run-old".to_string(),
        };
        fs::write(path, serde_json::to_string(&meta).expect("json")).expect("write lock");
    }

    #[test]
    fn acquire_writes_metadata_and_drop_removes_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/ralph.lock");
        {
            let lock = LoopLock::acquire(&path, "run-1").expect("acquire");
            assert_eq!(lock.metadata().pid, std::process::id());
            let on_disk = read_metadata(&path).expect("metadata");
            assert_eq!(on_disk.run_id, "run-1");
        }
        assert!(!path.exists());
    }

    /// Our own pid is alive, so a lock recorded under it is held.
    #[test]
    fn live_holder_blocks_acquisition() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph.lock");
        write_holder(&path, std::process::id(), current_host());

        let err = LoopLock::acquire(&path, "run-2").unwrap_err();
        let held = err.downcast_ref::<LockHeldError>().expect("lock held");
        assert_eq!(held.holder.as_ref().map(|h| h.pid), Some(std::process::id()));
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn dead_holder_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph.lock");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");
        write_holder(&path, dead_pid, current_host());

        let lock = LoopLock::acquire(&path, "run-3").expect("reclaim");
        assert_eq!(read_metadata(&path).map(|m| m.run_id), Some("run-3".to_string()));
        drop(lock);
    }

    #[test]
    fn holder_on_another_host_is_never_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph.lock");
        write_holder(&path, u32::MAX, "some-other-host.invalid".to_string());
        let err = LoopLock::acquire(&path, "run-4").unwrap_err();
        assert!(err.downcast_ref::<LockHeldError>().is_some());
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }
}
