//! Host-local role locks.
//!
//! Each role (tracker, fetcher) holds an advisory PID lock file for the
//! lifetime of the process, so a double launch fails fast instead of
//! queueing. A lock file whose recorded PID no longer refers to a live
//! process is stale — typically a crashed run — and is reclaimed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{info, warn};

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another {role} instance is already running (pid {pid})")]
    AlreadyRunning { role: String, pid: u32 },
    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A held role lock. Releasing is automatic on drop, covering every exit
/// path including panics unwinding out of the role loop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    role: String,
}

impl LockFile {
    /// Acquire the lock for `role`, failing immediately if a live instance
    /// holds it.
    pub fn acquire(dir: &Path, role: &str) -> Result<Self, LockError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{role}.lock"));

        // One retry: first pass may find a stale file to reclaim.
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    info!(role = %role, path = %path.display(), "Acquired lock");
                    return Ok(Self {
                        path,
                        role: role.to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::holder_pid(&path) {
                        Some(pid) if process_alive(pid) => {
                            return Err(LockError::AlreadyRunning {
                                role: role.to_string(),
                                pid,
                            });
                        }
                        holder => {
                            warn!(
                                role = %role,
                                path = %path.display(),
                                stale_pid = ?holder,
                                "Reclaiming stale lock file"
                            );
                            fs::remove_file(&path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Lost the reclaim race to another starting instance.
        Err(LockError::AlreadyRunning {
            role: role.to_string(),
            pid: Self::holder_pid(&path).unwrap_or(0),
        })
    }

    /// PID recorded in an existing lock file, if parsable.
    fn holder_pid(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(role = %self.role, error = %e, "Failed to remove lock file");
        } else {
            info!(role = %self.role, "Released lock");
        }
    }
}

/// Check whether `pid` refers to a live process.
fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let _held = LockFile::acquire(dir.path(), "fetcher").unwrap();

        // Our own PID is in the file and we are certainly alive.
        match LockFile::acquire(dir.path(), "fetcher") {
            Err(LockError::AlreadyRunning { role, pid }) => {
                assert_eq!(role, "fetcher");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn roles_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let _tracker = LockFile::acquire(dir.path(), "tracker").unwrap();
        let _fetcher = LockFile::acquire(dir.path(), "fetcher").unwrap();
    }

    #[test]
    fn released_lock_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let held = LockFile::acquire(dir.path(), "fetcher").unwrap();
        let path = held.path.clone();
        drop(held);
        assert!(!path.exists(), "drop should delete the lock file");
        let _again = LockFile::acquire(dir.path(), "fetcher").unwrap();
    }

    #[test]
    fn unparsable_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetcher.lock");
        fs::write(&path, "not-a-pid").unwrap();

        let lock = LockFile::acquire(dir.path(), "fetcher").unwrap();
        let recorded = fs::read_to_string(&lock.path).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());
    }

    #[test]
    fn dead_pid_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetcher.lock");

        // A child that has already exited gives us a PID that is
        // definitely not alive anymore.
        let child = std::process::Command::new("true")
            .spawn()
            .and_then(|mut c| {
                let pid = c.id();
                c.wait()?;
                Ok(pid)
            });
        let Ok(dead_pid) = child else {
            return; // environment without /bin/true; covered by the unparsable case
        };
        fs::write(&path, dead_pid.to_string()).unwrap();

        LockFile::acquire(dir.path(), "fetcher").expect("stale lock should be reclaimed");
    }
}
