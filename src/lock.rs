//! Project-scoped single-flight lock for the cycle orchestrator.
//!
//! `flock(LOCK_EX | LOCK_NB)` on a lock file: never blocks, and the kernel
//! drops the lock if the holder dies. The holder writes `<pid> <ms>` into the
//! file so a leftover lock on a filesystem without working flock can be
//! reclaimed once it is stale and its pid is gone.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::time::now_ms;

#[derive(Debug)]
pub struct CycleLock {
    file: File,
    path: PathBuf,
}

/// Pid and acquisition time recorded by a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub pid: i32,
    pub acquired_at: i64,
}

impl CycleLock {
    /// Try to take the lock. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path, stale_after: Duration) -> Result<Option<Self>> {
        if let Some(lock) = Self::try_once(path)? {
            return Ok(Some(lock));
        }
        match read_holder(path) {
            Some(holder) if is_stale(&holder, stale_after) => {
                tracing::warn!(
                    pid = holder.pid,
                    "cycle: reclaiming stale lock {}",
                    path.display()
                );
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Self::try_once(path)
            }
            _ => Ok(None),
        }
    }

    fn try_once(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // SAFETY: the fd is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(None);
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{} {}", std::process::id(), now_ms())?;
        file.flush()?;
        tracing::debug!("cycle: lock acquired {}", path.display());
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        // SAFETY: fd is still owned by self.file.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!("cycle: lock released {}", self.path.display());
    }
}

pub fn read_holder(path: &Path) -> Option<Holder> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    let mut parts = text.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let acquired_at = parts.next()?.parse().ok()?;
    Some(Holder { pid, acquired_at })
}

fn is_stale(holder: &Holder, stale_after: Duration) -> bool {
    let age = now_ms().saturating_sub(holder.acquired_at);
    age > stale_after.as_millis() as i64 && !pid_alive(holder.pid)
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
