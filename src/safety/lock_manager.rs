/// File-based advisory lock guarding the container registry
/// flock is released by the kernel when the holder exits, so a crashed
/// engine never leaves the store locked.
use crate::config::types::{EngineError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Diagnostic record written into the lock file by the current holder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub botbox_version: String,
}

/// Outcome of one non-blocking attempt
enum Attempt {
    Acquired(File),
    Busy,
}

/// Exclusive lock over a single lock file
#[derive(Debug, Clone)]
pub struct StoreLock {
    lock_path: PathBuf,
}

/// RAII guard; the lock is held until this is dropped
#[derive(Debug)]
pub struct StoreLockGuard {
    file: File,
    acquired: Instant,
}

impl StoreLock {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquire with exponential backoff and jitter until `timeout`
    pub fn acquire(&self, timeout: Duration) -> Result<StoreLockGuard> {
        let start = Instant::now();
        let mut retry_delay = Duration::from_millis(5);
        let mut contentions = 0u32;

        loop {
            match self.try_acquire_immediate()? {
                Attempt::Acquired(file) => {
                    if contentions > 0 {
                        debug!(
                            "Acquired {} after {} contentions in {:?}",
                            self.lock_path.display(),
                            contentions,
                            start.elapsed()
                        );
                    }
                    return Ok(StoreLockGuard {
                        file,
                        acquired: Instant::now(),
                    });
                }
                Attempt::Busy => {
                    if start.elapsed() >= timeout {
                        let owner = self
                            .current_owner()
                            .map(|info| format!("pid {}", info.pid))
                            .unwrap_or_else(|| "unknown owner".to_string());
                        return Err(EngineError::Lock(format!(
                            "timed out after {:?} waiting for {} (held by {})",
                            start.elapsed(),
                            self.lock_path.display(),
                            owner
                        )));
                    }

                    let jitter =
                        Duration::from_millis(fastrand::u64(0..=retry_delay.as_millis() as u64));
                    thread::sleep(retry_delay + jitter);
                    retry_delay = std::cmp::min(retry_delay * 2, Duration::from_millis(200));
                    contentions += 1;
                }
            }
        }
    }

    fn try_acquire_immediate(&self) -> Result<Attempt> {
        // Never truncate before holding the lock
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                EngineError::Lock(format!(
                    "cannot open lock file {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            return match errno.raw_os_error() {
                Some(libc::EWOULDBLOCK) => Ok(Attempt::Busy),
                _ => Err(EngineError::Lock(format!("flock failed: {}", errno))),
            };
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
            botbox_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let line = serde_json::to_string(&info)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", line)?;
        let pos = file.stream_position()?;
        file.set_len(pos)?;

        Ok(Attempt::Acquired(file))
    }

    /// Holder recorded in the lock file, if any
    pub fn current_owner(&self) -> Option<LockInfo> {
        let content = std::fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(content.lines().next()?).ok()
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        // An empty lock file means "released"
        if let Err(e) = self.file.set_len(0) {
            warn!("Failed to clear lock info: {}", e);
        }
        let held = self.acquired.elapsed();
        if held > Duration::from_secs(1) {
            debug!("Store lock held for {:?}", held);
        }
        // Closing the fd drops the flock
    }
}
