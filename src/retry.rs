use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Bounded exponential backoff for filesystem mutations that can hit
/// transient "file in use" errors (antivirus scans, container runtimes still
/// holding handles, Windows sharing violations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (0-based), growing by 1.4x and
    /// capped at `max_delay_ms`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let mut delay = self.initial_delay_ms;
        for _ in 0..attempt.min(32) {
            delay = delay.saturating_mul(7) / 5;
            if delay >= self.max_delay_ms {
                break;
            }
        }
        delay.min(self.max_delay_ms.max(self.initial_delay_ms))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub fn run<T>(&self, label: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let total = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = label, attempts = attempt + 1, "retried operation succeeded");
                    }
                    return Ok(value);
                }
                Err(err) if is_transient(&err) && attempt + 1 < total => {
                    let delay_ms = self.delay_ms(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        total_attempts = total,
                        delay_ms = delay_ms,
                        error = %err,
                        "transient filesystem failure, retrying"
                    );
                    if delay_ms > 0 {
                        thread::sleep(Duration::from_millis(delay_ms));
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Errors worth waiting out: sharing/lock violations and busy resources.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ResourceBusy | ErrorKind::Interrupted
    ) {
        return true;
    }
    match err.raw_os_error() {
        // EPERM, EBUSY, ETXTBSY on unix
        #[cfg(unix)]
        Some(1) | Some(16) | Some(26) => true,
        // ERROR_ACCESS_DENIED, ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(5) | Some(32) | Some(33) => true,
        _ => false,
    }
}

/// Removes a directory tree, treating "already gone" as success.
pub fn remove_dir_all(policy: &RetryPolicy, dir: &Path) -> Result<()> {
    policy
        .run("remove_dir_all", || match fs::remove_dir_all(dir) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .with_context(|| format!("failed removing directory {}", dir.display()))
}

pub fn rename(policy: &RetryPolicy, from: &Path, to: &Path) -> Result<()> {
    policy
        .run("rename", || fs::rename(from, to))
        .with_context(|| format!("failed renaming {} -> {}", from.display(), to.display()))
}

/// Recursive copy. Symlinks are copied as the files they point to.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    let metadata =
        fs::metadata(src).with_context(|| format!("failed reading {}", src.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow!("{} is not a directory", src.display()));
    }
    fs::create_dir_all(dest).with_context(|| format!("failed creating {}", dest.display()))?;
    for entry in
        fs::read_dir(src).with_context(|| format!("failed listing {}", src.display()))?
    {
        let entry = entry.with_context(|| format!("failed listing {}", src.display()))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if fs::metadata(&from)
            .with_context(|| format!("failed reading {}", from.display()))?
            .is_dir()
        {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_context(|| {
                format!("failed copying {} -> {}", from.display(), to.display())
            })?;
        }
    }
    Ok(())
}
