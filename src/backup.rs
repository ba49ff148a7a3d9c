use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::retry::{self, RetryPolicy};

const MAX_RESTORE_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Timestamped copies of the deployment directory under one backup root.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    keep: usize,
    enabled: bool,
    retry: RetryPolicy,
}

impl BackupManager {
    pub fn new(root: PathBuf, keep: usize, enabled: bool, retry: RetryPolicy) -> Self {
        Self {
            root,
            keep,
            enabled,
            retry,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.backup_dir(),
            config.backup.keep,
            config.backup.enabled,
            RetryPolicy::from(&config.retry),
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copies `source` into a fresh timestamped folder and prunes old ones.
    ///
    /// Returns `Ok(None)` when backups are disabled or there is nothing to
    /// back up yet (first install).
    pub fn create(&self, source: &Path) -> Result<Option<BackupRecord>> {
        if !self.enabled {
            return Ok(None);
        }
        if !source.is_dir() {
            info!(source = %source.display(), "nothing to back up yet");
            return Ok(None);
        }

        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed creating backup root {}", self.root.display()))?;
        let created_at = Utc::now();
        let path = self.unique_backup_path(&created_at);
        if let Err(err) = retry::copy_dir_recursive(source, &path) {
            if let Err(cleanup_err) = retry::remove_dir_all(&self.retry, &path) {
                warn!(path = %path.display(), error = %format!("{:#}", cleanup_err), "failed removing incomplete backup");
            }
            return Err(err.context(format!("failed backing up {}", source.display())));
        }
        info!(source = %source.display(), backup = %path.display(), "backup created");

        let record = BackupRecord { path, created_at };
        if let Err(err) = self.prune_except(Some(&record.path)) {
            warn!(root = %self.root.display(), error = %format!("{:#}", err), "failed pruning old backups");
        }
        Ok(Some(record))
    }

    fn unique_backup_path(&self, created_at: &DateTime<Utc>) -> PathBuf {
        let stamp = created_at.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut candidate = self.root.join(&stamp);
        let mut suffix = 1;
        while candidate.exists() {
            candidate = self.root.join(format!("{}-{}", stamp, suffix));
            suffix += 1;
        }
        candidate
    }

    /// Backup folders, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed listing {}", self.root.display()))?
        {
            let entry = entry.with_context(|| format!("failed listing {}", self.root.display()))?;
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed reading {}", entry.path().display()))?;
            if !metadata.is_dir() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, entry.path()));
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Deletes the oldest backups until at most `keep` remain.
    pub fn prune(&self) -> Result<usize> {
        self.prune_except(None)
    }

    /// Like `prune`, but `current` always survives and counts towards `keep`.
    fn prune_except(&self, current: Option<&Path>) -> Result<usize> {
        let backups = self.list()?;
        let keep = if current.is_some() {
            self.keep.max(1)
        } else {
            self.keep
        };
        if backups.len() <= keep {
            return Ok(0);
        }
        let excess = backups.len() - keep;
        let doomed = backups
            .iter()
            .filter(|path| Some(path.as_path()) != current)
            .take(excess);
        let mut removed = 0;
        for path in doomed {
            retry::remove_dir_all(&self.retry, path)?;
            info!(backup = %path.display(), "old backup pruned");
            removed += 1;
        }
        Ok(removed)
    }

    /// Replaces `target` with a copy of the backup, retrying the whole
    /// remove-then-copy when files are still locked.
    pub fn restore(&self, record: &BackupRecord, target: &Path) -> Result<()> {
        if !record.path.is_dir() {
            return Err(anyhow!(
                "backup {} no longer exists",
                record.path.display()
            ));
        }
        let attempts = self.retry.attempts.clamp(1, MAX_RESTORE_ATTEMPTS);
        let mut last_err = None;
        for attempt in 0..attempts {
            let outcome = retry::remove_dir_all(&self.retry, target)
                .and_then(|_| retry::copy_dir_recursive(&record.path, target));
            match outcome {
                Ok(()) => {
                    info!(backup = %record.path.display(), dest = %target.display(), "backup restored");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        total_attempts = attempts,
                        error = %format!("{:#}", err),
                        "restore attempt failed"
                    );
                    last_err = Some(err);
                    let delay_ms = self.retry.delay_ms(attempt);
                    if attempt + 1 < attempts && delay_ms > 0 {
                        std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("restore was never attempted"))
            .context(format!(
                "failed restoring {} from {}",
                target.display(),
                record.path.display()
            )))
    }
}
