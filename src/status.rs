use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastResult {
    NoUpdate,
    Success,
    Rollback,
    Failed,
    FailedRollback,
}

impl LastResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoUpdate => "no-update",
            Self::Success => "success",
            Self::Rollback => "rollback",
            Self::Failed => "failed",
            Self::FailedRollback => "failed-rollback",
        }
    }
}

impl fmt::Display for LastResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The document the dashboard reads. Timestamps are RFC 3339.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusDocument {
    pub current_version: Option<String>,
    pub latest_version: Option<String>,
    pub last_result: Option<LastResult>,
    pub last_source: Option<String>,
    pub last_error: Option<String>,
    pub last_checked_at: Option<String>,
    pub next_check_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    path: PathBuf,
}

impl StatusReporter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StatusDocument> {
        if !self.path.exists() {
            return Ok(StatusDocument::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading status file {}", self.path.display()))?;
        serde_json::from_str(raw.trim_start_matches('\u{feff}'))
            .with_context(|| format!("failed decoding status file {}", self.path.display()))
    }

    /// Read-modify-write of the whole document. An unreadable previous
    /// document is replaced rather than blocking the write.
    pub fn update(&self, apply: impl FnOnce(&mut StatusDocument)) -> Result<StatusDocument> {
        let mut document = match self.load() {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %self.path.display(), error = %format!("{:#}", err), "discarding unreadable status file");
                StatusDocument::default()
            }
        };
        apply(&mut document);
        self.persist(&document)?;
        Ok(document)
    }

    fn persist(&self, document: &StatusDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating status dir {}", parent.display()))?;
        }

        let payload =
            serde_json::to_string_pretty(document).context("failed encoding status document")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload).with_context(|| {
            format!("failed writing temporary status file {}", tmp_path.display())
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed moving status file {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}
