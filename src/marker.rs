use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::version::Version;

/// The `KEY=value` line in the service's env file that records which release
/// is live. Other lines in the file are preserved on write.
#[derive(Debug, Clone)]
pub struct VersionMarker {
    path: PathBuf,
    key: String,
}

impl VersionMarker {
    pub fn new(path: PathBuf, key: impl Into<String>) -> Self {
        Self {
            path,
            key: key.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        Ok(raw
            .lines()
            .filter_map(|line| self.value_of(line))
            .last()
            .filter(|value| !value.is_empty()))
    }

    /// The installed version, or `None` when the marker is missing or holds
    /// something that is not a version.
    pub fn current_version(&self) -> Result<Option<Version>> {
        Ok(self.read()?.as_deref().and_then(Version::parse_lenient))
    }

    pub fn write(&self, version: &str) -> Result<()> {
        self.rewrite(Some(format!("{}={}", self.key, version)))
    }

    /// Drops the key, keeping every other line. A missing file stays missing.
    pub fn clear(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.rewrite(None)
    }

    /// Puts back a value captured earlier with `read`.
    pub fn restore(&self, previous: Option<&str>) -> Result<()> {
        match previous {
            Some(version) => self.write(version),
            None => self.clear(),
        }
    }

    fn rewrite(&self, assignment: Option<String>) -> Result<()> {
        let existing = if self.path.exists() {
            fs::read_to_string(&self.path)
                .with_context(|| format!("failed reading {}", self.path.display()))?
        } else {
            String::new()
        };

        let mut pending = assignment;
        let mut lines: Vec<String> = Vec::new();
        for line in existing.lines() {
            if self.value_of(line).is_some() {
                if let Some(assignment) = pending.take() {
                    lines.push(assignment);
                }
            } else {
                lines.push(line.to_string());
            }
        }
        if let Some(assignment) = pending {
            lines.push(assignment);
        }
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).with_context(|| format!("failed writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed moving {} to {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    fn value_of(&self, line: &str) -> Option<String> {
        let line = line.trim_start_matches('\u{feff}').trim();
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=')?;
        if key.trim() != self.key {
            return None;
        }
        Some(value.trim().trim_matches('"').trim_matches('\'').to_string())
    }
}
