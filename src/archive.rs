use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::UpdateError;

pub const VERSION_ENTRY: &str = "VERSION.txt";

struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Extracts `zip_path` into `dest`, which must not exist yet.
///
/// Every entry name is validated before anything is written; a single entry
/// that would land outside `dest` aborts the whole extraction. On any error
/// the partially written `dest` is removed.
pub fn safe_extract(zip_path: &Path, dest: &Path) -> Result<usize> {
    let file = fs::File::open(zip_path)
        .with_context(|| format!("failed opening archive {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file).map_err(|err| UpdateError::MalformedArtifact {
        artifact: zip_path.to_path_buf(),
        reason: format!("not a readable zip archive: {}", err),
    })?;

    let mut plan = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .with_context(|| format!("failed reading entry #{} of {}", index, zip_path.display()))?;
        let name = entry.name().to_string();
        let relative = contained_relative_path(&name).ok_or_else(|| UpdateError::ZipSlip {
            entry: name.clone(),
            root: dest.to_path_buf(),
        })?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        plan.push(PlannedEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }

    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("failed clearing extraction dir {}", dest.display()))?;
    }
    fs::create_dir_all(dest)
        .with_context(|| format!("failed creating extraction dir {}", dest.display()))?;

    match write_entries(&mut archive, &plan, dest) {
        Ok(()) => {
            debug!(archive = %zip_path.display(), dest = %dest.display(), entries = plan.len(), "archive extracted");
            Ok(plan.len())
        }
        Err(err) => {
            if let Err(cleanup_err) = fs::remove_dir_all(dest) {
                warn!(dest = %dest.display(), error = %cleanup_err, "failed removing partial extraction");
            }
            Err(err)
        }
    }
}

fn write_entries(
    archive: &mut ZipArchive<fs::File>,
    plan: &[PlannedEntry],
    dest: &Path,
) -> Result<()> {
    for planned in plan {
        let target = dest.join(&planned.relative);
        if planned.is_dir {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed creating {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let mut entry = archive
            .by_index(planned.index)
            .with_context(|| format!("failed reading entry {}", planned.relative.display()))?;
        let mut out = fs::File::create(&target)
            .with_context(|| format!("failed creating {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed writing {}", target.display()))?;

        // keep executable bits so shipped scripts stay runnable
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode().filter(|mode| mode & 0o111 != 0) {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode((mode & 0o777) | 0o600))
                .with_context(|| format!("failed setting permissions on {}", target.display()))?;
        }
    }
    Ok(())
}

/// Lexically resolves an entry name against the extraction root.
///
/// Returns `None` when the name is absolute, carries a drive prefix, or climbs
/// above the root at any point. Backslashes are treated as separators so that
/// archives built on Windows cannot smuggle `..\` past the check.
pub fn contained_relative_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.iter().collect())
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Reads the trimmed `VERSION.txt` at the archive root, if present.
pub fn read_version_entry(zip_path: &Path) -> Result<Option<String>> {
    let file = fs::File::open(zip_path)
        .with_context(|| format!("failed opening archive {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed reading archive {}", zip_path.display()))?;
    let mut entry = match archive.by_name(VERSION_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed reading {} from {}", VERSION_ENTRY, zip_path.display())
            })
        }
    };
    let mut raw = String::new();
    entry
        .read_to_string(&mut raw)
        .with_context(|| format!("failed reading {} from {}", VERSION_ENTRY, zip_path.display()))?;
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}
