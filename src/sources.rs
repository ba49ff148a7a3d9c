use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::{ArchiveSourceConfig, Config, RegistrySourceConfig, ShareSourceConfig};
use crate::verifier::sibling_proof_paths;
use crate::version::Version;

const USER_AGENT: &str = concat!("autoupdated/", env!("CARGO_PKG_VERSION"));
const DEFAULT_ASSET_TEMPLATE: &str = "package-{version}.zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Registry,
    Archive,
    Share,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Archive => "archive",
            Self::Share => "share",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    ContainerImage,
    Archive,
}

/// A discovered release. Built fresh each cycle and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCandidate {
    pub source: SourceKind,
    pub version: String,
    pub artifact_kind: ArtifactKind,
    /// Image reference, or file path / `http(s)://` URL of the archive.
    pub locator: String,
    pub digest_ref: Option<String>,
    pub signature_ref: Option<String>,
}

impl UpdateCandidate {
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse_lenient(&self.version)
    }
}

/// Per-cycle inputs shared by every adapter.
#[derive(Debug, Clone, Default)]
pub struct PollContext {
    pub pinned: Option<Version>,
}

pub trait VersionSource {
    fn kind(&self) -> SourceKind;

    /// `Ok(None)` means the source has nothing to offer this cycle.
    fn candidate(&self, ctx: &PollContext) -> Result<Option<UpdateCandidate>>;
}

/// Enabled adapters in their fixed evaluation order: registry, archive, share.
pub fn from_config(config: &Config, agent: &ureq::Agent) -> Vec<Box<dyn VersionSource>> {
    let mut sources: Vec<Box<dyn VersionSource>> = Vec::new();
    if config.sources.registry.enabled {
        sources.push(Box::new(RegistrySource::new(
            config.sources.registry.clone(),
            agent.clone(),
        )));
    }
    if config.sources.archive.enabled {
        sources.push(Box::new(ArchiveSource::new(config.sources.archive.clone())));
    }
    if config.sources.share.enabled {
        sources.push(Box::new(ShareSource::new(config.sources.share.clone())));
    }
    sources
}

/// Polls every adapter. A failing adapter is logged and contributes nothing.
pub fn poll_sources(
    sources: &[Box<dyn VersionSource>],
    ctx: &PollContext,
) -> Vec<UpdateCandidate> {
    let mut candidates = Vec::new();
    for source in sources {
        match source.candidate(ctx) {
            Ok(Some(candidate)) => {
                info!(
                    source = %candidate.source,
                    version = %candidate.version,
                    locator = %candidate.locator,
                    "update candidate found"
                );
                candidates.push(candidate);
            }
            Ok(None) => debug!(source = %source.kind(), "source offered no candidate"),
            Err(err) => warn!(
                source = %source.kind(),
                error = %format!("{:#}", err),
                "update source unavailable"
            ),
        }
    }
    candidates
}

pub fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

pub fn is_remote(locator: &str) -> bool {
    let lower = locator.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Copies a local path or downloads an `http(s)://` URL into `dest`.
pub fn fetch_to_file(agent: &ureq::Agent, locator: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    if !is_remote(locator) {
        fs::copy(locator, dest)
            .with_context(|| format!("failed copying {} -> {}", locator, dest.display()))?;
        return Ok(());
    }

    let response = agent
        .get(locator.trim())
        .call()
        .map_err(|err| anyhow!("download of {} failed: {}", locator, err))?;
    let mut reader = response.into_reader();
    let mut file = fs::File::create(dest)
        .with_context(|| format!("failed creating {}", dest.display()))?;
    io::copy(&mut reader, &mut file)
        .with_context(|| format!("failed writing download to {}", dest.display()))?;
    Ok(())
}

fn strip_version_prefix(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed)
        .to_string()
}

/// Whether a pinned policy rules this version out. Unparseable versions are
/// left for the resolver to discard.
fn conflicts_with_pin(version: &str, pinned: Option<&Version>) -> bool {
    match (pinned, Version::parse_lenient(version)) {
        (Some(pinned), Some(found)) => found != *pinned,
        _ => false,
    }
}

pub struct RegistrySource {
    config: RegistrySourceConfig,
    agent: ureq::Agent,
}

impl RegistrySource {
    pub fn new(config: RegistrySourceConfig, agent: ureq::Agent) -> Self {
        Self { config, agent }
    }

    fn fetch_release(&self, url: &str) -> Result<Value> {
        let response = self
            .agent
            .get(url)
            .set("Accept", "application/json")
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    anyhow!("release API {} returned status {}", url, code)
                }
                ureq::Error::Transport(transport) => {
                    anyhow!("release API {} unreachable: {}", url, transport)
                }
            })?;
        let body = response
            .into_string()
            .with_context(|| format!("failed reading release API response from {}", url))?;
        serde_json::from_str(&body)
            .with_context(|| format!("release API {} returned invalid JSON", url))
    }
}

impl VersionSource for RegistrySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    fn candidate(&self, ctx: &PollContext) -> Result<Option<UpdateCandidate>> {
        let Some(url) = self.config.api_url.as_deref().filter(|url| !url.trim().is_empty())
        else {
            return Ok(None);
        };
        let release = self.fetch_release(url.trim())?;
        Ok(candidate_from_release(&release, &self.config, ctx))
    }
}

/// Maps release metadata to a candidate without any I/O.
pub fn candidate_from_release(
    release: &Value,
    config: &RegistrySourceConfig,
    ctx: &PollContext,
) -> Option<UpdateCandidate> {
    let tag = ["tag_name", "name", "version"]
        .iter()
        .filter_map(|key| release.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty());
    let Some(tag) = tag else {
        warn!("release metadata carries no version");
        return None;
    };
    let version = strip_version_prefix(tag);

    if conflicts_with_pin(&version, ctx.pinned.as_ref()) {
        info!(
            found = %version,
            pinned = ?ctx.pinned.map(|pin| pin.to_string()),
            "registry release ignored, not the pinned version"
        );
        return None;
    }

    if config.artifact_kind == ArtifactKind::Archive {
        return archive_candidate_from_assets(release, config, version);
    }

    let Some(template) = config.image_template.as_deref() else {
        warn!("registry source has no imageTemplate configured");
        return None;
    };
    Some(UpdateCandidate {
        source: SourceKind::Registry,
        locator: template.replace("{version}", &version),
        version,
        artifact_kind: ArtifactKind::ContainerImage,
        digest_ref: None,
        signature_ref: None,
    })
}

fn archive_candidate_from_assets(
    release: &Value,
    config: &RegistrySourceConfig,
    version: String,
) -> Option<UpdateCandidate> {
    let asset_name = config
        .asset_template
        .as_deref()
        .unwrap_or(DEFAULT_ASSET_TEMPLATE)
        .replace("{version}", &version);
    let digest_name = format!("{}{}", asset_name, config.digest_suffix);
    let signature_name = format!("{}{}", asset_name, config.signature_suffix);

    let assets = release
        .get("assets")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let find_asset = |name: &str| {
        assets.iter().find_map(|asset| {
            let matches = asset.get("name").and_then(Value::as_str) == Some(name);
            if !matches {
                return None;
            }
            asset
                .get("browser_download_url")
                .or_else(|| asset.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    };

    let Some(archive_url) = find_asset(&asset_name) else {
        warn!(version = %version, asset = %asset_name, "release has no matching archive asset");
        return None;
    };
    let Some(digest_url) = find_asset(&digest_name) else {
        warn!(version = %version, asset = %digest_name, "release has no digest asset for archive");
        return None;
    };

    Some(UpdateCandidate {
        source: SourceKind::Registry,
        version,
        artifact_kind: ArtifactKind::Archive,
        locator: archive_url,
        digest_ref: Some(digest_url),
        signature_ref: find_asset(&signature_name),
    })
}

pub struct ArchiveSource {
    config: ArchiveSourceConfig,
}

impl ArchiveSource {
    pub fn new(config: ArchiveSourceConfig) -> Self {
        Self { config }
    }
}

impl VersionSource for ArchiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    fn candidate(&self, _ctx: &PollContext) -> Result<Option<UpdateCandidate>> {
        let Some(path) = self.config.path.as_deref() else {
            return Ok(None);
        };
        if !path.is_file() {
            debug!(path = %path.display(), "offline archive not present");
            return Ok(None);
        }

        let embedded = match archive::read_version_entry(path) {
            Ok(version) => version,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{:#}", err),
                    "failed reading VERSION.txt from offline archive"
                );
                None
            }
        };
        let Some(version) = embedded.or_else(|| self.config.version.clone()) else {
            warn!(path = %path.display(), "offline archive has no VERSION.txt and no configured version");
            return Ok(None);
        };

        let (sibling_digest, sibling_signature) = sibling_proof_paths(path);
        let digest = self
            .config
            .digest_file
            .clone()
            .or_else(|| sibling_digest.is_file().then_some(sibling_digest));
        let signature = self
            .config
            .signature_file
            .clone()
            .or_else(|| sibling_signature.is_file().then_some(sibling_signature));

        Ok(Some(UpdateCandidate {
            source: SourceKind::Archive,
            version: strip_version_prefix(&version),
            artifact_kind: ArtifactKind::Archive,
            locator: path.display().to_string(),
            digest_ref: digest.map(path_string),
            signature_ref: signature.map(path_string),
        }))
    }
}

pub struct ShareSource {
    config: ShareSourceConfig,
}

impl ShareSource {
    pub fn new(config: ShareSourceConfig) -> Self {
        Self { config }
    }
}

impl VersionSource for ShareSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Share
    }

    fn candidate(&self, _ctx: &PollContext) -> Result<Option<UpdateCandidate>> {
        let Some(root) = self.config.root.as_deref() else {
            return Ok(None);
        };
        let pointer = root.join(&self.config.latest_file);
        if !pointer.is_file() {
            debug!(path = %pointer.display(), "share pointer file not present");
            return Ok(None);
        }
        let raw = fs::read_to_string(&pointer)
            .with_context(|| format!("failed reading {}", pointer.display()))?;
        let version = strip_version_prefix(raw.trim_start_matches('\u{feff}'));
        if version.is_empty() {
            warn!(path = %pointer.display(), "share pointer file is empty");
            return Ok(None);
        }

        let archive_path = root.join(self.config.archive_template.replace("{version}", &version));
        if !archive_path.is_file() {
            warn!(
                version = %version,
                path = %archive_path.display(),
                "share pointer names a version whose archive is missing"
            );
            return Ok(None);
        }

        let (digest, signature) = sibling_proof_paths(&archive_path);
        Ok(Some(UpdateCandidate {
            source: SourceKind::Share,
            version,
            artifact_kind: ArtifactKind::Archive,
            locator: path_string(archive_path),
            digest_ref: digest.is_file().then(|| path_string(digest)),
            signature_ref: signature.is_file().then(|| path_string(signature)),
        }))
    }
}

fn path_string(path: PathBuf) -> String {
    path.display().to_string()
}
