use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::config::{Config, SelfUpdateConfig};
use crate::retry::{self, RetryPolicy};
use crate::sources;
use crate::verifier::{compute_sha256_hex, Verifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfUpdateOutcome {
    Disabled,
    NoPackage,
    AlreadyApplied,
    /// Swapped in; takes effect on the next process start.
    Applied,
}

/// Sibling directories used around the daemon's own install dir.
#[derive(Debug, Clone)]
struct Layout {
    install: PathBuf,
    work: PathBuf,
    incoming: PathBuf,
    previous: PathBuf,
    stamp: PathBuf,
}

impl Layout {
    fn for_install_dir(install: &Path) -> Result<Self> {
        let name = install
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("install dir {} has no usable name", install.display()))?;
        let sibling = |suffix: &str| install.with_file_name(format!("{}.{}", name, suffix));
        Ok(Self {
            install: install.to_path_buf(),
            work: sibling("staging"),
            incoming: sibling("new"),
            previous: sibling("bak"),
            stamp: sibling("applied-sha256"),
        })
    }
}

/// Replaces the daemon's own install directory from a release package.
/// Runs once at startup; the running process keeps its old code.
pub struct SelfUpdater {
    settings: SelfUpdateConfig,
    install_dir: PathBuf,
    verifier: Verifier,
    retry: RetryPolicy,
    agent: ureq::Agent,
}

impl SelfUpdater {
    pub fn new(
        settings: SelfUpdateConfig,
        install_dir: PathBuf,
        verifier: Verifier,
        retry: RetryPolicy,
        agent: ureq::Agent,
    ) -> Self {
        Self {
            settings,
            install_dir,
            verifier,
            retry,
            agent,
        }
    }

    pub fn from_config(config: &Config, verifier: Verifier, agent: ureq::Agent) -> Result<Self> {
        let install_dir = config
            .self_update
            .install_dir
            .clone()
            .ok_or_else(|| anyhow!("selfUpdate.installDir is not configured"))?;
        Ok(Self::new(
            config.self_update.clone(),
            install_dir,
            verifier,
            RetryPolicy::from(&config.retry),
            agent,
        ))
    }

    /// Runs the self-update and only logs failures; the daemon keeps
    /// starting on its current code either way.
    pub fn check_and_apply(&self) -> Option<SelfUpdateOutcome> {
        match self.run() {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(install_dir = %self.install_dir.display(), error = %format!("{:#}", err), "self-update failed");
                None
            }
        }
    }

    pub fn run(&self) -> Result<SelfUpdateOutcome> {
        if !self.settings.enabled {
            return Ok(SelfUpdateOutcome::Disabled);
        }
        let zip_url = self
            .settings
            .zip_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());
        let locator = match (zip_url, self.settings.local_zip_path.as_deref()) {
            (Some(url), _) => url.to_string(),
            (None, Some(path)) if path.is_file() => path.display().to_string(),
            (None, Some(path)) => {
                debug!(path = %path.display(), "no local self-update package present");
                return Ok(SelfUpdateOutcome::NoPackage);
            }
            (None, None) => return Ok(SelfUpdateOutcome::NoPackage),
        };

        let layout = Layout::for_install_dir(&self.install_dir)?;
        info!(package = %locator, install_dir = %layout.install.display(), "checking for daemon self-update");
        retry::remove_dir_all(&self.retry, &layout.work)?;
        let outcome = self.stage_and_swap(&layout, &locator);
        if let Err(err) = retry::remove_dir_all(&self.retry, &layout.work) {
            warn!(dir = %layout.work.display(), error = %format!("{:#}", err), "failed cleaning self-update staging");
        }
        outcome
    }

    fn stage_and_swap(&self, layout: &Layout, locator: &str) -> Result<SelfUpdateOutcome> {
        fs::create_dir_all(&layout.work)
            .with_context(|| format!("failed creating {}", layout.work.display()))?;
        let package = layout.work.join("daemon-update.zip");
        sources::fetch_to_file(&self.agent, locator, &package)?;
        let digest = self.fetch_proof(self.settings.hash_url.as_deref(), &layout.work, "daemon-update.zip.sha256")?;
        let signature = self.fetch_proof(self.settings.signature_url.as_deref(), &layout.work, "daemon-update.zip.sig")?;
        self.verifier
            .verify(&package, digest.as_deref(), signature.as_deref())?;

        let package_hash = compute_sha256_hex(&package)?;
        if read_stamp(&layout.stamp).as_deref() == Some(package_hash.as_str()) {
            info!(sha256 = %package_hash, "self-update package already applied");
            return Ok(SelfUpdateOutcome::AlreadyApplied);
        }

        archive::safe_extract(&package, &layout.incoming)?;
        self.swap(layout)?;

        let tmp = layout.stamp.with_extension("tmp");
        fs::write(&tmp, &package_hash)
            .with_context(|| format!("failed writing {}", tmp.display()))?;
        fs::rename(&tmp, &layout.stamp)
            .with_context(|| format!("failed moving {} -> {}", tmp.display(), layout.stamp.display()))?;
        info!(install_dir = %layout.install.display(), "daemon self-update applied, active after next restart");
        Ok(SelfUpdateOutcome::Applied)
    }

    fn fetch_proof(&self, url: Option<&str>, dir: &Path, name: &str) -> Result<Option<PathBuf>> {
        let Some(url) = url.map(str::trim).filter(|url| !url.is_empty()) else {
            return Ok(None);
        };
        let dest = dir.join(name);
        sources::fetch_to_file(&self.agent, url, &dest)?;
        Ok(Some(dest))
    }

    fn swap(&self, layout: &Layout) -> Result<()> {
        retry::remove_dir_all(&self.retry, &layout.previous)?;
        if layout.install.exists() {
            retry::rename(&self.retry, &layout.install, &layout.previous)?;
        }
        if let Err(err) = retry::rename(&self.retry, &layout.incoming, &layout.install) {
            if layout.previous.exists() {
                if let Err(restore_err) = retry::rename(&self.retry, &layout.previous, &layout.install) {
                    error!(error = %format!("{:#}", restore_err), "failed restoring previous daemon install");
                }
            }
            return Err(err.context("failed activating new daemon install"));
        }
        Ok(())
    }
}

fn read_stamp(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_ascii_lowercase())
        .filter(|raw| !raw.is_empty())
}
