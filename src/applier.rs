use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::archive;
use crate::config::Config;
use crate::control::ProcessControl;
use crate::error::UpdateError;
use crate::marker::VersionMarker;
use crate::retry::{self, RetryPolicy};
use crate::sources::{self, ArtifactKind, UpdateCandidate};
use crate::verifier::Verifier;

const PACKAGE_FILE: &str = "package.zip";
const DEPLOY_SUBDIR: &str = "deploy";
const PERSISTENT_SUBDIRS: [&str; 2] = ["data", "logs"];

/// Files of one staged archive update.
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub dir: PathBuf,
    pub package: PathBuf,
    pub digest: Option<PathBuf>,
    pub signature: Option<PathBuf>,
}

/// Replaces the live deployment with a candidate release.
pub struct DeploymentApplier {
    deploy_dir: PathBuf,
    staging_root: PathBuf,
    verifier: Verifier,
    marker: VersionMarker,
    retry: RetryPolicy,
    agent: ureq::Agent,
}

impl DeploymentApplier {
    pub fn new(
        deploy_dir: PathBuf,
        staging_root: PathBuf,
        verifier: Verifier,
        marker: VersionMarker,
        retry: RetryPolicy,
        agent: ureq::Agent,
    ) -> Self {
        Self {
            deploy_dir,
            staging_root,
            verifier,
            marker,
            retry,
            agent,
        }
    }

    pub fn from_config(config: &Config, verifier: Verifier, agent: ureq::Agent) -> Self {
        Self::new(
            config.deploy_dir(),
            config.staging_dir(),
            verifier,
            VersionMarker::new(config.env_file(), config.target.version_key.clone()),
            RetryPolicy::from(&config.retry),
            agent,
        )
    }

    pub fn deploy_dir(&self) -> &Path {
        &self.deploy_dir
    }

    pub fn marker(&self) -> &VersionMarker {
        &self.marker
    }

    pub fn apply(&self, candidate: &UpdateCandidate, control: &dyn ProcessControl) -> Result<()> {
        info!(
            version = %candidate.version,
            source = %candidate.source,
            kind = ?candidate.artifact_kind,
            "applying update"
        );
        match candidate.artifact_kind {
            ArtifactKind::ContainerImage => self.apply_image(candidate, control),
            ArtifactKind::Archive => self.apply_archive(candidate, control),
        }
    }

    /// Not atomic: a bad image is caught by the health check and rolled back.
    fn apply_image(&self, candidate: &UpdateCandidate, control: &dyn ProcessControl) -> Result<()> {
        control
            .pull_image(&candidate.locator)
            .with_context(|| format!("failed pulling image {}", candidate.locator))?;
        self.marker.write(&candidate.version)?;
        control
            .restart()
            .context("failed recreating service with new image")?;
        info!(version = %candidate.version, image = %candidate.locator, "image deployed");
        Ok(())
    }

    fn apply_archive(
        &self,
        candidate: &UpdateCandidate,
        control: &dyn ProcessControl,
    ) -> Result<()> {
        let staged = self.stage(candidate)?;
        let result = self.swap_in(candidate, &staged, control);
        if let Err(err) = retry::remove_dir_all(&self.retry, &staged.dir) {
            warn!(dir = %staged.dir.display(), error = %format!("{:#}", err), "failed cleaning staging directory");
        }
        result
    }

    /// Copies the package and its proof files into a fresh staging folder.
    pub fn stage(&self, candidate: &UpdateCandidate) -> Result<StagedPackage> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let dir = self.staging_root.join(format!("update-{}", stamp));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed creating staging dir {}", dir.display()))?;

        let package = dir.join(PACKAGE_FILE);
        sources::fetch_to_file(&self.agent, &candidate.locator, &package)
            .with_context(|| format!("failed staging package {}", candidate.locator))?;

        let digest = self.stage_optional(&dir, candidate.digest_ref.as_deref(), ".sha256")?;
        let signature = self.stage_optional(&dir, candidate.signature_ref.as_deref(), ".sig")?;
        info!(dir = %dir.display(), "package staged");
        Ok(StagedPackage {
            dir,
            package,
            digest,
            signature,
        })
    }

    fn stage_optional(
        &self,
        dir: &Path,
        locator: Option<&str>,
        suffix: &str,
    ) -> Result<Option<PathBuf>> {
        let Some(locator) = locator else {
            return Ok(None);
        };
        if !sources::is_remote(locator) && !Path::new(locator).is_file() {
            // the verifier reports the missing proof when it is required
            warn!(locator = %locator, "proof file not found while staging");
            return Ok(None);
        }
        let dest = dir.join(format!("{}{}", PACKAGE_FILE, suffix));
        sources::fetch_to_file(&self.agent, locator, &dest)
            .with_context(|| format!("failed staging {}", locator))?;
        Ok(Some(dest))
    }

    fn swap_in(
        &self,
        candidate: &UpdateCandidate,
        staged: &StagedPackage,
        control: &dyn ProcessControl,
    ) -> Result<()> {
        self.verifier.verify(
            &staged.package,
            staged.digest.as_deref(),
            staged.signature.as_deref(),
        )?;

        let extract_dir = staged.dir.join("extract");
        archive::safe_extract(&staged.package, &extract_dir)?;
        let new_deploy = extract_dir.join(DEPLOY_SUBDIR);
        if !new_deploy.is_dir() {
            return Err(UpdateError::MalformedArtifact {
                artifact: staged.package.clone(),
                reason: format!("archive has no '{}/' directory", DEPLOY_SUBDIR),
            }
            .into());
        }

        control
            .stop()
            .context("failed stopping service before swap")?;

        if let Some(parent) = self.deploy_dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        retry::remove_dir_all(&self.retry, &self.deploy_dir)?;
        retry::rename(&self.retry, &new_deploy, &self.deploy_dir)?;
        for subdir in PERSISTENT_SUBDIRS {
            let path = self.deploy_dir.join(subdir);
            fs::create_dir_all(&path)
                .with_context(|| format!("failed creating {}", path.display()))?;
        }
        info!(deploy_dir = %self.deploy_dir.display(), version = %candidate.version, "deployment directory swapped");

        self.marker.write(&candidate.version)?;
        control
            .start()
            .context("failed starting service after swap")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use anyhow::Result;

    use super::DeploymentApplier;
    use crate::archive::test_support::write_zip;
    use crate::control::ProcessControl;
    use crate::error::UpdateError;
    use crate::marker::VersionMarker;
    use crate::retry::RetryPolicy;
    use crate::sources::{http_agent, ArtifactKind, SourceKind, UpdateCandidate};
    use crate::verifier::{compute_sha256_hex, Verifier};

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
    }

    impl ProcessControl for Recorder {
        fn pull_image(&self, image: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("pull {}", image));
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.calls.borrow_mut().push("stop".to_string());
            Ok(())
        }

        fn start(&self) -> Result<()> {
            self.calls.borrow_mut().push("start".to_string());
            Ok(())
        }

        fn current_running_version(&self) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn applier(root: &Path, verifier: Verifier) -> DeploymentApplier {
        let deploy = root.join("deploy");
        DeploymentApplier::new(
            deploy.clone(),
            root.join("staging"),
            verifier,
            VersionMarker::new(deploy.join(".env"), "APP_VERSION"),
            RetryPolicy::immediate(2),
            http_agent(Duration::from_secs(5)),
        )
    }

    fn archive_candidate(zip: &Path, digest: Option<&Path>) -> UpdateCandidate {
        UpdateCandidate {
            source: SourceKind::Archive,
            version: "2.0.0".to_string(),
            artifact_kind: ArtifactKind::Archive,
            locator: zip.display().to_string(),
            digest_ref: digest.map(|path| path.display().to_string()),
            signature_ref: None,
        }
    }

    #[test]
    fn archive_swap_replaces_deploy_dir_and_writes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("deploy")).expect("deploy");
        fs::write(dir.path().join("deploy/old.txt"), "old").expect("old");

        let zip = dir.path().join("release.zip");
        write_zip(
            &zip,
            &[
                ("VERSION.txt", "2.0.0"),
                ("deploy/app.txt", "new"),
                ("deploy/.env", "PORT=8080\n"),
            ],
        );
        let digest = dir.path().join("release.zip.sha256");
        fs::write(&digest, compute_sha256_hex(&zip).expect("hash")).expect("digest");

        let applier = applier(dir.path(), Verifier::new(true, false));
        let control = Recorder::default();
        applier
            .apply(&archive_candidate(&zip, Some(&digest)), &control)
            .expect("apply");

        let deploy = dir.path().join("deploy");
        assert_eq!(fs::read_to_string(deploy.join("app.txt")).expect("app"), "new");
        assert!(!deploy.join("old.txt").exists());
        assert!(deploy.join("data").is_dir());
        assert!(deploy.join("logs").is_dir());
        assert_eq!(
            fs::read_to_string(deploy.join(".env")).expect("env"),
            "PORT=8080\nAPP_VERSION=2.0.0\n"
        );
        assert_eq!(*control.calls.borrow(), vec!["stop", "start"]);
        let leftovers = fs::read_dir(dir.path().join("staging")).expect("staging").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn failed_digest_aborts_before_any_destructive_step() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("deploy")).expect("deploy");
        fs::write(dir.path().join("deploy/old.txt"), "old").expect("old");

        let zip = dir.path().join("release.zip");
        write_zip(&zip, &[("deploy/app.txt", "new")]);
        let digest = dir.path().join("release.zip.sha256");
        fs::write(&digest, "0".repeat(64)).expect("digest");

        let control = Recorder::default();
        let err = applier(dir.path(), Verifier::new(true, false))
            .apply(&archive_candidate(&zip, Some(&digest)), &control)
            .expect_err("digest mismatch");
        assert!(matches!(
            err.downcast_ref::<UpdateError>(),
            Some(UpdateError::Integrity { .. })
        ));
        assert!(control.calls.borrow().is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("deploy/old.txt")).expect("old"),
            "old"
        );
    }

    #[test]
    fn archive_without_deploy_dir_is_malformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip = dir.path().join("release.zip");
        write_zip(&zip, &[("app.txt", "flat layout")]);

        let control = Recorder::default();
        let err = applier(dir.path(), Verifier::new(false, false))
            .apply(&archive_candidate(&zip, None), &control)
            .expect_err("malformed");
        assert!(matches!(
            err.downcast_ref::<UpdateError>(),
            Some(UpdateError::MalformedArtifact { .. })
        ));
        assert!(control.calls.borrow().is_empty());
    }

    #[test]
    fn zip_slip_archive_never_touches_deployment() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("deploy")).expect("deploy");
        fs::write(dir.path().join("deploy/old.txt"), "old").expect("old");
        let zip = dir.path().join("release.zip");
        write_zip(
            &zip,
            &[("deploy/app.txt", "new"), ("../../escape.txt", "owned")],
        );

        let control = Recorder::default();
        let err = applier(dir.path(), Verifier::new(false, false))
            .apply(&archive_candidate(&zip, None), &control)
            .expect_err("zip slip");
        assert!(matches!(
            err.downcast_ref::<UpdateError>(),
            Some(UpdateError::ZipSlip { .. })
        ));
        assert!(control.calls.borrow().is_empty());
        assert!(dir.path().join("deploy/old.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn image_strategy_pulls_writes_marker_and_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let applier = applier(dir.path(), Verifier::new(true, true));
        let control = Recorder::default();
        let candidate = UpdateCandidate {
            source: SourceKind::Registry,
            version: "3.1.0".to_string(),
            artifact_kind: ArtifactKind::ContainerImage,
            locator: "ghcr.io/acme/app:3.1.0".to_string(),
            digest_ref: None,
            signature_ref: None,
        };
        applier.apply(&candidate, &control).expect("apply");
        assert_eq!(
            *control.calls.borrow(),
            vec!["pull ghcr.io/acme/app:3.1.0", "stop", "start"]
        );
        assert_eq!(
            applier.marker().read().expect("marker"),
            Some("3.1.0".to_string())
        );
    }
}
