use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use autoupdated::applier::DeploymentApplier;
use autoupdated::backup::BackupManager;
use autoupdated::config::ArchiveSourceConfig;
use autoupdated::control::ProcessControl;
use autoupdated::daemon::{CycleState, Daemon, DaemonParts};
use autoupdated::health::{HealthMonitor, Probe};
use autoupdated::marker::VersionMarker;
use autoupdated::resolver::Policy;
use autoupdated::retry::RetryPolicy;
use autoupdated::sources::{
    http_agent, ArchiveSource, ArtifactKind, PollContext, SourceKind, UpdateCandidate,
    VersionSource,
};
use autoupdated::status::{LastResult, StatusReporter};
use autoupdated::verifier::Verifier;

#[derive(Clone, Default)]
struct FakeControl {
    calls: Arc<Mutex<Vec<String>>>,
    fail_pull: bool,
}

impl FakeControl {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }
}

impl ProcessControl for FakeControl {
    fn pull_image(&self, image: &str) -> Result<()> {
        self.record(format!("pull {}", image));
        if self.fail_pull {
            return Err(anyhow!("manifest unknown"));
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop".to_string());
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.record("start".to_string());
        Ok(())
    }

    fn current_running_version(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Healthy unless the live marker names the broken release.
struct MarkerProbe {
    env_file: PathBuf,
    broken_version: &'static str,
    attempts: Arc<AtomicU32>,
}

impl Probe for MarkerProbe {
    fn probe(&self) -> Result<(), String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let marker = VersionMarker::new(self.env_file.clone(), "APP_VERSION");
        match marker.read() {
            Ok(Some(version)) if version == self.broken_version => {
                Err("502 bad gateway".to_string())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn describe(&self) -> String {
        "marker-probe".to_string()
    }
}

struct FixedSource(UpdateCandidate);

impl VersionSource for FixedSource {
    fn kind(&self) -> SourceKind {
        self.0.source
    }

    fn candidate(&self, _ctx: &PollContext) -> Result<Option<UpdateCandidate>> {
        Ok(Some(self.0.clone()))
    }
}

struct Harness {
    root: tempfile::TempDir,
    env_outside_deploy: bool,
}

impl Harness {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("tempdir"),
            env_outside_deploy: false,
        }
    }

    /// Keeps the env file in `config/`, where restoring the deploy dir
    /// does not touch it.
    fn with_env_outside_deploy() -> Self {
        Self {
            env_outside_deploy: true,
            ..Self::new()
        }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn deploy(&self) -> PathBuf {
        self.path().join("deploy")
    }

    fn env_file(&self) -> PathBuf {
        if self.env_outside_deploy {
            self.path().join("config/.env")
        } else {
            self.deploy().join(".env")
        }
    }

    fn status(&self) -> StatusReporter {
        StatusReporter::new(self.path().join("logs/update-status.json"))
    }

    fn seed_release(&self, version: &str) {
        fs::create_dir_all(self.deploy().join("web")).expect("deploy");
        fs::write(self.deploy().join("web/index.html"), format!("release {}", version))
            .expect("index");
        let env_file = self.env_file();
        if let Some(parent) = env_file.parent() {
            fs::create_dir_all(parent).expect("env dir");
        }
        fs::write(
            env_file,
            format!("DB_HOST=db\nAPP_VERSION={}\n", version),
        )
        .expect("env");
    }

    fn daemon(
        &self,
        sources: Vec<Box<dyn VersionSource>>,
        control: FakeControl,
        health: HealthMonitor,
        backup_root: PathBuf,
        backups_enabled: bool,
    ) -> Daemon {
        let retry = RetryPolicy::immediate(2);
        Daemon::new(DaemonParts {
            sources,
            policy: Policy::default(),
            backups: BackupManager::new(backup_root, 5, backups_enabled, retry),
            applier: DeploymentApplier::new(
                self.deploy(),
                self.path().join("staging"),
                Verifier::new(false, false),
                VersionMarker::new(self.env_file(), "APP_VERSION"),
                retry,
                http_agent(Duration::from_secs(5)),
            ),
            control: Box::new(control),
            health,
            status: self.status(),
            check_interval: Duration::from_secs(300),
            startup_delay: Duration::ZERO,
        })
    }

    fn marker_probe(&self, broken_version: &'static str) -> (HealthMonitor, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let monitor = HealthMonitor::new(
            Some(Box::new(MarkerProbe {
                env_file: self.env_file(),
                broken_version,
                attempts: attempts.clone(),
            })),
            45,
            Duration::ZERO,
        );
        (monitor, attempts)
    }
}

fn image_candidate(version: &str) -> UpdateCandidate {
    UpdateCandidate {
        source: SourceKind::Registry,
        version: version.to_string(),
        artifact_kind: ArtifactKind::ContainerImage,
        locator: format!("ghcr.io/acme/dashboard:{}", version),
        digest_ref: None,
        signature_ref: None,
    }
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = fs::File::create(path).expect("create zip");
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in entries {
        zip.start_file(*name, options).expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish zip");
}

fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).expect("read_dir") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                files.insert(path.strip_prefix(dir).expect("prefix").to_path_buf(), Vec::new());
                pending.push(path);
            } else {
                let body = fs::read(&path).expect("read");
                files.insert(path.strip_prefix(dir).expect("prefix").to_path_buf(), body);
            }
        }
    }
    files
}

#[test]
fn unhealthy_image_update_rolls_back_to_previous_release() {
    let harness = Harness::new();
    harness.seed_release("1.0.0");
    let before = snapshot(&harness.deploy());
    let control = FakeControl::default();
    let (health, attempts) = harness.marker_probe("2.0.0");

    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(image_candidate("2.0.0")))],
        control.clone(),
        health,
        harness.path().join("backup"),
        true,
    );
    let report = daemon.run_cycle();

    assert_eq!(report.result, LastResult::Rollback);
    assert!(report.states.contains(&CycleState::HealthChecking));
    assert!(report.states.contains(&CycleState::RolledBack));
    assert_eq!(report.states.last(), Some(&CycleState::Idle));
    // 45 failed probes against the new release, then one healthy probe after restore
    assert_eq!(attempts.load(Ordering::SeqCst), 46);

    let status = harness.status().load().expect("status");
    assert_eq!(status.last_result, Some(LastResult::Rollback));
    assert_eq!(status.current_version.as_deref(), Some("1.0.0"));
    assert_eq!(status.latest_version.as_deref(), Some("2.0.0"));
    assert_eq!(status.last_source.as_deref(), Some("registry"));
    assert!(status.last_error.is_some());
    assert!(status.last_checked_at.is_some());
    assert!(status.next_check_at.is_some());

    assert_eq!(snapshot(&harness.deploy()), before);
    assert_eq!(
        control.calls().first().map(String::as_str),
        Some("pull ghcr.io/acme/dashboard:2.0.0")
    );
}

#[test]
fn rollback_restores_version_marker_kept_outside_deploy_dir() {
    let harness = Harness::with_env_outside_deploy();
    harness.seed_release("1.0.0");
    let control = FakeControl::default();
    let (health, attempts) = harness.marker_probe("2.0.0");

    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(image_candidate("2.0.0")))],
        control.clone(),
        health,
        harness.path().join("backup"),
        true,
    );
    let report = daemon.run_cycle();

    assert_eq!(report.result, LastResult::Rollback);
    assert_eq!(attempts.load(Ordering::SeqCst), 46);
    assert_eq!(
        fs::read_to_string(harness.env_file()).expect("env"),
        "DB_HOST=db\nAPP_VERSION=1.0.0\n"
    );
    let status = harness.status().load().expect("status");
    assert_eq!(status.last_result, Some(LastResult::Rollback));
    assert_eq!(status.current_version.as_deref(), Some("1.0.0"));
}

#[test]
fn failed_apply_without_backups_reports_failed() {
    let harness = Harness::new();
    harness.seed_release("1.0.0");
    let before = snapshot(&harness.deploy());
    let control = FakeControl {
        fail_pull: true,
        ..FakeControl::default()
    };
    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(image_candidate("2.0.0")))],
        control.clone(),
        HealthMonitor::always_healthy(),
        harness.path().join("backup"),
        false,
    );
    let report = daemon.run_cycle();

    assert_eq!(report.result, LastResult::Failed);
    assert!(report.states.contains(&CycleState::Failed));
    assert!(!report.states.contains(&CycleState::RollingBack));
    assert!(!report.states.contains(&CycleState::HealthChecking));
    assert_eq!(control.calls(), vec!["pull ghcr.io/acme/dashboard:2.0.0".to_string()]);
    assert_eq!(snapshot(&harness.deploy()), before);
    assert!(!harness.path().join("backup").exists());

    let status = harness.status().load().expect("status");
    assert_eq!(status.last_result, Some(LastResult::Failed));
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("manifest unknown")));
}

#[test]
fn successful_apply_then_quiet_cycle_leaves_deployment_untouched() {
    let harness = Harness::new();
    let zip_path = harness.path().join("offline.zip");
    write_zip(
        &zip_path,
        &[
            ("VERSION.txt", "1.4.0\n"),
            ("deploy/web/index.html", "release 1.4.0"),
            ("deploy/docker-compose.yml", "services: {}\n"),
        ],
    );
    let source = ArchiveSource::new(ArchiveSourceConfig {
        enabled: true,
        path: Some(zip_path),
        ..ArchiveSourceConfig::default()
    });
    let mut daemon = harness.daemon(
        vec![Box::new(source)],
        FakeControl::default(),
        HealthMonitor::always_healthy(),
        harness.path().join("backup"),
        true,
    );

    let first = daemon.run_cycle();
    assert_eq!(first.result, LastResult::Success);
    assert_eq!(
        fs::read_to_string(harness.deploy().join("web/index.html")).expect("index"),
        "release 1.4.0"
    );
    let after_first = snapshot(&harness.deploy());

    let second = daemon.run_cycle();
    assert_eq!(second.result, LastResult::NoUpdate);
    assert_eq!(
        second.states,
        vec![
            CycleState::Idle,
            CycleState::Resolving,
            CycleState::NoCandidate,
            CycleState::Idle
        ]
    );
    assert_eq!(snapshot(&harness.deploy()), after_first);

    let status = harness.status().load().expect("status");
    assert_eq!(status.last_result, Some(LastResult::NoUpdate));
    assert_eq!(status.current_version.as_deref(), Some("1.4.0"));
    assert_eq!(status.last_source, None);
    assert_eq!(status.last_error, None);
}

#[test]
fn broken_backup_target_does_not_block_update() {
    let harness = Harness::new();
    harness.seed_release("1.0.0");
    let blocker = harness.path().join("not-a-dir");
    fs::write(&blocker, "plain file").expect("blocker");

    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(image_candidate("1.1.0")))],
        FakeControl::default(),
        HealthMonitor::always_healthy(),
        blocker.join("backup"),
        true,
    );
    let report = daemon.run_cycle();

    assert_eq!(report.result, LastResult::Success);
    let marker = VersionMarker::new(harness.env_file(), "APP_VERSION");
    assert_eq!(marker.read().expect("marker").as_deref(), Some("1.1.0"));
}

#[test]
fn zip_slip_release_is_rejected_and_rolled_back() {
    let harness = Harness::new();
    harness.seed_release("1.0.0");
    let before = snapshot(&harness.deploy());
    let zip_path = harness.path().join("evil.zip");
    write_zip(
        &zip_path,
        &[
            ("deploy/web/index.html", "pwned"),
            ("../../escape.txt", "owned"),
        ],
    );
    let candidate = UpdateCandidate {
        source: SourceKind::Share,
        version: "9.9.9".to_string(),
        artifact_kind: ArtifactKind::Archive,
        locator: zip_path.display().to_string(),
        digest_ref: None,
        signature_ref: None,
    };
    let control = FakeControl::default();
    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(candidate))],
        control.clone(),
        HealthMonitor::always_healthy(),
        harness.path().join("backup"),
        true,
    );
    let report = daemon.run_cycle();

    assert_eq!(report.result, LastResult::Rollback);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|error| error.contains("escapes extraction root")));
    assert_eq!(snapshot(&harness.deploy()), before);
    assert!(!harness.path().join("escape.txt").exists());
    assert!(!harness.path().join("staging").join("escape.txt").exists());
}

#[test]
fn restored_release_that_stays_unhealthy_is_a_failed_rollback() {
    let harness = Harness::new();
    harness.seed_release("1.0.0");
    let (health, _attempts) = harness.marker_probe("1.0.0");
    let control = FakeControl {
        fail_pull: true,
        ..FakeControl::default()
    };
    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(image_candidate("2.0.0")))],
        control,
        health,
        harness.path().join("backup"),
        true,
    );
    let report = daemon.run_cycle();

    assert_eq!(report.result, LastResult::FailedRollback);
    assert!(report.states.contains(&CycleState::FailedRollback));
    let status = harness.status().load().expect("status");
    assert_eq!(status.last_result, Some(LastResult::FailedRollback));
}

#[test]
fn older_candidate_is_ignored_without_downgrade_permission() {
    let harness = Harness::new();
    harness.seed_release("3.0.0");
    let control = FakeControl::default();
    let mut daemon = harness.daemon(
        vec![Box::new(FixedSource(image_candidate("2.9.0")))],
        control.clone(),
        HealthMonitor::always_healthy(),
        harness.path().join("backup"),
        true,
    );
    let report = daemon.run_cycle();
    assert_eq!(report.result, LastResult::NoUpdate);
    assert!(control.calls().is_empty());
    let status = harness.status().load().expect("status");
    assert_eq!(status.current_version.as_deref(), Some("3.0.0"));
}
