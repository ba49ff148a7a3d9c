use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::applier::DeploymentApplier;
use crate::backup::{BackupManager, BackupRecord};
use crate::config::Config;
use crate::control::{self, ProcessControl};
use crate::error;
use crate::health::HealthMonitor;
use crate::resolver::{self, Policy};
use crate::rollback::{RollbackCoordinator, RollbackOutcome};
use crate::sources::{self, PollContext, UpdateCandidate, VersionSource};
use crate::status::{LastResult, StatusDocument, StatusReporter};
use crate::verifier::Verifier;
use crate::version::Version;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Resolving,
    NoCandidate,
    CandidateFound,
    BackingUp,
    Applying,
    HealthChecking,
    Success,
    Failure,
    RollingBack,
    RolledBack,
    FailedRollback,
    Failed,
}

/// What one cycle did. `states` is the path taken through the state machine.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub result: LastResult,
    pub states: Vec<CycleState>,
    pub candidate: Option<UpdateCandidate>,
    pub error: Option<String>,
    pub status: Option<StatusDocument>,
}

/// Everything a daemon drives, already configured.
pub struct DaemonParts {
    pub sources: Vec<Box<dyn VersionSource>>,
    pub policy: Policy,
    pub backups: BackupManager,
    pub applier: DeploymentApplier,
    pub control: Box<dyn ProcessControl>,
    pub health: HealthMonitor,
    pub status: StatusReporter,
    pub check_interval: Duration,
    pub startup_delay: Duration,
}

/// The scheduler. Cycles run strictly one after another; `run_cycle` takes
/// `&mut self` so a second cycle cannot start while one is in flight.
///
/// Only one daemon may manage a deployment directory. There is no
/// cross-process lock.
pub struct Daemon {
    parts: DaemonParts,
}

impl Daemon {
    pub fn new(parts: DaemonParts) -> Self {
        Self { parts }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let agent = sources::http_agent(Duration::from_millis(
            config.network.request_timeout_ms.max(1),
        ));
        let verifier = Verifier::from_config(&config.security)?;
        Ok(Self::new(DaemonParts {
            sources: sources::from_config(config, &agent),
            policy: Policy::from(&config.policy),
            backups: BackupManager::from_config(config),
            applier: DeploymentApplier::from_config(config, verifier, agent),
            control: control::from_config(config),
            health: HealthMonitor::from_config(config),
            status: StatusReporter::new(config.status_file()),
            check_interval: Duration::from_millis(config.check_interval_ms.max(1000)),
            startup_delay: Duration::from_millis(config.startup_delay_ms),
        }))
    }

    pub fn status(&self) -> &StatusReporter {
        &self.parts.status
    }

    /// Startup delay, then cycles until `shutdown` is set. The interval is
    /// measured from the end of one cycle to the start of the next.
    pub fn run_forever(&mut self, shutdown: &AtomicBool) {
        info!(
            interval_ms = self.parts.check_interval.as_millis() as u64,
            startup_delay_ms = self.parts.startup_delay.as_millis() as u64,
            "update daemon started"
        );
        if !sleep_unless_shutdown(self.parts.startup_delay, shutdown) {
            info!("shutdown requested before first check");
            return;
        }
        loop {
            self.run_cycle();
            if !sleep_unless_shutdown(self.parts.check_interval, shutdown) {
                info!("shutdown requested, daemon stopping");
                return;
            }
        }
    }

    fn installed_version(&self) -> Option<Version> {
        match self.parts.applier.marker().current_version() {
            Ok(Some(version)) => return Some(version),
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{:#}", err), "failed reading version marker"),
        }
        match self.parts.control.current_running_version() {
            Ok(running) => running.as_deref().and_then(Version::parse_lenient),
            Err(err) => {
                warn!(error = %format!("{:#}", err), "failed asking controller for running version");
                None
            }
        }
    }

    fn marker_version_string(&self) -> Option<String> {
        self.parts.applier.marker().read().ok().flatten()
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let mut states = vec![CycleState::Idle, CycleState::Resolving];

        let current = self.installed_version();
        let ctx = PollContext {
            pinned: self.parts.policy.effective_pin(current.as_ref()),
        };
        let candidates = sources::poll_sources(&self.parts.sources, &ctx);
        let latest_seen = candidates
            .iter()
            .filter_map(UpdateCandidate::parsed_version)
            .max();
        let chosen = resolver::resolve(&candidates, current.as_ref(), &self.parts.policy)
            .filter(|candidate| candidate.parsed_version() != current);

        let Some(candidate) = chosen else {
            info!(current = ?current.map(|v| v.to_string()), "no update available");
            states.push(CycleState::NoCandidate);
            let status = self.write_status(|doc| {
                doc.current_version = current.map(|v| v.to_string());
                doc.latest_version = latest_seen.or(current).map(|v| v.to_string());
                doc.last_result = Some(LastResult::NoUpdate);
                doc.last_source = None;
                doc.last_error = None;
            });
            states.push(CycleState::Idle);
            return CycleReport {
                result: LastResult::NoUpdate,
                states,
                candidate: None,
                error: None,
                status,
            };
        };

        states.push(CycleState::CandidateFound);
        info!(
            version = %candidate.version,
            source = %candidate.source,
            current = ?current.map(|v| v.to_string()),
            "update selected"
        );

        let marker_before = match self.parts.applier.marker().read() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %format!("{:#}", err), "failed reading version marker before apply");
                None
            }
        };

        states.push(CycleState::BackingUp);
        let backup = self.take_backup();

        states.push(CycleState::Applying);
        let mut outcome = self
            .parts
            .applier
            .apply(&candidate, self.parts.control.as_ref())
            .context("apply failed");
        if outcome.is_ok() {
            states.push(CycleState::HealthChecking);
            outcome = self
                .parts
                .health
                .ensure_healthy()
                .map_err(anyhow::Error::from)
                .context("health check after apply failed");
        }

        let (result, error_message) = match outcome {
            Ok(()) => {
                states.push(CycleState::Success);
                info!(version = %candidate.version, "update applied and healthy");
                (LastResult::Success, None)
            }
            Err(err) => {
                let message = format!("{:#}", err);
                error!(
                    version = %candidate.version,
                    kind = error::classify(&err),
                    error = %message,
                    "update failed"
                );
                states.push(CycleState::Failure);
                let result = self.recover(backup.as_ref(), marker_before.as_ref(), &mut states);
                (result, Some(message))
            }
        };

        let current_after = match result {
            LastResult::Success => Some(candidate.version.clone()),
            LastResult::Rollback => marker_before
                .clone()
                .flatten()
                .or_else(|| self.marker_version_string())
                .or_else(|| current.map(|v| v.to_string())),
            _ => self.marker_version_string(),
        };
        let source = candidate.source.to_string();
        let latest = candidate.version.clone();
        let status = self.write_status(|doc| {
            doc.current_version = current_after;
            doc.latest_version = Some(latest);
            doc.last_result = Some(result);
            doc.last_source = Some(source);
            doc.last_error = error_message.clone();
        });
        states.push(CycleState::Idle);

        CycleReport {
            result,
            states,
            candidate: Some(candidate),
            error: error_message,
            status,
        }
    }

    /// Best effort: a failed backup is logged and the update still goes ahead.
    fn take_backup(&self) -> Option<BackupRecord> {
        match self.parts.backups.create(self.parts.applier.deploy_dir()) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    error = %format!("{:#}", err),
                    "backup failed, continuing without a rollback point"
                );
                None
            }
        }
    }

    /// `marker_before` is the marker value read before apply; `None` when it
    /// could not be read, in which case the marker is left alone.
    fn recover(
        &self,
        backup: Option<&BackupRecord>,
        marker_before: Option<&Option<String>>,
        states: &mut Vec<CycleState>,
    ) -> LastResult {
        if backup.is_none() || !self.parts.backups.enabled() {
            states.push(CycleState::Failed);
            warn!("no backup for this cycle, leaving deployment as is");
            return LastResult::Failed;
        }
        states.push(CycleState::RollingBack);
        let mut coordinator = RollbackCoordinator::new(
            &self.parts.backups,
            self.parts.control.as_ref(),
            &self.parts.health,
        );
        if let Some(previous) = marker_before {
            coordinator = coordinator.with_marker(self.parts.applier.marker(), previous.as_deref());
        }
        match coordinator.recover(backup, self.parts.applier.deploy_dir()) {
            RollbackOutcome::RolledBack => {
                states.push(CycleState::RolledBack);
                LastResult::Rollback
            }
            RollbackOutcome::FailedRollback { .. } => {
                states.push(CycleState::FailedRollback);
                LastResult::FailedRollback
            }
            RollbackOutcome::NotAttempted => {
                states.push(CycleState::Failed);
                LastResult::Failed
            }
        }
    }

    /// The single status write of a cycle. A failed write is logged; the
    /// cycle result stands.
    fn write_status(&self, apply: impl FnOnce(&mut StatusDocument)) -> Option<StatusDocument> {
        let now = Utc::now();
        let next = chrono::Duration::from_std(self.parts.check_interval)
            .ok()
            .and_then(|interval| now.checked_add_signed(interval));
        let result = self.parts.status.update(|doc| {
            apply(doc);
            doc.last_checked_at = Some(now.to_rfc3339());
            doc.next_check_at = next.map(|at| at.to_rfc3339());
        });
        match result {
            Ok(document) => Some(document),
            Err(err) => {
                error!(
                    path = %self.parts.status.path().display(),
                    error = %format!("{:#}", err),
                    "failed writing status file"
                );
                None
            }
        }
    }
}

/// Sleeps in short slices. Returns false when shutdown was requested.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SHUTDOWN_POLL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !shutdown.load(Ordering::Relaxed)
}
