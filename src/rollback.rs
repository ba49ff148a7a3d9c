use std::path::Path;

use tracing::{error, info, warn};

use crate::backup::{BackupManager, BackupRecord};
use crate::control::ProcessControl;
use crate::health::HealthMonitor;
use crate::marker::VersionMarker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Previous release restored and healthy again.
    RolledBack,
    /// Restore failed or the restored release stayed unhealthy.
    FailedRollback { reason: String },
    /// No backup to restore from.
    NotAttempted,
}

/// Restores the backup taken for this cycle. Never retries past one restore.
pub struct RollbackCoordinator<'a> {
    backups: &'a BackupManager,
    control: &'a dyn ProcessControl,
    health: &'a HealthMonitor,
    marker: Option<(&'a VersionMarker, Option<&'a str>)>,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(
        backups: &'a BackupManager,
        control: &'a dyn ProcessControl,
        health: &'a HealthMonitor,
    ) -> Self {
        Self {
            backups,
            control,
            health,
            marker: None,
        }
    }

    /// Also puts the version marker back to `previous` before restarting.
    /// Needed when the marker file lives outside the restored directory.
    pub fn with_marker(mut self, marker: &'a VersionMarker, previous: Option<&'a str>) -> Self {
        self.marker = Some((marker, previous));
        self
    }

    pub fn recover(&self, record: Option<&BackupRecord>, target: &Path) -> RollbackOutcome {
        let Some(record) = record.filter(|_| self.backups.enabled()) else {
            warn!(dest = %target.display(), "no backup available, skipping rollback");
            return RollbackOutcome::NotAttempted;
        };
        info!(backup = %record.path.display(), dest = %target.display(), "rolling back");

        if let Err(err) = self.control.stop() {
            warn!(error = %format!("{:#}", err), "failed stopping service before restore, continuing");
        }
        if let Err(err) = self.backups.restore(record, target) {
            return failed(format!("restore failed: {:#}", err));
        }
        if let Some((marker, previous)) = self.marker {
            if let Err(err) = marker.restore(previous) {
                return failed(format!("restoring version marker failed: {:#}", err));
            }
            info!(path = %marker.path().display(), version = ?previous, "version marker restored");
        }
        if let Err(err) = self.control.start() {
            return failed(format!("restart after restore failed: {:#}", err));
        }
        if !self.health.wait_healthy() {
            return failed("restored release did not become healthy".to_string());
        }
        info!(backup = %record.path.display(), "rollback completed, service healthy");
        RollbackOutcome::RolledBack
    }
}

fn failed(reason: String) -> RollbackOutcome {
    error!(reason = %reason, "rollback failed, operator attention required");
    RollbackOutcome::FailedRollback { reason }
}
