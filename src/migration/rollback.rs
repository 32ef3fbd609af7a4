//! Restoring the database from a backup artifact

use crate::config::GuardConfig;
use crate::migration::backup::CancellableReader;
use crate::migration::worker::run_cancellable;
use crate::migration::{
    BackupArtifact, CancellationToken, DatabaseBackupService, DatabaseSnapshotter, GuardError,
    Outcome,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredBackup {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub restored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackFailure {
    pub backup: String,
    pub error: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl RollbackFailure {
    pub(crate) fn new(backup: impl Into<String>, error: &GuardError) -> Self {
        Self {
            backup: backup.into(),
            error: error.to_string(),
            timed_out: matches!(error, GuardError::Timeout { .. }),
            cancelled: matches!(error, GuardError::Cancelled(_)),
        }
    }
}

pub type RollbackResult = Outcome<RestoredBackup, RollbackFailure>;

/// Restores a previously taken backup. Never invoked automatically.
#[derive(Clone)]
pub struct MigrationRollbackSystem {
    config: Arc<GuardConfig>,
    snapshotter: Arc<dyn DatabaseSnapshotter>,
    backups: DatabaseBackupService,
}

impl MigrationRollbackSystem {
    pub fn new(config: Arc<GuardConfig>, snapshotter: Arc<dyn DatabaseSnapshotter>) -> Self {
        let backups = DatabaseBackupService::new(Arc::clone(&config), Arc::clone(&snapshotter));
        Self {
            config,
            snapshotter,
            backups,
        }
    }

    /// Restore the database from the backup named `name`.
    ///
    /// The backup must exist in the backup directory and still match its manifest digest;
    /// otherwise the snapshotter is never invoked.
    pub fn rollback_to_backup(&self, name: &str) -> RollbackResult {
        self.rollback_to_backup_with_cancel(name, &CancellationToken::new())
    }

    /// Restore from `name`, stopping early once `cancel` is triggered.
    ///
    /// The restore runs off-thread for at most `backup_timeout_seconds`. On timeout `cancel`
    /// is triggered and the call returns only once the restore has stopped.
    pub fn rollback_to_backup_with_cancel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> RollbackResult {
        let artifact = match self.verified(name) {
            Ok(artifact) => artifact,
            Err(e) => {
                log::error!("Rollback to '{}' refused: {}", name, e);
                return Outcome::failure(
                    format!("Rollback refused: {}", e),
                    RollbackFailure::new(name, &e),
                );
            }
        };

        log::warn!("Restoring database from backup {}", artifact.name);
        match self.restore(&artifact, cancel) {
            Ok(()) => {
                log::info!("Database restored from backup {}", artifact.name);
                Outcome::success(
                    format!("Database restored from backup {}", artifact.name),
                    RestoredBackup {
                        name: artifact.name,
                        path: artifact.path,
                        size_bytes: artifact.size_bytes,
                        restored_at: Utc::now(),
                    },
                )
            }
            Err(e) => {
                log::error!("Restore from backup {} failed: {}", artifact.name, e);
                Outcome::failure(
                    format!("Rollback failed: {}", e),
                    RollbackFailure::new(artifact.name, &e),
                )
            }
        }
    }

    pub fn list_available_backups(&self) -> Result<Vec<BackupArtifact>, GuardError> {
        self.backups.list_backups()
    }

    fn verified(&self, name: &str) -> Result<BackupArtifact, GuardError> {
        let artifact = self.backups.find_backup(name)?;
        self.backups.verify_backup(&artifact)?;
        Ok(artifact)
    }

    fn restore(
        &self,
        artifact: &BackupArtifact,
        cancel: &CancellationToken,
    ) -> Result<(), GuardError> {
        let snapshotter = Arc::clone(&self.snapshotter);
        let path = artifact.path.clone();
        let timeout = Duration::from_secs(self.config.backup_timeout_seconds);

        run_cancellable("Restore", timeout, cancel, move |token| {
            let file = File::open(&path).map_err(|e| GuardError::io(&path, e))?;
            let mut reader = CancellableReader::new(BufReader::new(file), token.clone());
            snapshotter.restore(&mut reader, token)
        })
    }
}
