//! Migration safety layer
//!
//! Wraps an external versioned-migration runner with:
//! - checksum validation of applied migrations against their scripts
//! - repair-strategy selection and execution
//! - pre-migration backups and rollback from them
//! - dry-run previews and health reporting
//!
//! `memory` (feature `test-helpers`) holds in-memory stand-ins for the runner, the script
//! source and the snapshotter.

pub mod alert;
pub mod backup;
pub mod checksum;
pub mod dry_run;
pub mod error;
pub mod file;
pub mod health;
pub mod lock;
pub mod manager;
#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;
pub mod outcome;
pub mod record;
pub mod repair;
pub mod rollback;
pub mod runner;
pub mod status;
pub mod version;
mod worker;

pub use alert::{AlertKind, AlertSink, LogAlertSink, MemoryAlertSink, MigrationAlert};
pub use backup::{
    BackupArtifact, BackupFailure, BackupOutcome, BackupResult, BackupSummary,
    DatabaseBackupService, DatabaseSnapshotter, PgDumpSnapshotter,
};
pub use checksum::{
    calculate_checksum, ChecksumComparisonResult, ChecksumReport, ChecksumSummary,
    ChecksumValidationResult, ChecksumValidator,
};
pub use dry_run::{
    DryRunFailure, DryRunMigrationService, DryRunPreview, DryRunResult, PendingMigration,
};
pub use error::GuardError;
pub use file::{DirectoryScriptLocator, ScriptLocator, ScriptResource};
pub use health::{HealthState, HealthStatus};
pub use lock::{CampaignGuard, CampaignLock, CampaignPhase, Consistency};
pub use manager::{
    MigrationFailure, MigrationIssue, MigrationManager, MigrationManagerBuilder, MigrationResult,
    MigrationSummary, MigrationValidationResult, ValidationFailure, ValidationSummary,
};
#[cfg(any(test, feature = "test-helpers"))]
#[cfg(any(test, feature = "test-helpers"))]
pub use memory::{InMemoryRunner, InMemoryScriptLocator, MemorySnapshotter, RunnerOperation};
pub use outcome::Outcome;
pub use record::{MigrationRecord, MigrationState};
pub use repair::{
    RepairFailure, RepairRecommendation, RepairResult, RepairStrategy, RepairSummary,
    SchemaRepairService,
};
pub use rollback::{MigrationRollbackSystem, RestoredBackup, RollbackFailure, RollbackResult};
pub use runner::{MigrateOutput, MigrationRunner, RepairOutput};
pub use status::MigrationInfo;
pub use version::MigrationVersion;
pub use worker::CancellationToken;
