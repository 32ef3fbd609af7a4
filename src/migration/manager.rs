//! Orchestration of validation, repair, backup and execution.
//!
//! [`MigrationManager`] is the entry point operators and CI use. It serialises mutating
//! operations through one [`CampaignLock`], reports through the injected
//! [`MetricsCollector`] and [`AlertSink`], and never lets an internal error escape: every
//! operation returns an [`Outcome`] envelope.

use crate::config::GuardConfig;
use crate::metrics::{MetricsCollector, NoopMetricsCollector};
use crate::migration::worker::run_with_timeout;
use crate::migration::{
    AlertKind, AlertSink, BackupArtifact, BackupResult, CampaignGuard, CampaignLock, CampaignPhase,
    CancellationToken, ChecksumReport, ChecksumValidator, Consistency, DatabaseBackupService,
    DatabaseSnapshotter, DryRunMigrationService, DryRunResult, GuardError, HealthStatus,
    LogAlertSink, MigrationAlert, MigrationInfo, MigrationRollbackSystem, MigrationRunner,
    MigrationState, MigrationVersion, Outcome, RepairFailure, RepairRecommendation, RepairResult,
    RepairStrategy, RepairSummary, RollbackFailure, RollbackResult, SchemaRepairService,
    ScriptLocator,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub migrations_applied: usize,
    pub schema_version: Option<MigrationVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
    pub error: String,
    pub schema_version: Option<MigrationVersion>,
}

pub type MigrationResult = Outcome<MigrationSummary, MigrationFailure>;

/// An applied migration that is not cleanly applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationIssue {
    pub version: MigrationVersion,
    pub description: String,
    pub state: MigrationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub validated_count: usize,
    pub pending_count: usize,
    pub consistency: Consistency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub errors: Vec<String>,
    pub mismatches: Vec<MigrationIssue>,
    pub timed_out: bool,
    pub consistency: Consistency,
}

pub type MigrationValidationResult = Outcome<ValidationSummary, ValidationFailure>;

impl Outcome<ValidationSummary, ValidationFailure> {
    pub fn has_mismatches(&self) -> bool {
        self.failure_detail()
            .is_some_and(|failure| !failure.mismatches.is_empty())
    }
}

/// Builder for [`MigrationManager`]; metrics and alerts default to no-op and `log` sinks.
pub struct MigrationManagerBuilder {
    config: GuardConfig,
    runner: Arc<dyn MigrationRunner>,
    locator: Arc<dyn ScriptLocator>,
    snapshotter: Arc<dyn DatabaseSnapshotter>,
    metrics: Arc<dyn MetricsCollector>,
    alerts: Arc<dyn AlertSink>,
}

impl MigrationManagerBuilder {
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn build(self) -> MigrationManager {
        let config = Arc::new(self.config);
        let campaign = Arc::new(CampaignLock::new());

        let validator = ChecksumValidator::new(Arc::clone(&self.runner), Arc::clone(&self.locator))
            .with_campaign_lock(Arc::clone(&campaign));
        let repair = SchemaRepairService::new(
            Arc::clone(&config),
            Arc::clone(&self.runner),
            validator.clone(),
        );
        let backups =
            DatabaseBackupService::new(Arc::clone(&config), Arc::clone(&self.snapshotter));
        let rollback = MigrationRollbackSystem::new(Arc::clone(&config), self.snapshotter);
        let dry_run = DryRunMigrationService::new(Arc::clone(&self.runner), self.locator)
            .with_campaign_lock(Arc::clone(&campaign));

        MigrationManager {
            config,
            runner: self.runner,
            campaign,
            validator,
            repair,
            backups,
            rollback,
            dry_run,
            metrics: self.metrics,
            alerts: self.alerts,
        }
    }
}

pub struct MigrationManager {
    config: Arc<GuardConfig>,
    runner: Arc<dyn MigrationRunner>,
    campaign: Arc<CampaignLock>,
    validator: ChecksumValidator,
    repair: SchemaRepairService,
    backups: DatabaseBackupService,
    rollback: MigrationRollbackSystem,
    dry_run: DryRunMigrationService,
    metrics: Arc<dyn MetricsCollector>,
    alerts: Arc<dyn AlertSink>,
}

impl MigrationManager {
    pub fn builder(
        config: GuardConfig,
        runner: Arc<dyn MigrationRunner>,
        locator: Arc<dyn ScriptLocator>,
        snapshotter: Arc<dyn DatabaseSnapshotter>,
    ) -> MigrationManagerBuilder {
        MigrationManagerBuilder {
            config,
            runner,
            locator,
            snapshotter,
            metrics: Arc::new(NoopMetricsCollector),
            alerts: Arc::new(LogAlertSink),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn campaign_phase(&self) -> CampaignPhase {
        self.campaign.phase()
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.config.lock_timeout_seconds)
    }

    fn alert(&self, alert: MigrationAlert) {
        self.alerts.send(&alert);
    }

    fn schema_version(&self) -> Option<MigrationVersion> {
        self.runner
            .info()
            .ok()
            .and_then(|info| info.current_version().cloned())
    }

    fn migration_failure(&self, message: String, error: &GuardError) -> MigrationResult {
        self.metrics.record_failure(&error.to_string());
        Outcome::failure(
            message,
            MigrationFailure {
                error: error.to_string(),
                schema_version: self.schema_version(),
            },
        )
    }

    fn aborted(&self, message: String) -> MigrationResult {
        log::error!("{}", message);
        self.metrics.record_failure(&message);
        Outcome::failure(
            message.clone(),
            MigrationFailure {
                error: message,
                schema_version: self.schema_version(),
            },
        )
    }

    /// Apply all pending migrations.
    pub fn execute_migrations(&self) -> MigrationResult {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::campaign_span("execute").entered();

        let guard = match self.campaign.acquire("execute", self.lock_timeout()) {
            Ok(guard) => guard,
            Err(e) => return self.migration_failure(e.to_string(), &e),
        };

        let result = self.execute_locked(&guard);
        if result.is_success() {
            guard.transition(CampaignPhase::Done);
        }
        result
    }

    fn execute_locked(&self, guard: &CampaignGuard<'_>) -> MigrationResult {
        guard.transition(CampaignPhase::Executing);
        let start = Instant::now();

        let info = match self.runner.info() {
            Ok(info) => info,
            Err(e) => {
                guard.transition(CampaignPhase::Failed);
                return self.migration_failure(format!("Migration failed: {}", e), &e);
            }
        };

        if info.pending_count == 0 {
            log::debug!("No pending migrations");
            self.metrics.record_success(0, start.elapsed());
            return Outcome::success(
                "No pending migrations; schema is up to date",
                MigrationSummary {
                    migrations_applied: 0,
                    schema_version: info.current_version().cloned(),
                },
            );
        }

        match self.runner.migrate() {
            Ok(output) => {
                let applied = output.migrations_executed;
                self.metrics.record_success(applied, start.elapsed());
                let schema_version = self.schema_version();
                log::info!(
                    "Applied {} migrations in {:?}; schema at version {}",
                    applied,
                    start.elapsed(),
                    display_version(schema_version.as_ref())
                );
                Outcome::success(
                    format!(
                        "Applied {} migrations; schema now at version {}",
                        applied,
                        display_version(schema_version.as_ref())
                    ),
                    MigrationSummary {
                        migrations_applied: applied,
                        schema_version,
                    },
                )
            }
            Err(e) => {
                guard.transition(CampaignPhase::Failed);
                log::error!("Migration failed: {}", e);

                let mut alert = MigrationAlert::new(AlertKind::MigrationFailure, e.to_string());
                if let Some(failed) = self
                    .runner
                    .info()
                    .ok()
                    .and_then(|info| info.failed().next().cloned())
                {
                    alert = alert.for_migration(&failed.version, &failed.description);
                }
                self.alert(alert);

                self.migration_failure(format!("Migration failed: {}", e), &e)
            }
        }
    }

    /// Check that every applied migration is cleanly applied.
    ///
    /// The runner is queried on a worker thread bounded by `validation_timeout_seconds`.
    pub fn validate_migrations(&self) -> MigrationValidationResult {
        self.validate_with(self.campaign.consistency())
    }

    fn validate_with(&self, consistency: Consistency) -> MigrationValidationResult {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::validation_span().entered();

        let start = Instant::now();
        let result = self.validate_inner(consistency);
        self.metrics.record_validation_duration(start.elapsed());
        result
    }

    fn validate_inner(&self, consistency: Consistency) -> MigrationValidationResult {
        let runner = Arc::clone(&self.runner);
        let timeout = Duration::from_secs(self.config.validation_timeout_seconds);

        let info = match run_with_timeout("Validation", timeout, move || runner.info()) {
            Ok(info) => info,
            Err(e) => {
                let timed_out = matches!(e, GuardError::Timeout { .. });
                if timed_out {
                    self.alert(MigrationAlert::new(AlertKind::ValidationTimeout, e.to_string()));
                }
                log::error!("Validation failed: {}", e);
                return Outcome::failure(
                    e.to_string(),
                    ValidationFailure {
                        errors: vec![e.to_string()],
                        mismatches: Vec::new(),
                        timed_out,
                        consistency,
                    },
                );
            }
        };

        let mismatches = self.unclean_migrations(&info);
        if mismatches.is_empty() {
            return Outcome::success(
                format!("Validated {} applied migrations", info.applied_count),
                ValidationSummary {
                    validated_count: info.applied_count,
                    pending_count: info.pending_count,
                    consistency,
                },
            );
        }

        Outcome::failure(
            format!(
                "Validation found {} migrations that are not cleanly applied",
                mismatches.len()
            ),
            ValidationFailure {
                errors: Vec::new(),
                mismatches,
                timed_out: false,
                consistency,
            },
        )
    }

    fn unclean_migrations(&self, info: &MigrationInfo) -> Vec<MigrationIssue> {
        info.applied()
            .filter(|record| record.state.is_unclean())
            .map(|record| {
                let kind = if record.state == MigrationState::Failed {
                    AlertKind::MigrationFailure
                } else {
                    AlertKind::ChecksumMismatch
                };
                log::warn!(
                    "Migration {} ({}) is {}",
                    record.version,
                    record.description,
                    record.state
                );
                self.metrics.record_checksum_mismatch(&record.version);
                self.alert(
                    MigrationAlert::new(kind, format!("Migration is {}", record.state))
                        .for_migration(&record.version, &record.description),
                );
                MigrationIssue {
                    version: record.version.clone(),
                    description: record.description.clone(),
                    state: record.state,
                }
            })
            .collect()
    }

    /// Reconcile the schema history with the scripts, if automatic repair is enabled.
    pub fn repair_schema_history(&self) -> RepairResult {
        if !self.config.auto_repair {
            log::warn!("Schema history repair skipped: automatic repair is disabled");
            return Outcome::success(
                "Automatic repair is disabled",
                RepairSummary {
                    strategy: RepairStrategy::AutomaticRepair,
                    repaired_count: 0,
                },
            );
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::campaign_span("repair").entered();

        let guard = match self.campaign.acquire("repair", self.lock_timeout()) {
            Ok(guard) => guard,
            Err(e) => {
                return Outcome::failure(
                    e.to_string(),
                    RepairFailure {
                        strategy: RepairStrategy::AutomaticRepair,
                        remaining_mismatches: 0,
                        error: Some(e.to_string()),
                    },
                )
            }
        };

        let result = self.repair_locked(&guard);
        if result.is_success() {
            guard.transition(CampaignPhase::Done);
        }
        result
    }

    fn repair_locked(&self, guard: &CampaignGuard<'_>) -> RepairResult {
        guard.transition(CampaignPhase::Repairing);

        let validation = self.validator.validate_all_checksums();
        let strategy = self.repair.strategy_for(&validation);
        log::info!(
            "Repairing schema history: {} of {} migrations mismatch, strategy {}",
            validation.mismatch_count(),
            validation.total_count(),
            strategy
        );

        if strategy == RepairStrategy::BaselineReset && self.config.backup_before_migration {
            let label = format!(
                "pre-baseline-{}",
                display_version(self.schema_version().as_ref())
            );
            let backup = self.backups.create_pre_migration_backup(&label);
            if backup.is_failure() {
                self.alert(MigrationAlert::new(AlertKind::BackupFailure, backup.message()));
                self.metrics.record_repair(strategy, false);
                guard.transition(CampaignPhase::Failed);
                return Outcome::failure(
                    format!("Baseline reset aborted: {}", backup.message()),
                    RepairFailure {
                        strategy,
                        remaining_mismatches: validation.mismatch_count(),
                        error: Some(backup.message().to_string()),
                    },
                );
            }
        }

        let result = self.repair.perform_repair_with_strategy(strategy);
        self.metrics.record_repair(strategy, result.is_success());
        if result.is_failure() {
            guard.transition(CampaignPhase::Failed);
            self.alert(MigrationAlert::new(AlertKind::RepairFailure, result.message()));
        }
        result
    }

    /// Back up the database, labelled after the current schema version.
    pub fn create_pre_migration_backup(&self) -> BackupResult {
        let label = match self.runner.info() {
            Ok(info) => format!("pre-migration-{}", display_version(info.current_version())),
            Err(e) => {
                log::warn!("Could not read schema version for backup label: {}", e);
                "pre-migration-unknown".to_string()
            }
        };

        let result = self.backups.create_pre_migration_backup(&label);
        if result.is_failure() {
            self.alert(MigrationAlert::new(AlertKind::BackupFailure, result.message()));
        }
        result
    }

    /// Restore the backup named `name`. Serialised with other mutating operations.
    pub fn rollback_to_backup(&self, name: &str) -> RollbackResult {
        self.rollback_to_backup_with_cancel(name, &CancellationToken::new())
    }

    /// Like [`rollback_to_backup`](Self::rollback_to_backup), stopping once `cancel` fires.
    ///
    /// The campaign lock stays held until the restore worker has stopped, even when the
    /// restore times out or is cancelled.
    pub fn rollback_to_backup_with_cancel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> RollbackResult {
        let guard = match self.campaign.acquire("rollback", self.lock_timeout()) {
            Ok(guard) => guard,
            Err(e) => {
                return Outcome::failure(e.to_string(), RollbackFailure::new(name, &e));
            }
        };

        guard.transition(CampaignPhase::Executing);
        let result = self.rollback.rollback_to_backup_with_cancel(name, cancel);
        guard.transition(if result.is_success() {
            CampaignPhase::Done
        } else {
            CampaignPhase::Failed
        });
        result
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let consistency = self.campaign.consistency();
        match self.runner.info() {
            Ok(info) => {
                let checksums = self.validator.validate_all_checksums();
                HealthStatus::evaluate(
                    &info,
                    &checksums.mismatched_versions(),
                    self.config.auto_repair,
                    consistency,
                )
            }
            Err(e) => {
                log::error!("Health check could not read the schema history: {}", e);
                HealthStatus::unavailable(e, consistency)
            }
        }
    }

    /// Validate, repair if allowed, back up, execute and re-validate, all under one campaign.
    pub fn execute_with_safeguards(&self) -> MigrationResult {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::campaign_span("execute_with_safeguards").entered();

        let guard = match self
            .campaign
            .acquire("execute_with_safeguards", self.lock_timeout())
        {
            Ok(guard) => guard,
            Err(e) => return self.migration_failure(e.to_string(), &e),
        };

        guard.transition(CampaignPhase::Validating);
        let validation = self.validate_with(Consistency::Consistent);
        if let Some(failure) = validation.failure_detail() {
            if failure.mismatches.is_empty() {
                guard.transition(CampaignPhase::Failed);
                return self.aborted(format!("Migration aborted: {}", validation.message()));
            }
        }

        let checksums = self.validator.validate_all_checksums();
        let diverged = validation.has_mismatches() || checksums.has_mismatches();
        if diverged {
            if !self.config.auto_repair {
                guard.transition(CampaignPhase::Failed);
                return self.aborted(format!(
                    "Migration aborted: schema history diverges from the scripts and automatic repair is disabled ({} checksum mismatches)",
                    checksums.mismatch_count().max(
                        validation
                            .failure_detail()
                            .map_or(0, |f| f.mismatches.len())
                    )
                ));
            }

            let repair = self.repair_locked(&guard);
            if repair.is_failure() {
                guard.transition(CampaignPhase::Failed);
                return self.aborted(repair.message().to_string());
            }
        }

        let info = match self.runner.info() {
            Ok(info) => info,
            Err(e) => {
                guard.transition(CampaignPhase::Failed);
                return self.migration_failure(format!("Migration aborted: {}", e), &e);
            }
        };

        if self.config.backup_before_migration && info.pending_count > 0 {
            let backup = self.create_pre_migration_backup();
            if backup.is_failure() {
                guard.transition(CampaignPhase::Failed);
                return self.aborted(format!("Migration aborted: {}", backup.message()));
            }
        }

        let result = self.execute_locked(&guard);
        if result.is_failure() {
            return result;
        }

        guard.transition(CampaignPhase::Validating);
        let after = self.validator.validate_all_checksums();
        if !after.is_valid() {
            log::warn!(
                "Post-migration validation found {} mismatches",
                after.mismatch_count()
            );
            self.alert(MigrationAlert::new(
                AlertKind::ChecksumMismatch,
                format!(
                    "Post-migration validation found {} checksum mismatches and {} errors",
                    after.mismatch_count(),
                    after.validation_errors.len()
                ),
            ));
        }
        guard.transition(CampaignPhase::Done);
        result
    }

    pub fn perform_dry_run(&self) -> DryRunResult {
        self.dry_run.perform_dry_run()
    }

    pub fn get_repair_recommendations(&self) -> RepairRecommendation {
        self.repair.get_repair_recommendations()
    }

    pub fn generate_checksum_report(&self) -> ChecksumReport {
        self.validator.generate_checksum_report()
    }

    pub fn list_backups(&self) -> Result<Vec<BackupArtifact>, GuardError> {
        self.backups.list_backups()
    }
}

fn display_version(version: Option<&MigrationVersion>) -> String {
    version.map_or_else(|| "empty".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingMetricsCollector;
    use crate::migration::{
        InMemoryRunner, InMemoryScriptLocator, MemoryAlertSink, MemorySnapshotter,
        RunnerOperation,
    };
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        locator: Arc<InMemoryScriptLocator>,
        runner: Arc<InMemoryRunner>,
        metrics: Arc<CountingMetricsCollector>,
        alerts: Arc<MemoryAlertSink>,
        manager: MigrationManager,
    }

    fn fixture(config: GuardConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = config.with_backup_directory(dir.path());
        let locator = Arc::new(InMemoryScriptLocator::new());
        locator.add("1", "create users", "CREATE TABLE users ();");
        locator.add("2", "create orders", "CREATE TABLE orders ();");
        let runner = Arc::new(InMemoryRunner::new(locator.clone()));
        let metrics = Arc::new(CountingMetricsCollector::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let manager = MigrationManager::builder(
            config,
            runner.clone(),
            locator.clone(),
            Arc::new(MemorySnapshotter::new("snapshot")),
        )
        .metrics(metrics.clone())
        .alerts(alerts.clone())
        .build();

        Fixture {
            _dir: dir,
            locator,
            runner,
            metrics,
            alerts,
            manager,
        }
    }

    #[test]
    fn execute_applies_pending_and_reports_version() {
        let f = fixture(GuardConfig::default());
        let result = f.manager.execute_migrations();
        assert!(result.is_success(), "{}", result.message());

        let summary = result.success_detail().unwrap();
        assert_eq!(summary.migrations_applied, 2);
        assert_eq!(summary.schema_version.as_ref().map(ToString::to_string), Some("2".into()));
        assert_eq!(f.metrics.migrations_applied(), 2);
        assert_eq!(f.manager.campaign_phase(), CampaignPhase::Done);
    }

    #[test]
    fn execute_without_pending_does_not_call_migrate() {
        let f = fixture(GuardConfig::default());
        f.manager.execute_migrations();
        let calls = f.runner.migrate_calls();

        let again = f.manager.execute_migrations();
        assert!(again.is_success());
        assert_eq!(again.success_detail().unwrap().migrations_applied, 0);
        assert_eq!(f.runner.migrate_calls(), calls);
    }

    #[test]
    fn failing_migration_raises_alert_and_metric() {
        let f = fixture(GuardConfig::default());
        f.runner
            .fail_migration(MigrationVersion::parse("2").unwrap())
            .unwrap();

        let result = f.manager.execute_migrations();
        assert!(result.is_failure());
        assert_eq!(f.metrics.failures(), 1);
        assert_eq!(f.alerts.count(AlertKind::MigrationFailure), 1);
        assert_eq!(f.manager.campaign_phase(), CampaignPhase::Failed);
        let alert = &f.alerts.alerts()[0];
        assert_eq!(alert.version.as_ref().map(ToString::to_string), Some("2".into()));
    }

    #[test]
    fn validation_flags_unclean_migrations() {
        let f = fixture(GuardConfig::default());
        f.manager.execute_migrations();
        f.locator.add("1", "create users", "CREATE TABLE users (id INT);");

        let result = f.manager.validate_migrations();
        assert!(result.has_mismatches());
        let failure = result.failure_detail().unwrap();
        assert_eq!(failure.mismatches[0].state, MigrationState::Outdated);
        assert_eq!(f.metrics.checksum_mismatches(), 1);
        assert_eq!(f.alerts.count(AlertKind::ChecksumMismatch), 1);
        assert_eq!(f.metrics.validations(), 1);
    }

    #[test]
    fn validation_times_out() {
        let f = fixture(GuardConfig::default().with_validation_timeout_seconds(1));
        f.runner
            .set_info_delay(Some(Duration::from_millis(1500)))
            .unwrap();

        let result = f.manager.validate_migrations();
        assert!(result.is_failure());
        assert_eq!(result.message(), "Validation timed out after 1s");
        assert!(result.failure_detail().unwrap().timed_out);
        assert_eq!(f.alerts.count(AlertKind::ValidationTimeout), 1);
    }

    #[test]
    fn repair_is_a_no_op_when_disabled() {
        let f = fixture(GuardConfig::default());
        let result = f.manager.repair_schema_history();
        assert!(result.is_success());
        assert_eq!(result.message(), "Automatic repair is disabled");
        assert_eq!(f.runner.repair_calls(), 0);
    }

    #[test]
    fn mutating_operations_are_serialised() {
        let f = fixture(GuardConfig::default().with_lock_timeout_seconds(1));
        let _guard = f
            .manager
            .campaign
            .acquire("other", Duration::from_secs(1))
            .unwrap();

        let result = f.manager.execute_migrations();
        assert!(result.is_failure());
        assert!(result.message().contains("in progress"));
        assert_eq!(f.runner.migrate_calls(), 0);
    }

    #[test]
    fn health_reports_runner_failure() {
        let f = fixture(GuardConfig::default());
        f.runner.fail_on(RunnerOperation::Info).unwrap();
        let health = f.manager.get_health_status();
        assert!(health.has_issues());
        assert!(health.message.contains("simulated"));
    }
}
