//! Checksum validation of applied migrations against their scripts

use crate::migration::{
    CampaignLock, Consistency, GuardError, MigrationInfo, MigrationRecord, MigrationRunner,
    MigrationVersion, ScriptLocator,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Calculate the CRC-32 (IEEE) checksum of a script's raw bytes
///
/// This is the fingerprint recorded by the runner when a migration is applied; any edit of
/// the script afterwards changes it.
pub fn calculate_checksum(content: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(content);
    hasher.finalize()
}

/// Comparison of one applied migration against its current script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumComparisonResult {
    pub version: MigrationVersion,
    pub description: String,
    /// Checksum recorded in the schema history
    pub database_checksum: Option<u32>,
    /// Checksum of the script as it is now (`None` when it cannot be read)
    pub file_checksum: Option<u32>,
    pub matches: bool,
    pub error_message: Option<String>,
}

impl ChecksumComparisonResult {
    fn compare(record: &MigrationRecord, file_checksum: Result<u32, GuardError>) -> Self {
        let (file_checksum, matches, error_message) = match file_checksum {
            Ok(current) => match record.checksum {
                Some(recorded) if recorded == current => (Some(current), true, None),
                Some(_) => (Some(current), false, None),
                None => (
                    Some(current),
                    false,
                    Some("No checksum recorded in schema history".to_string()),
                ),
            },
            Err(GuardError::ScriptNotFound { .. }) => (
                None,
                false,
                Some(format!(
                    "Migration script not found: {}",
                    crate::migration::file::resource_name(record)
                )),
            ),
            Err(e) => (None, false, Some(e.to_string())),
        };

        Self {
            version: record.version.clone(),
            description: record.description.clone(),
            database_checksum: record.checksum,
            file_checksum,
            matches,
            error_message,
        }
    }
}

/// Comparisons of a validation pass, keyed by version
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecksumValidationResult {
    pub comparisons: BTreeMap<MigrationVersion, ChecksumComparisonResult>,
    pub mismatches: BTreeMap<MigrationVersion, ChecksumComparisonResult>,
    pub validation_errors: Vec<String>,
    pub consistency: Consistency,
}

impl ChecksumValidationResult {
    fn new(consistency: Consistency) -> Self {
        Self {
            comparisons: BTreeMap::new(),
            mismatches: BTreeMap::new(),
            validation_errors: Vec::new(),
            consistency,
        }
    }

    fn push(&mut self, comparison: ChecksumComparisonResult) {
        if !comparison.matches {
            self.mismatches
                .insert(comparison.version.clone(), comparison.clone());
        }
        self.comparisons.insert(comparison.version.clone(), comparison);
    }

    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty() && self.validation_errors.is_empty()
    }

    pub fn has_mismatches(&self) -> bool {
        !self.mismatches.is_empty()
    }

    pub fn mismatch_count(&self) -> usize {
        self.mismatches.len()
    }

    pub fn total_count(&self) -> usize {
        self.comparisons.len()
    }

    pub fn mismatched_versions(&self) -> Vec<MigrationVersion> {
        self.mismatches.keys().cloned().collect()
    }
}

/// Summary numbers of a [`ChecksumReport`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecksumSummary {
    pub total: usize,
    pub matched: usize,
    pub mismatched: usize,
    /// Mismatches caused by scripts that could not be read at all
    pub unresolved: usize,
    pub match_ratio: f64,
    pub mismatch_ratio: f64,
}

/// Validation result with summary statistics, for observability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecksumReport {
    pub generated_at: DateTime<Utc>,
    pub summary: ChecksumSummary,
    pub result: ChecksumValidationResult,
}

impl ChecksumReport {
    pub fn new(result: ChecksumValidationResult) -> Self {
        let total = result.total_count();
        let mismatched = result.mismatch_count();
        let unresolved = result
            .mismatches
            .values()
            .filter(|c| c.file_checksum.is_none())
            .count();
        let ratio = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        Self {
            generated_at: Utc::now(),
            summary: ChecksumSummary {
                total,
                matched: total - mismatched,
                mismatched,
                unresolved,
                match_ratio: if total == 0 { 1.0 } else { ratio(total - mismatched) },
                mismatch_ratio: ratio(mismatched),
            },
            result,
        }
    }

    pub fn to_json(&self) -> Result<String, GuardError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Detects divergence between the schema history and the scripts on disk.
///
/// Read-only; safe to call repeatedly and from several threads.
#[derive(Clone)]
pub struct ChecksumValidator {
    runner: Arc<dyn MigrationRunner>,
    locator: Arc<dyn ScriptLocator>,
    campaign: Arc<CampaignLock>,
}

impl ChecksumValidator {
    pub fn new(runner: Arc<dyn MigrationRunner>, locator: Arc<dyn ScriptLocator>) -> Self {
        Self {
            runner,
            locator,
            campaign: Arc::new(CampaignLock::new()),
        }
    }

    /// Share the manager's campaign lock so results are labelled correctly.
    pub fn with_campaign_lock(mut self, campaign: Arc<CampaignLock>) -> Self {
        self.campaign = campaign;
        self
    }

    /// Checksum of the script behind `record`, or `None` when it cannot be resolved or read.
    ///
    /// `None` means "unknown", never zero.
    pub fn calculate_file_checksum(&self, record: &MigrationRecord) -> Option<u32> {
        match self.locator.load(record) {
            Ok(bytes) => Some(calculate_checksum(&bytes)),
            Err(e) => {
                log::debug!("No checksum for migration {}: {}", record.version, e);
                None
            }
        }
    }

    pub fn validate_migration_checksum(
        &self,
        record: &MigrationRecord,
    ) -> ChecksumComparisonResult {
        let file_checksum = self
            .locator
            .load(record)
            .map(|bytes| calculate_checksum(&bytes));
        ChecksumComparisonResult::compare(record, file_checksum)
    }

    /// Compare every applied migration against its script.
    ///
    /// Pending and baseline entries are skipped. Unresolvable scripts become mismatches with
    /// an error message; a failing runner becomes a validation error. Nothing here panics or
    /// propagates.
    pub fn validate_all_checksums(&self) -> ChecksumValidationResult {
        self.validate_where(|_| true).0
    }

    /// Validate only `versions`; versions that are not applied are reported as errors.
    pub fn validate_versions(&self, versions: &[MigrationVersion]) -> ChecksumValidationResult {
        let (mut result, info) = self.validate_where(|record| versions.contains(&record.version));
        let Some(info) = info else {
            return result;
        };

        for version in versions {
            if result.comparisons.contains_key(version) {
                continue;
            }
            let error = match info.find(version) {
                Some(_) => format!("Migration {} is not applied", version),
                None => format!("Migration {} is unknown to the runner", version),
            };
            result.validation_errors.push(error);
        }
        result
    }

    fn validate_where(
        &self,
        include: impl Fn(&MigrationRecord) -> bool,
    ) -> (ChecksumValidationResult, Option<MigrationInfo>) {
        let consistency_before = self.campaign.consistency();
        let mut result = ChecksumValidationResult::new(consistency_before);

        let info = match self.runner.info() {
            Ok(info) => info,
            Err(e) => {
                log::error!("Checksum validation could not read the schema history: {}", e);
                result.validation_errors.push(e.to_string());
                return (result, None);
            }
        };

        for record in info.applied().filter(|r| include(r)) {
            let comparison = self.validate_migration_checksum(record);
            if !comparison.matches {
                log::warn!(
                    "Checksum mismatch for migration {} ({}): recorded {:?}, file {:?}",
                    comparison.version,
                    comparison.description,
                    comparison.database_checksum,
                    comparison.file_checksum
                );
            }
            result.push(comparison);
        }

        if self.campaign.consistency() == Consistency::BestEffort {
            result.consistency = Consistency::BestEffort;
        }
        (result, Some(info))
    }

    /// Fresh checksums of every applied migration whose script can be read.
    pub fn recalculate_all_checksums(&self) -> Result<BTreeMap<MigrationVersion, u32>, GuardError> {
        let info = self.runner.info()?;
        Ok(info
            .applied()
            .filter_map(|record| {
                self.calculate_file_checksum(record)
                    .map(|checksum| (record.version.clone(), checksum))
            })
            .collect())
    }

    pub fn generate_checksum_report(&self) -> ChecksumReport {
        ChecksumReport::new(self.validate_all_checksums())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{InMemoryRunner, InMemoryScriptLocator, MigrationRunner};

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    fn setup() -> (Arc<InMemoryScriptLocator>, Arc<InMemoryRunner>, ChecksumValidator) {
        let locator = Arc::new(InMemoryScriptLocator::new());
        let runner = Arc::new(InMemoryRunner::new(locator.clone()));
        let validator = ChecksumValidator::new(runner.clone(), locator.clone());
        (locator, runner, validator)
    }

    #[test]
    fn checksum_is_standard_crc32() {
        assert_eq!(calculate_checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(calculate_checksum(b""), 0);
    }

    #[test]
    fn single_byte_change_changes_the_checksum() {
        let original = b"CREATE TABLE users (id BIGINT PRIMARY KEY);";
        let mut edited = original.to_vec();
        edited[7] = b't';
        assert_eq!(calculate_checksum(original), calculate_checksum(original));
        assert_ne!(calculate_checksum(original), calculate_checksum(&edited));
    }

    #[test]
    fn clean_history_validates() {
        let (locator, runner, validator) = setup();
        locator.add("1", "create users", "CREATE TABLE users ();");
        locator.add("2", "create orders", "CREATE TABLE orders ();");
        runner.migrate().unwrap();

        let result = validator.validate_all_checksums();
        assert!(result.is_valid());
        assert_eq!(result.total_count(), 2);
        assert_eq!(result.consistency, Consistency::Consistent);
    }

    #[test]
    fn pending_migrations_are_not_checked() {
        let (locator, _runner, validator) = setup();
        locator.add("1", "create users", "CREATE TABLE users ();");

        let result = validator.validate_all_checksums();
        assert_eq!(result.total_count(), 0);
        assert!(result.is_valid());
    }

    #[test]
    fn missing_script_is_a_mismatch_with_message() {
        let (locator, runner, validator) = setup();
        let resource = locator.add("1", "create users", "CREATE TABLE users ();");
        runner.migrate().unwrap();
        locator.remove(&resource);

        let result = validator.validate_all_checksums();
        assert_eq!(result.mismatch_count(), 1);
        let comparison = &result.mismatches[&v("1")];
        assert!(comparison.file_checksum.is_none());
        assert!(comparison
            .error_message
            .as_deref()
            .unwrap()
            .contains("not found"));
    }

    #[test]
    fn file_checksum_is_none_not_zero_for_unreadable_scripts() {
        let (_locator, _runner, validator) = setup();
        let record = MigrationRecord::pending(v("9"), "nothing", "V9__nothing.sql");
        assert_eq!(validator.calculate_file_checksum(&record), None);
    }

    #[test]
    fn runner_failure_becomes_a_validation_error() {
        let (_locator, runner, validator) = setup();
        runner
            .fail_on(crate::migration::RunnerOperation::Info)
            .unwrap();

        let result = validator.validate_all_checksums();
        assert!(!result.is_valid());
        assert_eq!(result.validation_errors.len(), 1);
        assert_eq!(result.mismatch_count(), 0);
    }

    #[test]
    fn subset_validation_reports_unknown_versions() {
        let (locator, runner, validator) = setup();
        locator.add("1", "a", "select 1;");
        locator.add("2", "b", "select 2;");
        runner.migrate().unwrap();
        locator.add("2", "b", "select 22;");

        let result = validator.validate_versions(&[v("2"), v("7")]);
        assert_eq!(result.total_count(), 1);
        assert_eq!(result.mismatch_count(), 1);
        assert_eq!(
            result.validation_errors,
            vec!["Migration 7 is unknown to the runner".to_string()]
        );
    }

    #[test]
    fn subset_validation_distinguishes_pending_versions() {
        let (locator, runner, validator) = setup();
        locator.add("1", "a", "select 1;");
        runner.migrate().unwrap();
        locator.add("2", "b", "select 2;");

        let result = validator.validate_versions(&[v("2")]);
        assert_eq!(result.total_count(), 0);
        assert_eq!(
            result.validation_errors,
            vec!["Migration 2 is not applied".to_string()]
        );
    }

    #[test]
    fn subset_validation_reports_only_the_runner_error_when_history_is_unreadable() {
        let (locator, runner, validator) = setup();
        locator.add("1", "a", "select 1;");
        runner.migrate().unwrap();
        runner.fail_on(crate::migration::RunnerOperation::Info).unwrap();

        let result = validator.validate_versions(&[v("1"), v("2")]);
        assert_eq!(result.validation_errors.len(), 1);
        assert!(result.validation_errors[0].contains("simulated runner failure"));
    }

    #[test]
    fn recalculation_and_report_cover_applied_scripts() {
        let (locator, runner, validator) = setup();
        locator.add("1", "a", "select 1;");
        locator.add("2", "b", "select 2;");
        runner.migrate().unwrap();
        locator.add("2", "b", "select 22;");

        let checksums = validator.recalculate_all_checksums().unwrap();
        assert_eq!(checksums[&v("2")], calculate_checksum(b"select 22;"));

        let report = validator.generate_checksum_report();
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.mismatched, 1);
        assert!((report.summary.mismatch_ratio - 0.5).abs() < f64::EPSILON);
        assert!(report.to_json().unwrap().contains("\"mismatched\": 1"));
    }

    #[test]
    fn results_are_best_effort_while_a_campaign_runs() {
        let (locator, runner, validator) = setup();
        locator.add("1", "a", "select 1;");
        runner.migrate().unwrap();

        let campaign = Arc::new(CampaignLock::new());
        let validator = validator.with_campaign_lock(campaign.clone());
        let _guard = campaign
            .acquire("execute", std::time::Duration::from_secs(1))
            .unwrap();

        assert_eq!(
            validator.validate_all_checksums().consistency,
            Consistency::BestEffort
        );
    }
}
