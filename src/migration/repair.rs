//! Repair-strategy selection and execution for schema history divergence

use crate::config::{GuardConfig, RepairPolicy};
use crate::migration::{
    ChecksumValidationResult, ChecksumValidator, GuardError, MigrationRunner, MigrationVersion,
    Outcome,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Description written to the history when a baseline reset is chosen automatically
pub const BASELINE_RESET_DESCRIPTION: &str = "Baseline reset after checksum divergence";

/// Remediation approach for a detected divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    /// Let the runner realign the whole history (a no-op when nothing diverged)
    AutomaticRepair,
    /// Repair only the mismatched versions and verify them
    SelectiveRepair,
    /// Re-baseline the history at the highest applied version
    BaselineReset,
    /// Rewrite recorded checksums, then require a fully clean validation
    ChecksumUpdate,
    /// Do nothing automatically; an operator resolves the divergence
    ManualOverride,
}

impl RepairStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairStrategy::AutomaticRepair => "automatic_repair",
            RepairStrategy::SelectiveRepair => "selective_repair",
            RepairStrategy::BaselineReset => "baseline_reset",
            RepairStrategy::ChecksumUpdate => "checksum_update",
            RepairStrategy::ManualOverride => "manual_override",
        }
    }
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RepairPolicy {
    /// Classify `mismatches` out of `checked` migrations.
    pub fn classify(&self, mismatches: usize, checked: usize) -> RepairStrategy {
        if mismatches == 0 {
            return RepairStrategy::AutomaticRepair;
        }

        let ratio = mismatches as f64 / checked.max(1) as f64;
        if checked >= self.baseline_min_checked && ratio > self.baseline_mismatch_ratio {
            return RepairStrategy::BaselineReset;
        }

        if mismatches <= self.selective_max_mismatches {
            RepairStrategy::SelectiveRepair
        } else {
            RepairStrategy::AutomaticRepair
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub strategy: RepairStrategy,
    /// History entries fixed (realigned, removed or superseded by a baseline)
    pub repaired_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairFailure {
    pub strategy: RepairStrategy,
    /// Mismatches still present after the attempt
    pub remaining_mismatches: usize,
    pub error: Option<String>,
}

pub type RepairResult = Outcome<RepairSummary, RepairFailure>;

fn repaired(strategy: RepairStrategy, count: usize, message: impl Into<String>) -> RepairResult {
    Outcome::success(
        message,
        RepairSummary {
            strategy,
            repaired_count: count,
        },
    )
}

fn failed(strategy: RepairStrategy, remaining: usize, error: Option<&GuardError>) -> RepairResult {
    let message = match error {
        Some(e) => format!("{} failed: {}", strategy, e),
        None => format!(
            "{} incomplete: {} checksum mismatches remain",
            strategy, remaining
        ),
    };
    Outcome::failure(
        message,
        RepairFailure {
            strategy,
            remaining_mismatches: remaining,
            error: error.map(|e| e.to_string()),
        },
    )
}

/// The validation around a repair could not be completed, so convergence is unknown.
fn unverified(strategy: RepairStrategy, remaining: usize, errors: &[String]) -> RepairResult {
    let errors = errors.join("; ");
    log::error!("{} could not be verified: {}", strategy, errors);
    Outcome::failure(
        format!("{} could not be verified: {}", strategy, errors),
        RepairFailure {
            strategy,
            remaining_mismatches: remaining,
            error: Some(errors),
        },
    )
}

/// Read-only advice on how to reconcile the current divergence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairRecommendation {
    pub validation: ChecksumValidationResult,
    pub strategy: RepairStrategy,
    pub recommendations: Vec<String>,
}

/// Decides how to reconcile checksum divergence and carries the decision out
#[derive(Clone)]
pub struct SchemaRepairService {
    config: Arc<GuardConfig>,
    runner: Arc<dyn MigrationRunner>,
    validator: ChecksumValidator,
}

impl SchemaRepairService {
    pub fn new(
        config: Arc<GuardConfig>,
        runner: Arc<dyn MigrationRunner>,
        validator: ChecksumValidator,
    ) -> Self {
        Self {
            config,
            runner,
            validator,
        }
    }

    pub fn policy(&self) -> &RepairPolicy {
        &self.config.repair_policy
    }

    /// Strategy for a given validation result under the configured policy
    pub fn strategy_for(&self, validation: &ChecksumValidationResult) -> RepairStrategy {
        self.policy()
            .classify(validation.mismatch_count(), validation.total_count())
    }

    /// Validate all checksums and classify the result
    pub fn determine_optimal_repair_strategy(&self) -> RepairStrategy {
        let validation = self.validator.validate_all_checksums();
        let strategy = self.strategy_for(&validation);
        log::debug!(
            "{} of {} migrations mismatch; selected {}",
            validation.mismatch_count(),
            validation.total_count(),
            strategy
        );
        strategy
    }

    pub fn perform_repair_with_strategy(&self, strategy: RepairStrategy) -> RepairResult {
        log::info!("Performing schema history repair with strategy {}", strategy);
        match strategy {
            RepairStrategy::AutomaticRepair => self.perform_automatic_repair(),
            RepairStrategy::SelectiveRepair => {
                let validation = self.validator.validate_all_checksums();
                self.perform_selective_repair(&validation.mismatched_versions())
            }
            RepairStrategy::BaselineReset => match self.highest_applied_version() {
                Ok(Some(version)) => {
                    self.perform_baseline_reset(&version, BASELINE_RESET_DESCRIPTION)
                }
                Ok(None) => Outcome::failure(
                    "Baseline reset impossible: no applied migrations",
                    RepairFailure {
                        strategy,
                        remaining_mismatches: 0,
                        error: None,
                    },
                ),
                Err(e) => failed(strategy, 0, Some(&e)),
            },
            RepairStrategy::ChecksumUpdate => self.perform_checksum_update(),
            RepairStrategy::ManualOverride => repaired(
                strategy,
                0,
                "Manual override selected: no automated action taken, the schema history must be reconciled by an operator",
            ),
        }
    }

    /// Let the runner realign the whole history, unless automatic repair is disabled.
    pub fn perform_automatic_repair(&self) -> RepairResult {
        let strategy = RepairStrategy::AutomaticRepair;
        if !self.config.auto_repair {
            log::warn!("Automatic repair requested but disabled by configuration");
            return repaired(strategy, 0, "Automatic repair is disabled");
        }

        match self.runner.repair() {
            Ok(output) => {
                let count = output.entries_repaired();
                log::info!("Automatic repair fixed {} history entries", count);
                repaired(
                    strategy,
                    count,
                    format!("Automatic repair completed: {} entries repaired", count),
                )
            }
            Err(e) => {
                log::error!("Automatic repair failed: {}", e);
                failed(strategy, 0, Some(&e))
            }
        }
    }

    /// Repair `versions` and verify that exactly those versions are clean afterwards.
    ///
    /// Not guaranteed to converge in one pass: if mismatches remain the result is a failure
    /// carrying their count, and the caller may retry or escalate to a baseline reset.
    pub fn perform_selective_repair(&self, versions: &[MigrationVersion]) -> RepairResult {
        let strategy = RepairStrategy::SelectiveRepair;
        if versions.is_empty() {
            return repaired(strategy, 0, "No versions selected for repair");
        }

        let before = self.validator.validate_versions(versions);
        if !before.validation_errors.is_empty() {
            return unverified(strategy, before.mismatch_count(), &before.validation_errors);
        }
        if !before.has_mismatches() {
            return repaired(strategy, 0, "No checksum mismatches in the selected versions");
        }
        let targeted = before.mismatch_count();

        if let Err(e) = self.runner.repair() {
            log::error!("Selective repair failed: {}", e);
            return failed(strategy, targeted, Some(&e));
        }

        let after = self.validator.validate_versions(versions);
        if !after.validation_errors.is_empty() {
            return unverified(strategy, targeted, &after.validation_errors);
        }
        let remaining = after.mismatch_count();
        if remaining > 0 {
            log::warn!(
                "Selective repair left {} of {} mismatches in place",
                remaining,
                targeted
            );
            return failed(strategy, remaining, None);
        }

        let list = before
            .mismatched_versions()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        repaired(
            strategy,
            targeted,
            format!("Selective repair completed for versions {}", list),
        )
    }

    /// Re-establish the history baseline at `version`.
    ///
    /// Destructive for history bookkeeping below `version`; callers take a backup first.
    pub fn perform_baseline_reset(
        &self,
        version: &MigrationVersion,
        description: &str,
    ) -> RepairResult {
        let strategy = RepairStrategy::BaselineReset;
        let superseded = match self.runner.info() {
            Ok(info) => info.applied().filter(|r| &r.version <= version).count(),
            Err(e) => return failed(strategy, 0, Some(&e)),
        };

        match self.runner.baseline(version, description) {
            Ok(()) => {
                log::info!(
                    "Schema history baselined at {} ({} entries superseded)",
                    version,
                    superseded
                );
                repaired(
                    strategy,
                    superseded,
                    format!("Baseline reset to version {}", version),
                )
            }
            Err(e) => {
                log::error!("Baseline reset to {} failed: {}", version, e);
                failed(strategy, 0, Some(&e))
            }
        }
    }

    fn perform_checksum_update(&self) -> RepairResult {
        let strategy = RepairStrategy::ChecksumUpdate;
        let output = match self.runner.repair() {
            Ok(output) => output,
            Err(e) => return failed(strategy, 0, Some(&e)),
        };

        let after = self.validator.validate_all_checksums();
        if !after.validation_errors.is_empty() {
            return unverified(strategy, after.mismatch_count(), &after.validation_errors);
        }
        if after.has_mismatches() {
            return failed(strategy, after.mismatch_count(), None);
        }
        repaired(
            strategy,
            output.migrations_aligned,
            format!(
                "Recorded checksums updated for {} migrations",
                output.migrations_aligned
            ),
        )
    }

    fn highest_applied_version(&self) -> Result<Option<MigrationVersion>, GuardError> {
        let info = self.runner.info()?;
        Ok(info.applied().last().map(|r| r.version.clone()))
    }

    /// Advisory combining the current validation, the recommended strategy and operator hints.
    pub fn get_repair_recommendations(&self) -> RepairRecommendation {
        let validation = self.validator.validate_all_checksums();
        let mut recommendations = Vec::new();

        if !validation.validation_errors.is_empty() {
            recommendations.push(format!(
                "Checksum analysis failed: {}",
                validation.validation_errors.join("; ")
            ));
            recommendations.push(
                "Resolve the analysis errors before attempting an automated repair".to_string(),
            );
            return RepairRecommendation {
                validation,
                strategy: RepairStrategy::ManualOverride,
                recommendations,
            };
        }

        let strategy = self.strategy_for(&validation);
        let mismatches = validation.mismatch_count();
        let total = validation.total_count();

        if mismatches == 0 {
            recommendations.push(format!(
                "No repair needed: all {} applied migrations match their scripts",
                total
            ));
        } else {
            match strategy {
                RepairStrategy::SelectiveRepair => {
                    recommendations.push(format!(
                        "{} checksum mismatches detected - selective repair recommended",
                        mismatches
                    ));
                    let versions = validation
                        .mismatched_versions()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    recommendations.push(format!("Affected versions: {}", versions));
                }
                RepairStrategy::BaselineReset => {
                    recommendations.push(format!(
                        "{} of {} applied migrations mismatch - baseline reset recommended",
                        mismatches, total
                    ));
                    recommendations
                        .push("Take a database backup before resetting the baseline".to_string());
                }
                _ => recommendations.push(format!(
                    "{} checksum mismatches detected - automatic repair recommended",
                    mismatches
                )),
            }

            let unresolved = validation
                .mismatches
                .values()
                .filter(|c| c.file_checksum.is_none())
                .count();
            if unresolved > 0 {
                recommendations.push(format!(
                    "{} applied migrations have no resolvable script; restore the files or repair to drop them",
                    unresolved
                ));
            }

            if !self.config.auto_repair {
                recommendations.push(
                    "Automatic repair is disabled; enable auto_repair or repair manually"
                        .to_string(),
                );
            }
        }

        RepairRecommendation {
            validation,
            strategy,
            recommendations,
        }
    }
}
