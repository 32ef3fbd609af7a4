//! Preview of what `migrate()` would apply

use crate::migration::checksum::calculate_checksum;
use crate::migration::{
    CampaignLock, Consistency, GuardError, MigrationRunner, MigrationVersion, Outcome,
    ScriptLocator,
};
use serde::Serialize;
use std::sync::Arc;

/// One pending migration as it would be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: MigrationVersion,
    pub description: String,
    pub location: String,
    pub size_bytes: u64,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunPreview {
    pub current_version: Option<MigrationVersion>,
    pub target_version: Option<MigrationVersion>,
    pub pending: Vec<PendingMigration>,
    pub consistency: Consistency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunFailure {
    /// Pending versions whose script could not be resolved
    pub unresolved: Vec<MigrationVersion>,
    pub error: Option<String>,
}

pub type DryRunResult = Outcome<DryRunPreview, DryRunFailure>;

impl Outcome<DryRunPreview, DryRunFailure> {
    /// Whether a complete preview could be computed
    pub fn is_valid(&self) -> bool {
        self.is_success()
    }

    pub fn preview(&self) -> Option<&DryRunPreview> {
        self.success_detail()
    }
}

#[derive(Clone)]
pub struct DryRunMigrationService {
    runner: Arc<dyn MigrationRunner>,
    locator: Arc<dyn ScriptLocator>,
    campaign: Arc<CampaignLock>,
}

impl DryRunMigrationService {
    pub fn new(runner: Arc<dyn MigrationRunner>, locator: Arc<dyn ScriptLocator>) -> Self {
        Self {
            runner,
            locator,
            campaign: Arc::new(CampaignLock::new()),
        }
    }

    pub fn with_campaign_lock(mut self, campaign: Arc<CampaignLock>) -> Self {
        self.campaign = campaign;
        self
    }

    /// List pending migrations in application order without touching the database.
    pub fn perform_dry_run(&self) -> DryRunResult {
        let consistency = self.campaign.consistency();

        let info = match self.runner.info() {
            Ok(info) => info,
            Err(e) => {
                log::error!("Dry run could not read the schema history: {}", e);
                return Outcome::failure(
                    format!("Dry run failed: {}", e),
                    DryRunFailure {
                        unresolved: Vec::new(),
                        error: Some(e.to_string()),
                    },
                );
            }
        };

        let mut pending = Vec::new();
        let mut unresolved = Vec::new();
        for record in info.pending() {
            match self.locator.load(record) {
                Ok(bytes) => pending.push(PendingMigration {
                    version: record.version.clone(),
                    description: record.description.clone(),
                    location: self.locator.location(record),
                    size_bytes: bytes.len() as u64,
                    checksum: calculate_checksum(&bytes),
                }),
                Err(GuardError::ScriptNotFound { .. }) => unresolved.push(record.version.clone()),
                Err(e) => {
                    log::warn!("Script for pending migration {} unreadable: {}", record.version, e);
                    unresolved.push(record.version.clone());
                }
            }
        }

        if !unresolved.is_empty() {
            let list = unresolved
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Outcome::failure(
                format!("Dry run invalid: unresolved scripts for versions {}", list),
                DryRunFailure {
                    unresolved,
                    error: None,
                },
            );
        }

        let current_version = info.current_version().cloned();
        let target_version = pending
            .last()
            .map(|p| p.version.clone())
            .or_else(|| current_version.clone());
        let consistency = if self.campaign.is_held() {
            Consistency::BestEffort
        } else {
            consistency
        };

        log::debug!("Dry run: {} pending migrations", pending.len());
        let message = match &target_version {
            Some(target) if !pending.is_empty() => format!(
                "{} pending migrations would be applied, reaching version {}",
                pending.len(),
                target
            ),
            _ => "Schema is up to date; nothing would be applied".to_string(),
        };

        Outcome::success(
            message,
            DryRunPreview {
                current_version,
                target_version,
                pending,
                consistency,
            },
        )
    }
}
