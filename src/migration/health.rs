//! Aggregate health of the migration subsystem

use crate::migration::{Consistency, MigrationInfo, MigrationState, MigrationVersion};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Health snapshot, recomputed on every request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub current_version: Option<MigrationVersion>,
    pub pending_count: usize,
    pub last_migration_at: Option<DateTime<Utc>>,
    pub message: String,
    pub consistency: Consistency,
}

impl HealthStatus {
    pub fn has_issues(&self) -> bool {
        self.state != HealthState::Healthy
    }

    /// Classify a runner snapshot.
    ///
    /// `checksum_mismatches` are applied versions whose recorded checksum no longer matches
    /// their script; they are merged with the runner's own `Outdated`/`Missing` states.
    pub fn evaluate(
        info: &MigrationInfo,
        checksum_mismatches: &[MigrationVersion],
        auto_repair: bool,
        consistency: Consistency,
    ) -> Self {
        let mut diverged: Vec<&MigrationVersion> = info
            .all()
            .iter()
            .filter(|r| matches!(r.state, MigrationState::Outdated | MigrationState::Missing))
            .map(|r| &r.version)
            .collect();
        for version in checksum_mismatches {
            if !diverged.contains(&version) {
                diverged.push(version);
            }
        }

        let failed: Vec<String> = info.failed().map(|r| r.version.to_string()).collect();

        let (state, message) = if !failed.is_empty() {
            (
                HealthState::Unhealthy,
                format!("Failed migrations present: {}", failed.join(", ")),
            )
        } else if !diverged.is_empty() && !auto_repair {
            (
                HealthState::Unhealthy,
                format!(
                    "{} migrations diverge from their scripts and automatic repair is disabled",
                    diverged.len()
                ),
            )
        } else if !diverged.is_empty() {
            (
                HealthState::Degraded,
                format!(
                    "{} migrations diverge from their scripts; automatic repair will reconcile them",
                    diverged.len()
                ),
            )
        } else if info.pending_count > 0 {
            (
                HealthState::Degraded,
                format!("{} pending migrations", info.pending_count),
            )
        } else {
            (HealthState::Healthy, "Schema is up to date".to_string())
        };

        Self {
            state,
            current_version: info.current_version().cloned(),
            pending_count: info.pending_count,
            last_migration_at: info.last_installed_on(),
            message,
            consistency,
        }
    }

    /// Status reported when the runner could not be queried at all
    pub fn unavailable(error: impl fmt::Display, consistency: Consistency) -> Self {
        Self {
            state: HealthState::Unhealthy,
            current_version: None,
            pending_count: 0,
            last_migration_at: None,
            message: format!("Health check failed: {}", error),
            consistency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationRecord;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    fn applied(version: &str, rank: u32, state: MigrationState) -> MigrationRecord {
        MigrationRecord::applied(v(version), "m", "", Some(1), rank, state)
    }

    fn info(records: Vec<MigrationRecord>) -> MigrationInfo {
        MigrationInfo::new(records).unwrap()
    }

    #[test]
    fn clean_history_is_healthy() {
        let info = info(vec![applied("1", 1, MigrationState::Success)]);
        let status = HealthStatus::evaluate(&info, &[], false, Consistency::Consistent);
        assert_eq!(status.state, HealthState::Healthy);
        assert!(!status.has_issues());
        assert_eq!(status.current_version, Some(v("1")));
    }

    #[test]
    fn failed_migration_is_unhealthy_even_with_auto_repair() {
        let info = info(vec![
            applied("1", 1, MigrationState::Success),
            applied("2", 2, MigrationState::Failed),
        ]);
        let status = HealthStatus::evaluate(&info, &[], true, Consistency::Consistent);
        assert_eq!(status.state, HealthState::Unhealthy);
        assert!(status.message.contains("2"));
    }

    #[test]
    fn divergence_depends_on_auto_repair() {
        let info = info(vec![applied("1", 1, MigrationState::Outdated)]);
        assert_eq!(
            HealthStatus::evaluate(&info, &[], false, Consistency::Consistent).state,
            HealthState::Unhealthy
        );
        assert_eq!(
            HealthStatus::evaluate(&info, &[], true, Consistency::Consistent).state,
            HealthState::Degraded
        );
    }

    #[test]
    fn checksum_mismatches_count_as_divergence() {
        let info = info(vec![applied("1", 1, MigrationState::Success)]);
        let status = HealthStatus::evaluate(&info, &[v("1")], false, Consistency::Consistent);
        assert_eq!(status.state, HealthState::Unhealthy);
    }

    #[test]
    fn pending_only_is_degraded() {
        let info = info(vec![
            applied("1", 1, MigrationState::Success),
            MigrationRecord::pending(v("2"), "next", "V2__next.sql"),
        ]);
        let status = HealthStatus::evaluate(&info, &[], false, Consistency::Consistent);
        assert_eq!(status.state, HealthState::Degraded);
        assert_eq!(status.pending_count, 1);
    }

    #[test]
    fn unavailable_runner_is_unhealthy() {
        let status = HealthStatus::unavailable("connection refused", Consistency::Consistent);
        assert_eq!(status.state, HealthState::Unhealthy);
        assert!(status.message.contains("connection refused"));
    }
}
