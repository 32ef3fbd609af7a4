//! `MigrationRecord` - Entries of the runner's schema history

use crate::migration::MigrationVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a migration as reported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Script resolved but not applied yet
    Pending,
    /// Applied cleanly
    Success,
    /// Application started but did not complete
    Failed,
    /// Applied, but the script has changed since
    Outdated,
    /// Applied, but the script can no longer be resolved
    Missing,
    /// Marker row written by `baseline()`; has no script
    Baseline,
}

impl MigrationState {
    /// Whether the schema history contains an application attempt for this migration
    pub fn is_applied(self) -> bool {
        matches!(
            self,
            MigrationState::Success
                | MigrationState::Failed
                | MigrationState::Outdated
                | MigrationState::Missing
        )
    }

    /// Applied, but not in a state the history can vouch for
    pub fn is_unclean(self) -> bool {
        matches!(
            self,
            MigrationState::Failed | MigrationState::Outdated | MigrationState::Missing
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Pending => "pending",
            MigrationState::Success => "success",
            MigrationState::Failed => "failed",
            MigrationState::Outdated => "outdated",
            MigrationState::Missing => "missing",
            MigrationState::Baseline => "baseline",
        };
        f.write_str(s)
    }
}

/// One migration known to the runner.
///
/// Owned by the runner and read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: MigrationVersion,

    pub description: String,

    /// Script resource path as registered by the runner (empty when unknown)
    pub script: String,

    /// CRC-32 recorded when the migration was applied (`None` for pending and baseline rows)
    pub checksum: Option<u32>,

    /// Position in application order (`None` until applied)
    pub installed_rank: Option<u32>,

    pub installed_on: Option<DateTime<Utc>>,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,

    pub state: MigrationState,
}

impl MigrationRecord {
    /// Create a pending record for a resolved script
    #[must_use]
    pub fn pending(
        version: MigrationVersion,
        description: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            script: script.into(),
            checksum: None,
            installed_rank: None,
            installed_on: None,
            execution_time_ms: None,
            state: MigrationState::Pending,
        }
    }

    /// Create a record that has been applied with the given outcome
    #[must_use]
    pub fn applied(
        version: MigrationVersion,
        description: impl Into<String>,
        script: impl Into<String>,
        checksum: Option<u32>,
        installed_rank: u32,
        state: MigrationState,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            script: script.into(),
            checksum,
            installed_rank: Some(installed_rank),
            installed_on: Some(Utc::now()),
            execution_time_ms: None,
            state,
        }
    }

    /// Whether this entry is a clean part of the history
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self.state, MigrationState::Success | MigrationState::Baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_and_unclean_states() {
        assert!(MigrationState::Outdated.is_applied());
        assert!(MigrationState::Outdated.is_unclean());
        assert!(MigrationState::Success.is_applied());
        assert!(!MigrationState::Success.is_unclean());
        assert!(!MigrationState::Pending.is_applied());
        assert!(!MigrationState::Baseline.is_applied());
    }

    #[test]
    fn baseline_rows_count_as_success() {
        let v = MigrationVersion::parse("1").unwrap();
        let record =
            MigrationRecord::applied(v, "<< Baseline >>", "", None, 1, MigrationState::Baseline);
        assert!(record.success());
    }
}
