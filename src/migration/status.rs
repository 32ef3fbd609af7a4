//! Snapshot of the runner's view of all migrations

use crate::migration::{GuardError, MigrationRecord, MigrationState, MigrationVersion};
use chrono::{DateTime, Utc};

/// What the runner's `info()` reports: every known migration, applied or not.
#[derive(Debug, Clone, Default)]
pub struct MigrationInfo {
    records: Vec<MigrationRecord>,

    /// Number of migrations with an application attempt
    pub applied_count: usize,

    /// Number of migrations not yet applied
    pub pending_count: usize,
}

impl MigrationInfo {
    /// Build a snapshot, sorting records by version.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::InvalidHistory` if two records share a version or an installed
    /// rank. Ranks record application order, which may differ from version order.
    pub fn new(mut records: Vec<MigrationRecord>) -> Result<Self, GuardError> {
        records.sort_by(|a, b| a.version.cmp(&b.version));

        for pair in records.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(GuardError::InvalidHistory(format!(
                    "version {} appears more than once",
                    pair[1].version
                )));
            }
        }

        let mut ranks: Vec<(u32, &MigrationVersion)> = records
            .iter()
            .filter_map(|r| r.installed_rank.map(|rank| (rank, &r.version)))
            .collect();
        ranks.sort_by_key(|(rank, _)| *rank);
        for pair in ranks.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(GuardError::InvalidHistory(format!(
                    "versions {} and {} share installed rank {}",
                    pair[0].1, pair[1].1, pair[0].0
                )));
            }
        }

        let applied_count = records.iter().filter(|r| r.state.is_applied()).count();
        let pending_count = records
            .iter()
            .filter(|r| r.state == MigrationState::Pending)
            .count();

        Ok(Self {
            records,
            applied_count,
            pending_count,
        })
    }

    pub fn all(&self) -> &[MigrationRecord] {
        &self.records
    }

    pub fn applied(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records.iter().filter(|r| r.state.is_applied())
    }

    pub fn pending(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records
            .iter()
            .filter(|r| r.state == MigrationState::Pending)
    }

    pub fn failed(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records
            .iter()
            .filter(|r| r.state == MigrationState::Failed)
    }

    /// The highest applied migration (or baseline marker): the schema version
    #[must_use]
    pub fn current(&self) -> Option<&MigrationRecord> {
        self.records
            .iter()
            .filter(|r| r.state.is_applied() || r.state == MigrationState::Baseline)
            .last()
    }

    #[must_use]
    pub fn current_version(&self) -> Option<&MigrationVersion> {
        self.current().map(|r| &r.version)
    }

    /// When the latest migration was installed
    #[must_use]
    pub fn last_installed_on(&self) -> Option<DateTime<Utc>> {
        self.records.iter().filter_map(|r| r.installed_on).max()
    }

    pub fn find(&self, version: &MigrationVersion) -> Option<&MigrationRecord> {
        self.records.iter().find(|r| &r.version == version)
    }

    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    #[must_use]
    pub fn next_pending_version(&self) -> Option<&MigrationVersion> {
        self.pending().next().map(|r| &r.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    #[test]
    fn sorts_and_counts() {
        let info = MigrationInfo::new(vec![
            MigrationRecord::pending(v("3"), "c", "V3__c.sql"),
            MigrationRecord::applied(v("1"), "a", "V1__a.sql", Some(1), 1, MigrationState::Success),
            MigrationRecord::applied(v("2"), "b", "V2__b.sql", Some(2), 2, MigrationState::Success),
        ])
        .unwrap();

        assert_eq!(info.applied_count, 2);
        assert_eq!(info.pending_count, 1);
        assert_eq!(info.current_version(), Some(&v("2")));
        assert_eq!(info.next_pending_version(), Some(&v("3")));
        assert!(!info.is_up_to_date());
    }

    #[test]
    fn rejects_shared_ranks() {
        let result = MigrationInfo::new(vec![
            MigrationRecord::applied(v("1"), "a", "V1__a.sql", Some(1), 2, MigrationState::Success),
            MigrationRecord::applied(v("2"), "b", "V2__b.sql", Some(2), 2, MigrationState::Success),
        ]);
        assert!(matches!(result, Err(GuardError::InvalidHistory(_))));
    }

    #[test]
    fn out_of_order_application_is_allowed() {
        let info = MigrationInfo::new(vec![
            MigrationRecord::applied(v("1"), "a", "V1__a.sql", Some(1), 2, MigrationState::Success),
            MigrationRecord::applied(v("2"), "b", "V2__b.sql", Some(2), 1, MigrationState::Success),
        ])
        .unwrap();
        assert_eq!(info.current_version(), Some(&v("2")));
    }

    #[test]
    fn rejects_duplicate_versions() {
        let result = MigrationInfo::new(vec![
            MigrationRecord::pending(v("1"), "a", "V1__a.sql"),
            MigrationRecord::pending(v("1.0"), "b", "V1.0__b.sql"),
        ]);
        assert!(matches!(result, Err(GuardError::InvalidHistory(_))));
    }

    #[test]
    fn baseline_is_current_when_nothing_applied_after_it() {
        let info = MigrationInfo::new(vec![
            MigrationRecord::applied(
                v("5"),
                "<< Baseline >>",
                "",
                None,
                1,
                MigrationState::Baseline,
            ),
            MigrationRecord::pending(v("6"), "f", "V6__f.sql"),
        ])
        .unwrap();
        assert_eq!(info.current_version(), Some(&v("5")));
    }
}
