//! Contract of the external migration runner

use crate::migration::{GuardError, MigrationInfo, MigrationVersion};

/// Outcome of a runner `migrate()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrateOutput {
    pub migrations_executed: usize,
}

/// Outcome of a runner `repair()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepairOutput {
    /// History entries whose recorded checksum or description was realigned
    pub migrations_aligned: usize,
    /// Failed history entries that were removed
    pub migrations_removed: usize,
}

impl RepairOutput {
    pub fn entries_repaired(&self) -> usize {
        self.migrations_aligned + self.migrations_removed
    }
}

/// The versioned-migration runner the safety layer wraps.
///
/// The runner owns the schema-history table and is responsible for its own database-level
/// locking during `migrate()`, `repair()` and `baseline()`. Implementations must be usable
/// from several threads; read-only `info()` may run concurrently with a mutating call.
pub trait MigrationRunner: Send + Sync {
    /// Every migration the runner knows about, applied or pending.
    fn info(&self) -> Result<MigrationInfo, GuardError>;

    /// Apply all pending migrations in version order.
    fn migrate(&self) -> Result<MigrateOutput, GuardError>;

    /// Declare `version` as the starting point of the history.
    fn baseline(&self, version: &MigrationVersion, description: &str) -> Result<(), GuardError>;

    /// Realign recorded checksums with the current scripts and drop failed entries.
    fn repair(&self) -> Result<RepairOutput, GuardError>;

    /// Drop everything in the managed schema. Only meant for tests.
    fn clean(&self) -> Result<(), GuardError> {
        Err(GuardError::runner("clean", "clean is disabled for this runner"))
    }
}
