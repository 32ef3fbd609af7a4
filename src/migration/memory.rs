//! In-memory runner, script source and snapshotter.
//!
//! [`InMemoryRunner`] implements the runner contract over any [`ScriptLocator`] with the schema
//! history kept in memory. It backs the test-suite and local dry runs, and can be told to fail
//! individual operations so the safety layer's error paths can be exercised without a database.

use crate::migration::checksum::calculate_checksum;
use crate::migration::{
    CancellationToken, DatabaseSnapshotter, GuardError, MigrateOutput, MigrationInfo,
    MigrationRecord, MigrationRunner, MigrationState, MigrationVersion, RepairOutput,
    ScriptLocator, ScriptResource,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// Runner operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerOperation {
    Info,
    Migrate,
    Baseline,
    Repair,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    description: String,
    script: String,
    checksum: Option<u32>,
    rank: u32,
    installed_on: DateTime<Utc>,
    execution_time_ms: Option<i64>,
    success: bool,
    baseline: bool,
}

#[derive(Debug, Default)]
struct RunnerState {
    history: BTreeMap<MigrationVersion, HistoryEntry>,
    failing: HashSet<RunnerOperation>,
    failing_migration: Option<MigrationVersion>,
    repair_effective: bool,
    info_delay: Option<Duration>,
}

impl RunnerState {
    fn next_rank(&self) -> u32 {
        self.history.values().map(|e| e.rank).max().unwrap_or(0) + 1
    }

    fn baseline_version(&self) -> Option<&MigrationVersion> {
        self.history
            .iter()
            .filter(|(_, e)| e.baseline)
            .map(|(v, _)| v)
            .last()
    }

    fn check(&self, operation: RunnerOperation, name: &'static str) -> Result<(), GuardError> {
        if self.failing.contains(&operation) {
            return Err(GuardError::runner(name, "simulated runner failure"));
        }
        Ok(())
    }
}

/// A migration runner whose schema history lives in memory
pub struct InMemoryRunner {
    locator: Arc<dyn ScriptLocator>,
    state: Mutex<RunnerState>,
    migrate_calls: AtomicUsize,
    repair_calls: AtomicUsize,
    baseline_calls: AtomicUsize,
}

impl InMemoryRunner {
    pub fn new(locator: Arc<dyn ScriptLocator>) -> Self {
        Self {
            locator,
            state: Mutex::new(RunnerState {
                repair_effective: true,
                ..RunnerState::default()
            }),
            migrate_calls: AtomicUsize::new(0),
            repair_calls: AtomicUsize::new(0),
            baseline_calls: AtomicUsize::new(0),
        }
    }

    /// Runner over a copy of `locator`'s current scripts, typically a directory locator.
    pub fn from_locator<L>(locator: &L) -> Result<Self, GuardError>
    where
        L: ScriptLocator + Clone + 'static,
    {
        let runner = Self::new(Arc::new(locator.clone()));
        // Surface an unreadable script root at construction rather than on first use
        runner.locator.discover()?;
        Ok(runner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RunnerState>, GuardError> {
        self.state
            .lock()
            .map_err(|_| GuardError::runner("lock", "runner state poisoned"))
    }

    /// Record `version` as applied with an explicit checksum, bypassing the scripts.
    pub fn seed_applied(
        &self,
        version: MigrationVersion,
        description: impl Into<String>,
        checksum: u32,
    ) -> Result<(), GuardError> {
        let description = description.into();
        let mut state = self.lock()?;
        let rank = state.next_rank();
        let script = ScriptResource::filename_for(&version, &description);
        state.history.insert(
            version,
            HistoryEntry {
                description,
                script,
                checksum: Some(checksum),
                rank,
                installed_on: Utc::now(),
                execution_time_ms: Some(0),
                success: true,
                baseline: false,
            },
        );
        Ok(())
    }

    /// Make every call of `operation` fail until [`Self::heal`] is called.
    pub fn fail_on(&self, operation: RunnerOperation) -> Result<(), GuardError> {
        self.lock()?.failing.insert(operation);
        Ok(())
    }

    /// Make `migrate()` stop with a failed history entry when it reaches `version`.
    pub fn fail_migration(&self, version: MigrationVersion) -> Result<(), GuardError> {
        self.lock()?.failing_migration = Some(version);
        Ok(())
    }

    /// When `false`, `repair()` reports success without touching the history.
    pub fn set_repair_effective(&self, effective: bool) -> Result<(), GuardError> {
        self.lock()?.repair_effective = effective;
        Ok(())
    }

    /// Slow down `info()`, for exercising timeouts.
    pub fn set_info_delay(&self, delay: Option<Duration>) -> Result<(), GuardError> {
        self.lock()?.info_delay = delay;
        Ok(())
    }

    /// Clear all injected failures.
    pub fn heal(&self) -> Result<(), GuardError> {
        let mut state = self.lock()?;
        state.failing.clear();
        state.failing_migration = None;
        state.repair_effective = true;
        Ok(())
    }

    pub fn migrate_calls(&self) -> usize {
        self.migrate_calls.load(Ordering::SeqCst)
    }

    pub fn repair_calls(&self) -> usize {
        self.repair_calls.load(Ordering::SeqCst)
    }

    pub fn baseline_calls(&self) -> usize {
        self.baseline_calls.load(Ordering::SeqCst)
    }

    fn script_checksums(
        &self,
    ) -> Result<BTreeMap<MigrationVersion, (ScriptResource, Option<u32>)>, GuardError> {
        let mut scripts = BTreeMap::new();
        for script in self.locator.discover()? {
            let pending = MigrationRecord::pending(
                script.version.clone(),
                &script.description,
                &script.resource,
            );
            let checksum = self.locator.load(&pending).ok().map(|b| calculate_checksum(&b));
            scripts.insert(script.version.clone(), (script, checksum));
        }
        Ok(scripts)
    }
}

impl MigrationRunner for InMemoryRunner {
    fn info(&self) -> Result<MigrationInfo, GuardError> {
        let delay = {
            let state = self.lock()?;
            state.check(RunnerOperation::Info, "info")?;
            state.info_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let scripts = self.script_checksums()?;
        let state = self.lock()?;
        let baseline = state.baseline_version().cloned();
        let mut records = Vec::new();

        for (version, entry) in &state.history {
            let state_of = if entry.baseline {
                MigrationState::Baseline
            } else if !entry.success {
                MigrationState::Failed
            } else {
                match scripts.get(version) {
                    None | Some((_, None)) => MigrationState::Missing,
                    Some((_, Some(current))) if Some(*current) != entry.checksum => {
                        MigrationState::Outdated
                    }
                    Some(_) => MigrationState::Success,
                }
            };

            records.push(MigrationRecord {
                version: version.clone(),
                description: entry.description.clone(),
                script: entry.script.clone(),
                checksum: entry.checksum,
                installed_rank: Some(entry.rank),
                installed_on: Some(entry.installed_on),
                execution_time_ms: entry.execution_time_ms,
                state: state_of,
            });
        }

        for (version, (script, _)) in &scripts {
            if state.history.contains_key(version) {
                continue;
            }
            if baseline.as_ref().is_some_and(|b| version <= b) {
                continue;
            }
            records.push(MigrationRecord::pending(
                version.clone(),
                &script.description,
                &script.resource,
            ));
        }

        MigrationInfo::new(records)
    }

    fn migrate(&self) -> Result<MigrateOutput, GuardError> {
        self.migrate_calls.fetch_add(1, Ordering::SeqCst);
        self.lock()?.check(RunnerOperation::Migrate, "migrate")?;

        let info = self.info()?;
        if let Some(failed) = info.failed().next() {
            return Err(GuardError::runner(
                "migrate",
                format!(
                    "Detected failed migration to version {} ({}); repair the history first",
                    failed.version, failed.description
                ),
            ));
        }

        let scripts = self.script_checksums()?;
        let mut state = self.lock()?;
        let mut executed = 0;

        for pending in info.pending() {
            let checksum = scripts.get(&pending.version).and_then(|(_, c)| *c);
            let rank = state.next_rank();
            let fails = state.failing_migration.as_ref() == Some(&pending.version);

            state.history.insert(
                pending.version.clone(),
                HistoryEntry {
                    description: pending.description.clone(),
                    script: pending.script.clone(),
                    checksum,
                    rank,
                    installed_on: Utc::now(),
                    execution_time_ms: Some(1),
                    success: !fails,
                    baseline: false,
                },
            );

            if fails {
                return Err(GuardError::runner(
                    "migrate",
                    format!(
                        "Migration {} ({}) failed after {} successful migration(s)",
                        pending.version, pending.description, executed
                    ),
                ));
            }
            executed += 1;
        }

        Ok(MigrateOutput {
            migrations_executed: executed,
        })
    }

    fn baseline(&self, version: &MigrationVersion, description: &str) -> Result<(), GuardError> {
        self.baseline_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock()?;
        state.check(RunnerOperation::Baseline, "baseline")?;

        state.history.retain(|v, _| v > version);

        // Renumber so the baseline marker precedes everything kept above it
        let mut kept: Vec<&mut HistoryEntry> = state.history.values_mut().collect();
        kept.sort_by_key(|e| e.rank);
        for (i, entry) in kept.into_iter().enumerate() {
            entry.rank = i as u32 + 2;
        }

        state.history.insert(
            version.clone(),
            HistoryEntry {
                description: description.to_string(),
                script: String::new(),
                checksum: None,
                rank: 1,
                installed_on: Utc::now(),
                execution_time_ms: None,
                success: true,
                baseline: true,
            },
        );
        Ok(())
    }

    fn repair(&self) -> Result<RepairOutput, GuardError> {
        self.repair_calls.fetch_add(1, Ordering::SeqCst);
        self.lock()?.check(RunnerOperation::Repair, "repair")?;

        let scripts = self.script_checksums()?;
        let mut state = self.lock()?;
        if !state.repair_effective {
            return Ok(RepairOutput::default());
        }

        let mut output = RepairOutput::default();
        let mut removed = Vec::new();

        for (version, entry) in state.history.iter_mut() {
            if entry.baseline {
                continue;
            }
            match scripts.get(version) {
                _ if !entry.success => removed.push(version.clone()),
                None | Some((_, None)) => removed.push(version.clone()),
                Some((script, Some(current))) => {
                    if entry.checksum != Some(*current) || entry.description != script.description {
                        entry.checksum = Some(*current);
                        entry.description = script.description.clone();
                        entry.script = script.resource.clone();
                        output.migrations_aligned += 1;
                    }
                }
            }
        }

        for version in removed {
            state.history.remove(&version);
            output.migrations_removed += 1;
        }

        Ok(output)
    }

    fn clean(&self) -> Result<(), GuardError> {
        self.lock()?.history.clear();
        Ok(())
    }
}

/// Scripts held in memory, keyed by resource name
#[derive(Debug, Default)]
pub struct InMemoryScriptLocator {
    scripts: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryScriptLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the script stored under `resource`.
    pub fn insert(&self, resource: impl Into<String>, content: impl Into<Vec<u8>>) {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        scripts.insert(resource.into(), content.into());
    }

    /// Add a script under its conventional file name and return that name.
    pub fn add(&self, version: &str, description: &str, content: impl Into<Vec<u8>>) -> String {
        let resource = match MigrationVersion::parse(version) {
            Ok(v) => ScriptResource::filename_for(&v, description),
            Err(_) => format!("V{}__{}.sql", version, description.replace(' ', "_")),
        };
        self.insert(resource.clone(), content);
        resource
    }

    pub fn remove(&self, resource: &str) -> Option<Vec<u8>> {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        scripts.remove(resource)
    }
}

impl ScriptLocator for InMemoryScriptLocator {
    fn load(&self, record: &MigrationRecord) -> Result<Vec<u8>, GuardError> {
        let resource = crate::migration::file::resource_name(record);
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        scripts
            .get(&resource)
            .cloned()
            .ok_or_else(|| GuardError::ScriptNotFound {
                version: record.version.to_string(),
                description: record.description.clone(),
            })
    }

    fn location(&self, record: &MigrationRecord) -> String {
        format!("memory:{}", crate::migration::file::resource_name(record))
    }

    fn discover(&self) -> Result<Vec<ScriptResource>, GuardError> {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<ScriptResource> = scripts
            .keys()
            .filter_map(|resource| {
                ScriptResource::parse_filename(resource).map(|(version, description)| {
                    ScriptResource {
                        version,
                        description,
                        resource: resource.clone(),
                    }
                })
            })
            .collect();
        found.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(found)
    }
}

/// Snapshotter over an in-memory "database" image
#[derive(Debug, Default)]
pub struct MemorySnapshotter {
    content: Mutex<Vec<u8>>,
    dump_delay: Mutex<Option<Duration>>,
    restore_delay: Mutex<Option<Duration>>,
    fail_dumps: AtomicBool,
    fail_restores: AtomicBool,
    dump_calls: AtomicUsize,
    restore_calls: AtomicUsize,
    restores_in_flight: AtomicUsize,
}

impl MemorySnapshotter {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: Mutex::new(content.into()),
            ..Self::default()
        }
    }

    pub fn content(&self) -> Vec<u8> {
        self.content.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_content(&self, content: impl Into<Vec<u8>>) {
        *self.content.lock().unwrap_or_else(|e| e.into_inner()) = content.into();
    }

    /// Stretch each dump over `delay`, writing the image repeatedly in small steps.
    pub fn set_dump_delay(&self, delay: Option<Duration>) {
        *self.dump_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Hold each restore for `delay` before the image is swapped in.
    pub fn set_restore_delay(&self, delay: Option<Duration>) {
        *self.restore_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn fail_dumps(&self, fail: bool) {
        self.fail_dumps.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restores(&self, fail: bool) {
        self.fail_restores.store(fail, Ordering::SeqCst);
    }

    pub fn dump_calls(&self) -> usize {
        self.dump_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    /// Restores that have started but not yet returned
    pub fn restores_in_flight(&self) -> usize {
        self.restores_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DatabaseSnapshotter for MemorySnapshotter {
    fn dump(&self, out: &mut dyn Write, cancel: &CancellationToken) -> Result<(), GuardError> {
        self.dump_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_dumps.load(Ordering::SeqCst) {
            return Err(GuardError::Backup("simulated dump failure".to_string()));
        }

        let content = self.content();
        let delay = *self.dump_delay.lock().unwrap_or_else(|e| e.into_inner());
        match delay {
            None => out
                .write_all(&content)
                .map_err(|e| GuardError::io("memory snapshot", e)),
            Some(delay) => {
                let start = Instant::now();
                while start.elapsed() < delay {
                    if cancel.is_cancelled() {
                        return Err(GuardError::Cancelled("Backup"));
                    }
                    out.write_all(&content)
                        .map_err(|e| GuardError::io("memory snapshot", e))?;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(())
            }
        }
    }

    fn restore(&self, input: &mut dyn Read, cancel: &CancellationToken) -> Result<(), GuardError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.restores_in_flight);
        if self.fail_restores.load(Ordering::SeqCst) {
            return Err(GuardError::Backup("simulated restore failure".to_string()));
        }

        let mut image = Vec::new();
        input
            .read_to_end(&mut image)
            .map_err(|e| GuardError::io("memory snapshot", e))?;

        let delay = *self.restore_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            let start = Instant::now();
            while start.elapsed() < delay && !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        // the image is swapped in whole or not at all
        if cancel.is_cancelled() {
            return Err(GuardError::Cancelled("Restore"));
        }
        self.set_content(image);
        Ok(())
    }
}
