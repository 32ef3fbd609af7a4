//! Shared fixtures for the integration tests

#![allow(dead_code)]

use schemaguard::config::GuardConfig;
use schemaguard::metrics::CountingMetricsCollector;
use schemaguard::migration::{
    InMemoryRunner, InMemoryScriptLocator, MemoryAlertSink, MemorySnapshotter, MigrationManager,
    MigrationVersion,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Script whose CRC-32 is exactly 67890
pub const FORGED_SCRIPT: &[u8] = b"-- Test migration\nSELECT 1;\n-- \x4d\xe7\x55\xe5";

pub struct Harness {
    pub dir: TempDir,
    pub locator: Arc<InMemoryScriptLocator>,
    pub runner: Arc<InMemoryRunner>,
    pub snapshotter: Arc<MemorySnapshotter>,
    pub metrics: Arc<CountingMetricsCollector>,
    pub alerts: Arc<MemoryAlertSink>,
    pub manager: MigrationManager,
}

impl Harness {
    pub fn new(config: GuardConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = config.with_backup_directory(dir.path().join("backups"));

        let locator = Arc::new(InMemoryScriptLocator::new());
        let runner = Arc::new(InMemoryRunner::new(locator.clone()));
        let snapshotter = Arc::new(MemorySnapshotter::new("-- database image\n"));
        let metrics = Arc::new(CountingMetricsCollector::new());
        let alerts = Arc::new(MemoryAlertSink::new());

        let manager =
            MigrationManager::builder(config, runner.clone(), locator.clone(), snapshotter.clone())
                .metrics(metrics.clone())
                .alerts(alerts.clone())
                .build();

        Self {
            dir,
            locator,
            runner,
            snapshotter,
            metrics,
            alerts,
            manager,
        }
    }

    /// Add scripts `1..=count`, each with distinct content.
    pub fn with_scripts(self, count: usize) -> Self {
        for i in 1..=count {
            self.locator
                .add(&i.to_string(), &format!("step {i}"), format!("SELECT {i};"));
        }
        self
    }

    /// Change the content of script `i` added by [`Self::with_scripts`].
    pub fn edit_script(&self, i: usize) {
        self.locator
            .add(&i.to_string(), &format!("step {i}"), format!("SELECT {i} + 0;"));
    }
}

pub fn v(s: &str) -> MigrationVersion {
    MigrationVersion::parse(s).expect("valid version")
}
