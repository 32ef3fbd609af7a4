//! # Schemaguard
//!
//! Safety layer around a versioned schema-migration runner.
//!
//! Schemaguard observes the runner's applied-migration history, compares it against the
//! migration scripts on disk, decides how to reconcile any divergence, takes backups before
//! risky operations and reports aggregate health. The [`migration::MigrationManager`] is the
//! single entry point operators and CI use.
//!
//! Wiring a manager around an existing runner:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use schemaguard::config::GuardConfig;
//! use schemaguard::metrics::NoopMetricsCollector;
//! use schemaguard::migration::{
//!     DirectoryScriptLocator, LogAlertSink, MigrationManager, MigrationRunner, PgDumpSnapshotter,
//! };
//!
//! fn run(
//!     runner: Arc<dyn MigrationRunner>,
//!     database_url: &str,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GuardConfig::load()?;
//!     let locator = Arc::new(DirectoryScriptLocator::new(&config.scripts_directory));
//!     let snapshotter = Arc::new(PgDumpSnapshotter::new(database_url));
//!
//!     let manager = MigrationManager::builder(config, runner, locator, snapshotter)
//!         .metrics(Arc::new(NoopMetricsCollector))
//!         .alerts(Arc::new(LogAlertSink))
//!         .build();
//!
//!     let result = manager.execute_with_safeguards();
//!     println!("{}", result.message());
//!     Ok(())
//! }
//! ```
//!
//! The in-memory runner, script source and snapshotter used by the test-suite live in
//! `migration::memory` behind the `test-helpers` feature.

pub mod config;
pub mod metrics;
pub mod migration;

pub use config::GuardConfig;
pub use migration::{GuardError, MigrationManager};
