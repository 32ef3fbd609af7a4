//! Write-only metrics sink for migration campaigns.
//!
//! The manager reports through the [`MetricsCollector`] trait. With the `metrics` feature,
//! [`OtelMetricsCollector`] forwards to an OpenTelemetry meter (exported by whatever provider
//! the host application installs); [`CountingMetricsCollector`] keeps plain counters in process.

use crate::migration::{MigrationVersion, RepairStrategy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

/// Receives counters and timings; must never fail or block the caller.
pub trait MetricsCollector: Send + Sync {
    fn record_success(&self, migrations_applied: usize, duration: Duration);
    fn record_failure(&self, error: &str);
    fn record_checksum_mismatch(&self, version: &MigrationVersion);
    fn record_repair(&self, strategy: RepairStrategy, success: bool);
    fn record_validation_duration(&self, duration: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn record_success(&self, _migrations_applied: usize, _duration: Duration) {}
    fn record_failure(&self, _error: &str) {}
    fn record_checksum_mismatch(&self, _version: &MigrationVersion) {}
    fn record_repair(&self, _strategy: RepairStrategy, _success: bool) {}
    fn record_validation_duration(&self, _duration: Duration) {}
}

/// Plain in-process counters
#[derive(Debug, Default)]
pub struct CountingMetricsCollector {
    successes: AtomicU64,
    failures: AtomicU64,
    migrations_applied: AtomicU64,
    checksum_mismatches: AtomicU64,
    repairs: AtomicU64,
    failed_repairs: AtomicU64,
    validations: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl CountingMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn migrations_applied(&self) -> u64 {
        self.migrations_applied.load(Ordering::Relaxed)
    }

    pub fn checksum_mismatches(&self) -> u64 {
        self.checksum_mismatches.load(Ordering::Relaxed)
    }

    pub fn repairs(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }

    pub fn failed_repairs(&self) -> u64 {
        self.failed_repairs.load(Ordering::Relaxed)
    }

    pub fn validations(&self) -> u64 {
        self.validations.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl MetricsCollector for CountingMetricsCollector {
    fn record_success(&self, migrations_applied: usize, _duration: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.migrations_applied
            .fetch_add(migrations_applied as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
    }

    fn record_checksum_mismatch(&self, _version: &MigrationVersion) {
        self.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_repair(&self, _strategy: RepairStrategy, success: bool) {
        if success {
            self.repairs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_repairs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_validation_duration(&self, _duration: Duration) {
        self.validations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide OpenTelemetry collector
#[cfg(feature = "metrics")]
pub static METRICS: Lazy<OtelMetricsCollector> = Lazy::new(OtelMetricsCollector::init);

#[cfg(feature = "metrics")]
pub struct OtelMetricsCollector {
    pub migrations_success_total: Counter<u64>,
    pub migrations_failure_total: Counter<u64>,
    pub migrations_applied_total: Counter<u64>,
    pub checksum_mismatch_total: Counter<u64>,
    pub repair_total: Counter<u64>,
    pub migration_duration: Histogram<f64>,
    pub validation_duration: Histogram<f64>,
}

#[cfg(feature = "metrics")]
impl OtelMetricsCollector {
    pub fn init() -> Self {
        let meter = global::meter("schemaguard");

        let migrations_success_total = meter
            .u64_counter("schemaguard_migrations_success_total")
            .with_description("Migration campaigns that completed successfully")
            .build();

        let migrations_failure_total = meter
            .u64_counter("schemaguard_migrations_failure_total")
            .with_description("Migration campaigns that failed")
            .build();

        let migrations_applied_total = meter
            .u64_counter("schemaguard_migrations_applied_total")
            .with_description("Individual migrations applied")
            .build();

        let checksum_mismatch_total = meter
            .u64_counter("schemaguard_checksum_mismatch_total")
            .with_description("Applied migrations whose script no longer matches the history")
            .build();

        let repair_total = meter
            .u64_counter("schemaguard_repair_total")
            .with_description("Schema history repairs by strategy and outcome")
            .build();

        let migration_duration = meter
            .f64_histogram("schemaguard_migration_duration_seconds")
            .with_description("Duration of migration execution")
            .build();

        let validation_duration = meter
            .f64_histogram("schemaguard_validation_duration_seconds")
            .with_description("Duration of schema history validation")
            .build();

        Self {
            migrations_success_total,
            migrations_failure_total,
            migrations_applied_total,
            checksum_mismatch_total,
            repair_total,
            migration_duration,
            validation_duration,
        }
    }
}

#[cfg(feature = "metrics")]
impl MetricsCollector for OtelMetricsCollector {
    fn record_success(&self, migrations_applied: usize, duration: Duration) {
        self.migrations_success_total.add(1, &[]);
        self.migrations_applied_total
            .add(migrations_applied as u64, &[]);
        self.migration_duration.record(duration.as_secs_f64(), &[]);
    }

    fn record_failure(&self, _error: &str) {
        self.migrations_failure_total.add(1, &[]);
    }

    fn record_checksum_mismatch(&self, version: &MigrationVersion) {
        self.checksum_mismatch_total
            .add(1, &[KeyValue::new("version", version.to_string())]);
    }

    fn record_repair(&self, strategy: RepairStrategy, success: bool) {
        self.repair_total.add(
            1,
            &[
                KeyValue::new("strategy", strategy.as_str()),
                KeyValue::new("success", success),
            ],
        );
    }

    fn record_validation_duration(&self, duration: Duration) {
        self.validation_duration.record(duration.as_secs_f64(), &[]);
    }
}

/// Collector that forwards to the shared [`METRICS`] instance.
#[cfg(feature = "metrics")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalMetricsCollector;

#[cfg(feature = "metrics")]
impl MetricsCollector for GlobalMetricsCollector {
    fn record_success(&self, migrations_applied: usize, duration: Duration) {
        METRICS.record_success(migrations_applied, duration);
    }

    fn record_failure(&self, error: &str) {
        METRICS.record_failure(error);
    }

    fn record_checksum_mismatch(&self, version: &MigrationVersion) {
        METRICS.record_checksum_mismatch(version);
    }

    fn record_repair(&self, strategy: RepairStrategy, success: bool) {
        METRICS.record_repair(strategy, success);
    }

    fn record_validation_duration(&self, duration: Duration) {
        METRICS.record_validation_duration(duration);
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn campaign_span(operation: &'static str) -> Span {
        info_span!("schemaguard.campaign", operation)
    }

    pub fn validation_span() -> Span {
        info_span!("schemaguard.validate")
    }

    pub fn backup_span(label: &str) -> Span {
        info_span!("schemaguard.backup", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_collector_tracks_outcomes() {
        let metrics = CountingMetricsCollector::new();
        metrics.record_success(3, Duration::from_millis(10));
        metrics.record_failure("boom");
        metrics.record_repair(RepairStrategy::SelectiveRepair, false);
        metrics.record_checksum_mismatch(&MigrationVersion::parse("1").unwrap());

        assert_eq!(metrics.successes(), 1);
        assert_eq!(metrics.migrations_applied(), 3);
        assert_eq!(metrics.failures(), 1);
        assert_eq!(metrics.failed_repairs(), 1);
        assert_eq!(metrics.checksum_mismatches(), 1);
        assert_eq!(metrics.last_error().as_deref(), Some("boom"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn otel_collector_records_without_a_provider() {
        let collector = OtelMetricsCollector::init();
        collector.record_success(1, Duration::from_millis(5));
        collector.record_repair(RepairStrategy::BaselineReset, true);
        GlobalMetricsCollector.record_validation_duration(Duration::from_millis(1));
    }
}
