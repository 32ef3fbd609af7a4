//! Alerting sink for migration failures and checksum mismatches

use crate::migration::MigrationVersion;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MigrationFailure,
    ChecksumMismatch,
    RepairFailure,
    BackupFailure,
    ValidationTimeout,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::MigrationFailure => "migration_failure",
            AlertKind::ChecksumMismatch => "checksum_mismatch",
            AlertKind::RepairFailure => "repair_failure",
            AlertKind::BackupFailure => "backup_failure",
            AlertKind::ValidationTimeout => "validation_timeout",
        };
        f.write_str(s)
    }
}

/// Structured event handed to the alerting sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationAlert {
    pub kind: AlertKind,
    pub version: Option<MigrationVersion>,
    pub description: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl MigrationAlert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            version: None,
            description: None,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn for_migration(mut self, version: &MigrationVersion, description: &str) -> Self {
        self.version = Some(version.clone());
        self.description = Some(description.to_string());
        self
    }
}

/// Write-only receiver of alerts; implementations must not panic or block for long.
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &MigrationAlert);
}

/// Emits alerts through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, alert: &MigrationAlert) {
        match (&alert.version, &alert.description) {
            (Some(version), Some(description)) => log::error!(
                "[{}] migration {} ({}): {}",
                alert.kind,
                version,
                description,
                alert.message
            ),
            _ => log::error!("[{}] {}", alert.kind, alert.message),
        }
    }
}

/// Keeps every alert in memory, in order
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<MigrationAlert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<MigrationAlert> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn send(&self, alert: &MigrationAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert.clone());
    }
}
