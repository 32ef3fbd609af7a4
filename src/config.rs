//! Configuration for the migration safety layer.
//!
//! [`GuardConfig`] is loaded once (from `config/schemaguard.toml` or environment variables via
//! [`GuardConfig::load()`]) and then injected, immutable, into every service.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config/schemaguard.toml";
const ENV_PREFIX: &str = "SCHEMAGUARD";

/// Thresholds used to classify checksum divergence into a repair strategy.
///
/// With `m` mismatches out of `n` checked migrations:
///
/// 1. `m == 0` selects automatic repair (a no-op);
/// 2. `n >= baseline_min_checked` and `m / n > baseline_mismatch_ratio` selects a baseline reset;
/// 3. `m <= selective_max_mismatches` selects selective repair;
/// 4. anything else falls back to automatic repair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepairPolicy {
    #[serde(default = "default_selective_max_mismatches")]
    pub selective_max_mismatches: usize,
    #[serde(default = "default_baseline_min_checked")]
    pub baseline_min_checked: usize,
    #[serde(default = "default_baseline_mismatch_ratio")]
    pub baseline_mismatch_ratio: f64,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            selective_max_mismatches: default_selective_max_mismatches(),
            baseline_min_checked: default_baseline_min_checked(),
            baseline_mismatch_ratio: default_baseline_mismatch_ratio(),
        }
    }
}

fn default_selective_max_mismatches() -> usize {
    3
}

fn default_baseline_min_checked() -> usize {
    5
}

fn default_baseline_mismatch_ratio() -> f64 {
    0.5
}

/// Options consumed by the safety layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Repair checksum divergence automatically before executing migrations
    #[serde(default)]
    pub auto_repair: bool,
    /// Take a database backup before mutating the schema
    #[serde(default = "default_backup_before_migration")]
    pub backup_before_migration: bool,
    #[serde(default = "default_validation_timeout_seconds")]
    pub validation_timeout_seconds: u64,
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
    /// Backups older than this are pruned after each successful backup (0 keeps everything)
    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u32,
    #[serde(default = "default_backup_timeout_seconds")]
    pub backup_timeout_seconds: u64,
    /// How long a mutating operation waits for an in-flight campaign to finish
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    #[serde(default = "default_scripts_directory")]
    pub scripts_directory: PathBuf,
    #[serde(default)]
    pub repair_policy: RepairPolicy,
}

fn default_backup_before_migration() -> bool {
    true
}

fn default_validation_timeout_seconds() -> u64 {
    30
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("backups")
}

fn default_backup_retention_days() -> u32 {
    7
}

fn default_backup_timeout_seconds() -> u64 {
    300
}

fn default_lock_timeout_seconds() -> u64 {
    60 // Same default the runner uses for its advisory lock
}

fn default_scripts_directory() -> PathBuf {
    PathBuf::from("migrations")
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            auto_repair: false,
            backup_before_migration: default_backup_before_migration(),
            validation_timeout_seconds: default_validation_timeout_seconds(),
            backup_directory: default_backup_directory(),
            backup_retention_days: default_backup_retention_days(),
            backup_timeout_seconds: default_backup_timeout_seconds(),
            lock_timeout_seconds: default_lock_timeout_seconds(),
            scripts_directory: default_scripts_directory(),
            repair_policy: RepairPolicy::default(),
        }
    }
}

impl GuardConfig {
    /// Load the configuration from `config/schemaguard.toml` (section `[migration]`), falling
    /// back to `SCHEMAGUARD__MIGRATION__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(env_source());

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                if Path::new(CONFIG_FILE).exists() {
                    log::warn!(
                        "Failed to load {}, falling back to environment: {}",
                        CONFIG_FILE,
                        err
                    );
                }
                Config::builder()
                    .add_source(env_source())
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {}, then env-only error: {}",
                            err, env_err
                        ))
                    })?
            }
        };

        Self::from_settings(&settings)
    }

    /// Extract the `migration` section from an already-built [`Config`].
    ///
    /// A missing section yields the defaults.
    pub fn from_settings(settings: &Config) -> Result<Self, ConfigError> {
        let guard_config = match settings.get::<GuardConfig>("migration") {
            Ok(cfg) => cfg,
            Err(ConfigError::NotFound(_)) => GuardConfig::default(),
            Err(e) => {
                return Err(ConfigError::Message(format!(
                    "Migration configuration could not be loaded: {}",
                    e
                )))
            }
        };

        guard_config.validate()?;
        Ok(guard_config)
    }

    /// Reject values the services cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "validation_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.backup_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "backup_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "backup_directory must not be empty".to_string(),
            ));
        }
        let ratio = self.repair_policy.baseline_mismatch_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(ConfigError::Message(format!(
                "repair_policy.baseline_mismatch_ratio must be in [0, 1), got {}",
                ratio
            )));
        }
        Ok(())
    }

    pub fn with_auto_repair(mut self, enabled: bool) -> Self {
        self.auto_repair = enabled;
        self
    }

    pub fn with_backup_before_migration(mut self, enabled: bool) -> Self {
        self.backup_before_migration = enabled;
        self
    }

    pub fn with_backup_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_directory = dir.into();
        self
    }

    pub fn with_scripts_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_directory = dir.into();
        self
    }

    pub fn with_validation_timeout_seconds(mut self, seconds: u64) -> Self {
        self.validation_timeout_seconds = seconds;
        self
    }

    pub fn with_backup_timeout_seconds(mut self, seconds: u64) -> Self {
        self.backup_timeout_seconds = seconds;
        self
    }

    pub fn with_backup_retention_days(mut self, days: u32) -> Self {
        self.backup_retention_days = days;
        self
    }

    pub fn with_lock_timeout_seconds(mut self, seconds: u64) -> Self {
        self.lock_timeout_seconds = seconds;
        self
    }

    pub fn with_repair_policy(mut self, policy: RepairPolicy) -> Self {
        self.repair_policy = policy;
        self
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GuardConfig::default();
        assert!(!cfg.auto_repair);
        assert!(cfg.backup_before_migration);
        assert_eq!(cfg.validation_timeout_seconds, 30);
        assert_eq!(cfg.backup_retention_days, 7);
        assert_eq!(cfg.repair_policy.selective_max_mismatches, 3);
        assert_eq!(cfg.repair_policy.baseline_min_checked, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_section_falls_back_to_defaults() {
        let settings = Config::builder()
            .add_source(File::from_str("[other]\nkey = 1\n", FileFormat::Toml))
            .build()
            .unwrap();
        let cfg = GuardConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg, GuardConfig::default());
    }

    #[test]
    fn partial_section_keeps_unset_defaults() {
        let toml = r#"
            [migration]
            auto_repair = true
            backup_directory = "/var/backups/app"

            [migration.repair_policy]
            selective_max_mismatches = 2
        "#;
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        let cfg = GuardConfig::from_settings(&settings).unwrap();

        assert!(cfg.auto_repair);
        assert_eq!(cfg.backup_directory, PathBuf::from("/var/backups/app"));
        assert_eq!(cfg.repair_policy.selective_max_mismatches, 2);
        assert_eq!(cfg.repair_policy.baseline_min_checked, 5);
        assert_eq!(cfg.lock_timeout_seconds, 60);
    }

    #[test]
    fn zero_validation_timeout_is_rejected() {
        let cfg = GuardConfig::default().with_validation_timeout_seconds(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ratio_out_of_range_is_rejected() {
        let cfg = GuardConfig::default().with_repair_policy(RepairPolicy {
            baseline_mismatch_ratio: 1.5,
            ..RepairPolicy::default()
        });
        assert!(cfg.validate().is_err());
    }
}
