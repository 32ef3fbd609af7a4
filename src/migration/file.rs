//! Migration script discovery and resolution

use crate::migration::{GuardError, MigrationRecord, MigrationVersion};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Pattern: `V{version}__{description}.sql`, version segments separated by `.` or `_`
static SCRIPT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^V([0-9]+(?:[._][0-9]+)*)__(.+)\.sql$").expect("script name pattern is valid")
});

/// A migration script found on disk (or in any other script source)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResource {
    pub version: MigrationVersion,

    /// Description with underscores turned back into spaces
    pub description: String,

    /// Resource name relative to the script root, as the runner registers it
    pub resource: String,
}

impl ScriptResource {
    /// Parse a script file name into version and description
    ///
    /// # Example
    /// - `V1.2__add_users_table.sql` → version: 1.2, description: "add users table"
    pub fn parse_filename(filename: &str) -> Option<(MigrationVersion, String)> {
        let caps = SCRIPT_NAME.captures(filename)?;
        let version = MigrationVersion::parse(caps.get(1)?.as_str()).ok()?;
        let description = caps.get(2)?.as_str().replace('_', " ");
        Some((version, description))
    }

    /// The file name a migration with this version and description is stored under
    pub fn filename_for(version: &MigrationVersion, description: &str) -> String {
        format!("V{}__{}.sql", version, description.replace(' ', "_"))
    }
}

/// Resolves the script a migration was registered from.
///
/// Resolution must use the same resource the runner used; an unresolvable script is reported
/// as [`GuardError::ScriptNotFound`], never guessed.
pub trait ScriptLocator: Send + Sync {
    /// Read the raw bytes of the script behind `record`.
    fn load(&self, record: &MigrationRecord) -> Result<Vec<u8>, GuardError>;

    /// Human-readable location of the script, for previews and reports.
    fn location(&self, record: &MigrationRecord) -> String;

    /// All scripts currently available, sorted by version.
    fn discover(&self) -> Result<Vec<ScriptResource>, GuardError>;
}

/// Resource name registered for `record`, falling back to the conventional file name.
pub fn resource_name(record: &MigrationRecord) -> String {
    if record.script.is_empty() {
        ScriptResource::filename_for(&record.version, &record.description)
    } else {
        record.script.clone()
    }
}

/// Scripts stored as files below one root directory
#[derive(Debug, Clone)]
pub struct DirectoryScriptLocator {
    root: PathBuf,
}

impl DirectoryScriptLocator {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the script for `record`, if the resource stays inside the root.
    pub fn path_for(&self, record: &MigrationRecord) -> Option<PathBuf> {
        let resource = resource_name(record);
        let relative = Path::new(&resource);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return None;
        }
        Some(self.root.join(relative))
    }

    fn not_found(record: &MigrationRecord) -> GuardError {
        GuardError::ScriptNotFound {
            version: record.version.to_string(),
            description: record.description.clone(),
        }
    }
}

impl ScriptLocator for DirectoryScriptLocator {
    fn load(&self, record: &MigrationRecord) -> Result<Vec<u8>, GuardError> {
        let path = self.path_for(record).ok_or_else(|| Self::not_found(record))?;
        if !path.is_file() {
            return Err(Self::not_found(record));
        }
        fs::read(&path).map_err(|e| GuardError::io(&path, e))
    }

    fn location(&self, record: &MigrationRecord) -> String {
        self.path_for(record)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| resource_name(record))
    }

    /// Scan the root for files matching `V{version}__{description}.sql`.
    ///
    /// Files that do not match the pattern are skipped; a missing root yields no scripts.
    fn discover(&self) -> Result<Vec<ScriptResource>, GuardError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        if !self.root.is_dir() {
            return Err(GuardError::io(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            ));
        }

        let mut scripts = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| GuardError::io(&self.root, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| GuardError::io(&self.root, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            match ScriptResource::parse_filename(filename) {
                Some((version, description)) => scripts.push(ScriptResource {
                    version,
                    description,
                    resource: filename.to_string(),
                }),
                None => log::debug!("Skipping non-migration file {}", path.display()),
            }
        }

        scripts.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationState;

    #[test]
    fn parses_versioned_script_names() {
        let (version, description) =
            ScriptResource::parse_filename("V1.2__add_users_table.sql").unwrap();
        assert_eq!(version, MigrationVersion::parse("1.2").unwrap());
        assert_eq!(description, "add users table");

        assert!(ScriptResource::parse_filename("V1__.sql").is_none());
        assert!(ScriptResource::parse_filename("R__view.sql").is_none());
        assert!(ScriptResource::parse_filename("V1__a.txt").is_none());
    }

    #[test]
    fn derived_filename_round_trips_through_the_parser() {
        let version = MigrationVersion::parse("1.0").unwrap();
        let name = ScriptResource::filename_for(&version, "Test migration");
        assert_eq!(name, "V1.0__Test_migration.sql");
        let (parsed, description) = ScriptResource::parse_filename(&name).unwrap();
        assert_eq!(parsed, version);
        assert_eq!(description, "Test migration");
    }

    #[test]
    fn discover_skips_foreign_files_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("V10__ten.sql"), "select 10;").unwrap();
        fs::write(dir.path().join("V2__two.sql"), "select 2;").unwrap();
        fs::write(dir.path().join("README.md"), "docs").unwrap();

        let locator = DirectoryScriptLocator::new(dir.path());
        let scripts = locator.discover().unwrap();
        let versions: Vec<_> = scripts.iter().map(|s| s.version.to_string()).collect();
        assert_eq!(versions, vec!["2", "10"]);
    }

    #[test]
    fn load_reports_missing_scripts_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let locator = DirectoryScriptLocator::new(dir.path());
        let record = MigrationRecord::applied(
            MigrationVersion::parse("1").unwrap(),
            "gone",
            "V1__gone.sql",
            Some(1),
            1,
            MigrationState::Success,
        );
        assert!(matches!(
            locator.load(&record),
            Err(GuardError::ScriptNotFound { .. })
        ));
    }

    #[test]
    fn resources_escaping_the_root_are_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let locator = DirectoryScriptLocator::new(dir.path());
        let record = MigrationRecord::pending(
            MigrationVersion::parse("1").unwrap(),
            "sneaky",
            "../V1__sneaky.sql",
        );
        assert!(locator.path_for(&record).is_none());
        assert!(locator.load(&record).is_err());
    }
}
