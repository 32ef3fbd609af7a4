//! Pre-migration database backups
//!
//! A backup is a snapshot written by a [`DatabaseSnapshotter`] into the configured backup
//! directory. Each artifact is named `{label}-{timestamp}-{seq}.{ext}` and accompanied by a
//! `{name}.manifest.json` sidecar holding its label, creation time, size and SHA-256 digest.
//! Snapshots are written to `{name}.partial` first and only renamed once complete, so a backup
//! that timed out or was cancelled never looks like a usable artifact.

use crate::config::GuardConfig;
use crate::migration::worker::run_cancellable;
use crate::migration::{CancellationToken, GuardError, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

const MANIFEST_SUFFIX: &str = ".manifest.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Process-wide sequence making names unique for identical labels and timestamps
static BACKUP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Produces and restores database snapshots
///
/// Both operations receive the caller's [`CancellationToken`]. Once it fires they stop and
/// return `GuardError::Cancelled`; a cancelled restore leaves the database as it was.
pub trait DatabaseSnapshotter: Send + Sync {
    /// Write a complete snapshot of the database to `out`.
    fn dump(&self, out: &mut dyn Write, cancel: &CancellationToken) -> Result<(), GuardError>;

    /// Replace the database contents with the snapshot read from `input`.
    fn restore(&self, input: &mut dyn Read, cancel: &CancellationToken) -> Result<(), GuardError>;

    /// File extension of the snapshot format, without the dot
    fn extension(&self) -> &str {
        "sql"
    }
}

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(50);

/// Snapshots a PostgreSQL database with the `pg_dump` and `psql` executables
///
/// The password of a `postgres://` URL is handed to the tools through `PGPASSWORD`, never on
/// the command line. Restores run in a single transaction, so killing `psql` rolls them back.
#[derive(Debug, Clone)]
pub struct PgDumpSnapshotter {
    database_url: String,
    pg_dump: PathBuf,
    psql: PathBuf,
}

impl PgDumpSnapshotter {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pg_dump: PathBuf::from("pg_dump"),
            psql: PathBuf::from("psql"),
        }
    }

    /// Use explicit executables instead of looking them up on `PATH`.
    pub fn with_executables(
        mut self,
        pg_dump: impl Into<PathBuf>,
        psql: impl Into<PathBuf>,
    ) -> Self {
        self.pg_dump = pg_dump.into();
        self.psql = psql.into();
        self
    }

    fn command(&self, program: &Path, args: &[&str]) -> Command {
        let target = ConnectionTarget::parse(&self.database_url);
        let mut command = Command::new(program);
        command.args(args).arg("--dbname").arg(&target.dbname);
        if let Some(password) = target.password {
            command.env("PGPASSWORD", password);
        }
        command
    }
}

/// Connection argument for the libpq tools, with any URL password split off
#[derive(Debug, PartialEq, Eq)]
struct ConnectionTarget {
    dbname: String,
    password: Option<String>,
}

impl ConnectionTarget {
    /// Key/value connection strings are passed through untouched.
    fn parse(database_url: &str) -> Self {
        let passthrough = || ConnectionTarget {
            dbname: database_url.to_string(),
            password: None,
        };

        let mut url = match Url::parse(database_url) {
            Ok(url) if matches!(url.scheme(), "postgres" | "postgresql") => url,
            _ => return passthrough(),
        };
        let Some(password) = url.password().map(percent_decode) else {
            return passthrough();
        };
        if url.set_password(None).is_err() {
            return passthrough();
        }
        ConnectionTarget {
            dbname: url.to_string(),
            password: Some(password),
        }
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(byte) = hex {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn command_failure(program: &Path, status: ExitStatus, stderr: &[u8]) -> GuardError {
    GuardError::Backup(format!(
        "{} exited with {}: {}",
        program.display(),
        status,
        String::from_utf8_lossy(stderr).trim()
    ))
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drive `child` through `pump`, killing it as soon as `cancel` fires.
///
/// A watchdog thread polls the token, so a tool stalled without producing or consuming any
/// data is still terminated.
fn supervise<F>(
    program: &Path,
    operation: &'static str,
    mut child: Child,
    cancel: &CancellationToken,
    pump: F,
) -> Result<(), GuardError>
where
    F: FnOnce() -> io::Result<u64>,
{
    let stderr = child.stderr.take();
    let child = Arc::new(Mutex::new(child));
    let done = Arc::new(AtomicBool::new(false));

    let spawned = {
        let child = Arc::clone(&child);
        let done = Arc::clone(&done);
        let token = cancel.clone();
        std::thread::Builder::new()
            .name(format!("schemaguard-{}-watchdog", operation.to_lowercase()))
            .spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if token.is_cancelled() {
                        log::warn!("{} cancelled; killing child process", operation);
                        let _ = lock_child(&child).kill();
                        return;
                    }
                    std::thread::sleep(WATCHDOG_INTERVAL);
                }
            })
    };
    let watchdog = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            let mut child = lock_child(&child);
            let _ = child.kill();
            let _ = child.wait();
            return Err(GuardError::io("watchdog thread", e));
        }
    };

    let pumped = pump();
    if pumped.is_err() {
        let _ = lock_child(&child).kill();
    }

    let mut diagnostics = Vec::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_end(&mut diagnostics);
    }
    done.store(true, Ordering::Release);
    let _ = watchdog.join();
    let status = lock_child(&child)
        .wait()
        .map_err(|e| GuardError::io(program, e))?;

    if cancel.is_cancelled() {
        return Err(GuardError::Cancelled(operation));
    }
    pumped.map_err(|e| GuardError::io(program, e))?;
    if !status.success() {
        return Err(command_failure(program, status, &diagnostics));
    }
    Ok(())
}

impl DatabaseSnapshotter for PgDumpSnapshotter {
    fn dump(&self, out: &mut dyn Write, cancel: &CancellationToken) -> Result<(), GuardError> {
        let mut child = self
            .command(&self.pg_dump, &["--no-owner", "--no-privileges"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GuardError::io(&self.pg_dump, e))?;

        let stdout = child.stdout.take();
        supervise(&self.pg_dump, "Backup", child, cancel, move || match stdout {
            Some(mut stdout) => io::copy(&mut stdout, out),
            None => Ok(0),
        })
    }

    fn restore(&self, input: &mut dyn Read, cancel: &CancellationToken) -> Result<(), GuardError> {
        let mut child = self
            .command(
                &self.psql,
                &["--quiet", "--single-transaction", "--set", "ON_ERROR_STOP=1"],
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GuardError::io(&self.psql, e))?;

        let stdin = child.stdin.take();
        supervise(&self.psql, "Restore", child, cancel, move || match stdin {
            Some(mut stdin) => io::copy(input, &mut stdin),
            None => Ok(0),
        })
    }
}

/// A completed backup on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the snapshot file
    pub sha256: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BackupManifest {
    label: String,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupOutcome {
    Created(BackupArtifact),
    /// Backups are turned off; nothing was written
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub backup: BackupOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupFailure {
    pub label: String,
    pub error: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

pub type BackupResult = Outcome<BackupSummary, BackupFailure>;

impl Outcome<BackupSummary, BackupFailure> {
    /// Path of the created artifact; `None` for disabled or failed backups
    pub fn backup_path(&self) -> Option<&Path> {
        match self.success_detail() {
            Some(BackupSummary {
                backup: BackupOutcome::Created(artifact),
            }) => Some(&artifact.path),
            _ => None,
        }
    }

    pub fn artifact(&self) -> Option<&BackupArtifact> {
        match self.success_detail() {
            Some(BackupSummary {
                backup: BackupOutcome::Created(artifact),
            }) => Some(artifact),
            _ => None,
        }
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

/// Writer that hashes and counts what passes through and refuses writes once cancelled
struct CancellableWriter<W: Write> {
    inner: W,
    token: CancellationToken,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> CancellableWriter<W> {
    fn new(inner: W, token: CancellationToken) -> Self {
        Self {
            inner,
            token,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<(W, u64, String)> {
        self.inner.flush()?;
        Ok((self.inner, self.written, format!("{:x}", self.hasher.finalize())))
    }
}

impl<W: Write> Write for CancellableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "backup cancelled"));
        }
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that refuses further reads once cancelled
pub(crate) struct CancellableReader<R: Read> {
    inner: R,
    token: CancellationToken,
}

impl<R: Read> CancellableReader<R> {
    pub(crate) fn new(inner: R, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "restore cancelled"));
        }
        self.inner.read(buf)
    }
}

fn write_snapshot(
    snapshotter: &dyn DatabaseSnapshotter,
    partial: &Path,
    token: &CancellationToken,
) -> Result<(u64, String), GuardError> {
    let file = File::create(partial).map_err(|e| GuardError::io(partial, e))?;
    let mut writer = CancellableWriter::new(BufWriter::new(file), token.clone());
    snapshotter.dump(&mut writer, token)?;

    let (buffered, size, digest) = writer.finish().map_err(|e| GuardError::io(partial, e))?;
    let file = buffered
        .into_inner()
        .map_err(|e| GuardError::io(partial, e.into_error()))?;
    file.sync_all().map_err(|e| GuardError::io(partial, e))?;
    Ok((size, digest))
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
    }
}

/// SHA-256 of a file, streamed
pub(crate) fn file_digest(path: &Path) -> Result<String, GuardError> {
    let file = File::open(path).map_err(|e| GuardError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| GuardError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Creates, lists and prunes backup artifacts
#[derive(Clone)]
pub struct DatabaseBackupService {
    config: Arc<GuardConfig>,
    snapshotter: Arc<dyn DatabaseSnapshotter>,
}

impl DatabaseBackupService {
    pub fn new(config: Arc<GuardConfig>, snapshotter: Arc<dyn DatabaseSnapshotter>) -> Self {
        Self {
            config,
            snapshotter,
        }
    }

    pub fn backup_directory(&self) -> &Path {
        &self.config.backup_directory
    }

    pub fn create_pre_migration_backup(&self, label: &str) -> BackupResult {
        self.create_backup_with_cancel(label, &CancellationToken::new())
    }

    /// Take a backup that stops early once `cancel` is triggered.
    ///
    /// The caller waits at most `backup_timeout_seconds`; on timeout `cancel` is triggered and
    /// the call returns only after the snapshot worker has stopped and removed its partial file.
    pub fn create_backup_with_cancel(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> BackupResult {
        if !self.config.backup_before_migration {
            log::warn!("Backup '{}' skipped: backups are disabled", label);
            return Outcome::success(
                "Backup disabled by configuration",
                BackupSummary {
                    backup: BackupOutcome::Disabled,
                },
            );
        }

        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::backup_span(label).entered();

        match self.write_backup(label, cancel) {
            Ok(artifact) => {
                log::info!(
                    "Backup {} created ({} bytes)",
                    artifact.name,
                    artifact.size_bytes
                );
                if let Err(e) = self.prune_expired_backups(Utc::now()) {
                    log::warn!("Pruning expired backups failed: {}", e);
                }
                Outcome::success(
                    format!("Backup created: {}", artifact.name),
                    BackupSummary {
                        backup: BackupOutcome::Created(artifact),
                    },
                )
            }
            Err(e) => {
                log::error!("Backup '{}' failed: {}", label, e);
                Outcome::failure(
                    format!("Backup failed: {}", e),
                    BackupFailure {
                        label: label.to_string(),
                        error: e.to_string(),
                        timed_out: matches!(e, GuardError::Timeout { .. }),
                        cancelled: matches!(e, GuardError::Cancelled(_)),
                    },
                )
            }
        }
    }

    fn write_backup(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact, GuardError> {
        let dir = self.config.backup_directory.clone();
        fs::create_dir_all(&dir).map_err(|e| GuardError::io(&dir, e))?;

        let label = sanitize_label(label);
        let created_at = Utc::now();
        let seq = BACKUP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{}-{:04}.{}",
            label,
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            seq,
            self.snapshotter.extension()
        );
        let path = dir.join(&name);
        let partial = dir.join(format!("{}{}", name, PARTIAL_SUFFIX));

        let snapshotter = Arc::clone(&self.snapshotter);
        let worker_partial = partial.clone();
        let timeout = Duration::from_secs(self.config.backup_timeout_seconds);

        let written = run_cancellable("Backup", timeout, cancel, move |token| {
            let result = write_snapshot(snapshotter.as_ref(), &worker_partial, token);
            if token.is_cancelled() {
                remove_if_present(&worker_partial);
                return Err(GuardError::Cancelled("Backup"));
            }
            if result.is_err() {
                remove_if_present(&worker_partial);
            }
            result
        });

        let (size_bytes, sha256) = match written {
            Ok(written) => written,
            Err(e) => {
                remove_if_present(&partial);
                return Err(e);
            }
        };

        fs::rename(&partial, &path).map_err(|e| GuardError::io(&path, e))?;

        let manifest = BackupManifest {
            label: label.clone(),
            created_at,
            size_bytes,
            sha256: sha256.clone(),
        };
        let manifest_path = dir.join(format!("{}{}", name, MANIFEST_SUFFIX));
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .map_err(|e| GuardError::io(&manifest_path, e))?;

        Ok(BackupArtifact {
            name,
            path,
            size_bytes,
            sha256,
            label,
            created_at,
        })
    }

    /// Every artifact that has a manifest, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupArtifact>, GuardError> {
        let dir = &self.config.backup_directory;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GuardError::io(dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GuardError::io(dir, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file_name.strip_suffix(MANIFEST_SUFFIX) else {
                continue;
            };
            match self.load_artifact(name) {
                Ok(artifact) => backups.push(artifact),
                Err(e) => log::warn!("Ignoring backup {}: {}", name, e),
            }
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    /// Look up a backup by artifact name; names containing path components are rejected.
    pub fn find_backup(&self, name: &str) -> Result<BackupArtifact, GuardError> {
        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || name.contains('/') || name.contains('\\') {
            return Err(GuardError::Backup(format!(
                "'{}' is not a backup name",
                name
            )));
        }
        self.load_artifact(name)
    }

    fn load_artifact(&self, name: &str) -> Result<BackupArtifact, GuardError> {
        let dir = &self.config.backup_directory;
        let path = dir.join(name);
        if !path.is_file() {
            return Err(GuardError::Backup(format!("backup '{}' does not exist", name)));
        }

        let manifest_path = dir.join(format!("{}{}", name, MANIFEST_SUFFIX));
        let raw = fs::read(&manifest_path).map_err(|e| GuardError::io(&manifest_path, e))?;
        let manifest: BackupManifest = serde_json::from_slice(&raw)?;

        Ok(BackupArtifact {
            name: name.to_string(),
            path,
            size_bytes: manifest.size_bytes,
            sha256: manifest.sha256,
            label: manifest.label,
            created_at: manifest.created_at,
        })
    }

    /// Check that an artifact still matches the digest in its manifest.
    pub fn verify_backup(&self, artifact: &BackupArtifact) -> Result<(), GuardError> {
        let actual = file_digest(&artifact.path)?;
        if actual != artifact.sha256 {
            return Err(GuardError::Backup(format!(
                "backup '{}' is corrupt: digest {} does not match manifest {}",
                artifact.name, actual, artifact.sha256
            )));
        }
        Ok(())
    }

    /// Delete artifacts older than the retention window; returns how many were removed.
    pub fn prune_expired_backups(&self, now: DateTime<Utc>) -> Result<usize, GuardError> {
        let days = self.config.backup_retention_days;
        if days == 0 {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::days(i64::from(days));

        let mut removed = 0;
        for artifact in self.list_backups()? {
            if artifact.created_at >= cutoff {
                continue;
            }
            fs::remove_file(&artifact.path).map_err(|e| GuardError::io(&artifact.path, e))?;
            remove_if_present(
                &self
                    .config
                    .backup_directory
                    .join(format!("{}{}", artifact.name, MANIFEST_SUFFIX)),
            );
            log::info!("Pruned expired backup {}", artifact.name);
            removed += 1;
        }
        Ok(removed)
    }
}
