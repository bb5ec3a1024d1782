//! Durable state persistence.
//!
//! All writes are atomic: serialize to a temp file colocated with the
//! target, then rename over it, so a partial document is never observable.
//! A hard invariant at the write boundary rejects any path resolving inside
//! the worker-owned telemetry tree. Reads deserialize with per-field
//! defaults, so documents from older schema versions never fail to load.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{AlertRecord, FleetState, IssueRegistry};

/// Scan locks older than this are considered abandoned and broken.
const STALE_LOCK_MINUTES: i64 = 30;

/// Errors enforced at the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Writes inside the worker-owned telemetry tree are forbidden.
    #[error("refusing to write inside the telemetry tree: {path}")]
    TelemetryTreeWrite { path: String },

    /// Another scan invocation holds the lock.
    #[error("scan lock already held: {path}")]
    LockHeld { path: String },
}

/// State store rooted at a directory, guarding the telemetry tree.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    telemetry_root: PathBuf,
}

impl StateStore {
    /// Open (and lay out) the state tree at `root`. The `telemetry_root`
    /// is the worker-owned tree this store must never write into.
    pub fn open(root: &Path, telemetry_root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
            telemetry_root: telemetry_root.to_path_buf(),
        };
        for dir in [
            store.root.clone(),
            store.alerts_outbox_dir(),
            store.alerts_sent_dir(),
            store.reports_dir(),
        ] {
            store.guard(&dir)?;
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    #[must_use]
    pub fn issues_path(&self) -> PathBuf {
        self.root.join("issues.json")
    }

    #[must_use]
    pub fn alerts_outbox_dir(&self) -> PathBuf {
        self.root.join("alerts").join("outbox")
    }

    #[must_use]
    pub fn alerts_sent_dir(&self) -> PathBuf {
        self.root.join("alerts").join("sent")
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Read the rolling fleet state, merging over defaults.
    pub fn read_state(&self) -> Result<FleetState> {
        self.read_document(&self.state_path())
    }

    /// Persist the fleet state atomically.
    pub fn write_state(&self, state: &FleetState) -> Result<()> {
        self.write_document(&self.state_path(), state)
    }

    /// Read the issue registry, merging over defaults.
    pub fn read_issues(&self) -> Result<IssueRegistry> {
        self.read_document(&self.issues_path())
    }

    /// Persist the issue registry atomically.
    pub fn write_issues(&self, registry: &IssueRegistry) -> Result<()> {
        self.write_document(&self.issues_path(), registry)
    }

    /// Write an alert record into the outbox. Returns the outbox path.
    pub fn write_alert_outbox(&self, record: &AlertRecord) -> Result<PathBuf> {
        let path = self
            .alerts_outbox_dir()
            .join(format!("{}.json", record.alert_id));
        self.write_document(&path, record)?;
        Ok(path)
    }

    /// Move an alert record from the outbox to the sent ledger after a
    /// successful transport handoff. Returns the sent path.
    pub fn mark_alert_sent(&self, outbox_path: &Path) -> Result<PathBuf> {
        let file_name = outbox_path
            .file_name()
            .with_context(|| format!("Alert path has no file name: {}", outbox_path.display()))?;
        let sent_path = self.alerts_sent_dir().join(file_name);
        self.guard(&sent_path)?;
        fs::rename(outbox_path, &sent_path).with_context(|| {
            format!(
                "Failed to move alert {} to sent",
                outbox_path.display()
            )
        })?;
        Ok(sent_path)
    }

    /// Persist a rendered briefing report. Returns the report path.
    pub fn write_report(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.reports_dir().join(name);
        self.guard(&path)?;
        let tmp = tmp_sibling(&path);
        fs::write(&tmp, text)
            .with_context(|| format!("Failed to write report temp {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to rename report into {}", path.display()))?;
        Ok(path)
    }

    /// Mirror a read-only snapshot of `state.json` and `issues.json` into a
    /// sandbox directory.
    pub fn mirror_snapshot(&self, dir: &Path) -> Result<()> {
        self.guard(dir)?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create mirror dir {}", dir.display()))?;
        for source in [self.state_path(), self.issues_path()] {
            if !source.exists() {
                continue;
            }
            let target = dir.join(source.file_name().unwrap_or_default());
            let tmp = tmp_sibling(&target);
            fs::copy(&source, &tmp)
                .with_context(|| format!("Failed to copy snapshot to {}", tmp.display()))?;
            fs::rename(&tmp, &target)
                .with_context(|| format!("Failed to rename snapshot into {}", target.display()))?;
        }
        debug!(dir = %dir.display(), "mirrored state snapshot");
        Ok(())
    }

    /// Acquire the single-flight scan lock. Stale locks are broken with a
    /// warning; a fresh lock held by another invocation is an error.
    pub fn acquire_scan_lock(&self, now: DateTime<Utc>) -> Result<ScanLock> {
        let path = self.root.join(".scan.lock");
        self.guard(&path)?;

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(ScanLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = lock_age(&path, now);
                if age.map_or(true, |a| a > Duration::minutes(STALE_LOCK_MINUTES)) {
                    warn!(path = %path.display(), "breaking stale scan lock");
                    fs::remove_file(&path).ok();
                    fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&path)
                        .with_context(|| "Failed to re-acquire scan lock".to_string())?;
                    Ok(ScanLock { path })
                } else {
                    Err(StoreError::LockHeld {
                        path: path.display().to_string(),
                    }
                    .into())
                }
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create lock {}", path.display())),
        }
    }

    fn read_document<T: DeserializeOwned + Default>(&self, path: &Path) -> Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn write_document<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.guard(path)?;
        let json = serde_json::to_string_pretty(value).context("Failed to serialize document")?;
        let tmp = tmp_sibling(path);
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write temp {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename into {}", path.display()))?;
        Ok(())
    }

    /// The write-boundary invariant: no path may resolve inside the
    /// worker-owned telemetry tree.
    fn guard(&self, path: &Path) -> Result<(), StoreError> {
        let target = lexical_absolute(path);
        let forbidden = lexical_absolute(&self.telemetry_root);
        if target.starts_with(&forbidden) {
            return Err(StoreError::TelemetryTreeWrite {
                path: path.display().to_string(),
            });
        }
        Ok(())
    }
}

/// Held for the duration of a scan; releases the lock file on drop.
pub struct ScanLock {
    path: PathBuf,
}

impl Drop for ScanLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to release scan lock: {e}");
        }
    }
}

fn lock_age(path: &Path, now: DateTime<Utc>) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some(now - modified)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "document".into(), |n| n.to_os_string());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Absolute, lexically-normalized form of a path (no filesystem access, so
/// it works for paths that do not exist yet).
fn lexical_absolute(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
