//! Removal of action directories that haven't been used for a while, and
//! the schedule deciding when that happens.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::time::{Duration, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::LockError;
use crate::fingerprint::{Fingerprint, now};
use crate::lock::WorkLock;

pub(crate) const MAINTENANCE_FILE: &str = "maintenance.json";

#[derive(Debug, Default)]
pub struct CleanReport {
    pub scanned: usize,
    pub deleted: Vec<Utf8PathBuf>,
    pub bytes_freed: u64,
}

fn dir_size(path: &Utf8Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Last time the action in `dir` was executed or found up to date. Falls back
/// to the directory mtime when there is no readable sidecar.
fn last_used(fingerprint: Option<&Fingerprint>, dir: &Utf8Path) -> u64 {
    if let Some(fingerprint) = fingerprint {
        return fingerprint.last_used;
    }

    fs::metadata(dir)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_fingerprint(dir: &Utf8Path) -> Option<Fingerprint> {
    match Fingerprint::read(dir) {
        Ok(fingerprint) => fingerprint,
        Err(err) => {
            warn!(path = %dir, "unreadable fingerprint: {err}");
            None
        }
    }
}

fn try_lock(work: &Utf8Path) -> io::Result<Option<WorkLock>> {
    match WorkLock::acquire(work) {
        Ok(lock) => Ok(Some(lock)),
        Err(LockError::Contention { .. } | LockError::ContentionUnknown { .. }) => {
            info!(work = %work, "working directory is locked, skipping cleanup");
            Ok(None)
        }
        Err(LockError::Create(err)) => Err(err),
    }
}

/// Deletes every action directory under `work` not used within `max_age`,
/// except the ones named in `keep` and the ones a kept terminal producer
/// skipped over. Returns `None` without touching anything when another
/// process holds the lock on `work`.
pub fn clean_expired(
    work: &Utf8Path,
    max_age: Duration,
    keep: &HashSet<String>,
) -> io::Result<Option<CleanReport>> {
    if !work.is_dir() {
        return Ok(Some(CleanReport::default()));
    }

    let Some(_lock) = try_lock(work)? else {
        return Ok(None);
    };

    clean_locked(work, max_age, keep).map(Some)
}

fn clean_locked(work: &Utf8Path, max_age: Duration, keep: &HashSet<String>) -> io::Result<CleanReport> {
    let deadline = now().saturating_sub(max_age.as_secs());
    let mut report = CleanReport::default();
    let mut expired = Vec::new();
    let mut protected = HashSet::new();

    for entry in work.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();

        if name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }

        report.scanned += 1;

        let path = entry.path();
        let fingerprint = read_fingerprint(path);
        let used = last_used(fingerprint.as_ref(), path);

        if keep.contains(name) || used >= deadline {
            if let Some(terminal) = fingerprint.and_then(|f| f.terminal) {
                protected.extend(terminal.protects);
            }
            continue;
        }

        expired.push((name.to_string(), path.to_owned(), used));
    }

    for (name, path, used) in expired {
        if protected.contains(&name) {
            debug!(path = %path, "keeping expired entry needed by a terminal action");
            continue;
        }

        let size = dir_size(&path);
        debug!(path = %path, last_used = used, "deleting expired entry");
        fs::remove_dir_all(&path)?;

        report.bytes_freed += size;
        report.deleted.push(path);
    }

    info!(
        deleted = report.deleted.len(),
        bytes_freed = report.bytes_freed,
        "cache cleanup complete"
    );

    Ok(report)
}

/// When [`perform_maintenance`] actually cleans up.
#[derive(Debug, Clone)]
pub struct MaintenancePolicy {
    /// Entries unused for longer than this are deleted.
    pub expire_unused_after: Duration,
    /// Minimum time between two cleanups.
    pub perform_cleanup_after: Duration,
    /// Once a cleanup is due it is scheduled this far ahead, so that the
    /// dispatch that noticed it isn't slowed down by it.
    pub delay_cleanup_by: Duration,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        const DAY: u64 = 24 * 60 * 60;

        Self {
            expire_unused_after: Duration::from_secs(7 * DAY),
            perform_cleanup_after: Duration::from_secs(DAY),
            delay_cleanup_by: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MaintenanceInfo {
    last_cleanup: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheduled_cleanup: Option<u64>,
}

impl MaintenanceInfo {
    fn read(path: &Utf8Path) -> Option<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path, "unreadable maintenance record: {err}");
                return None;
            }
        };

        serde_json::from_slice(&data)
            .inspect_err(|err| warn!(path = %path, "unreadable maintenance record: {err}"))
            .ok()
    }

    fn write(&self, path: &Utf8Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(path, data)
    }
}

/// What a call to [`perform_maintenance`] did.
#[derive(Debug)]
pub enum Maintenance {
    /// No record existed yet, one was created and the clock started.
    Started,
    /// The last cleanup is recent enough, or the scheduled one isn't due.
    NotDue,
    /// A cleanup became due and was scheduled for the given unix time.
    Scheduled(u64),
    Cleaned(CleanReport),
    /// Another process holds the working directory, try again later.
    Locked,
}

/// Runs [`clean_expired`] on a schedule recorded in `<work>/maintenance.json`.
/// Cleanup happens in two steps: once `perform_cleanup_after` has passed since
/// the last one a cleanup gets scheduled `delay_cleanup_by` ahead, and a
/// later call past that time performs it.
pub fn perform_maintenance(
    work: &Utf8Path,
    policy: &MaintenancePolicy,
    keep: &HashSet<String>,
) -> io::Result<Maintenance> {
    if !work.is_dir() {
        return Ok(Maintenance::NotDue);
    }

    let Some(_lock) = try_lock(work)? else {
        return Ok(Maintenance::Locked);
    };

    let path = work.join(MAINTENANCE_FILE);
    let now = now();

    let Some(info) = MaintenanceInfo::read(&path) else {
        MaintenanceInfo {
            last_cleanup: now,
            scheduled_cleanup: None,
        }
        .write(&path)?;
        return Ok(Maintenance::Started);
    };

    if now.saturating_sub(info.last_cleanup) < policy.perform_cleanup_after.as_secs() {
        return Ok(Maintenance::NotDue);
    }

    match info.scheduled_cleanup {
        None => {
            let at = now + policy.delay_cleanup_by.as_secs();
            info!(at, "scheduled cache cleanup");
            MaintenanceInfo {
                scheduled_cleanup: Some(at),
                ..info
            }
            .write(&path)?;
            Ok(Maintenance::Scheduled(at))
        }
        Some(at) if now >= at => {
            let report = clean_locked(work, policy.expire_unused_after, keep)?;
            MaintenanceInfo {
                last_cleanup: now,
                scheduled_cleanup: None,
            }
            .write(&path)?;
            Ok(Maintenance::Cleaned(report))
        }
        Some(_) => Ok(Maintenance::NotDue),
    }
}
