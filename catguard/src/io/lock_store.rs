//! Lock files under `.claude/cat/locks/`.
//!
//! Readers tolerate concurrent writers: a half-written or malformed file is
//! skipped, never fatal. Lock files reached through a symlink, or names that
//! would escape the lock directory, are rejected.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::lock::{Lock, is_owned_by, is_session_owner, is_stale};

const LOCK_EXTENSION: &str = "lock";

/// A lock together with the issue it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockEntry {
    pub issue_id: String,
    #[serde(flatten)]
    pub lock: Lock,
}

/// Outcome of [`acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// The caller already held the lock; it was left as is.
    AlreadyOwned,
    /// A stale lock held by someone else was replaced.
    ReplacedStale { previous_session: Option<String> },
    HeldByOther { lock: Lock },
}

/// Reject issue ids that are not a single plain path component.
fn validate_issue_name(issue_id: &str) -> Result<()> {
    let valid = !issue_id.is_empty()
        && issue_id != "."
        && issue_id != ".."
        && !issue_id.contains('/')
        && !issue_id.contains('\\')
        && !issue_id.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid issue id for lock file: '{issue_id}'"))
    }
}

pub fn lock_file(dir: &Path, issue_id: &str) -> Result<PathBuf> {
    validate_issue_name(issue_id)?;
    Ok(dir.join(format!("{issue_id}.{LOCK_EXTENSION}")))
}

/// Read one lock file, returning `None` for anything unreadable or suspicious.
pub fn read_lock(path: &Path) -> Option<Lock> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), err = %err, "cannot stat lock file");
            }
            return None;
        }
    };
    if !meta.file_type().is_file() {
        warn!(path = %path.display(), "ignoring non-regular lock file");
        return None;
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "cannot read lock file");
            return None;
        }
    };
    match serde_json::from_str::<Lock>(&contents) {
        Ok(lock) => Some(lock),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "skipping malformed lock file");
            None
        }
    }
}

/// Read the lock for `issue_id`, if present and well-formed.
pub fn load_lock(dir: &Path, issue_id: &str) -> Option<Lock> {
    let path = lock_file(dir, issue_id).ok()?;
    read_lock(&path)
}

/// Every readable lock in `dir`, sorted by issue id. A missing directory is empty.
pub fn list_locks(dir: &Path) -> Result<Vec<LockEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read lock dir {}", dir.display()));
        }
    };
    let mut locks = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOCK_EXTENSION) {
            continue;
        }
        let Some(issue_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(lock) = read_lock(&path) {
            locks.push(LockEntry {
                issue_id: issue_id.to_string(),
                lock,
            });
        }
    }
    locks.sort_by(|a, b| a.issue_id.cmp(&b.issue_id));
    Ok(locks)
}

/// Claim the lock for `issue_id` on behalf of `session_id`.
///
/// Creation uses `create_new`, so two concurrent claimers cannot both see
/// `Acquired`. A stale foreign lock is replaced.
pub fn acquire(
    dir: &Path,
    issue_id: &str,
    session_id: &str,
    now: i64,
) -> Result<AcquireOutcome> {
    if session_id.trim().is_empty() {
        return Err(anyhow!("session id is required to acquire a lock"));
    }
    let path = lock_file(dir, issue_id)?;
    fs::create_dir_all(dir).with_context(|| format!("create lock dir {}", dir.display()))?;

    let lock = Lock::new(session_id, now, iso_timestamp(now));
    match create_exclusive(&path, &lock) {
        Ok(()) => {
            info!(issue_id, session_id, "lock acquired");
            return Ok(AcquireOutcome::Acquired);
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(err).with_context(|| format!("create lock {}", path.display()));
        }
    }

    let Some(existing) = read_lock(&path) else {
        // Unreadable or half-written: treat as held until someone force-releases it.
        return Ok(AcquireOutcome::HeldByOther {
            lock: Lock::default(),
        });
    };
    if is_session_owner(&existing, session_id) {
        return Ok(AcquireOutcome::AlreadyOwned);
    }
    if !is_stale(&existing, now) {
        return Ok(AcquireOutcome::HeldByOther { lock: existing });
    }

    warn!(issue_id, previous = ?existing.session_id, "replacing stale lock");
    write_lock(&path, &lock)?;
    Ok(AcquireOutcome::ReplacedStale {
        previous_session: existing.session_id,
    })
}

/// Record `worktree` (with `agent_id`, possibly empty) in the lock for `issue_id`.
pub fn record_worktree(
    dir: &Path,
    issue_id: &str,
    session_id: &str,
    worktree: &Path,
    agent_id: &str,
) -> Result<()> {
    let path = lock_file(dir, issue_id)?;
    let mut lock = read_lock(&path)
        .ok_or_else(|| anyhow!("lock for {issue_id} is missing or unreadable"))?;
    if !is_session_owner(&lock, session_id) {
        return Err(anyhow!("lock for {issue_id} is not owned by session {session_id}"));
    }
    lock.worktrees
        .insert(worktree.to_string_lossy().into_owned(), agent_id.to_string());
    write_lock(&path, &lock)
}

/// Delete the lock if `session_id`/`agent_id` own it. Returns whether it was removed.
pub fn release(dir: &Path, issue_id: &str, session_id: &str, agent_id: &str) -> Result<bool> {
    let path = lock_file(dir, issue_id)?;
    let Some(lock) = read_lock(&path) else {
        return Ok(false);
    };
    let owned = if lock.worktrees.is_empty() {
        is_session_owner(&lock, session_id)
    } else {
        lock.worktrees
            .keys()
            .all(|worktree| is_owned_by(&lock, Path::new(worktree), session_id, agent_id))
    };
    if !owned {
        return Err(anyhow!(
            "lock for {issue_id} is held by another agent (session {})",
            lock.session_id.as_deref().unwrap_or("<unknown>")
        ));
    }
    remove(&path)?;
    info!(issue_id, "lock released");
    Ok(true)
}

/// Delete the lock unconditionally. Returns whether a file was removed.
pub fn force_release(dir: &Path, issue_id: &str) -> Result<bool> {
    let path = lock_file(dir, issue_id)?;
    if fs::symlink_metadata(&path).is_err() {
        return Ok(false);
    }
    remove(&path)?;
    warn!(issue_id, "lock force-released");
    Ok(true)
}

fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
    }
}

fn create_exclusive(path: &Path, lock: &Lock) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut buf = serde_json::to_string_pretty(lock).map_err(std::io::Error::other)?;
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.sync_all()
}

/// Atomically replace a lock file (temp file + rename).
fn write_lock(path: &Path, lock: &Lock) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(lock).context("serialize lock")?;
    buf.push('\n');
    let tmp_path = path.with_extension("lock.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp lock {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace lock {}", path.display()))?;
    Ok(())
}

pub fn iso_timestamp(epoch_secs: i64) -> String {
    DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
