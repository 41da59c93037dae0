//! Per-issue lock records and the ownership/staleness predicates.
//!
//! Every field that may be missing from a lock file on disk is an `Option`, and
//! each predicate states how it treats an absent field: missing `created_at`
//! never goes stale, missing owner identity is never "mine".

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Locks older than this (strictly) are stale.
pub const STALE_AFTER_SECS: i64 = 4 * 60 * 60;

/// Infix separating a session id from a subagent name in agent identities.
pub const SUBAGENT_INFIX: &str = "/subagents/";

/// Contents of `<locks>/<issue-id>.lock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Absolute worktree path -> agent identity (empty = session-level ownership).
    #[serde(default)]
    pub worktrees: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_iso: Option<String>,
}

impl Lock {
    pub fn new(session_id: &str, created_at: i64, created_iso: String) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            worktrees: BTreeMap::new(),
            created_at: Some(created_at),
            created_iso: Some(created_iso),
        }
    }

    /// Agent identity recorded for `worktree`, if the worktree is tracked.
    pub fn agent_for(&self, worktree: &Path) -> Option<&str> {
        self.worktrees
            .iter()
            .find(|(path, _)| Path::new(path) == worktree)
            .map(|(_, agent)| agent.as_str())
    }

    /// Age in seconds at `now`, if the creation time is known.
    pub fn age_secs(&self, now: i64) -> Option<i64> {
        self.created_at.map(|created| now.saturating_sub(created))
    }
}

/// `now - created_at > 4h`. A lock without `created_at` is never stale.
pub fn is_stale(lock: &Lock, now: i64) -> bool {
    match lock.age_secs(now) {
        Some(age) => age > STALE_AFTER_SECS,
        None => false,
    }
}

/// Ownership of `lock` for the worktree at `worktree` by the given caller.
///
/// - If the lock stores a non-empty agent identity for the worktree, only a
///   caller presenting that exact identity owns it. A caller without an agent
///   identity does not.
/// - Otherwise ownership falls back to session equality. A lock without a
///   session id (or an empty one) is owned by nobody.
pub fn is_owned_by(lock: &Lock, worktree: &Path, session_id: &str, agent_id: &str) -> bool {
    if let Some(stored) = lock.agent_for(worktree)
        && !stored.is_empty()
    {
        return !agent_id.is_empty() && stored == agent_id;
    }
    match lock.session_id.as_deref() {
        Some(owner) if !owner.is_empty() => owner == session_id,
        _ => false,
    }
}

/// Session-level ownership regardless of worktree (used for release/reuse).
pub fn is_session_owner(lock: &Lock, session_id: &str) -> bool {
    matches!(lock.session_id.as_deref(), Some(owner) if !owner.is_empty() && owner == session_id)
}

/// Build `<session>/subagents/<name>`.
pub fn subagent_identity(session_id: &str, name: &str) -> String {
    format!("{session_id}{SUBAGENT_INFIX}{name}")
}

/// Parent session of an agent identity (`None` for a bare session id).
pub fn parent_session(agent_id: &str) -> Option<&str> {
    agent_id
        .split_once(SUBAGENT_INFIX)
        .map(|(session, _)| session)
}
