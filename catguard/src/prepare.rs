//! `catguard prepare`: pick an issue, lock it, and give it a worktree.
//!
//! The sequence is resolve -> acquire -> `git worktree add` -> write worktree
//! metadata -> record the worktree in the lock. Issues whose lock is held by a
//! live session are skipped for multi-issue scopes. A failure after the lock was
//! taken releases it again.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::issue::IssueId;
use crate::core::resolver::{Resolution, Scope, resolve};
use crate::io::git::Git;
use crate::io::issue_tree::load_issue_tree;
use crate::io::lock_store::{self, AcquireOutcome};
use crate::io::paths::{BASE_BRANCH_FILE, FORK_POINT_FILE, ProjectPaths};
use crate::select::SelectRequest;

#[derive(Debug, Clone, Default)]
pub struct PrepareRequest {
    pub select: SelectRequest,
    pub session_id: String,
    pub agent_id: String,
    /// Branch to fork from; defaults to the main checkout's current branch.
    pub base: Option<String>,
    /// Epoch seconds used for lock timestamps and staleness.
    pub now: i64,
}

/// A locked issue with a fresh worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename = "READY")]
pub struct ReadyWorktree {
    pub issue_id: String,
    pub issue_path: String,
    pub worktree_path: String,
    pub branch: String,
    pub base_branch: String,
    pub fork_point: String,
    /// How the lock was obtained: `acquired`, `replaced_stale`, or `already_owned`.
    pub lock: &'static str,
}

/// An explicitly requested issue whose lock belongs to someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename = "locked")]
pub struct LockedIssue {
    pub issue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PrepareResult {
    Ready(ReadyWorktree),
    Locked(LockedIssue),
    /// Nothing claimable; the resolver's answer is passed through.
    Unresolved(Resolution),
}

#[instrument(skip_all)]
pub fn prepare(root: &Path, request: &PrepareRequest) -> Result<PrepareResult> {
    let paths = ProjectPaths::require(root)?;
    let tree = load_issue_tree(&paths).context("load issue tree")?;
    let scope = request.select.scope();
    let mut options = request.select.options()?;
    let git = Git::new(&paths.root);
    let base = match &request.base {
        Some(base) => base.clone(),
        None => git.current_branch()?,
    };

    loop {
        let found = match resolve(&tree, &scope, &options) {
            Resolution::Found(found) => found,
            other => return Ok(PrepareResult::Unresolved(other)),
        };
        let id = found
            .id()
            .ok_or_else(|| anyhow!("resolver returned malformed id {}", found.issue_id))?;

        let outcome =
            lock_store::acquire(&paths.locks_dir, &found.issue_id, &request.session_id, request.now)?;
        let lock = match &outcome {
            AcquireOutcome::HeldByOther { lock } => {
                if matches!(scope, Scope::Issue(_) | Scope::BareName(_)) {
                    return Ok(PrepareResult::Locked(LockedIssue {
                        message: format!(
                            "{id} is locked by another session; pick another issue or \
                             force-release the lock if it is abandoned"
                        ),
                        issue_id: found.issue_id,
                        held_by: lock.session_id.clone(),
                    }));
                }
                info!(issue_id = %id, "lock held by another session, skipping");
                options.skip.insert(id);
                continue;
            }
            AcquireOutcome::Acquired => "acquired",
            AcquireOutcome::ReplacedStale { .. } => "replaced_stale",
            AcquireOutcome::AlreadyOwned => "already_owned",
        };

        return match create_worktree(&git, &paths, &id, &base, request) {
            Ok((worktree, fork_point)) => {
                info!(issue_id = %id, worktree = %worktree.display(), "worktree ready");
                Ok(PrepareResult::Ready(ReadyWorktree {
                    issue_id: found.issue_id,
                    issue_path: found.issue_path,
                    worktree_path: worktree.to_string_lossy().into_owned(),
                    branch: id.to_string(),
                    base_branch: base,
                    fork_point,
                    lock,
                }))
            }
            Err(err) => {
                if outcome != AcquireOutcome::AlreadyOwned
                    && let Err(release_err) = lock_store::release(
                        &paths.locks_dir,
                        &found.issue_id,
                        &request.session_id,
                        &request.agent_id,
                    )
                {
                    warn!(err = %format!("{release_err:#}"), "lock release after failure failed");
                }
                Err(err)
            }
        };
    }
}

/// Add the worktree and record it; returns its path and fork point.
fn create_worktree(
    git: &Git,
    paths: &ProjectPaths,
    id: &IssueId,
    base: &str,
    request: &PrepareRequest,
) -> Result<(PathBuf, String)> {
    let worktree = paths.worktree_path(id);
    if worktree.exists() {
        bail!("worktree path {} already exists", worktree.display());
    }
    let branch = id.to_string();
    let fork_point = git
        .rev_parse(base)
        .with_context(|| format!("resolve base branch {base}"))?;
    fs::create_dir_all(&paths.worktrees_dir)
        .with_context(|| format!("create {}", paths.worktrees_dir.display()))?;
    git.worktree_add(&worktree, &branch, &fork_point)?;

    let recorded = write_metadata(&worktree, base, &fork_point).and_then(|()| {
        lock_store::record_worktree(
            &paths.locks_dir,
            &branch,
            &request.session_id,
            &worktree,
            &request.agent_id,
        )
    });
    if let Err(err) = recorded {
        if let Err(cleanup) = git.worktree_remove(&worktree, true) {
            warn!(err = %format!("{cleanup:#}"), "cannot remove half-created worktree");
        }
        if let Err(cleanup) = git.delete_branch(&branch, true) {
            warn!(err = %format!("{cleanup:#}"), "cannot delete half-created branch");
        }
        return Err(err);
    }
    Ok((worktree, fork_point))
}

fn write_metadata(worktree: &Path, base: &str, fork_point: &str) -> Result<()> {
    let git_dir = Git::new(worktree).git_dir()?;
    for (name, value) in [(BASE_BRANCH_FILE, base), (FORK_POINT_FILE, fork_point)] {
        let path = git_dir.join(name);
        fs::write(&path, format!("{value}\n"))
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_serializes_with_status_tag() {
        let ready = PrepareResult::Ready(ReadyWorktree {
            issue_id: "1.0-a".to_string(),
            issue_path: "p".to_string(),
            worktree_path: "/w".to_string(),
            branch: "1.0-a".to_string(),
            base_branch: "main".to_string(),
            fork_point: "abc".to_string(),
            lock: "acquired",
        });
        let json = serde_json::to_value(&ready).expect("json");
        assert_eq!(json["status"], "READY");
        assert_eq!(json["base_branch"], "main");
    }

    #[test]
    fn unresolved_passes_resolution_through() {
        let result = PrepareResult::Unresolved(Resolution::AlreadyComplete {
            issue_id: "1.0-a".to_string(),
        });
        let json = serde_json::to_value(&result).expect("json");
        assert_eq!(json["status"], "already_complete");
    }
}
