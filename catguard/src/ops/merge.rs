//! `merge-and-cleanup`: fast-forward an issue branch into its base branch, then
//! remove the worktree, the branch, and the lock.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{OpOutcome, OpStatus};
use crate::core::issue::IssueId;
use crate::io::git::{Git, RebaseOutcome};
use crate::io::lock_store;
use crate::io::paths::{BASE_BRANCH_FILE, ProjectPaths};

/// Who is merging; used to release the issue lock afterwards.
#[derive(Debug, Clone, Default)]
pub struct MergeRequest<'a> {
    pub issue_id: &'a str,
    pub session_id: &'a str,
    pub agent_id: &'a str,
    pub remote: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeResult {
    Ok {
        issue_id: String,
        base_branch: String,
        merged_commit: String,
        commits_merged: usize,
        rebased: bool,
        lock_released: bool,
        summary: String,
        commits: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl OpOutcome for MergeResult {
    fn status(&self) -> OpStatus {
        match self {
            MergeResult::Ok { .. } => OpStatus::Ok,
            MergeResult::Error { .. } => OpStatus::Error,
        }
    }
}

#[instrument(skip_all, fields(issue_id = request.issue_id))]
pub fn merge_and_cleanup(project_dir: &Path, request: &MergeRequest<'_>) -> MergeResult {
    match run(project_dir, request) {
        Ok(result) => result,
        Err(err) => MergeResult::Error {
            message: format!("{err:#}"),
        },
    }
}

fn run(project_dir: &Path, request: &MergeRequest<'_>) -> Result<MergeResult> {
    let paths = ProjectPaths::require(project_dir)?;
    let id = IssueId::parse(request.issue_id)
        .ok_or_else(|| anyhow!("invalid issue id '{}'", request.issue_id))?;
    let worktree = paths.worktree_path(&id);
    if !worktree.is_dir() {
        bail!("no worktree for {id} at {}", worktree.display());
    }

    let issue_git = Git::new(&worktree);
    let base = read_base_branch(&issue_git)?;
    let branch = issue_git.current_branch()?;
    issue_git.ensure_no_tracked_changes()?;

    let main_git = Git::new(&paths.root);
    sync_base(&main_git, request.remote, &base)?;

    let base_tip = main_git.rev_parse(&base)?;
    let mut rebased = false;
    if !main_git.is_ancestor(&base_tip, &branch)? {
        info!(base = %base, "issue branch forked from an older base, rebasing");
        match issue_git.rebase(&base_tip)? {
            RebaseOutcome::Completed => rebased = true,
            RebaseOutcome::Conflict { files } => {
                issue_git.rebase_abort()?;
                bail!(
                    "rebasing {branch} onto {base} hit conflicts in: {}; resolve them in {} and retry",
                    files.join(", "),
                    worktree.display()
                );
            }
            RebaseOutcome::Failed { message } => {
                issue_git.rebase_abort()?;
                bail!("rebasing {branch} onto {base} failed: {message}");
            }
        }
    }

    let issue_head = main_git.rev_parse(&branch)?;
    let range = format!("{base_tip}..{issue_head}");
    let commits_merged = main_git.count_commits(&range)?;
    let commits = main_git.log_oneline(&range)?;
    fast_forward(&main_git, &base, &issue_head)?;
    if !main_git.is_ancestor(&issue_head, &base)? {
        bail!("{base} does not contain {issue_head} after the merge");
    }

    main_git
        .worktree_remove(&worktree, true)
        .with_context(|| format!("remove worktree {}", worktree.display()))?;
    main_git.delete_branch(&branch, true)?;
    let lock_released = release_lock(&paths, request);

    info!(base = %base, commits_merged, "merged and cleaned up");
    Ok(MergeResult::Ok {
        summary: format!("Merged {commits_merged} commit(s) from {branch} into {base}"),
        issue_id: id.to_string(),
        base_branch: base,
        merged_commit: issue_head,
        commits_merged,
        rebased,
        lock_released,
        commits,
    })
}

fn read_base_branch(git: &Git) -> Result<String> {
    let path = git.git_dir()?.join(BASE_BRANCH_FILE);
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("read base branch file {}", path.display()))?;
    let base = contents.trim();
    if base.is_empty() {
        bail!("base branch file {} is empty", path.display());
    }
    Ok(base.to_string())
}

/// Bring local `base` up to date with `<remote>/<base>`.
fn sync_base(git: &Git, remote: &str, base: &str) -> Result<()> {
    git.fetch(remote, base)
        .with_context(|| format!("cannot fetch {base} from {remote}"))?;
    let remote_ref = format!("{remote}/{base}");
    if git.resolve_commit(&remote_ref)?.is_none() {
        warn!(remote_ref = %remote_ref, "no remote-tracking ref after fetch");
        return Ok(());
    }
    let (local_only, remote_only) = git.divergence(base, &remote_ref)?;
    if local_only > 0 && remote_only > 0 {
        bail!(
            "local {base} and {remote_ref} have diverged ({local_only} local, {remote_only} \
             remote commits); reconcile {base} manually before merging"
        );
    }
    if remote_only > 0 {
        info!(base, behind = remote_only, "fast-forwarding base to remote");
        let tip = git.rev_parse(&remote_ref)?;
        fast_forward(git, base, &tip)?;
    }
    Ok(())
}

/// Fast-forward `branch` to `commit`: `merge --ff-only` when it is checked out
/// in `git`'s worktree, else a compare-and-swap ref update.
fn fast_forward(git: &Git, branch: &str, commit: &str) -> Result<()> {
    let old = git.rev_parse(branch)?;
    if old == commit {
        return Ok(());
    }
    if !git.is_ancestor(&old, commit)? {
        bail!("cannot fast-forward {branch} to {commit}: {branch} has diverged");
    }
    if git.current_branch_opt()?.as_deref() == Some(branch) {
        git.merge_ff_only(commit)
    } else {
        git.update_ref(&format!("refs/heads/{branch}"), commit, &old)
    }
}

fn release_lock(paths: &ProjectPaths, request: &MergeRequest<'_>) -> bool {
    match lock_store::release(
        &paths.locks_dir,
        request.issue_id,
        request.session_id,
        request.agent_id,
    ) {
        Ok(released) => released,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "lock not released");
            false
        }
    }
}
