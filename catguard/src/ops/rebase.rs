//! `rebase-safe`: rebase behind a backup branch and verify the result.

use std::fs;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{OpOutcome, OpStatus};
use crate::io::git::{Git, RebaseOutcome};
use crate::io::paths::FORK_POINT_FILE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebaseResult {
    Ok {
        target: String,
        commits_rebased: usize,
        backup_branch: String,
        backup_cleaned: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Conflict {
        target: String,
        backup_branch: String,
        conflicting_files: Vec<String>,
        message: String,
    },
    Error {
        message: String,
    },
}

impl OpOutcome for RebaseResult {
    fn status(&self) -> OpStatus {
        match self {
            RebaseResult::Ok { .. } => OpStatus::Ok,
            RebaseResult::Conflict { .. } => OpStatus::Conflict,
            RebaseResult::Error { .. } => OpStatus::Error,
        }
    }
}

/// Rebase the current branch onto `target`, or onto the recorded fork point.
#[instrument(skip_all)]
pub fn rebase_safe(git: &Git, target: Option<&str>) -> RebaseResult {
    match run(git, target) {
        Ok(result) => result,
        Err(err) => RebaseResult::Error {
            message: format!("{err:#}"),
        },
    }
}

fn run(git: &Git, explicit: Option<&str>) -> Result<RebaseResult> {
    let branch = git.current_branch()?;
    let target = match explicit {
        Some(target) => target.to_string(),
        None => read_fork_point(git)?,
    };
    let target_commit = git
        .resolve_commit(&target)?
        .ok_or_else(|| anyhow!("rebase target '{target}' does not name a commit"))?;
    git.ensure_no_tracked_changes()?;

    let old_head = git.head()?;
    let old_base = git.merge_base(&target_commit, &old_head)?;
    let commits = git.count_commits(&format!("{target_commit}..{old_head}"))?;
    let backup = backup_branch_name(git, &branch)?;
    git.create_branch(&backup, &old_head)?;
    debug!(backup = %backup, commits, "backup branch created");

    match git.rebase(&target_commit)? {
        RebaseOutcome::Completed => {}
        RebaseOutcome::Conflict { files } => {
            git.rebase_abort()?;
            warn!(target = %target, conflicts = files.len(), "rebase aborted on conflicts");
            return Ok(RebaseResult::Conflict {
                message: format!(
                    "rebase onto {target} stopped on conflicts and was aborted; \
                     {branch} is unchanged and backed up at {backup}"
                ),
                target,
                backup_branch: backup,
                conflicting_files: files,
            });
        }
        RebaseOutcome::Failed { message } => {
            git.rebase_abort()?;
            if git.head()? == old_head {
                git.delete_branch(&backup, true)?;
            }
            return Err(anyhow!(message));
        }
    }

    let before = git.changed_files(&old_base, &backup)?;
    let after = git.changed_files(&target_commit, "HEAD")?;
    if before != after {
        warn!(backup = %backup, "changed files differ after rebase, keeping backup");
        return Ok(RebaseResult::Ok {
            warning: Some(format!(
                "files changed by {branch} differ after the rebase (before: {}, after: {}); \
                 backup kept at {backup}",
                before.join(", "),
                after.join(", ")
            )),
            target,
            commits_rebased: commits,
            backup_branch: backup,
            backup_cleaned: false,
        });
    }

    git.delete_branch(&backup, true)?;
    info!(target = %target, commits, "rebase complete");
    Ok(RebaseResult::Ok {
        target,
        commits_rebased: commits,
        backup_branch: backup,
        backup_cleaned: true,
        warning: None,
    })
}

fn read_fork_point(git: &Git) -> Result<String> {
    let path = git.git_dir()?.join(FORK_POINT_FILE);
    let contents = fs::read_to_string(&path).with_context(|| {
        format!(
            "no rebase target given and fork point file {} is unreadable",
            path.display()
        )
    })?;
    let fork_point = contents.trim();
    if fork_point.is_empty() {
        return Err(anyhow!("fork point file {} is empty", path.display()));
    }
    Ok(fork_point.to_string())
}

/// `backup-before-rebase-<branch>-<UTC timestamp>`, made unique if needed.
fn backup_branch_name(git: &Git, branch: &str) -> Result<String> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let base = format!("backup-before-rebase-{}-{stamp}", branch.replace('/', "-"));
    let mut candidate = base.clone();
    let mut n = 1;
    while git.branch_exists(&candidate)? {
        n += 1;
        candidate = format!("{base}-{n}");
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_omits_missing_warning() {
        let result = RebaseResult::Ok {
            target: "main".to_string(),
            commits_rebased: 2,
            backup_branch: "b".to_string(),
            backup_cleaned: true,
            warning: None,
        };
        let json = serde_json::to_value(&result).expect("json");
        assert_eq!(json["status"], "OK");
        assert_eq!(json["commits_rebased"], 2);
        assert!(json.get("warning").is_none());
    }
}
