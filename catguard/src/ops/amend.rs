//! `amend-safe`: amend HEAD only while it is unpublished, and notice if it was
//! published while we amended.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{OpOutcome, OpStatus};
use crate::io::git::Git;

/// Brings the local view of `tracking_ref` up to date before the post-amend check.
pub trait TrackingRefresh {
    fn refresh(&self, git: &Git, tracking_ref: &str) -> Result<()>;
}

/// Worktrees of one repository share refs; nothing to refresh.
pub struct SharedRefs;

impl TrackingRefresh for SharedRefs {
    fn refresh(&self, _git: &Git, _tracking_ref: &str) -> Result<()> {
        Ok(())
    }
}

/// Fetch the tracking branch from its remote.
pub struct FetchRemote;

impl TrackingRefresh for FetchRemote {
    fn refresh(&self, git: &Git, tracking_ref: &str) -> Result<()> {
        let Some((remote, branch)) = tracking_ref.split_once('/') else {
            return Ok(());
        };
        match git.fetch(remote, branch) {
            Ok(()) => Ok(()),
            // A branch that was never pushed has nothing to fetch.
            Err(err) if git.resolve_commit(tracking_ref)?.is_none() => {
                warn!(err = %format!("{err:#}"), tracking_ref, "tracking branch not fetched");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmendResult {
    Ok {
        old_head: String,
        new_head: String,
        tracking_ref: String,
        race_detected: bool,
    },
    AlreadyPushed {
        head: String,
        tracking_ref: String,
        message: String,
    },
    RaceDetected {
        old_head: String,
        new_head: String,
        tracking_ref: String,
        message: String,
    },
    Error {
        message: String,
    },
}

impl OpOutcome for AmendResult {
    fn status(&self) -> OpStatus {
        match self {
            AmendResult::Ok { .. } => OpStatus::Ok,
            AmendResult::AlreadyPushed { .. } => OpStatus::AlreadyPushed,
            AmendResult::RaceDetected { .. } => OpStatus::RaceDetected,
            AmendResult::Error { .. } => OpStatus::Error,
        }
    }
}

/// Tracking ref for `branch`: the configured upstream, else `<remote>/<branch>`.
pub fn tracking_ref(git: &Git, remote: &str, branch: &str) -> Result<String> {
    Ok(git
        .upstream()?
        .unwrap_or_else(|| format!("{remote}/{branch}")))
}

/// Amend HEAD (keeping its message unless `message` is given).
#[instrument(skip_all)]
pub fn amend_safe(
    git: &Git,
    remote: &str,
    message: Option<&str>,
    refresh: &impl TrackingRefresh,
) -> AmendResult {
    match run(git, remote, message, refresh) {
        Ok(result) => result,
        Err(err) => AmendResult::Error {
            message: format!("{err:#}"),
        },
    }
}

fn run(
    git: &Git,
    remote: &str,
    message: Option<&str>,
    refresh: &impl TrackingRefresh,
) -> Result<AmendResult> {
    let branch = git.current_branch()?;
    let old_head = git.head()?;
    let tracking = tracking_ref(git, remote, &branch)?;

    if published(git, &old_head, &tracking)? {
        info!(head = %old_head, tracking_ref = %tracking, "HEAD already pushed");
        return Ok(AmendResult::AlreadyPushed {
            message: format!(
                "HEAD {old_head} is already on {tracking}; amending would rewrite published \
                 history. Create a new commit instead."
            ),
            head: old_head,
            tracking_ref: tracking,
        });
    }

    git.commit_amend(message)?;
    let new_head = git.head()?;

    refresh.refresh(git, &tracking)?;
    if published(git, &old_head, &tracking)? {
        warn!(old_head = %old_head, new_head = %new_head, "pre-amend commit was pushed concurrently");
        return Ok(AmendResult::RaceDetected {
            message: format!(
                "{old_head} was pushed to {tracking} while amending; the amended commit \
                 {new_head} now diverges from it. Inspect {tracking} before pushing, and use \
                 `git push --force-with-lease` only if replacing the pushed commit is intended."
            ),
            old_head,
            new_head,
            tracking_ref: tracking,
        });
    }

    info!(old_head = %old_head, new_head = %new_head, "amended");
    Ok(AmendResult::Ok {
        old_head,
        new_head,
        tracking_ref: tracking,
        race_detected: false,
    })
}

/// True if `commit` is reachable from `tracking` (false when `tracking` does not exist).
fn published(git: &Git, commit: &str, tracking: &str) -> Result<bool> {
    match git.resolve_commit(tracking)? {
        Some(tip) => git.is_ancestor(commit, &tip),
        None => Ok(false),
    }
}
