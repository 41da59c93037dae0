//! Block recursive deletions that would strand the shell or destroy another
//! agent's worktree.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Decision, GuardContext, ParsedCommand, canonicalize_lenient, program_name, resolve_path};
use crate::core::lock::{is_owned_by, is_stale};
use crate::core::tokenize::{Segment, has_unresolved_expansion};

/// A deletion found in one simple command.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Removal {
    /// Directory relative targets are resolved against.
    base: PathBuf,
    targets: Vec<String>,
}

/// Check every `rm -r` / `git worktree remove` in `command`.
pub fn check_removal(command: &str, cwd: &Path, ctx: &GuardContext) -> Decision {
    let parsed = ParsedCommand::parse(command);
    let mut cwd = canonicalize_lenient(cwd);
    for segment in &parsed.segments {
        if let Some(next) = cd_target(segment, &cwd) {
            cwd = next;
            continue;
        }
        let Some(removal) = removal_in(segment, &cwd) else {
            continue;
        };
        for target in &removal.targets {
            let decision = check_target(target, &removal.base, &cwd, &parsed.agent_id, ctx);
            if decision.blocked {
                return decision;
            }
        }
    }
    Decision::allow()
}

/// New working directory after a `cd` segment.
fn cd_target(segment: &Segment, cwd: &Path) -> Option<PathBuf> {
    if segment.program() != Some("cd") {
        return None;
    }
    let arg = segment
        .args()
        .iter()
        .map(|token| token.text.as_str())
        .find(|text| !text.starts_with('-'))
        .unwrap_or("~");
    if has_unresolved_expansion(arg) {
        return Some(cwd.to_path_buf());
    }
    Some(resolve_path(arg, cwd))
}

fn removal_in(segment: &Segment, cwd: &Path) -> Option<Removal> {
    match program_name(segment.program()?) {
        "rm" => rm_targets(segment, cwd),
        "git" => worktree_remove_targets(segment, cwd),
        _ => None,
    }
}

fn rm_targets(segment: &Segment, cwd: &Path) -> Option<Removal> {
    let mut recursive = false;
    let mut targets = Vec::new();
    let mut flags_done = false;
    for token in segment.args() {
        let text = token.text.as_str();
        if flags_done || token.quoted || !text.starts_with('-') || text == "-" {
            targets.push(text.to_string());
            continue;
        }
        if text == "--" {
            flags_done = true;
        } else if text == "--recursive" {
            recursive = true;
        } else if !text.starts_with("--") && text[1..].contains(['r', 'R']) {
            recursive = true;
        }
    }
    (recursive && !targets.is_empty()).then(|| Removal {
        base: cwd.to_path_buf(),
        targets,
    })
}

/// `git [-C dir] worktree remove [-f|--force] <path>`.
fn worktree_remove_targets(segment: &Segment, cwd: &Path) -> Option<Removal> {
    let args = segment.args();
    let mut base = cwd.to_path_buf();
    let mut index = 0;
    while let Some(token) = args.get(index) {
        match token.text.as_str() {
            "-C" => {
                let dir = args.get(index + 1)?;
                base = resolve_path(&dir.text, &base);
                index += 2;
            }
            text if text.starts_with('-') => index += 1,
            _ => break,
        }
    }
    if args.get(index).map(|t| t.text.as_str()) != Some("worktree")
        || args.get(index + 1).map(|t| t.text.as_str()) != Some("remove")
    {
        return None;
    }
    let targets: Vec<String> = args[index + 2..]
        .iter()
        .filter(|token| token.quoted || !token.text.starts_with('-'))
        .map(|token| token.text.clone())
        .collect();
    (!targets.is_empty()).then_some(Removal { base, targets })
}

fn check_target(
    raw: &str,
    base: &Path,
    cwd: &Path,
    agent_id: &str,
    ctx: &GuardContext,
) -> Decision {
    if has_unresolved_expansion(raw) {
        return Decision::block(format!(
            "UNSAFE: cannot verify deletion target '{raw}' because it contains shell expansion.\n\
             Working directory: {}\n\
             Spell out the literal path so it can be checked.",
            cwd.display()
        ));
    }
    let target = resolve_path(raw, base);
    debug!(target = %target.display(), "checking deletion target");

    if cwd.starts_with(&target) {
        return Decision::block(format!(
            "UNSAFE: working directory is inside the deletion target.\n\
             Deletion target: {}\n\
             Working directory: {}\n\
             Deleting it would leave the shell without a working directory. \
             Run `cd {}` first, then retry.",
            target.display(),
            cwd.display(),
            ctx.project_dir().display()
        ));
    }

    if target == ctx.project_dir() {
        return Decision::block(format!(
            "UNSAFE: refusing to delete the main git worktree.\n\
             Deletion target: {}\n\
             Working directory: {}",
            target.display(),
            cwd.display()
        ));
    }

    for entry in &ctx.locks {
        if is_stale(&entry.lock, ctx.now) {
            continue;
        }
        for worktree in locked_worktrees(ctx, &entry.issue_id, &entry.lock.worktrees) {
            let canonical = canonicalize_lenient(&worktree);
            if !canonical.starts_with(&target) {
                continue;
            }
            if is_owned_by(&entry.lock, &worktree, &ctx.session_id, agent_id) {
                continue;
            }
            let holder = entry
                .lock
                .agent_for(&worktree)
                .filter(|agent| !agent.is_empty())
                .or(entry.lock.session_id.as_deref())
                .unwrap_or("<unknown>");
            return Decision::block(format!(
                "UNSAFE: deletion target contains a worktree locked by another agent.\n\
                 Deletion target: {}\n\
                 Worktree: {} (issue {}, held by {holder})\n\
                 Working directory: {}\n\
                 If the lock is abandoned, release it first with \
                 `catguard lock force-release {}`. If you are the subagent that owns \
                 this worktree, prefix the command with `CAT_AGENT_ID=<your agent id>`.",
                target.display(),
                canonical.display(),
                entry.issue_id,
                cwd.display(),
                entry.issue_id
            ));
        }
    }
    Decision::allow()
}

/// Worktrees recorded in a lock plus the issue's default worktree location.
fn locked_worktrees<'a>(
    ctx: &GuardContext,
    issue_id: &str,
    recorded: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = recorded
        .into_iter()
        .map(|(path, _)| PathBuf::from(path))
        .collect();
    let default = ctx.paths.worktrees_dir.join(issue_id);
    if !out.contains(&default) {
        out.push(default);
    }
    out
}
