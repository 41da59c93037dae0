//! Pre-execution guardrails for agent tool calls.
//!
//! Every check takes the proposed command (or file path), the caller's working
//! directory, and a [`GuardContext`] snapshot, and returns a [`Decision`]. The
//! only I/O performed during a check is path canonicalization and the lazy
//! transcript scan for merge approval.

pub mod approval;
pub mod isolation;
pub mod removal;

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::tokenize::{Segment, lex, segments};
use crate::io::config::{CatConfig, TrustLevel};
use crate::io::lock_store::{LockEntry, list_locks};
use crate::io::paths::ProjectPaths;

/// Environment assignment that carries a subagent's identity in a command.
pub const AGENT_ID_VAR: &str = "CAT_AGENT_ID";

/// Allow/block verdict with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub blocked: bool,
    pub reason: String,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            blocked: false,
            reason: String::new(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: reason.into(),
        }
    }
}

/// Everything a check needs besides the command itself.
#[derive(Debug, Clone)]
pub struct GuardContext {
    pub paths: ProjectPaths,
    pub session_id: String,
    pub trust: TrustLevel,
    /// Epoch seconds used for lock staleness.
    pub now: i64,
    pub locks: Vec<LockEntry>,
    pub transcript_path: Option<PathBuf>,
    pub approval_patterns: Vec<Regex>,
}

impl GuardContext {
    /// Snapshot locks and settings for the project at `project_dir`.
    pub fn load(
        project_dir: &Path,
        session_id: &str,
        config: &CatConfig,
        now: i64,
    ) -> Result<Self> {
        let paths = ProjectPaths::new(canonicalize_lenient(project_dir));
        let locks = list_locks(&paths.locks_dir)?;
        debug!(locks = locks.len(), "loaded lock snapshot");
        Ok(Self {
            transcript_path: config.transcript_path(&paths.root, session_id),
            approval_patterns: config.approval_regexes()?,
            paths,
            session_id: session_id.to_string(),
            trust: config.trust,
            now,
            locks,
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.paths.root
    }
}

/// Vet a Bash command: removal, then isolation, then merge approval.
#[instrument(skip_all)]
pub fn check_bash(command: &str, cwd: &Path, ctx: &GuardContext) -> Decision {
    let checks: [fn(&str, &Path, &GuardContext) -> Decision; 3] = [
        removal::check_removal,
        isolation::check_isolation,
        approval::check_merge_approval,
    ];
    for check in checks {
        let decision = check(command, cwd, ctx);
        if decision.blocked {
            info!(reason = %first_line(&decision.reason), "command blocked");
            return decision;
        }
    }
    Decision::allow()
}

/// Vet a file-writing tool call (`Write`, `Edit`, `NotebookEdit`).
#[instrument(skip_all, fields(tool))]
pub fn check_file_write(tool: &str, file_path: &str, cwd: &Path, ctx: &GuardContext) -> Decision {
    let decision = isolation::check_write_target(tool, file_path, cwd, ctx);
    if decision.blocked {
        info!(reason = %first_line(&decision.reason), "file write blocked");
    }
    decision
}

/// Parsed command line shared by the checks.
pub(crate) struct ParsedCommand {
    pub segments: Vec<Segment>,
    pub agent_id: String,
}

impl ParsedCommand {
    pub fn parse(command: &str) -> Self {
        let segments = segments(&lex(command));
        let agent_id = segments
            .iter()
            .find_map(|segment| segment.assignment(AGENT_ID_VAR))
            .unwrap_or_default()
            .to_string();
        Self { segments, agent_id }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Final path component of a program word (`/bin/rm` -> `rm`).
pub(crate) fn program_name(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

/// Resolve a shell path argument against `cwd` into an absolute,
/// symlink-resolved path. Components that do not exist yet are kept as is.
pub(crate) fn resolve_path(raw: &str, cwd: &Path) -> PathBuf {
    let expanded = expand_home(raw);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    canonicalize_lenient(&normalize(&joined))
}

fn expand_home(raw: &str) -> PathBuf {
    let home = std::env::var_os("HOME");
    match (raw, home) {
        ("~", Some(home)) => PathBuf::from(home),
        (raw, Some(home)) if raw.starts_with("~/") => PathBuf::from(home).join(&raw[2..]),
        (raw, _) => PathBuf::from(raw),
    }
}

/// Lexically drop `.` and fold `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor and re-append the rest.
pub(crate) fn canonicalize_lenient(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::lock::Lock;

    pub(crate) const NOW: i64 = 1_700_000_000;

    /// A CAT project in a temp dir with no locks.
    pub(crate) fn context(root: &Path) -> GuardContext {
        fs::create_dir_all(root.join(".claude/cat/locks")).expect("mkdir");
        GuardContext::load(root, "session-me", &CatConfig::default(), NOW).expect("context")
    }

    /// Add a lock for `issue` with one worktree entry and create the worktree dir.
    pub(crate) fn add_lock(
        ctx: &mut GuardContext,
        issue: &str,
        session: &str,
        agent: &str,
        age_secs: i64,
    ) -> PathBuf {
        let worktree = ctx.paths.worktrees_dir.join(issue);
        fs::create_dir_all(&worktree).expect("worktree dir");
        let mut worktrees = BTreeMap::new();
        worktrees.insert(worktree.to_string_lossy().into_owned(), agent.to_string());
        ctx.locks.push(LockEntry {
            issue_id: issue.to_string(),
            lock: Lock {
                session_id: Some(session.to_string()),
                worktrees,
                created_at: Some(NOW - age_secs),
                created_iso: None,
            },
        });
        worktree
    }

    #[test]
    fn resolve_path_handles_relative_dots_and_home() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonical");
        fs::create_dir_all(root.join("a/b")).expect("mkdir");
        assert_eq!(resolve_path("../new.txt", &root.join("a/b")), root.join("a/new.txt"));
        assert_eq!(resolve_path("./x/y", &root), root.join("x/y"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                resolve_path("~/f", &root),
                canonicalize_lenient(&PathBuf::from(home).join("f"))
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolve_path_follows_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonical");
        fs::create_dir_all(root.join("real")).expect("mkdir");
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).expect("symlink");
        assert_eq!(resolve_path("link/out.txt", &root), root.join("real/out.txt"));
    }

    #[test]
    fn agent_id_comes_from_assignment() {
        let parsed = ParsedCommand::parse("CAT_AGENT_ID=s/subagents/a rm -rf x");
        assert_eq!(parsed.agent_id, "s/subagents/a");
        assert_eq!(ParsedCommand::parse("rm -rf x").agent_id, "");
    }

    #[test]
    fn check_bash_allows_harmless_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        assert_eq!(check_bash("ls -la && git status", temp.path(), &ctx), Decision::allow());
    }
}
