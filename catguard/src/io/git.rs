//! Git adapter for the safety wrappers and orchestrator.
//!
//! Every history mutation goes through the `git` binary; we keep a small,
//! explicit wrapper around subprocess calls so failures carry the command line
//! and git's stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Result of attempting a rebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Completed,
    /// Stopped on conflicts; the rebase is still in progress.
    Conflict { files: Vec<String> },
    /// Refused or failed for another reason (dirty tree, bad ref, ...).
    Failed { message: String },
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        match self.current_branch_opt()? {
            Some(name) => {
                debug!(branch = %name, "current branch");
                Ok(name)
            }
            None => {
                warn!("detached HEAD detected");
                Err(anyhow!("detached HEAD (refuse to run)"))
            }
        }
    }

    /// Current branch, or `None` when HEAD is detached.
    pub fn current_branch_opt(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        Ok((name != "HEAD").then_some(name))
    }

    /// Full hash of `HEAD`.
    pub fn head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Full commit hash for `rev` (errors if it does not resolve).
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Full commit hash for `rev`, or `None` if it names nothing.
    pub fn resolve_commit(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Short name of the configured upstream (e.g. `origin/main`), if any.
    pub fn upstream(&self) -> Result<Option<String>> {
        let output = self.run(&[
            "rev-parse",
            "--abbrev-ref",
            "--symbolic-full-name",
            "@{upstream}",
        ])?;
        if !output.status.success() {
            return Ok(None);
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!name.is_empty()).then_some(name))
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.run(&args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failure(&args, &output)),
        }
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let out = self.run_capture(&["merge-base", a, b])?;
        Ok(out.trim().to_string())
    }

    /// Number of commits in `range` (e.g. `a..b`).
    pub fn count_commits(&self, range: &str) -> Result<usize> {
        let out = self.run_capture(&["rev-list", "--count", range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// `(only_in_left, only_in_right)` commit counts for `left...right`.
    pub fn divergence(&self, left: &str, right: &str) -> Result<(usize, usize)> {
        let range = format!("{left}...{right}");
        let out = self.run_capture(&["rev-list", "--left-right", "--count", &range])?;
        let mut parts = out.split_whitespace();
        let parse = |part: Option<&str>| -> Result<usize> {
            part.ok_or_else(|| anyhow!("unexpected rev-list output '{}'", out.trim()))?
                .parse()
                .with_context(|| format!("parse rev-list output '{}'", out.trim()))
        };
        let left_only = parse(parts.next())?;
        let right_only = parse(parts.next())?;
        Ok((left_only, right_only))
    }

    /// Paths that differ between two revisions, sorted.
    pub fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", from, to])?;
        let mut files: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree has no tracked modifications (untracked files are allowed).
    #[instrument(skip_all)]
    pub fn ensure_no_tracked_changes(&self) -> Result<()> {
        let dirty: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.code != "??")
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        warn!(dirty_count = dirty.len(), "worktree has uncommitted changes");
        let mut msg = format!(
            "working tree {} has uncommitted changes:\n",
            self.workdir.display()
        );
        for entry in dirty {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Amend HEAD, keeping its message unless `message` is given.
    #[instrument(skip_all)]
    pub fn commit_amend(&self, message: Option<&str>) -> Result<()> {
        match message {
            Some(message) => self.run_checked(&["commit", "--amend", "-m", message])?,
            None => self.run_checked(&["commit", "--amend", "--no-edit"])?,
        };
        Ok(())
    }

    /// Create `branch` pointing at `start` without checking it out.
    #[instrument(skip_all, fields(branch))]
    pub fn create_branch(&self, branch: &str, start: &str) -> Result<()> {
        debug!(branch, start, "creating branch");
        self.run_checked(&["branch", branch, start])?;
        Ok(())
    }

    /// Delete a local branch (`-D` when `force`).
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(())
    }

    /// Rebase the current branch onto `onto`.
    #[instrument(skip_all, fields(onto))]
    pub fn rebase(&self, onto: &str) -> Result<RebaseOutcome> {
        let output = self.run(&["rebase", onto])?;
        if output.status.success() {
            return Ok(RebaseOutcome::Completed);
        }
        let files = self.conflicting_files()?;
        if !files.is_empty() {
            warn!(conflicts = files.len(), "rebase stopped on conflicts");
            return Ok(RebaseOutcome::Conflict { files });
        }
        let message = failure(&["rebase", onto], &output).to_string();
        Ok(RebaseOutcome::Failed { message })
    }

    /// Abort an in-progress rebase, if any.
    pub fn rebase_abort(&self) -> Result<()> {
        if !self.rebase_in_progress()? {
            return Ok(());
        }
        self.run_checked(&["rebase", "--abort"])?;
        Ok(())
    }

    pub fn rebase_in_progress(&self) -> Result<bool> {
        let git_dir = self.git_dir()?;
        Ok(git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists())
    }

    /// Unmerged paths in the index, sorted.
    pub fn conflicting_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        let mut files: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Fetch `refspec` from `remote`.
    #[instrument(skip_all, fields(remote))]
    pub fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run_checked(&["fetch", "--quiet", remote, refspec])?;
        Ok(())
    }

    /// Fast-forward the checked-out branch to `rev`; never creates a merge commit.
    #[instrument(skip_all, fields(rev))]
    pub fn merge_ff_only(&self, rev: &str) -> Result<()> {
        self.run_checked(&["merge", "--ff-only", "--quiet", rev])?;
        Ok(())
    }

    /// Compare-and-swap `refname` from `old` to `new`.
    pub fn update_ref(&self, refname: &str, new: &str, old: &str) -> Result<()> {
        self.run_checked(&["update-ref", refname, new, old])?;
        Ok(())
    }

    /// Add a worktree at `path` on a new branch `branch` starting at `start`.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str, start: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--quiet", "-b", branch, &path_str, start])?;
        Ok(())
    }

    /// Remove the worktree at `path`.
    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.to_string_lossy();
        if force {
            self.run_checked(&["worktree", "remove", "--force", &path_str])?;
        } else {
            self.run_checked(&["worktree", "remove", &path_str])?;
        }
        Ok(())
    }

    /// Absolute git directory (worktree-specific for linked worktrees).
    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// One-line summaries for commits in `range`, oldest first.
    pub fn log_oneline(&self, range: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["log", "--reverse", "--format=%h %s", range])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run git and fail with stderr when it exits non-zero.
    pub fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(failure(args, &output));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn failure(args: &[&str], output: &Output) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    anyhow!("git {} failed: {}", args.join(" "), detail)
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn is_ancestor_and_divergence_on_real_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.run_checked(&["init", "--quiet", "-b", "main"]).expect("init");
        git.run_checked(&["config", "user.email", "t@example.com"]).expect("email");
        git.run_checked(&["config", "user.name", "T"]).expect("name");
        std::fs::write(temp.path().join("a"), "1").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("one").expect("commit"));
        let first = git.head().expect("head");
        std::fs::write(temp.path().join("a"), "2").expect("write");
        git.add_all().expect("add");
        git.commit_staged("two").expect("commit");

        assert!(git.is_ancestor(&first, "HEAD").expect("ancestor"));
        assert!(!git.is_ancestor("HEAD", &first).expect("not ancestor"));
        assert_eq!(git.divergence("HEAD", &first).expect("div"), (1, 0));
        assert_eq!(git.count_commits(&format!("{first}..HEAD")).expect("count"), 1);
        assert_eq!(git.resolve_commit("no-such-branch").expect("resolve"), None);
        assert_eq!(git.current_branch().expect("branch"), "main");
    }
}
