//! Test-only helpers: throwaway git repositories with a bare `origin` and CAT
//! project scaffolding.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::io::git::Git;
use crate::io::paths::ProjectPaths;

/// A repository at `root` on branch `main`, pushed to a bare `origin`.
pub struct TestRepo {
    _temp: TempDir,
    pub root: PathBuf,
    pub origin: PathBuf,
    pub git: Git,
}

impl TestRepo {
    /// Create the repo with one commit (`README.md`) pushed to `origin/main`.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let base = fs::canonicalize(temp.path()).context("canonicalize tempdir")?;
        let origin = base.join("origin.git");
        let root = base.join("work");
        fs::create_dir_all(&origin).context("create origin dir")?;
        fs::create_dir_all(&root).context("create work dir")?;

        Git::new(&origin).run_checked(&["init", "--quiet", "--bare", "-b", "main"])?;
        let git = Git::new(&root);
        git.run_checked(&["init", "--quiet", "-b", "main"])?;
        configure_identity(&git)?;
        let origin_str = origin.to_string_lossy();
        git.run_checked(&["remote", "add", "origin", &origin_str])?;

        let repo = Self {
            _temp: temp,
            root,
            origin,
            git,
        };
        repo.commit_file("README.md", "hello\n", "initial commit")?;
        repo.git.run_checked(&["push", "--quiet", "-u", "origin", "main"])?;
        Ok(repo)
    }

    /// Write `rel` in the main checkout, stage everything, and commit. Returns HEAD.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<String> {
        commit_in(&self.git, rel, contents, message)
    }

    /// Clone `origin` next to the work tree (to play another agent pushing).
    pub fn clone_origin(&self, name: &str) -> Result<Git> {
        let dest = self
            .root
            .parent()
            .context("work dir has a parent")?
            .join(name);
        let origin = self.origin.to_string_lossy();
        let dest_str = dest.to_string_lossy();
        Git::new(&self.root).run_checked(&["clone", "--quiet", &origin, &dest_str])?;
        let clone = Git::new(dest);
        configure_identity(&clone)?;
        Ok(clone)
    }

    /// Create `.claude/cat/{issues,locks}` and keep `.claude/` out of `git status`.
    pub fn init_cat(&self) -> Result<ProjectPaths> {
        let paths = ProjectPaths::new(&self.root);
        fs::create_dir_all(&paths.issues_dir).context("create issues dir")?;
        fs::create_dir_all(&paths.locks_dir).context("create locks dir")?;
        let exclude = self.root.join(".git/info/exclude");
        fs::create_dir_all(exclude.parent().context("exclude parent")?)?;
        fs::write(&exclude, ".claude/\n").context("write info/exclude")?;
        Ok(paths)
    }

    /// Add `issues/v<version>/<name>/STATE.md` with the given status.
    pub fn add_issue(&self, version: &str, name: &str, status: &str) -> Result<PathBuf> {
        let paths = ProjectPaths::new(&self.root);
        let mut dir = paths.issues_dir.clone();
        let mut prefix = String::new();
        for part in version.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(part);
            dir = dir.join(format!("v{prefix}"));
        }
        let issue_dir = dir.join(name);
        fs::create_dir_all(&issue_dir).context("create issue dir")?;
        fs::write(
            issue_dir.join("STATE.md"),
            format!("# State\n\n- **Status:** {status}\n"),
        )
        .context("write STATE.md")?;
        Ok(issue_dir)
    }
}

/// Write `rel` under `git`'s workdir, stage everything, and commit. Returns HEAD.
pub fn commit_in(git: &Git, rel: &str, contents: &str, message: &str) -> Result<String> {
    let path = git.workdir().join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    git.add_all()?;
    git.commit_staged(message)?;
    git.head()
}

fn configure_identity(git: &Git) -> Result<()> {
    git.run_checked(&["config", "user.email", "agent@example.com"])?;
    git.run_checked(&["config", "user.name", "Test Agent"])?;
    git.run_checked(&["config", "commit.gpgsign", "false"])?;
    Ok(())
}

