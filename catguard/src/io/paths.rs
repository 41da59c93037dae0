//! Canonical paths within `.claude/cat/` for a project root.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::issue::IssueId;

/// All canonical paths for a CAT project rooted at `root`.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub cat_dir: PathBuf,
    pub issues_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub config_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cat_dir = root.join(".claude").join("cat");
        Self {
            root: root.clone(),
            cat_dir: cat_dir.clone(),
            issues_dir: cat_dir.join("issues"),
            locks_dir: cat_dir.join("locks"),
            worktrees_dir: cat_dir.join("worktrees"),
            config_path: cat_dir.join("config.toml"),
        }
    }

    /// Paths for `root`, failing unless it is a CAT project.
    pub fn require(root: &Path) -> Result<Self> {
        let paths = Self::new(root);
        if !paths.is_cat_project() {
            return Err(anyhow!(
                "Not a CAT project: {} (missing .claude/cat)",
                root.display()
            ));
        }
        Ok(paths)
    }

    pub fn is_cat_project(&self) -> bool {
        self.cat_dir.is_dir()
    }

    pub fn worktree_path(&self, issue: &IssueId) -> PathBuf {
        self.worktrees_dir.join(issue.to_string())
    }
}

/// Per-worktree metadata file names inside the worktree's git directory.
pub const BASE_BRANCH_FILE: &str = "cat-base";
pub const FORK_POINT_FILE: &str = "cat-fork-point";
