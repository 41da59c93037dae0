//! I/O helpers: project layout, config, lock files, issue tree scanning, git.

pub mod config;
pub mod git;
pub mod issue_tree;
pub mod lock_store;
pub mod paths;
pub mod transcript;
