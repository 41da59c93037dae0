//! Load the on-disk issue tree (`.claude/cat/issues/`) into an [`IssueTree`].
//!
//! Version directories are named `v<major>[.<minor>[.<patch>]]`; every other
//! directory with a `STATE.md` is an issue of the enclosing version. Fields are
//! Markdown bullet lines such as `- **Status:** open`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::core::issue::{Issue, IssueId, Status, Version, VersionKey};
use crate::core::resolver::IssueTree;
use crate::io::paths::ProjectPaths;

const STATE_FILE: &str = "STATE.md";

/// Fields recognized in a `STATE.md` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFields {
    pub status: Option<String>,
    pub dependencies: Vec<String>,
    pub decomposed_into: Vec<String>,
    pub post_conditions: Vec<String>,
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*[-*]\s*\*\*(?P<key>[^*:]+):?\*\*:?\s*(?P<value>.*?)\s*$")
            .expect("static field regex")
    })
}

/// Parse the bullet fields of a `STATE.md` body. Unknown keys are ignored.
pub fn parse_state(contents: &str) -> StateFields {
    let mut fields = StateFields::default();
    for caps in field_regex().captures_iter(contents) {
        let key = caps["key"].trim().to_ascii_lowercase();
        let value = &caps["value"];
        match key.as_str() {
            "status" => fields.status = Some(value.trim().to_string()),
            "dependencies" | "depends on" => fields.dependencies = parse_list(value),
            "decomposed into" | "sub-issues" => fields.decomposed_into = parse_list(value),
            "post-conditions" | "postconditions" => fields.post_conditions = parse_list(value),
            _ => {}
        }
    }
    fields
}

/// Parse `[a, b]`, `a, b`, `none`, or `[]` into a list.
pub fn parse_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    trimmed
        .split(',')
        .map(|item| item.trim().trim_matches('`').trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Scan the issue tree for the project at `paths.root`.
///
/// A missing issues directory yields an empty tree. Unreadable `STATE.md`
/// files produce open issues with no dependencies.
pub fn load_issue_tree(paths: &ProjectPaths) -> Result<IssueTree> {
    let mut tree = IssueTree::default();
    if !paths.issues_dir.is_dir() {
        debug!(dir = %paths.issues_dir.display(), "no issues directory");
        return Ok(tree);
    }
    for (name, path) in sorted_subdirs(&paths.issues_dir)? {
        if let Some(key) = VersionKey::from_dir_name(&name)
            && key.minor.is_none()
        {
            scan_version(paths, &path, key, &mut tree)?;
        }
    }
    Ok(tree)
}

fn scan_version(
    paths: &ProjectPaths,
    dir: &Path,
    key: VersionKey,
    tree: &mut IssueTree,
) -> Result<()> {
    let version = match read_state(&dir.join(STATE_FILE)) {
        Some(fields) => Version {
            status: fields.status.as_deref().map(Status::normalize),
            dependencies: fields.dependencies,
            post_conditions: fields.post_conditions,
        },
        None => Version::default(),
    };
    tree.insert_version(key, version);

    for (name, path) in sorted_subdirs(dir)? {
        if let Some(child) = VersionKey::from_dir_name(&name) {
            if is_direct_child(&key, &child) {
                scan_version(paths, &path, child, tree)?;
            } else {
                warn!(dir = %path.display(), "version directory nested under the wrong parent");
            }
            continue;
        }
        let state_path = path.join(STATE_FILE);
        if !state_path.exists() {
            continue;
        }
        let id = IssueId::new(key, name.clone());
        tree.insert_issue(load_issue(paths, &path, &state_path, id));
    }
    Ok(())
}

fn is_direct_child(parent: &VersionKey, child: &VersionKey) -> bool {
    match (parent.minor, child.minor, child.patch) {
        (None, Some(_), None) => child.major == parent.major,
        (Some(minor), Some(child_minor), Some(_)) => {
            parent.patch.is_none() && child.major == parent.major && child_minor == minor
        }
        _ => false,
    }
}

fn load_issue(paths: &ProjectPaths, dir: &Path, state_path: &Path, id: IssueId) -> Issue {
    let fields = read_state(state_path).unwrap_or_default();
    let worktree_path = paths.worktree_path(&id);
    let worktree = worktree_path
        .is_dir()
        .then(|| worktree_path.to_string_lossy().into_owned());
    let relative = dir.strip_prefix(&paths.root).unwrap_or(dir);
    Issue {
        status: fields
            .status
            .as_deref()
            .map(Status::normalize)
            .unwrap_or(Status::Open),
        dependencies: fields.dependencies,
        decomposed_into: fields.decomposed_into,
        worktree,
        path: relative.to_string_lossy().into_owned(),
        id,
    }
}

fn read_state(path: &Path) -> Option<StateFields> {
    match fs::read_to_string(path) {
        Ok(contents) => Some(parse_state(&contents)),
        Err(err) => {
            if path.exists() {
                warn!(path = %path.display(), err = %err, "cannot read state file");
            }
            None
        }
    }
}

/// Subdirectories of `dir` sorted by name. Symlinked directories are skipped.
fn sorted_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        out.push((name, entry.path()));
    }
    out.sort();
    Ok(out)
}
