//! Issue and version types for the issue tree.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Canonical issue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl Status {
    /// Normalize a status string, accepting the legacy aliases.
    ///
    /// Unknown values map to `Open` so a typo never makes work look finished.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "closed" | "completed" | "complete" | "done" => Status::Closed,
            "in-progress" | "in_progress" | "active" => Status::InProgress,
            "blocked" => Status::Blocked,
            _ => Status::Open,
        }
    }

    pub fn is_closed(self) -> bool {
        self == Status::Closed
    }
}

/// `major[.minor[.patch]]`, ordered numerically with shorter keys first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub major: u32,
    pub minor: Option<u32>,
    pub patch: Option<u32>,
}

impl VersionKey {
    pub fn major(major: u32) -> Self {
        Self {
            major,
            minor: None,
            patch: None,
        }
    }

    pub fn minor(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: Some(minor),
            patch: None,
        }
    }

    /// True if `self` is `other` or nested beneath it (`1.2.3` within `1.2` within `1`).
    pub fn within(&self, other: &VersionKey) -> bool {
        if self.major != other.major {
            return false;
        }
        match (other.minor, self.minor) {
            (None, _) => true,
            (Some(want), Some(have)) if want == have => match (other.patch, self.patch) {
                (None, _) => true,
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
            },
            _ => false,
        }
    }

    /// Parse a version directory name such as `v1`, `v1.2`, `v1.2.3`.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('v')?;
        rest.parse().ok()
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
            if let Some(patch) = self.patch {
                write!(f, ".{patch}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for VersionKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(anyhow!("invalid version '{s}'"));
        }
        let mut nums = Vec::with_capacity(parts.len());
        for part in &parts {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(anyhow!("invalid version '{s}'"));
            }
            nums.push(
                part.parse::<u32>()
                    .map_err(|err| anyhow!("invalid version '{s}': {err}"))?,
            );
        }
        Ok(Self {
            major: nums[0],
            minor: nums.get(1).copied(),
            patch: nums.get(2).copied(),
        })
    }
}

/// Fully-qualified issue id: `<version>-<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueId {
    pub version: VersionKey,
    pub name: String,
}

impl IssueId {
    pub fn new(version: VersionKey, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
        }
    }

    /// Parse `1.2-name` style ids. Returns `None` for bare names.
    pub fn parse(raw: &str) -> Option<Self> {
        let (version, name) = raw.split_once('-')?;
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
            return None;
        }
        let version = version.parse().ok()?;
        Some(Self::new(version, name))
    }
}

impl Ord for IssueId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for IssueId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.version, self.name)
    }
}

/// One issue as read from its `STATE.md`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: IssueId,
    pub status: Status,
    /// Declared dependency references: qualified ids or bare names.
    pub dependencies: Vec<String>,
    /// Sub-issue names (present on decomposed parents only).
    pub decomposed_into: Vec<String>,
    /// Absolute path of the issue's worktree, when one exists on disk.
    pub worktree: Option<String>,
    /// Directory holding the issue's files, relative to the project root.
    pub path: String,
}

/// Version metadata from the version directory's `STATE.md`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Version {
    pub status: Option<Status>,
    pub dependencies: Vec<String>,
    pub post_conditions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_aliases_normalize() {
        assert_eq!(Status::normalize("pending"), Status::Open);
        assert_eq!(Status::normalize("Active"), Status::InProgress);
        assert_eq!(Status::normalize("in_progress"), Status::InProgress);
        assert_eq!(Status::normalize("done"), Status::Closed);
        assert_eq!(Status::normalize("COMPLETED"), Status::Closed);
        assert_eq!(Status::normalize("blocked"), Status::Blocked);
        assert_eq!(Status::normalize("???"), Status::Open);
    }

    #[test]
    fn issue_ids_parse_and_display() {
        let id = IssueId::parse("1.2-parser-core").expect("id");
        assert_eq!(id.version, VersionKey::minor(1, 2));
        assert_eq!(id.name, "parser-core");
        assert_eq!(id.to_string(), "1.2-parser-core");

        let major = IssueId::parse("3-bootstrap").expect("id");
        assert_eq!(major.version, VersionKey::major(3));

        assert!(IssueId::parse("parser").is_none());
        assert!(IssueId::parse("x.y-parser").is_none());
        assert!(IssueId::parse("1.2-").is_none());
    }

    #[test]
    fn versions_sort_numerically() {
        let mut keys: Vec<VersionKey> = ["1.10", "1.2", "1", "2", "1.2.1"]
            .iter()
            .map(|s| s.parse().expect("version"))
            .collect();
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["1", "1.2", "1.2.1", "1.10", "2"]);
    }

    #[test]
    fn within_checks_nesting() {
        let patch: VersionKey = "1.2.3".parse().expect("version");
        assert!(patch.within(&VersionKey::major(1)));
        assert!(patch.within(&VersionKey::minor(1, 2)));
        assert!(!patch.within(&VersionKey::minor(1, 3)));
        assert!(!VersionKey::major(1).within(&VersionKey::minor(1, 2)));
    }

    #[test]
    fn version_dir_names() {
        assert_eq!(
            VersionKey::from_dir_name("v1.2"),
            Some(VersionKey::minor(1, 2))
        );
        assert_eq!(VersionKey::from_dir_name("parser"), None);
        assert_eq!(VersionKey::from_dir_name("v1.x"), None);
    }
}
