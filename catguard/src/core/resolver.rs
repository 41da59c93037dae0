//! Deterministic "what can be claimed next" logic over an in-memory issue tree.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use globset::{Glob, GlobMatcher};
use serde::Serialize;

use crate::core::issue::{Issue, IssueId, Version, VersionKey};

/// Snapshot of every issue and version found on disk.
#[derive(Debug, Clone, Default)]
pub struct IssueTree {
    pub issues: BTreeMap<IssueId, Issue>,
    pub versions: BTreeMap<VersionKey, Version>,
}

impl IssueTree {
    pub fn insert_issue(&mut self, issue: Issue) {
        self.versions.entry(issue.id.version).or_default();
        self.issues.insert(issue.id.clone(), issue);
    }

    pub fn insert_version(&mut self, key: VersionKey, version: Version) {
        self.versions.insert(key, version);
    }

    /// Resolve a dependency or child reference as seen from `from`.
    ///
    /// Qualified ids match exactly. Bare names prefer `from`'s own version, then
    /// the first match in sorted order.
    pub fn lookup(&self, from: &IssueId, reference: &str) -> Option<&Issue> {
        let reference = reference.trim();
        if let Some(id) = IssueId::parse(reference)
            && let Some(issue) = self.issues.get(&id)
        {
            return Some(issue);
        }
        let local = IssueId::new(from.version, reference);
        if let Some(issue) = self.issues.get(&local) {
            return Some(issue);
        }
        self.first_named(reference)
    }

    /// First issue with bare name `name` in version-then-lexical order.
    pub fn first_named(&self, name: &str) -> Option<&Issue> {
        self.issues.values().find(|issue| issue.id.name == name)
    }

    fn is_post_condition(&self, issue: &Issue) -> bool {
        let Some(version) = self.versions.get(&issue.id.version) else {
            return false;
        };
        let qualified = issue.id.to_string();
        version
            .post_conditions
            .iter()
            .any(|entry| entry.trim() == issue.id.name || entry.trim() == qualified)
    }

    /// Dependency references of `issue` that are not closed, in declared order.
    fn unmet_dependencies(&self, issue: &Issue) -> Vec<String> {
        issue
            .dependencies
            .iter()
            .filter(|dep| {
                !self
                    .lookup(&issue.id, dep)
                    .is_some_and(|found| found.status.is_closed())
            })
            .map(|dep| dep.trim().to_string())
            .collect()
    }

    /// Sub-issues of `issue` that are still open. Missing children count as open.
    fn open_children(&self, issue: &Issue) -> Vec<String> {
        issue
            .decomposed_into
            .iter()
            .filter(|child| {
                !self
                    .lookup(&issue.id, child)
                    .is_some_and(|found| found.status.is_closed())
            })
            .map(|child| child.trim().to_string())
            .collect()
    }

    fn has_open_regular_sibling(&self, issue: &Issue) -> bool {
        self.issues.values().any(|other| {
            other.id.version == issue.id.version
                && other.id != issue.id
                && !other.status.is_closed()
                && !self.is_post_condition(other)
        })
    }

    /// True when `key` (a version reference) is complete.
    fn version_complete(&self, key: &VersionKey) -> bool {
        let Some(version) = self.versions.get(key) else {
            return false;
        };
        if let Some(status) = version.status {
            return status.is_closed();
        }
        self.issues
            .values()
            .filter(|issue| issue.id.version.within(key))
            .all(|issue| issue.status.is_closed())
    }

    /// Unmet dependencies of `issue`'s version and every enclosing version.
    fn unmet_version_dependencies(&self, issue: &Issue) -> Vec<String> {
        let mut unmet = Vec::new();
        for (key, version) in &self.versions {
            if !issue.id.version.within(key) {
                continue;
            }
            for dep in &version.dependencies {
                let met = dep
                    .trim()
                    .parse::<VersionKey>()
                    .is_ok_and(|dep_key| self.version_complete(&dep_key));
                if !met {
                    unmet.push(dep.trim().to_string());
                }
            }
        }
        unmet
    }
}

/// Which part of the tree a caller wants work from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Issue(IssueId),
    Major(u32),
    Minor(u32, u32),
    BareName(String),
}

impl Scope {
    /// Interpret a user-supplied scope argument.
    ///
    /// Empty or `all` selects everything; `2` a major version; `2.1` a minor
    /// version; `2.1-name` one issue; anything else is a bare issue name.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = raw.map(str::trim).unwrap_or("");
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return Scope::All;
        }
        if let Some(id) = IssueId::parse(raw) {
            return Scope::Issue(id);
        }
        if let Ok(key) = raw.parse::<VersionKey>() {
            match (key.minor, key.patch) {
                (None, _) => return Scope::Major(key.major),
                (Some(minor), None) => return Scope::Minor(key.major, minor),
                _ => {}
            }
        }
        Scope::BareName(raw.to_string())
    }

    fn admits(&self, id: &IssueId) -> bool {
        match self {
            Scope::All => true,
            Scope::Major(major) => id.version.within(&VersionKey::major(*major)),
            Scope::Minor(major, minor) => id.version.within(&VersionKey::minor(*major, *minor)),
            Scope::Issue(target) => target == id,
            Scope::BareName(name) => &id.name == name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Issue(id) => write!(f, "{id}"),
            Scope::Major(major) => write!(f, "{major}"),
            Scope::Minor(major, minor) => write!(f, "{major}.{minor}"),
            Scope::BareName(name) => write!(f, "{name}"),
        }
    }
}

/// Caller knobs for a resolution pass.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Glob (not regex) excluding issues by bare name or qualified id.
    pub exclude: Option<GlobMatcher>,
    /// Evaluate post-condition issues as if their siblings were closed.
    pub override_postconditions: bool,
    /// Ids to pass over, e.g. because another agent holds their lock.
    pub skip: HashSet<IssueId>,
}

impl ResolveOptions {
    /// Compile an exclude pattern with glob semantics (`.` is literal, `*` wildcards).
    pub fn with_exclude(mut self, pattern: &str) -> anyhow::Result<Self> {
        let glob = Glob::new(pattern)
            .map_err(|err| anyhow::anyhow!("invalid exclude pattern '{pattern}': {err}"))?;
        self.exclude = Some(glob.compile_matcher());
        Ok(self)
    }

    fn excludes(&self, id: &IssueId) -> bool {
        match &self.exclude {
            Some(matcher) => matcher.is_match(&id.name) || matcher.is_match(id.to_string()),
            None => false,
        }
    }
}

/// Resolution outcome, serialized with a `status` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Found(FoundIssue),
    NotFound {
        scope: String,
        message: String,
    },
    Blocked {
        issue_id: String,
        blocked_by: Vec<String>,
    },
    AlreadyComplete {
        issue_id: String,
    },
    Decomposed {
        issue_id: String,
        open_sub_issues: Vec<String>,
    },
    ExistingWorktree {
        issue_id: String,
        worktree_path: String,
    },
}

/// Location of a claimable issue. Version fields that do not apply are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundIssue {
    pub issue_id: String,
    pub major: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<u32>,
    pub issue_name: String,
    pub issue_path: String,
}

impl FoundIssue {
    fn from_issue(issue: &Issue) -> Self {
        Self {
            issue_id: issue.id.to_string(),
            major: issue.id.version.major,
            minor: issue.id.version.minor,
            patch: issue.id.version.patch,
            issue_name: issue.id.name.clone(),
            issue_path: issue.path.clone(),
        }
    }

    pub fn id(&self) -> Option<IssueId> {
        IssueId::parse(&self.issue_id)
    }
}

/// Resolve `scope` against `tree`.
pub fn resolve(tree: &IssueTree, scope: &Scope, options: &ResolveOptions) -> Resolution {
    match scope {
        Scope::Issue(id) => classify(tree, id),
        Scope::BareName(name) => match tree.first_named(name) {
            Some(issue) => classify(tree, &issue.id),
            None => Resolution::NotFound {
                scope: scope.to_string(),
                message: format!("no issue named '{name}' in any version"),
            },
        },
        Scope::All | Scope::Major(_) | Scope::Minor(_, _) => first_eligible(tree, scope, options),
    }
}

/// Precise classification for one explicitly requested issue.
fn classify(tree: &IssueTree, id: &IssueId) -> Resolution {
    let Some(issue) = tree.issues.get(id) else {
        return Resolution::NotFound {
            scope: id.to_string(),
            message: format!("issue {id} does not exist"),
        };
    };
    let issue_id = id.to_string();
    if issue.status.is_closed() {
        return Resolution::AlreadyComplete { issue_id };
    }
    let blocked_by = tree.unmet_dependencies(issue);
    if !blocked_by.is_empty() {
        return Resolution::Blocked {
            issue_id,
            blocked_by,
        };
    }
    let open_sub_issues = tree.open_children(issue);
    if !open_sub_issues.is_empty() {
        return Resolution::Decomposed {
            issue_id,
            open_sub_issues,
        };
    }
    if let Some(worktree_path) = &issue.worktree {
        return Resolution::ExistingWorktree {
            issue_id,
            worktree_path: worktree_path.clone(),
        };
    }
    Resolution::Found(FoundIssue::from_issue(issue))
}

fn first_eligible(tree: &IssueTree, scope: &Scope, options: &ResolveOptions) -> Resolution {
    let found = tree
        .issues
        .values()
        .filter(|issue| scope.admits(&issue.id))
        .find(|issue| skip_reason(tree, issue, options).is_none());
    match found {
        Some(issue) => Resolution::Found(FoundIssue::from_issue(issue)),
        None => Resolution::NotFound {
            scope: scope.to_string(),
            message: format!("no claimable issue in scope '{scope}'"),
        },
    }
}

/// Why an issue is not eligible during a multi-issue scan. First exclusion wins.
pub fn skip_reason(
    tree: &IssueTree,
    issue: &Issue,
    options: &ResolveOptions,
) -> Option<&'static str> {
    if issue.status.is_closed() {
        return Some("closed");
    }
    if options.skip.contains(&issue.id) {
        return Some("skipped by caller");
    }
    if issue.worktree.is_some() {
        return Some("existing worktree");
    }
    if !tree.unmet_dependencies(issue).is_empty() {
        return Some("unmet dependency");
    }
    if options.excludes(&issue.id) {
        return Some("excluded");
    }
    if !tree.open_children(issue).is_empty() {
        return Some("open sub-issues");
    }
    if !options.override_postconditions
        && tree.is_post_condition(issue)
        && tree.has_open_regular_sibling(issue)
    {
        return Some("post-condition pending");
    }
    if !tree.unmet_version_dependencies(issue).is_empty() {
        return Some("version dependency");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::issue::Status;

    fn issue(id: &str, status: Status) -> Issue {
        let id = IssueId::parse(id).expect("id");
        Issue {
            path: format!(".claude/cat/issues/v{}/{}", id.version, id.name),
            id,
            status,
            dependencies: Vec::new(),
            decomposed_into: Vec::new(),
            worktree: None,
        }
    }

    fn with_deps(mut issue: Issue, deps: &[&str]) -> Issue {
        issue.dependencies = deps.iter().map(|d| d.to_string()).collect();
        issue
    }

    fn tree(issues: Vec<Issue>) -> IssueTree {
        let mut tree = IssueTree::default();
        for issue in issues {
            tree.insert_issue(issue);
        }
        tree
    }

    fn found_id(resolution: &Resolution) -> &str {
        match resolution {
            Resolution::Found(found) => &found.issue_id,
            other => panic!("expected found, got {other:?}"),
        }
    }

    #[test]
    fn all_scope_returns_first_open_in_version_order() {
        let t = tree(vec![
            issue("1.10-late", Status::Open),
            issue("1.2-b", Status::Open),
            issue("1.2-a", Status::Closed),
        ]);
        let r = resolve(&t, &Scope::All, &ResolveOptions::default());
        assert_eq!(found_id(&r), "1.2-b");
    }

    #[test]
    fn unmet_dependency_skips_then_blocks_when_requested() {
        let t = tree(vec![
            with_deps(issue("1.0-a", Status::Open), &["1.0-c", "z-missing"]),
            issue("1.0-b", Status::Open),
            issue("1.0-c", Status::InProgress),
        ]);
        let r = resolve(&t, &Scope::All, &ResolveOptions::default());
        assert_eq!(found_id(&r), "1.0-b");

        let single = resolve(
            &t,
            &Scope::Issue(IssueId::parse("1.0-a").expect("id")),
            &ResolveOptions::default(),
        );
        assert_eq!(
            single,
            Resolution::Blocked {
                issue_id: "1.0-a".to_string(),
                blocked_by: vec!["1.0-c".to_string(), "z-missing".to_string()],
            }
        );
    }

    #[test]
    fn bare_dependency_prefers_same_version() {
        let t = tree(vec![
            issue("1.0-lexer", Status::Open),
            issue("2.0-lexer", Status::Closed),
            with_deps(issue("2.0-parser", Status::Open), &["lexer"]),
        ]);
        let r = resolve(
            &t,
            &Scope::Issue(IssueId::parse("2.0-parser").expect("id")),
            &ResolveOptions::default(),
        );
        assert_eq!(found_id(&r), "2.0-parser");
    }

    #[test]
    fn exclude_uses_glob_semantics() {
        let t = tree(vec![issue("1.0-axb", Status::Open), issue("1.0-c", Status::Open)]);
        // A regex would let '.' match 'x'; a glob treats it literally.
        let opts = ResolveOptions::default().with_exclude("a.b").expect("glob");
        let r = resolve(&t, &Scope::All, &opts);
        assert_eq!(found_id(&r), "1.0-axb");

        let opts = ResolveOptions::default().with_exclude("a*").expect("glob");
        let r = resolve(&t, &Scope::All, &opts);
        assert_eq!(found_id(&r), "1.0-c");
    }

    #[test]
    fn decomposed_parent_waits_for_children() {
        let mut parent = issue("1.0-parent", Status::Open);
        parent.decomposed_into = vec!["child-a".to_string(), "child-b".to_string()];
        let t = tree(vec![
            parent,
            issue("1.0-child-a", Status::Closed),
            issue("1.0-child-b", Status::Open),
        ]);
        let r = resolve(&t, &Scope::All, &ResolveOptions::default());
        assert_eq!(found_id(&r), "1.0-child-b");

        let single = resolve(
            &t,
            &Scope::Issue(IssueId::parse("1.0-parent").expect("id")),
            &ResolveOptions::default(),
        );
        assert_eq!(
            single,
            Resolution::Decomposed {
                issue_id: "1.0-parent".to_string(),
                open_sub_issues: vec!["child-b".to_string()],
            }
        );
    }

    #[test]
    fn post_condition_waits_for_siblings_unless_overridden() {
        let mut t = tree(vec![
            issue("1.0-aaa-audit", Status::Open),
            issue("1.0-feature", Status::Open),
        ]);
        t.insert_version(
            VersionKey::minor(1, 0),
            Version {
                post_conditions: vec!["aaa-audit".to_string()],
                ..Version::default()
            },
        );
        let r = resolve(&t, &Scope::All, &ResolveOptions::default());
        assert_eq!(found_id(&r), "1.0-feature");

        let opts = ResolveOptions {
            override_postconditions: true,
            ..ResolveOptions::default()
        };
        let r = resolve(&t, &Scope::All, &opts);
        assert_eq!(found_id(&r), "1.0-aaa-audit");
    }

    #[test]
    fn version_dependency_skips_whole_version() {
        let mut t = tree(vec![issue("1.0-base", Status::Open), issue("1.1-next", Status::Open)]);
        t.insert_version(
            VersionKey::minor(1, 1),
            Version {
                dependencies: vec!["1.0".to_string()],
                ..Version::default()
            },
        );
        let r = resolve(&t, &Scope::Minor(1, 1), &ResolveOptions::default());
        assert!(matches!(r, Resolution::NotFound { .. }));

        let closed_base = tree(vec![issue("1.0-base", Status::Closed)]);
        let mut t2 = closed_base;
        t2.insert_issue(issue("1.1-next", Status::Open));
        t2.insert_version(
            VersionKey::minor(1, 1),
            Version {
                dependencies: vec!["1.0".to_string()],
                ..Version::default()
            },
        );
        let r = resolve(&t2, &Scope::All, &ResolveOptions::default());
        assert_eq!(found_id(&r), "1.1-next");
    }

    #[test]
    fn single_issue_classification_order() {
        let mut wt = issue("1.0-wt", Status::Open);
        wt.worktree = Some("/p/.claude/cat/worktrees/1.0-wt".to_string());
        let t = tree(vec![issue("1.0-done", Status::Closed), wt]);

        let done = resolve(
            &t,
            &Scope::Issue(IssueId::parse("1.0-done").expect("id")),
            &ResolveOptions::default(),
        );
        assert_eq!(
            done,
            Resolution::AlreadyComplete {
                issue_id: "1.0-done".to_string()
            }
        );

        let existing = resolve(&t, &Scope::BareName("wt".to_string()), &ResolveOptions::default());
        assert!(matches!(existing, Resolution::ExistingWorktree { .. }));
    }

    #[test]
    fn skip_set_moves_past_locked_issue() {
        let t = tree(vec![issue("1.0-a", Status::Open), issue("1.0-b", Status::Open)]);
        let mut opts = ResolveOptions::default();
        opts.skip.insert(IssueId::parse("1.0-a").expect("id"));
        let r = resolve(&t, &Scope::All, &opts);
        assert_eq!(found_id(&r), "1.0-b");
    }

    #[test]
    fn found_json_omits_absent_version_fields() {
        let t = tree(vec![issue("3-bootstrap", Status::Open)]);
        let r = resolve(&t, &Scope::All, &ResolveOptions::default());
        let json = serde_json::to_value(&r).expect("json");
        assert_eq!(json["status"], "found");
        assert_eq!(json["issue_id"], "3-bootstrap");
        assert_eq!(json["major"], 3);
        assert!(json.get("minor").is_none());
        assert!(json.get("patch").is_none());

        let t = tree(vec![issue("3.1-x", Status::Open)]);
        let json = serde_json::to_value(resolve(&t, &Scope::All, &ResolveOptions::default()))
            .expect("json");
        assert_eq!(json["minor"], 1);
        assert!(json.get("patch").is_none());
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(Scope::parse(None), Scope::All);
        assert_eq!(Scope::parse(Some("all")), Scope::All);
        assert_eq!(Scope::parse(Some("2")), Scope::Major(2));
        assert_eq!(Scope::parse(Some("2.1")), Scope::Minor(2, 1));
        assert!(matches!(Scope::parse(Some("2.1-x")), Scope::Issue(_)));
        assert_eq!(
            Scope::parse(Some("parser")),
            Scope::BareName("parser".to_string())
        );
    }
}
