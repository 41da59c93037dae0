//! Keep an agent that owns an issue worktree from writing into the main checkout.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Decision, GuardContext, ParsedCommand, canonicalize_lenient, program_name, resolve_path};
use crate::core::tokenize::{Segment, Token, has_unresolved_expansion};

/// The worktree the calling agent is confined to, if any.
pub fn caller_worktree(ctx: &GuardContext, agent_id: &str) -> Option<PathBuf> {
    if !agent_id.is_empty() {
        for entry in &ctx.locks {
            if let Some((path, _)) = entry
                .lock
                .worktrees
                .iter()
                .find(|(_, agent)| agent.as_str() == agent_id)
            {
                return Some(PathBuf::from(path));
            }
        }
    }
    ctx.locks
        .iter()
        .find(|entry| {
            entry.lock.session_id.as_deref() == Some(ctx.session_id.as_str())
                && !ctx.session_id.is_empty()
        })
        .map(|entry| {
            entry
                .lock
                .worktrees
                .keys()
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| ctx.paths.worktrees_dir.join(&entry.issue_id))
        })
}

/// Check every write sink in `command`.
pub fn check_isolation(command: &str, cwd: &Path, ctx: &GuardContext) -> Decision {
    let parsed = ParsedCommand::parse(command);
    let Some(worktree) = active_worktree(ctx, &parsed.agent_id) else {
        return Decision::allow();
    };
    let cwd = canonicalize_lenient(cwd);
    for segment in &parsed.segments {
        for sink in write_sinks(segment) {
            let decision = classify(&sink, &cwd, &worktree, ctx, "command");
            if decision.blocked {
                return decision;
            }
        }
    }
    Decision::allow()
}

/// Check a single file path written by a tool.
pub fn check_write_target(tool: &str, file_path: &str, cwd: &Path, ctx: &GuardContext) -> Decision {
    let Some(worktree) = active_worktree(ctx, "") else {
        return Decision::allow();
    };
    let cwd = canonicalize_lenient(cwd);
    classify(file_path, &cwd, &worktree, ctx, tool)
}

/// Caller's worktree, canonicalized, if it exists on disk.
fn active_worktree(ctx: &GuardContext, agent_id: &str) -> Option<PathBuf> {
    let worktree = caller_worktree(ctx, agent_id)?;
    if !worktree.is_dir() {
        debug!(worktree = %worktree.display(), "caller worktree missing on disk");
        return None;
    }
    Some(canonicalize_lenient(&worktree))
}

fn classify(raw: &str, cwd: &Path, worktree: &Path, ctx: &GuardContext, source: &str) -> Decision {
    if has_unresolved_expansion(raw) {
        return Decision::block(format!(
            "Worktree isolation: cannot verify write target '{raw}' because it contains \
             shell expansion.\nWorktree: {}\nSpell out a literal path inside the worktree.",
            worktree.display()
        ));
    }
    let target = resolve_path(raw, cwd);
    if target.starts_with(worktree) || !target.starts_with(ctx.project_dir()) {
        return Decision::allow();
    }
    let relative = target.strip_prefix(ctx.project_dir()).unwrap_or(&target);
    let suggested = worktree.join(relative);
    Decision::block(format!(
        "Worktree isolation: {source} would write inside the main checkout instead of your worktree.\n\
         Worktree: {}\n\
         Write target: {}\n\
         Use this path instead: {}",
        worktree.display(),
        target.display(),
        suggested.display()
    ))
}

/// Paths a simple command writes to: redirections, `tee` targets, `cp`/`mv` destinations.
fn write_sinks(segment: &Segment) -> Vec<String> {
    let mut sinks: Vec<String> = segment
        .redirects
        .iter()
        .filter(|redirect| redirect.writes_file())
        .map(|redirect| redirect.target.text.clone())
        .collect();

    let Some(program) = segment.program() else {
        return sinks;
    };
    let args = segment.args();
    match program_name(program) {
        "tee" => sinks.extend(
            args.iter()
                .filter(|token| token.quoted || !token.text.starts_with('-'))
                .map(|token| token.text.clone()),
        ),
        "cp" | "mv" => sinks.extend(copy_destination(args)),
        _ => {}
    }
    sinks
}

fn copy_destination(args: &[Token]) -> Option<String> {
    let mut operands = Vec::new();
    let mut flags_done = false;
    let mut index = 0;
    while let Some(token) = args.get(index) {
        let text = token.text.as_str();
        index += 1;
        if flags_done || token.quoted || !text.starts_with('-') || text == "-" {
            operands.push(text);
            continue;
        }
        if text == "--" {
            flags_done = true;
        } else if text == "-t" || text == "--target-directory" {
            return args.get(index).map(|dir| dir.text.clone());
        } else if let Some(dir) = text.strip_prefix("--target-directory=") {
            return Some(dir.to_string());
        } else if let Some(dir) = text.strip_prefix("-t") {
            return Some(dir.to_string());
        }
    }
    if operands.len() < 2 {
        return None;
    }
    operands.last().map(|text| (*text).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenize::{lex, segments};
    use crate::guard::tests::{add_lock, context};

    fn sinks(command: &str) -> Vec<String> {
        segments(&lex(command)).iter().flat_map(write_sinks).collect()
    }

    fn setup() -> (tempfile::TempDir, GuardContext, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(temp.path());
        let worktree = add_lock(&mut ctx, "1.2-parser", "session-me", "", 60);
        (temp, ctx, worktree)
    }

    #[test]
    fn finds_redirect_tee_and_copy_sinks() {
        assert_eq!(sinks("echo hi > out.txt"), vec!["out.txt"]);
        assert_eq!(sinks("echo hi >>log 2>&1"), vec!["log"]);
        assert_eq!(sinks("make 2> err.txt &>all.txt"), vec!["err.txt", "all.txt"]);
        assert_eq!(sinks("echo '>' quoted"), Vec::<String>::new());
        assert_eq!(sinks("cat a | tee -a one two"), vec!["one", "two"]);
        assert_eq!(sinks("cp -r src dst"), vec!["dst"]);
        assert_eq!(sinks("mv -t dir a b"), vec!["dir"]);
        assert_eq!(sinks("cp --target-directory=d a"), vec!["d"]);
        assert_eq!(sinks("cp only"), Vec::<String>::new());
    }

    #[test]
    fn finds_sinks_glued_to_operators() {
        assert_eq!(sinks("echo x>out.txt"), vec!["out.txt"]);
        assert_eq!(sinks("echo x 2>err>>log"), vec!["err", "log"]);
        assert_eq!(sinks("echo x|tee t.txt"), vec!["t.txt"]);
        assert_eq!(sinks("echo x\ntee t.txt < /dev/null"), vec!["t.txt"]);
        assert_eq!(sinks("sudo tee -a t.txt"), vec!["t.txt"]);
        assert_eq!(sinks(r#"echo x >"out file""#), vec!["out file"]);
        assert_eq!(sinks("cat <in.txt"), Vec::<String>::new());
    }

    #[test]
    fn glued_and_piped_writes_to_main_checkout_are_blocked() {
        let (_temp, ctx, worktree) = setup();
        let target = ctx.project_dir().join("src/lib.rs").display().to_string();
        for command in [
            format!("echo x>{target}"),
            format!("echo x|tee {target}"),
            format!("echo x\ntee {target} < /dev/null"),
            format!("(echo x >> {target})"),
        ] {
            let decision = check_isolation(&command, &worktree, &ctx);
            assert!(decision.blocked, "{command:?} was allowed");
        }
    }

    #[test]
    fn one_bad_sink_among_good_ones_blocks() {
        let (_temp, ctx, worktree) = setup();
        let outside = ctx.project_dir().join("notes.txt").display().to_string();
        let command = format!("echo x | tee inside.txt {outside}");
        assert!(check_isolation(&command, &worktree, &ctx).blocked);
        let command = format!("echo x > inside.txt; echo y > {outside}");
        assert!(check_isolation(&command, &worktree, &ctx).blocked);
    }

    #[test]
    fn lock_without_worktree_on_disk_is_not_enforced() {
        let (_temp, ctx, worktree) = setup();
        std::fs::remove_dir_all(&worktree).expect("remove worktree");
        let target = ctx.project_dir().join("src/lib.rs");
        let command = format!("echo x > {}", target.display());
        assert!(!check_isolation(&command, ctx.project_dir(), &ctx).blocked);
    }

    #[test]
    fn write_inside_worktree_is_allowed() {
        let (_temp, ctx, worktree) = setup();
        let decision = check_isolation("echo x > notes.txt", &worktree, &ctx);
        assert!(!decision.blocked, "{}", decision.reason);
    }

    #[test]
    fn write_to_main_checkout_is_blocked_with_suggestion() {
        let (_temp, ctx, worktree) = setup();
        let root = ctx.project_dir().to_path_buf();
        let command = format!("echo x > {}", root.join("src/lib.rs").display());
        let decision = check_isolation(&command, &worktree, &ctx);
        assert!(decision.blocked);
        assert!(decision.reason.contains(&worktree.display().to_string()));
        assert!(decision.reason.contains(&root.join("src/lib.rs").display().to_string()));
        assert!(
            decision
                .reason
                .contains(&worktree.join("src/lib.rs").display().to_string())
        );
    }

    #[test]
    fn write_outside_project_is_allowed() {
        let (_temp, ctx, worktree) = setup();
        assert!(!check_isolation("echo x > /dev/null", &worktree, &ctx).blocked);
        let elsewhere = tempfile::tempdir().expect("elsewhere");
        let command = format!("cp a.txt {}", elsewhere.path().display());
        assert!(!check_isolation(&command, &worktree, &ctx).blocked);
    }

    #[test]
    fn expansion_in_sink_is_blocked() {
        let (_temp, ctx, worktree) = setup();
        assert!(check_isolation("echo x > $OUT", &worktree, &ctx).blocked);
    }

    #[test]
    fn no_lock_means_no_confinement() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let command = format!("echo x > {}", temp.path().join("a.txt").display());
        assert!(!check_isolation(&command, temp.path(), &ctx).blocked);
    }

    #[test]
    fn agent_identity_selects_its_own_worktree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(temp.path());
        let agent = "session-other/subagents/a";
        let worktree = add_lock(&mut ctx, "1.3-lexer", "session-other", agent, 60);
        assert_eq!(caller_worktree(&ctx, agent), Some(worktree));
        assert_eq!(caller_worktree(&ctx, ""), None);
    }

    #[test]
    fn file_write_tool_uses_same_rules() {
        let (_temp, ctx, worktree) = setup();
        let outside = ctx.project_dir().join("README.md");
        let decision = check_write_target("Write", &outside.display().to_string(), &worktree, &ctx);
        assert!(decision.blocked);
        assert!(decision.reason.starts_with("Worktree isolation: Write"));
        let inside = worktree.join("README.md");
        assert!(!check_write_target("Edit", &inside.display().to_string(), &worktree, &ctx).blocked);
    }
}
