//! Require recorded user approval before `merge-and-cleanup` runs.

use std::path::Path;

use tracing::{debug, warn};

use super::{Decision, GuardContext, ParsedCommand};
use crate::io::config::TrustLevel;
use crate::io::transcript::{ASK_USER_TOOL, find_approval};

pub const MERGE_COMMAND: &str = "merge-and-cleanup";

/// True if any unquoted word names the merge operation (`merge-and-cleanup`,
/// `bin/merge-and-cleanup`, `cat:merge-and-cleanup`).
fn invokes_merge(parsed: &ParsedCommand) -> bool {
    parsed.segments.iter().any(|segment| {
        segment.words.iter().any(|token| {
            !token.quoted && token.text.rsplit(['/', ':']).next() == Some(MERGE_COMMAND)
        })
    })
}

pub fn check_merge_approval(command: &str, _cwd: &Path, ctx: &GuardContext) -> Decision {
    let parsed = ParsedCommand::parse(command);
    if !invokes_merge(&parsed) {
        return Decision::allow();
    }
    if ctx.trust == TrustLevel::High {
        debug!("trust=high, merge approval not required");
        return Decision::allow();
    }
    let Some(transcript) = &ctx.transcript_path else {
        return blocked("no session transcript is available");
    };
    match find_approval(transcript, &ctx.approval_patterns) {
        Ok(Some(approval)) => {
            debug!(?approval, "merge approved");
            Decision::allow()
        }
        Ok(None) => blocked(&format!(
            "no approval found in {}",
            transcript.display()
        )),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "transcript scan failed");
            blocked(&format!("transcript could not be read: {err:#}"))
        }
    }
}

fn blocked(detail: &str) -> Decision {
    Decision::block(format!(
        "Merging requires explicit user approval: {detail}.\n\
         Approval gate: ask the user with {ASK_USER_TOOL} whether to merge, and run \
         {MERGE_COMMAND} only after they approve."
    ))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::guard::tests::context;

    const APPROVED: &str = r#"{"type":"user","message":{"content":"yes, merge it"}}"#;

    #[test]
    fn unrelated_commands_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        assert!(!check_merge_approval("git commit -m 'merge-and-cleanup later'", temp.path(), &ctx).blocked);
    }

    #[test]
    fn missing_transcript_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(temp.path());
        ctx.transcript_path = Some(temp.path().join("missing.jsonl"));
        let decision = check_merge_approval("catguard merge-and-cleanup 1.2-x", temp.path(), &ctx);
        assert!(decision.blocked);
        assert!(decision.reason.contains("Approval gate"));
        assert!(decision.reason.contains("AskUserQuestion"));
    }

    #[test]
    fn approval_in_transcript_allows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(temp.path());
        let transcript = temp.path().join("s.jsonl");
        fs::write(&transcript, format!("{APPROVED}\n")).expect("write");
        ctx.transcript_path = Some(transcript);
        assert!(!check_merge_approval("cat:merge-and-cleanup 1.2-x", temp.path(), &ctx).blocked);
    }

    #[test]
    fn high_trust_skips_the_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(temp.path());
        ctx.transcript_path = None;
        ctx.trust = TrustLevel::High;
        assert!(!check_merge_approval("merge-and-cleanup 1.2-x", temp.path(), &ctx).blocked);
    }
}
