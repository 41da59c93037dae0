//! Streaming scan of a session transcript (`<session-id>.jsonl`) for user approval.
//!
//! Each line is one JSON record. Lines that fail to parse are skipped; the scan
//! stops at the first piece of approval evidence.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Tool the agent uses to ask the user a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// What approved the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    /// A user message matched approval phrasing.
    UserMessage { line: usize },
    /// The user answered an `AskUserQuestion` prompt with approval phrasing.
    AnsweredQuestion { line: usize, tool_use_id: String },
}

#[derive(Debug, Deserialize)]
struct Record {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Value,
}

/// Scan the transcript at `path`. A missing file yields `Ok(None)`.
pub fn find_approval(path: &Path, patterns: &[Regex]) -> Result<Option<Approval>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no transcript");
            return Ok(None);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("open transcript {}", path.display()));
        }
    };
    scan(BufReader::new(file), patterns)
}

/// Scan transcript lines from any reader.
pub fn scan(reader: impl BufRead, patterns: &[Regex]) -> Result<Option<Approval>> {
    let mut questions: HashSet<String> = HashSet::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("read transcript line")?;
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                debug!(line = line_no, err = %err, "skipping malformed transcript line");
                continue;
            }
        };
        let Some(message) = record.message else {
            continue;
        };
        match record.kind.as_str() {
            "assistant" => collect_questions(&message.content, &mut questions),
            "user" => {
                if let Some(approval) = user_approval(&message.content, &questions, patterns, line_no) {
                    return Ok(Some(approval));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

fn collect_questions(content: &Value, questions: &mut HashSet<String>) {
    let Some(blocks) = content.as_array() else {
        return;
    };
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_use")
            && block.get("name").and_then(Value::as_str) == Some(ASK_USER_TOOL)
            && let Some(id) = block.get("id").and_then(Value::as_str)
        {
            questions.insert(id.to_string());
        }
    }
}

fn user_approval(
    content: &Value,
    questions: &HashSet<String>,
    patterns: &[Regex],
    line: usize,
) -> Option<Approval> {
    if let Some(text) = content.as_str() {
        return matches_any(text, patterns).then_some(Approval::UserMessage { line });
    }
    for block in content.as_array()? {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str)
                    && matches_any(text, patterns)
                {
                    return Some(Approval::UserMessage { line });
                }
            }
            Some("tool_result") => {
                let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                    continue;
                };
                if questions.contains(id)
                    && block
                        .get("content")
                        .is_some_and(|result| result_text(result).iter().any(|t| matches_any(t, patterns)))
                {
                    return Some(Approval::AnsweredQuestion {
                        line,
                        tool_use_id: id.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    None
}

/// Text parts of a `tool_result` content value (a string or text blocks).
fn result_text(content: &Value) -> Vec<&str> {
    match content {
        Value::String(text) => vec![text.as_str()],
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    }
}

/// Words that turn approval phrasing into a refusal ("not approved", "don't merge it").
fn negation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:not|no|never|nope|don['’]?t|doesn['’]?t|won['’]?t|can['’]?t|cannot|shouldn['’]?t|isn['’]?t|hold off)\b",
        )
        .expect("static negation regex")
    })
}

/// True if some sentence of `text` matches a pattern without being negated.
fn matches_any(text: &str, patterns: &[Regex]) -> bool {
    text.split(['.', '!', '?', ';', '\n'])
        .filter(|sentence| !negation_regex().is_match(sentence))
        .any(|sentence| patterns.iter().any(|pattern| pattern.is_match(sentence)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::CatConfig;

    fn patterns() -> Vec<Regex> {
        CatConfig::default().approval_regexes().expect("patterns")
    }

    fn run(lines: &[&str]) -> Option<Approval> {
        scan(lines.join("\n").as_bytes(), &patterns()).expect("scan")
    }

    #[test]
    fn plain_user_approval_counts() {
        let found = run(&[
            r#"{"type":"user","message":{"role":"user","content":"looks good, approved"}}"#,
        ]);
        assert_eq!(found, Some(Approval::UserMessage { line: 1 }));
    }

    #[test]
    fn answered_question_counts_only_with_matching_id() {
        let found = run(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_1","name":"AskUserQuestion","input":{}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_other","content":"Approve"}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":[{"type":"text","text":"Approve and merge"}]}]}}"#,
        ]);
        assert_eq!(
            found,
            Some(Approval::AnsweredQuestion {
                line: 3,
                tool_use_id: "tu_1".to_string()
            })
        );
    }

    #[test]
    fn refusals_are_not_approval() {
        for text in [
            "I do not approve this",
            "not approved yet",
            "Don't merge it, the tests are flaky",
            "No, hold off on merging",
            "never ship it",
        ] {
            let line = serde_json::json!({"type": "user", "message": {"content": text}}).to_string();
            assert_eq!(run(&[&line]), None, "{text}");
        }
    }

    #[test]
    fn approval_in_a_later_sentence_counts() {
        let found = run(&[
            r#"{"type":"user","message":{"content":"Not the docs change. The parser branch is approved."}}"#,
        ]);
        assert_eq!(found, Some(Approval::UserMessage { line: 1 }));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let found = run(&[
            "{not json",
            r#"{"type":"user","message":{"content":"please fix the tests"}}"#,
            r#"{"type":"assistant","message":{"content":"approve?"}}"#,
        ]);
        assert_eq!(found, None);
    }

    #[test]
    fn missing_transcript_is_no_evidence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let found = find_approval(&temp.path().join("none.jsonl"), &patterns()).expect("scan");
        assert_eq!(found, None);
    }
}
