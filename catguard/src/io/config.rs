//! Project configuration stored under `.claude/cat/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// How much the user trusts agents to act without explicit approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// CAT configuration (TOML).
///
/// Missing fields default to conservative values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatConfig {
    pub trust: TrustLevel,

    /// Case-insensitive regexes; a user message matching any counts as approval.
    pub approval_patterns: Vec<String>,

    /// Directory holding `<session-id>.jsonl` transcripts. Derived from
    /// `$HOME/.claude/projects/` when unset.
    pub transcript_dir: Option<PathBuf>,

    /// Remote that base branches are synced with.
    pub remote: String,
}

impl Default for CatConfig {
    fn default() -> Self {
        Self {
            trust: TrustLevel::Medium,
            approval_patterns: vec![
                r"\bapprove(d)?\b".to_string(),
                r"\blgtm\b".to_string(),
                r"\bmerge it\b".to_string(),
                r"\bship it\b".to_string(),
                r"^\s*yes\b".to_string(),
            ],
            transcript_dir: None,
            remote: "origin".to_string(),
        }
    }
}

impl CatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must be non-empty"));
        }
        if self.approval_patterns.is_empty() {
            return Err(anyhow!("approval_patterns must be a non-empty array"));
        }
        self.approval_regexes()?;
        Ok(())
    }

    /// Compile `approval_patterns`.
    pub fn approval_regexes(&self) -> Result<Vec<Regex>> {
        self.approval_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()
                    .with_context(|| format!("compile approval pattern '{pattern}'"))
            })
            .collect()
    }

    /// Transcript file for `session_id` in the project at `project_dir`.
    pub fn transcript_path(&self, project_dir: &Path, session_id: &str) -> Option<PathBuf> {
        if session_id.is_empty() {
            return None;
        }
        let dir = match &self.transcript_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = std::env::var_os("HOME")?;
                PathBuf::from(home)
                    .join(".claude")
                    .join("projects")
                    .join(encode_project_dir(project_dir))
            }
        };
        Some(dir.join(format!("{session_id}.jsonl")))
    }
}

/// Directory name used for a project's transcripts: path separators and dots become `-`.
pub fn encode_project_dir(project_dir: &Path) -> String {
    project_dir
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CatConfig::default()`.
pub fn load_config(path: &Path) -> Result<CatConfig> {
    if !path.exists() {
        let cfg = CatConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CatConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
