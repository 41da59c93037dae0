//! Guardrails and orchestration for coding agents sharing one git repository.
//!
//! Each agent works in its own worktree tied to an issue. This crate decides
//! which issue an agent may start next, manages per-issue locks, vets proposed
//! shell commands and file writes before they execute, and runs the dangerous
//! git operations (amend, rebase, merge) with post-mutation race checks.
//!
//! - **[`core`]**: Pure, deterministic logic (tokenizing, lock predicates,
//!   issue resolution). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, lock files, git
//!   subprocesses, transcript scanning).
//!
//! Orchestration modules ([`guard`], [`ops`], [`select`], [`prepare`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod guard;
pub mod io;
pub mod logging;
pub mod ops;
pub mod prepare;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
