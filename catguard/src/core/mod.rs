//! Deterministic, pure logic shared by the guardrails and the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod issue;
pub mod lock;
pub mod resolver;
pub mod tokenize;
