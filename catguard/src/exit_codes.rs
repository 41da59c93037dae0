//! Stable exit codes for catguard CLI commands.

/// Command allowed, succeeded, or an operation ended `OK`.
pub const OK: i32 = 0;
/// Invalid invocation, layout, or config, or another internal error.
pub const INVALID: i32 = 1;
/// A guardrail blocked the command or file write.
pub const BLOCKED: i32 = 2;
/// A git operation ended `CONFLICT`, `RACE_DETECTED`, `ALREADY_PUSHED`, or `ERROR`.
pub const OP_FAILED: i32 = 3;
