//! Git safety wrappers.
//!
//! Each operation runs PRECHECK -> MUTATE -> POSTCHECK and reports a terminal
//! status. Nothing is retried; a race or conflict is reported with the
//! evidence needed to recover by hand. Results serialize as JSON objects tagged
//! by `status`.

pub mod amend;
pub mod merge;
pub mod rebase;

use serde::Serialize;

/// Terminal state of a git operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    Ok,
    Conflict,
    RaceDetected,
    AlreadyPushed,
    Error,
}

/// Common surface of operation results.
pub trait OpOutcome: Serialize {
    fn status(&self) -> OpStatus;
}
