//! Execution status shared by jobs, stages and steps

use serde::{Deserialize, Serialize};

/// Terminal error of an execution stopped on request
pub const CANCELLED_BY_REQUEST: &str = "cancelled by request";

/// Status of a job execution, a stage or a step
///
/// `Fail`, `Success` and `Stop` are terminal: once reached they never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Not started yet
    #[default]
    NotRun,

    /// Currently executing
    Running,

    /// Finished with an error
    Fail,

    /// Finished successfully
    Success,

    /// Cancelled by request or by the step timeout watchdog
    Stop,
}

impl Status {
    /// Returns true for statuses that can never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Fail | Status::Success | Status::Stop)
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Status::NotRun => next != Status::NotRun,
            Status::Running => next.is_terminal(),
            Status::Fail | Status::Success | Status::Stop => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::NotRun => write!(f, "NOTRUN"),
            Status::Running => write!(f, "RUNNING"),
            Status::Fail => write!(f, "FAIL"),
            Status::Success => write!(f, "SUCCESS"),
            Status::Stop => write!(f, "STOP"),
        }
    }
}
