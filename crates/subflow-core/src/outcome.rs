//! The outcome sum type: the discriminated result of executing a step.
//!
//! One constructor per tag, a fold, and the three transitions the engine
//! builds on: `execute_step`, `abort` and `resume`.

use serde_json::Value;

use crate::error::{CLASS_API_UNAVAILABLE, CLASS_INCONSISTENT_DATA};
use crate::state::State;
use crate::types::{ProcessStatus, StepStatus};

/// Result of executing a step, carrying the state as of that step.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(State),
    Skipped(State),
    Suspend(State),
    AwaitingCallback(State),
    Waiting(State),
    Failed(State),
    Abort(State),
    Complete(State),
}

impl Outcome {
    /// Borrow the carried state.
    pub fn state(&self) -> &State {
        match self {
            Self::Success(s)
            | Self::Skipped(s)
            | Self::Suspend(s)
            | Self::AwaitingCallback(s)
            | Self::Waiting(s)
            | Self::Failed(s)
            | Self::Abort(s)
            | Self::Complete(s) => s,
        }
    }

    /// Unwrap the carried state.
    pub fn into_state(self) -> State {
        match self {
            Self::Success(s)
            | Self::Skipped(s)
            | Self::Suspend(s)
            | Self::AwaitingCallback(s)
            | Self::Waiting(s)
            | Self::Failed(s)
            | Self::Abort(s)
            | Self::Complete(s) => s,
        }
    }

    /// Apply a function to the state, keeping the tag.
    pub fn map(self, f: impl FnOnce(State) -> State) -> Outcome {
        match self {
            Self::Success(s) => Self::Success(f(s)),
            Self::Skipped(s) => Self::Skipped(f(s)),
            Self::Suspend(s) => Self::Suspend(f(s)),
            Self::AwaitingCallback(s) => Self::AwaitingCallback(f(s)),
            Self::Waiting(s) => Self::Waiting(f(s)),
            Self::Failed(s) => Self::Failed(f(s)),
            Self::Abort(s) => Self::Abort(f(s)),
            Self::Complete(s) => Self::Complete(f(s)),
        }
    }

    /// Whether the executor may run the next step from this outcome.
    pub fn advances(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Skipped(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend(_))
    }

    pub fn is_awaiting_callback(&self) -> bool {
        matches!(self, Self::AwaitingCallback(_))
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// The step status persisted for this outcome.
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Success(_) => StepStatus::Success,
            Self::Skipped(_) => StepStatus::Skipped,
            Self::Suspend(_) => StepStatus::Suspend,
            Self::AwaitingCallback(_) => StepStatus::AwaitingCallback,
            Self::Waiting(_) => StepStatus::Waiting,
            Self::Failed(_) => StepStatus::Failed,
            Self::Abort(_) => StepStatus::Abort,
            Self::Complete(_) => StepStatus::Complete,
        }
    }

    /// Rebuild an outcome from a persisted step status and state.
    pub fn from_status(status: StepStatus, state: State) -> Outcome {
        match status {
            StepStatus::Success => Self::Success(state),
            StepStatus::Skipped => Self::Skipped(state),
            StepStatus::Suspend => Self::Suspend(state),
            StepStatus::AwaitingCallback => Self::AwaitingCallback(state),
            StepStatus::Waiting => Self::Waiting(state),
            StepStatus::Failed => Self::Failed(state),
            StepStatus::Abort => Self::Abort(state),
            StepStatus::Complete => Self::Complete(state),
        }
    }

    /// Project the overall process status.
    ///
    /// Failed outcomes are subclassified by the `class` field of the
    /// error state they carry.
    pub fn overall_status(&self) -> ProcessStatus {
        match self {
            Self::Success(_) | Self::Skipped(_) => ProcessStatus::Running,
            Self::Suspend(_) => ProcessStatus::Suspended,
            Self::AwaitingCallback(_) => ProcessStatus::AwaitingCallback,
            Self::Waiting(_) => ProcessStatus::Waiting,
            Self::Abort(_) => ProcessStatus::Aborted,
            Self::Complete(_) => ProcessStatus::Completed,
            Self::Failed(state) => match state.get("class").and_then(Value::as_str) {
                Some(CLASS_INCONSISTENT_DATA) => ProcessStatus::InconsistentData,
                Some(CLASS_API_UNAVAILABLE) => ProcessStatus::ApiUnavailable,
                _ => ProcessStatus::Failed,
            },
        }
    }

    /// Execute a step transition.
    ///
    /// The step runs only when the current outcome advances; any other
    /// outcome is returned unchanged.
    pub fn execute_step(self, step: impl FnOnce(State) -> Outcome) -> Outcome {
        match self {
            Self::Success(s) | Self::Skipped(s) => step(s),
            other => other,
        }
    }

    /// Abort the process. Works for every state except Complete.
    pub fn abort(self) -> Outcome {
        match self {
            Self::Complete(s) => Self::Complete(s),
            other => Self::Abort(other.into_state()),
        }
    }

    /// Resume the process.
    ///
    /// Suspend and AwaitingCallback go through `on_suspend` (which merges
    /// user input and may itself fail); Failed and Waiting become Success
    /// so the failing step is retried; Abort and Complete are preserved.
    pub fn resume(self, on_suspend: impl FnOnce(State) -> Outcome) -> Outcome {
        match self {
            Self::Suspend(s) | Self::AwaitingCallback(s) => on_suspend(s),
            Self::Abort(s) => Self::Abort(s),
            Self::Complete(s) => Self::Complete(s),
            other => Self::Success(other.into_state()),
        }
    }

    /// Apply a function to the state only when Failed.
    pub fn on_failed(self, f: impl FnOnce(State) -> State) -> Outcome {
        match self {
            Self::Failed(s) => Self::Failed(f(s)),
            other => other,
        }
    }

    /// Apply a function to the state only when Waiting.
    pub fn on_waiting(self, f: impl FnOnce(State) -> State) -> Outcome {
        match self {
            Self::Waiting(s) => Self::Waiting(f(s)),
            other => other,
        }
    }

    /// Apply a function to the state only when Success.
    pub fn on_success(self, f: impl FnOnce(State) -> State) -> Outcome {
        match self {
            Self::Success(s) => Self::Success(f(s)),
            other => other,
        }
    }
}
