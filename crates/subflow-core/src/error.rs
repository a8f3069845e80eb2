//! Step-level failures and their serializable form.
//!
//! A failure raised inside a step never escapes the executor: it is
//! reified into a JSON error object and persisted on the step row. The
//! `class` field subclassifies the failure and drives the overall-status
//! projection (inconsistent_data / api_unavailable) and the assignee
//! override.

use serde_json::{json, Value};
use thiserror::Error;

use crate::state::State;

/// Error class marking an assertion-style failure (bad data found).
pub const CLASS_INCONSISTENT_DATA: &str = "InconsistentData";
/// Error class marking an upstream API failure.
pub const CLASS_API_UNAVAILABLE: &str = "ApiUnavailable";
/// Error class for a generic step failure.
pub const CLASS_PROCESS_FAILURE: &str = "ProcessFailure";
/// Error class used when a step body panicked.
pub const CLASS_STEP_PANIC: &str = "StepPanic";

/// A failure produced by a step body.
#[derive(Debug, Error)]
pub enum StepFailure {
    /// An assertion about the domain did not hold; a human (NOC) must look.
    #[error("{message}")]
    Inconsistent {
        message: String,
        details: Option<Value>,
    },

    /// An upstream system was unavailable or returned an error.
    #[error("{message}")]
    Api {
        message: String,
        status_code: Option<u16>,
        body: Option<String>,
    },

    /// Any other failure.
    #[error("{message}")]
    Process {
        message: String,
        details: Option<Value>,
    },
}

impl StepFailure {
    /// A plain failure with a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
            details: None,
        }
    }

    /// An assertion failure; routes the process to `inconsistent_data`.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent {
            message: message.into(),
            details: None,
        }
    }

    /// An upstream API failure; routes the process to `api_unavailable`.
    pub fn api(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Api {
            message: message.into(),
            status_code,
            body: None,
        }
    }

    pub fn with_details(self, details: Value) -> Self {
        match self {
            Self::Inconsistent { message, .. } => Self::Inconsistent {
                message,
                details: Some(details),
            },
            Self::Process { message, .. } => Self::Process {
                message,
                details: Some(details),
            },
            other => other,
        }
    }

    /// The error class persisted under the `class` key.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Inconsistent { .. } => CLASS_INCONSISTENT_DATA,
            Self::Api { .. } => CLASS_API_UNAVAILABLE,
            Self::Process { .. } => CLASS_PROCESS_FAILURE,
        }
    }
}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        StepFailure::msg(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for StepFailure {
    fn from(err: serde_json::Error) -> Self {
        StepFailure::msg(format!("serialization error: {err}"))
    }
}

/// Render a failure as the JSON error object stored in step state.
pub fn error_state(err: &StepFailure) -> State {
    let mut state = State::new();
    state.insert("class".into(), json!(err.class()));
    state.insert("error".into(), json!(err.to_string()));
    match err {
        StepFailure::Inconsistent {
            details: Some(details),
            ..
        }
        | StepFailure::Process {
            details: Some(details),
            ..
        } => {
            state.insert("details".into(), details.clone());
        }
        StepFailure::Api {
            status_code, body, ..
        } => {
            if let Some(code) = status_code {
                state.insert("status_code".into(), json!(code));
            }
            if let Some(body) = body {
                state.insert("body".into(), json!(body));
            }
        }
        _ => {}
    }
    state
}

/// Error object for a step body that panicked.
pub fn panic_error_state(panic: &(dyn std::any::Any + Send)) -> State {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "step panicked".to_string());

    let mut state = State::new();
    state.insert("class".into(), json!(CLASS_STEP_PANIC));
    state.insert("error".into(), json!(message));
    state
}

/// Extract the human-readable error message from a persisted error state.
pub fn error_message(state: &State) -> Option<&str> {
    state.get("error").and_then(Value::as_str)
}
