//! Errors surfaced at the engine control surface.
//!
//! Everything here is returned to the caller before any durable state
//! change; failures inside steps never appear as these, they are
//! persisted as Failed/Waiting step rows instead.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use subflow_core::forms::{FieldError, FormError};
use subflow_storage::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("process not found: {0}")]
    NotFound(Uuid),

    /// The process state does not allow the requested operation.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("forbidden")]
    Forbidden,

    /// The workflow's run predicate does not allow starting now.
    #[error("workflow '{0}' cannot be started")]
    StartPredicate(String),

    /// More form input is needed; carries the next page's schema.
    #[error("form not complete")]
    FormNotComplete { form: Value },

    #[error("form input invalid")]
    FormValidation { errors: Vec<FieldError> },

    /// The engine is paused.
    #[error("workflow engine is paused")]
    ServiceUnavailable,

    /// The delivered callback token does not match the emitted one.
    #[error("callback token mismatch")]
    TokenMismatch,

    /// Optimistic-locking version mismatch reported by a collaborator.
    #[error("stale data: expected version {expected:?}, got {actual:?}")]
    StaleData {
        expected: Option<i64>,
        actual: Option<i64>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind, independent of transport.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Forbidden => "forbidden",
            Self::StartPredicate(_) => "start_predicate_error",
            Self::FormNotComplete { .. } => "form_not_complete",
            Self::FormValidation { .. } => "form_validation_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::TokenMismatch => "token_mismatch",
            Self::StaleData { .. } => "stale_data",
            Self::Store(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<FormError> for EngineError {
    fn from(err: FormError) -> Self {
        match err {
            FormError::NotComplete { form } => Self::FormNotComplete { form },
            FormError::Validation { errors } => Self::FormValidation { errors },
        }
    }
}
