// Engine error to HTTP response mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use subflow_engine::EngineError;

/// Wrapper so engine errors can be returned straight from handlers.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            EngineError::WorkflowNotFound(_) | EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict { .. } => StatusCode::CONFLICT,
            EngineError::Forbidden => StatusCode::FORBIDDEN,
            EngineError::StartPredicate(_) => StatusCode::CONFLICT,
            EngineError::FormNotComplete { .. } => StatusCode::BAD_REQUEST,
            EngineError::FormValidation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::TokenMismatch => StatusCode::NOT_FOUND,
            EngineError::StaleData { .. } => StatusCode::CONFLICT,
            EngineError::Store(_) | EngineError::Internal(_) => {
                tracing::error!(error = %err, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut body = json!({
            "error": err.kind(),
            "detail": err.to_string(),
        });
        match &err {
            EngineError::FormNotComplete { form } => {
                body["form"] = form.clone();
            }
            EngineError::FormValidation { errors } => {
                body["validation_errors"] = serde_json::to_value(errors).unwrap_or_default();
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
