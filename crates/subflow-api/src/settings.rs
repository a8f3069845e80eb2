// Engine settings HTTP routes

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use subflow_engine::{Engine, EngineStatus};

use crate::error::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Request to pause or unpause the engine.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPauseRequest {
    pub pause: bool,
}

/// Result of a bulk resume.
#[derive(Debug, Serialize, ToSchema)]
pub struct BulkResumeResponse {
    pub count: usize,
}

/// Create settings routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/settings/status", get(engine_status))
        .route("/v1/settings/pause", put(set_pause))
        .route("/v1/settings/bulk-resume", post(bulk_resume))
        .with_state(state)
}

/// GET /v1/settings/status - Engine pause/running view
#[utoipa::path(
    get,
    path = "/v1/settings/status",
    responses((status = 200, description = "Engine status", body = serde_json::Value)),
    tag = "settings"
)]
pub async fn engine_status(
    State(state): State<AppState>,
) -> Result<Json<EngineStatus>, ApiError> {
    Ok(Json(state.engine.engine_status().await?))
}

/// PUT /v1/settings/pause - Set or clear the global pause lock
#[utoipa::path(
    put,
    path = "/v1/settings/pause",
    request_body = SetPauseRequest,
    responses((status = 200, description = "Updated engine status", body = serde_json::Value)),
    tag = "settings"
)]
pub async fn set_pause(
    State(state): State<AppState>,
    Json(request): Json<SetPauseRequest>,
) -> Result<Json<EngineStatus>, ApiError> {
    Ok(Json(state.engine.set_engine_pause(request.pause).await?))
}

/// POST /v1/settings/bulk-resume - Resume all resumable processes
#[utoipa::path(
    post,
    path = "/v1/settings/bulk-resume",
    responses(
        (status = 200, description = "Number of resumed processes", body = BulkResumeResponse),
        (status = 409, description = "A bulk resume is already running")
    ),
    tag = "settings"
)]
pub async fn bulk_resume(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BulkResumeResponse>, ApiError> {
    let user = headers
        .get("x-user")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("api");
    let count = state.engine.bulk_resume(user).await?;
    Ok(Json(BulkResumeResponse { count }))
}
