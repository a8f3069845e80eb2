// Process control HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use subflow_core::state::State as WfState;
use subflow_engine::Engine;
use subflow_storage::{ProcessFilter, ProcessRow, ProcessStepRow};

use crate::error::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// A process record as returned by the API.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessResponse {
    pub process_id: Uuid,
    pub workflow_name: String,
    pub workflow_target: String,
    pub last_status: String,
    pub last_step: Option<String>,
    pub assignee: String,
    pub started_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub failed_reason: Option<String>,
    pub created_by: Option<String>,
    pub is_task: bool,
}

impl From<ProcessRow> for ProcessResponse {
    fn from(row: ProcessRow) -> Self {
        Self {
            process_id: row.process_id,
            workflow_name: row.workflow_name,
            workflow_target: row.workflow_target,
            last_status: row.last_status,
            last_step: row.last_step,
            assignee: row.assignee,
            started_at: row.started_at,
            last_modified_at: row.last_modified_at,
            failed_reason: row.failed_reason,
            created_by: row.created_by,
            is_task: row.is_task,
        }
    }
}

/// One persisted step transition.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessStepResponse {
    pub step_id: Uuid,
    pub name: String,
    pub status: String,
    pub state: Value,
    pub executed_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl From<ProcessStepRow> for ProcessStepResponse {
    fn from(row: ProcessStepRow) -> Self {
        Self {
            step_id: row.step_id,
            name: row.name,
            status: row.status,
            state: row.state,
            executed_at: row.executed_at,
            created_by: row.created_by,
        }
    }
}

/// Full process detail: record plus step log.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessDetailResponse {
    #[serde(flatten)]
    pub process: ProcessResponse,
    pub steps: Vec<ProcessStepResponse>,
    pub subscription_ids: Vec<Uuid>,
}

/// Response for a started process.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    pub process_id: Uuid,
}

/// Query parameters for listing processes.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListProcessesParams {
    pub last_status: Option<String>,
    pub is_task: Option<bool>,
    pub workflow_name: Option<String>,
}

fn caller(headers: &HeaderMap) -> String {
    headers
        .get("x-user")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("api")
        .to_string()
}

/// Create process routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/processes", get(list_processes))
        .route("/v1/processes/:workflow_name", post(start_process))
        .route("/v1/processes/id/:process_id", get(get_process))
        .route("/v1/processes/id/:process_id/resume", put(resume_process))
        .route("/v1/processes/id/:process_id/abort", put(abort_process))
        .route(
            "/v1/processes/id/:process_id/callback/:token",
            post(deliver_callback),
        )
        .with_state(state)
}

/// POST /v1/processes/{workflow_name} - Start a workflow
#[utoipa::path(
    post,
    path = "/v1/processes/{workflow_name}",
    params(("workflow_name" = String, Path, description = "Registered workflow name")),
    request_body = Vec<serde_json::Value>,
    responses(
        (status = 201, description = "Process created", body = StartResponse),
        (status = 404, description = "Unknown workflow"),
        (status = 422, description = "Form validation failed"),
        (status = 503, description = "Engine is paused")
    ),
    tag = "processes"
)]
pub async fn start_process(
    State(state): State<AppState>,
    Path(workflow_name): Path<String>,
    headers: HeaderMap,
    Json(user_inputs): Json<Vec<WfState>>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let user = caller(&headers);
    let process_id = state
        .engine
        .start(&workflow_name, user_inputs, &user, None)
        .await?;
    Ok((StatusCode::CREATED, Json(StartResponse { process_id })))
}

/// GET /v1/processes - List processes
#[utoipa::path(
    get,
    path = "/v1/processes",
    params(
        ("last_status" = Option<String>, Query, description = "Filter by status (comma separated)"),
        ("is_task" = Option<bool>, Query, description = "Filter tasks or workflows"),
        ("workflow_name" = Option<String>, Query, description = "Filter by workflow name")
    ),
    responses((status = 200, description = "List of processes", body = Vec<ProcessResponse>)),
    tag = "processes"
)]
pub async fn list_processes(
    State(state): State<AppState>,
    Query(params): Query<ListProcessesParams>,
) -> Result<Json<Vec<ProcessResponse>>, ApiError> {
    let filter = ProcessFilter {
        last_status: params
            .last_status
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect()),
        is_task: params.is_task,
        workflow_name: params.workflow_name,
    };
    let rows = state.engine.list_processes(filter).await?;
    Ok(Json(rows.into_iter().map(ProcessResponse::from).collect()))
}

/// GET /v1/processes/id/{process_id} - Process record with its step log
#[utoipa::path(
    get,
    path = "/v1/processes/id/{process_id}",
    params(("process_id" = Uuid, Path, description = "Process id")),
    responses(
        (status = 200, description = "Process detail", body = ProcessDetailResponse),
        (status = 404, description = "Process not found")
    ),
    tag = "processes"
)]
pub async fn get_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
) -> Result<Json<ProcessDetailResponse>, ApiError> {
    let details = state.engine.get_process(process_id).await?;
    Ok(Json(ProcessDetailResponse {
        process: details.process.into(),
        steps: details
            .steps
            .into_iter()
            .map(ProcessStepResponse::from)
            .collect(),
        subscription_ids: details
            .subscriptions
            .into_iter()
            .map(|link| link.subscription_id)
            .collect(),
    }))
}

/// PUT /v1/processes/id/{process_id}/resume - Resume a process
#[utoipa::path(
    put,
    path = "/v1/processes/id/{process_id}/resume",
    params(("process_id" = Uuid, Path, description = "Process id")),
    request_body = Vec<serde_json::Value>,
    responses(
        (status = 204, description = "Process resumed"),
        (status = 404, description = "Process not found"),
        (status = 409, description = "Process state does not allow resuming"),
        (status = 422, description = "Form validation failed")
    ),
    tag = "processes"
)]
pub async fn resume_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
    headers: HeaderMap,
    Json(user_inputs): Json<Vec<WfState>>,
) -> Result<StatusCode, ApiError> {
    let user = caller(&headers);
    state.engine.resume(process_id, user_inputs, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /v1/processes/id/{process_id}/abort - Abort a process
#[utoipa::path(
    put,
    path = "/v1/processes/id/{process_id}/abort",
    params(("process_id" = Uuid, Path, description = "Process id")),
    responses(
        (status = 204, description = "Process aborted"),
        (status = 404, description = "Process not found")
    ),
    tag = "processes"
)]
pub async fn abort_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = caller(&headers);
    state.engine.abort(process_id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/processes/id/{process_id}/callback/{token} - Deliver a callback
#[utoipa::path(
    post,
    path = "/v1/processes/id/{process_id}/callback/{token}",
    params(
        ("process_id" = Uuid, Path, description = "Process id"),
        ("token" = String, Path, description = "Route token emitted by the awaiting step")
    ),
    request_body = serde_json::Value,
    responses(
        (status = 204, description = "Callback accepted"),
        (status = 404, description = "Process not found or token mismatch"),
        (status = 409, description = "Process is not awaiting a callback")
    ),
    tag = "processes"
)]
pub async fn deliver_callback(
    State(state): State<AppState>,
    Path((process_id, token)): Path<(Uuid, String)>,
    Json(payload): Json<WfState>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .deliver_callback(process_id, &token, payload)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
