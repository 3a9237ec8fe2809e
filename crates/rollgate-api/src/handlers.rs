//! REST API handlers for deployments and target groups.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::ApiState;
use crate::orchestrator::{OrchestratorError, RegisterGroupRequest, StartRequest};

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code, e.g. `active_deployment`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }
}

fn api_error(err: &OrchestratorError) -> Response {
    let status = match err {
        OrchestratorError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::ActiveDeployment { .. } => StatusCode::CONFLICT,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidTransition(_) => StatusCode::CONFLICT,
        OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<T, OrchestratorError>, ok: StatusCode) -> Response {
    match result {
        Ok(data) => (ok, ApiResponse::ok(data)).into_response(),
        Err(e) => api_error(&e),
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    api_error(&OrchestratorError::InvalidConfig(format!(
        "malformed request body: {}",
        rejection.body_text()
    )))
}

/// POST /api/v1/deployments
pub async fn start_deployment(
    State(state): State<ApiState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return bad_body(rejection),
    };
    respond(state.orchestrator.start(req).await, StatusCode::CREATED)
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Response {
    respond(state.orchestrator.list(), StatusCode::OK)
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.status(&id), StatusCode::OK)
}

/// GET /api/v1/deployments/{id}/snapshots
pub async fn list_snapshots(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.snapshots(&id), StatusCode::OK)
}

/// POST /api/v1/deployments/{id}/pause
pub async fn pause_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.pause(&id).await, StatusCode::OK)
}

/// POST /api/v1/deployments/{id}/resume
pub async fn resume_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    respond(state.orchestrator.resume(&id).await, StatusCode::OK)
}

/// POST /api/v1/deployments/{id}/abort
pub async fn abort_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.abort(&id).await, StatusCode::OK)
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> Response {
    respond(state.orchestrator.groups(), StatusCode::OK)
}

/// GET /api/v1/groups/{id}
pub async fn get_group(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.group(&id), StatusCode::OK)
}

/// PUT /api/v1/groups/{id}
pub async fn put_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<RegisterGroupRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return bad_body(rejection),
    };
    respond(state.orchestrator.register_group(&id, req), StatusCode::OK)
}
