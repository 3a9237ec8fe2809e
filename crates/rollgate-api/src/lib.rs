//! rollgate-api — orchestration API for Rollgate.
//!
//! The [`Orchestrator`] owns one control loop per active deployment and
//! exposes the operator surface: start, pause, resume, abort, status. The
//! axum handlers in [`handlers`] put that surface on HTTP.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/deployments` | List all deployments |
//! | POST | `/api/v1/deployments` | Start a deployment |
//! | GET | `/api/v1/deployments/{id}` | Deployment status and latest snapshot |
//! | GET | `/api/v1/deployments/{id}/snapshots` | Evaluation history |
//! | POST | `/api/v1/deployments/{id}/pause` | Pause between ticks |
//! | POST | `/api/v1/deployments/{id}/resume` | Resume a paused deployment |
//! | POST | `/api/v1/deployments/{id}/abort` | Roll back regardless of step |
//! | GET | `/api/v1/groups` | List target groups |
//! | GET | `/api/v1/groups/{id}` | Get a target group |
//! | PUT | `/api/v1/groups/{id}` | Register or replace a target group |

pub mod handlers;
pub mod orchestrator;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

pub use orchestrator::{
    DeploymentView, OpResult, Orchestrator, OrchestratorError, OrchestratorResult,
    OrchestratorSettings, RegisterGroupRequest, StartRequest,
};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::start_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/snapshots", get(handlers::list_snapshots))
        .route("/deployments/{id}/pause", post(handlers::pause_deployment))
        .route("/deployments/{id}/resume", post(handlers::resume_deployment))
        .route("/deployments/{id}/abort", post(handlers::abort_deployment))
        .route("/groups", get(handlers::list_groups))
        .route(
            "/groups/{id}",
            get(handlers::get_group).put(handlers::put_group),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
