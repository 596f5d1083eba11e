//! Workflow definition and launch handlers for the REST API.
//!
//! Endpoints for registering workflow definitions, launching executions and
//! listing the executions of one workflow.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use promptchain_core::repository::workflow::WorkflowRepository;
use promptchain_core::workflow::EngineError;
use promptchain_types::workflow::{Execution, WorkflowDefinition};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters and bodies
// ---------------------------------------------------------------------------

/// Query parameters for listing executions.
#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    /// Maximum number of executions to return (default 20).
    #[serde(default = "default_execution_limit")]
    pub limit: u32,
}

fn default_execution_limit() -> u32 {
    20
}

/// Body returned by a successful launch.
#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    pub execution_id: Uuid,
}

/// A registered definition with its estimated cost.
#[derive(Debug, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub definition: WorkflowDefinition,
    pub estimated_cost: f64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the workflow sub-router.
///
/// Mounted at `/api/v1` by the main router.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/launch", post(launch_workflow))
        .route("/workflows/{id}/executions", get(list_executions))
}

// ---------------------------------------------------------------------------
// Definition handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Register (or re-register) a workflow definition.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state.engine.register_definition(body).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/api/v1/workflows/{}", def.id);
    let resp = ApiResponse::success(def, request_id, elapsed).with_link("self", &self_link);

    Ok(Json(resp))
}

/// GET /api/v1/workflows - List all workflow definitions.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let defs = state
        .engine
        .repo()
        .list_definitions()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp =
        ApiResponse::success(defs, request_id, elapsed).with_link("self", "/api/v1/workflows");

    Ok(Json(resp))
}

/// GET /api/v1/workflows/:id - Get a workflow definition with its cost estimate.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowDetail>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let definition = state
        .engine
        .repo()
        .get_definition(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or(EngineError::WorkflowNotFound(id))?;
    let estimated_cost = state.engine.estimate(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        WorkflowDetail {
            definition,
            estimated_cost,
        },
        request_id,
        elapsed,
    )
    .with_link("self", &format!("/api/v1/workflows/{id}"))
    .with_link("executions", &format!("/api/v1/workflows/{id}/executions"));

    Ok(Json(resp))
}

// ---------------------------------------------------------------------------
// Launch and execution listing
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/:id/launch - Start a new execution.
///
/// Returns as soon as the execution is persisted; steps run in the
/// background. Poll `GET /api/v1/executions/:id` for progress.
pub async fn launch_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<LaunchResponse>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution_id = state.engine.launch(id).await?;
    state.spawn_advance(execution_id);

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(LaunchResponse { execution_id }, request_id, elapsed)
        .with_link("execution", &format!("/api/v1/executions/{execution_id}"))
        .with_link("workflow", &format!("/api/v1/workflows/{id}"));

    Ok(Json(resp))
}

/// GET /api/v1/workflows/:id/executions - List executions of a workflow.
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<Vec<Execution>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let executions = state
        .engine
        .repo()
        .list_executions(Some(&id), query.limit)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(executions, request_id, elapsed)
        .with_link("self", &format!("/api/v1/workflows/{id}/executions"))
        .with_link("workflow", &format!("/api/v1/workflows/{id}"));

    Ok(Json(resp))
}
