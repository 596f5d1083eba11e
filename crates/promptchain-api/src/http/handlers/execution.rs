//! Execution inspection and control handlers.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use promptchain_types::workflow::{Execution, ExecutionStatus, ExecutionView};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of an approve request. Send `{}` to use the default note.
#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub note: Option<String>,
}

/// Build the execution sub-router.
pub fn execution_routes() -> Router<AppState> {
    Router::new()
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/approve", post(approve_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
}

/// GET /api/v1/executions/:id - Execution with attempts and usage totals.
///
/// Clients poll this until `status` is no longer pending or running.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ExecutionView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let view = state.engine.get_execution(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let workflow_link = format!("/api/v1/workflows/{}", view.execution.workflow_id);
    let resp = ApiResponse::success(view, request_id, elapsed)
        .with_link("self", &format!("/api/v1/executions/{id}"))
        .with_link("workflow", &workflow_link);

    Ok(Json(resp))
}

/// POST /api/v1/executions/:id/approve - Sign off the gate a paused execution waits on.
///
/// The remaining steps run in the background.
pub async fn approve_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveRequest>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.engine.approve(id, body.note).await?;
    if execution.status == ExecutionStatus::Running {
        state.spawn_advance(id);
    }

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(execution, request_id, elapsed)
        .with_link("self", &format!("/api/v1/executions/{id}"));

    Ok(Json(resp))
}

/// POST /api/v1/executions/:id/cancel - Cancel a pending, running or paused execution.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.engine.cancel(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(execution, request_id, elapsed)
        .with_link("self", &format!("/api/v1/executions/{id}"));

    Ok(Json(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptchain_types::config::GlobalConfig;
    use promptchain_types::workflow::{
        CompletionCriterion, ContextStrategy, CriterionCheck, StepDefinition, WorkflowDefinition,
    };

    async fn state_with_workflow() -> (tempfile::TempDir, AppState, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init_at(dir.path().to_path_buf(), GlobalConfig::default())
            .await
            .unwrap();
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "review".to_string(),
            description: None,
            steps: vec![StepDefinition {
                id: "draft".to_string(),
                order_index: 0,
                model: "kimi-k2p5".to_string(),
                prompt: "Draft the release notes".to_string(),
                criterion: CompletionCriterion::new(CriterionCheck::ValidJson),
                context_strategy: ContextStrategy::Full,
                requires_approval: true,
            }],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let id = def.id;
        state.engine.register_definition(def).await.unwrap();
        (dir, state, id)
    }

    #[tokio::test]
    async fn test_get_unknown_execution_is_not_found() {
        let (_dir, state, _) = state_with_workflow().await;
        let err = get_execution(State(state), Path(Uuid::now_v7())).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_get_launched_execution() {
        let (_dir, state, workflow_id) = state_with_workflow().await;
        let execution_id = state.engine.launch(workflow_id).await.unwrap();

        let Json(resp) = get_execution(State(state), Path(execution_id)).await.unwrap();
        let view = resp.data.unwrap();
        assert_eq!(view.execution.id, execution_id);
        assert_eq!(view.execution.status, ExecutionStatus::Running);
        assert_eq!(view.usage.attempts, 0);
        assert_eq!(resp.links["workflow"], format!("/api/v1/workflows/{workflow_id}"));
    }

    #[tokio::test]
    async fn test_approve_running_execution_conflicts() {
        let (_dir, state, workflow_id) = state_with_workflow().await;
        let execution_id = state.engine.launch(workflow_id).await.unwrap();

        let err = approve_execution(
            State(state),
            Path(execution_id),
            Json(ApproveRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_and_code().1, "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again() {
        let (_dir, state, workflow_id) = state_with_workflow().await;
        let execution_id = state.engine.launch(workflow_id).await.unwrap();

        let Json(resp) = cancel_execution(State(state.clone()), Path(execution_id))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().status, ExecutionStatus::Cancelled);

        let err = cancel_execution(State(state), Path(execution_id)).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "INVALID_STATE");
    }
}
