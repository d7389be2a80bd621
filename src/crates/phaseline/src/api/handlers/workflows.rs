//! Workflow endpoint handlers
//!
//! Built-in workflows are read-only; clone one to customize it.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::workflow::Workflow;

#[derive(Debug, Clone, Deserialize)]
pub struct CloneWorkflowRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// GET /api/workflows
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<Workflow>> {
    let workflows = state.engine.workflows().list();
    Json(workflows.iter().map(|w| w.as_ref().clone()).collect())
}

/// GET /api/workflows/:id
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state.engine.workflows().get(&id)?;
    Ok(Json(workflow.as_ref().clone()))
}

/// POST /api/workflows
pub async fn create_workflow(
    State(state): State<AppState>,
    payload: Result<Json<Workflow>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(workflow) = payload?;
    let created = state.engine.workflows().create(workflow)?;
    Ok((StatusCode::CREATED, Json(created.as_ref().clone())))
}

/// PUT /api/workflows/:id
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<Workflow>, JsonRejection>,
) -> ApiResult<Json<Workflow>> {
    let Json(workflow) = payload?;
    let updated = state.engine.workflows().update(&id, workflow)?;
    Ok(Json(updated.as_ref().clone()))
}

/// DELETE /api/workflows/:id
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.workflows().delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/workflows/:id/clone
pub async fn clone_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CloneWorkflowRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let cloned = state
        .engine
        .workflows()
        .clone_workflow(&id, &request.id, request.name)?;
    Ok((StatusCode::CREATED, Json(cloned.as_ref().clone())))
}
