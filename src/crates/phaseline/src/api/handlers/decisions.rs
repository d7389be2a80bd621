//! Decision endpoint handlers

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::AppState;
use crate::gate::{PendingDecision, Resolution};
use crate::task::TaskStatus;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionListQuery {
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveDecisionRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDecisionResponse {
    pub decision_id: String,
    pub task_id: String,
    pub approved: bool,
    pub new_status: TaskStatus,
}

/// GET /api/decisions
pub async fn list_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionListQuery>,
) -> Json<Vec<PendingDecision>> {
    let task_id = query.task_id.as_deref().filter(|id| !id.is_empty());
    Json(state.engine.pending_decisions(task_id))
}

/// GET /api/decisions/:id
pub async fn get_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PendingDecision>> {
    state
        .engine
        .decisions()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Decision not found: {}", id)))
}

/// POST /api/decisions/:id
pub async fn resolve_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ResolveDecisionRequest>, JsonRejection>,
) -> ApiResult<Json<ResolveDecisionResponse>> {
    let Json(request) = payload?;
    let resolution = Resolution::new(request.approved, request.reason)
        .by(request.resolved_by.unwrap_or_default());
    let outcome = state.engine.resolve_decision(&id, resolution).await?;

    Ok(Json(ResolveDecisionResponse {
        decision_id: outcome.decision.decision_id,
        task_id: outcome.decision.task_id,
        approved: request.approved,
        new_status: outcome.new_status,
    }))
}
